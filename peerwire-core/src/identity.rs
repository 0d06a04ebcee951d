//! Peer identity and transport crypto: keypairs, peer IDs, session keys.

use std::fmt;

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Serde helper for fixed-size byte arrays; bincode has no native support.
mod fixed_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        v: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        d: D,
    ) -> Result<[u8; N], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into().map_err(|v: Vec<u8>| {
            serde::de::Error::custom(format!("expected {N} bytes, got {}", v.len()))
        })
    }
}

/// Peer public key (32 bytes, X25519). Serializable for the transport handshake.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "fixed_bytes")] [u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `PublicKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Peer ID: deterministic hash of the public key. Stable across connections,
/// opaque to everything above the transport.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "fixed_bytes")] [u8; 16]);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Derive a peer ID from a public key (same derivation as `Keypair`).
    pub fn from_public_key(public: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public);
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        PeerId(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// X25519 keypair. Keep the secret key private; expose only public key and peer ID.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    peer_id: PeerId,
}

impl Keypair {
    /// Generate a new random keypair and derive the peer ID from the public key.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public_x = X25519PublicKey::from(&secret);
        let public = PublicKey(public_x.to_bytes());
        let peer_id = PeerId::from_public_key(public.as_bytes());
        Self {
            secret,
            public,
            peer_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Shared secret with another peer's public key. Used to derive session keys.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(*other_public.as_bytes());
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Derive a 32-byte directed session key from a shared secret. The label
/// separates initiator and responder traffic so the two directions never
/// share a (key, nonce) pair.
pub fn derive_directed_key(shared_secret: &[u8; 32], label: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"peerwire-session-v1");
    hasher.update(label.as_bytes());
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Counter nonce for one record: the low 8 of 12 bytes carry the counter.
/// Each direction has its own key, so a counter per half-connection is enough.
fn record_nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_le_bytes());
    bytes.into()
}

/// Seal one record with ChaCha20-Poly1305. Never reuse a counter under one key.
pub fn seal(key: &[u8; 32], counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    ChaCha20Poly1305::new(key.into())
        .encrypt(&record_nonce(counter), plaintext)
        .map_err(|_| CryptoError::Seal)
}

/// Open one sealed record. Fails on any tampering or counter mismatch.
pub fn open(key: &[u8; 32], counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    ChaCha20Poly1305::new(key.into())
        .decrypt(&record_nonce(counter), ciphertext)
        .map_err(|_| CryptoError::Open)
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("sealing failed")]
    Seal,
    #[error("opening failed")]
    Open,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_peer_id_derivation() {
        let kp = Keypair::generate();
        let id = PeerId::from_public_key(kp.public_key().as_bytes());
        assert_eq!(id, kp.peer_id());
    }

    #[test]
    fn key_exchange_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let secret_a = a.shared_secret(b.public_key());
        let secret_b = b.shared_secret(a.public_key());
        assert_eq!(secret_a, secret_b);
    }

    #[test]
    fn directed_keys_differ_by_label() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let shared = a.shared_secret(b.public_key());
        let initiator = derive_directed_key(&shared, "initiator");
        let responder = derive_directed_key(&shared, "responder");
        assert_ne!(initiator, responder);
    }

    #[test]
    fn seal_open_roundtrip() {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let plain = b"hello peerwire";
        let sealed = seal(&key, 0, plain).unwrap();
        let opened = open(&key, 0, &sealed).unwrap();
        assert_eq!(opened.as_slice(), plain);
    }

    #[test]
    fn open_rejects_wrong_nonce() {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let sealed = seal(&key, 0, b"payload").unwrap();
        assert!(open(&key, 1, &sealed).is_err());
    }

    #[test]
    fn public_key_roundtrip_rejects_truncated_input() {
        let kp = Keypair::generate();
        let bytes = bincode::serialize(kp.public_key()).unwrap();
        let decoded: PublicKey = bincode::deserialize(&bytes).unwrap();
        assert_eq!(&decoded, kp.public_key());
        assert!(bincode::deserialize::<PublicKey>(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn peer_id_display_is_hex() {
        let kp = Keypair::generate();
        let text = kp.peer_id().to_string();
        assert_eq!(text.len(), 32);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
