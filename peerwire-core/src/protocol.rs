//! Protocol identifiers and stream negotiation types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, PublicKey};

/// Current protocol version. Exchanged during the transport handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum length of a protocol identifier in bytes.
pub const MAX_PROTOCOL_ID_LEN: usize = 255;

/// Application-level namespace token selecting which handler processes a
/// stream, e.g. `/demo/1.0.0`. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolId(String);

impl ProtocolId {
    pub fn new(id: impl Into<String>) -> Result<Self, ProtocolIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ProtocolIdError::Empty);
        }
        if id.len() > MAX_PROTOCOL_ID_LEN {
            return Err(ProtocolIdError::TooLong(id.len()));
        }
        Ok(ProtocolId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolIdError {
    #[error("protocol id must not be empty")]
    Empty,
    #[error("protocol id of {0} bytes exceeds maximum of {MAX_PROTOCOL_ID_LEN}")]
    TooLong(usize),
}

/// Transport handshake message: both sides send one, bincode-encoded behind a
/// length prefix, before any stream traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u8,
    pub peer_id: PeerId,
    pub public_key: PublicKey,
}
