//! TCP transport: identity handshake, then per-direction encrypted records.
//!
//! Each write becomes one `[4-byte BE length][ChaCha20-Poly1305 ciphertext]`
//! record; reads decrypt one record at a time and serve plaintext bytes, so
//! the layer above still sees an ordered byte stream.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::identity::{self, Keypair, PeerId};
use crate::protocol::{Hello, PROTOCOL_VERSION};
use crate::transport::{Listener, RawStream, StreamReader, StreamWriter, Transport, TransportError};

const HELLO_LEN_SIZE: usize = 4;
const MAX_HELLO_LEN: u32 = 1024;
// One record carries at most one framed message plus AEAD overhead.
const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024 + 1024;
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const INITIATOR_LABEL: &str = "initiator";
const RESPONDER_LABEL: &str = "responder";

pub struct TcpTransport {
    keypair: Arc<Keypair>,
    handshake_timeout: Duration,
}

impl TcpTransport {
    pub fn new(keypair: Arc<Keypair>) -> Self {
        Self {
            keypair,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl Transport for TcpTransport {
    type Stream = SecureStream;
    type Listener = TcpTransportListener;

    fn local_peer(&self) -> PeerId {
        self.keypair.peer_id()
    }

    async fn listen(&self, addr: &str) -> Result<TcpTransportListener, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?.to_string();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let keypair = self.keypair.clone();
        let timeout = self.handshake_timeout;
        let loop_cancel = cancel.clone();
        // Handshakes run in their own tasks so a slow peer cannot stall accept.
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    res = listener.accept() => res,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        let keypair = keypair.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            match tokio::time::timeout(
                                timeout,
                                handshake(stream, &keypair, Role::Responder),
                            )
                            .await
                            {
                                Ok(Ok((peer, secured))) => {
                                    let _ = tx.send((peer, secured)).await;
                                }
                                Ok(Err(err)) => {
                                    debug!(%remote, %err, "inbound handshake failed")
                                }
                                Err(_) => debug!(%remote, "inbound handshake timed out"),
                            }
                        });
                    }
                    Err(err) => {
                        warn!(%err, "tcp accept failed");
                        break;
                    }
                }
            }
        });

        Ok(TcpTransportListener {
            rx,
            cancel,
            local_addr,
        })
    }

    async fn dial(&self, addr: &str) -> Result<(PeerId, SecureStream), TransportError> {
        let stream = TcpStream::connect(addr).await?;
        match tokio::time::timeout(
            self.handshake_timeout,
            handshake(stream, &self.keypair, Role::Initiator),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Handshake("handshake timed out".into())),
        }
    }
}

pub struct TcpTransportListener {
    rx: mpsc::Receiver<(PeerId, SecureStream)>,
    cancel: CancellationToken,
    local_addr: String,
}

impl Listener for TcpTransportListener {
    type Stream = SecureStream;

    async fn accept(&mut self) -> Result<(PeerId, SecureStream), TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }

    fn local_addr(&self) -> &str {
        &self.local_addr
    }
}

impl Drop for TcpTransportListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone, Copy)]
enum Role {
    Initiator,
    Responder,
}

/// Exchange `Hello` messages, verify the peer id against the public key,
/// derive per-direction record keys.
async fn handshake(
    mut stream: TcpStream,
    keypair: &Keypair,
    role: Role,
) -> Result<(PeerId, SecureStream), TransportError> {
    let hello = Hello {
        protocol_version: PROTOCOL_VERSION,
        peer_id: keypair.peer_id(),
        public_key: keypair.public_key().clone(),
    };
    let payload =
        bincode::serialize(&hello).map_err(|err| TransportError::Handshake(err.to_string()))?;
    let mut out = Vec::with_capacity(HELLO_LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    stream.write_all(&out).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; HELLO_LEN_SIZE];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_HELLO_LEN {
        return Err(TransportError::Handshake("oversized hello".into()));
    }
    let mut hello_buf = vec![0u8; len as usize];
    stream.read_exact(&mut hello_buf).await?;
    let peer_hello: Hello = bincode::deserialize(&hello_buf)
        .map_err(|err| TransportError::Handshake(err.to_string()))?;

    if peer_hello.protocol_version != PROTOCOL_VERSION {
        return Err(TransportError::Handshake(format!(
            "unsupported protocol version {}",
            peer_hello.protocol_version
        )));
    }
    if peer_hello.peer_id != PeerId::from_public_key(peer_hello.public_key.as_bytes()) {
        return Err(TransportError::Handshake(
            "peer id does not match public key".into(),
        ));
    }

    let shared = keypair.shared_secret(&peer_hello.public_key);
    let (write_label, read_label) = match role {
        Role::Initiator => (INITIATOR_LABEL, RESPONDER_LABEL),
        Role::Responder => (RESPONDER_LABEL, INITIATOR_LABEL),
    };
    let write_key = identity::derive_directed_key(&shared, write_label);
    let read_key = identity::derive_directed_key(&shared, read_label);
    Ok((
        peer_hello.peer_id,
        SecureStream {
            inner: stream,
            read_key,
            write_key,
        },
    ))
}

pub struct SecureStream {
    inner: TcpStream,
    read_key: [u8; 32],
    write_key: [u8; 32],
}

impl std::fmt::Debug for SecureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStream")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl RawStream for SecureStream {
    type Reader = SecureReader;
    type Writer = SecureWriter;

    fn into_split(self) -> (SecureReader, SecureWriter) {
        let (r, w) = self.inner.into_split();
        (
            SecureReader {
                inner: r,
                key: self.read_key,
                nonce: 0,
                plain: Vec::new(),
                pos: 0,
            },
            SecureWriter {
                inner: w,
                key: self.write_key,
                nonce: 0,
            },
        )
    }
}

pub struct SecureReader {
    inner: OwnedReadHalf,
    key: [u8; 32],
    nonce: u64,
    plain: Vec<u8>,
    pos: usize,
}

impl SecureReader {
    /// Read and decrypt the next record. `Ok(false)` means the peer closed the
    /// stream cleanly on a record boundary.
    async fn fill(&mut self) -> io::Result<bool> {
        let mut first = [0u8; 1];
        if self.inner.read(&mut first).await? == 0 {
            return Ok(false);
        }
        let mut rest = [0u8; 3];
        self.inner.read_exact(&mut rest).await?;
        let len = u32::from_be_bytes([first[0], rest[0], rest[1], rest[2]]);
        if len > MAX_RECORD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized record",
            ));
        }
        let mut cipher = vec![0u8; len as usize];
        self.inner.read_exact(&mut cipher).await?;
        let plain = identity::open(&self.key, self.nonce, &cipher)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.nonce = self.nonce.saturating_add(1);
        self.plain = plain;
        self.pos = 0;
        Ok(true)
    }
}

impl StreamReader for SecureReader {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.plain.len() {
            if !self.fill().await? {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

pub struct SecureWriter {
    inner: OwnedWriteHalf,
    key: [u8; 32],
    nonce: u64,
}

impl StreamWriter for SecureWriter {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let cipher = identity::seal(&self.key, self.nonce, buf)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.nonce = self.nonce.saturating_add(1);
        let mut record = Vec::with_capacity(4 + cipher.len());
        record.extend_from_slice(&(cipher.len() as u32).to_be_bytes());
        record.extend_from_slice(&cipher);
        self.inner.write_all(&record).await?;
        self.inner.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_accept_exchange_bytes() {
        let kp_a = Arc::new(Keypair::generate());
        let kp_b = Arc::new(Keypair::generate());
        let transport_a = TcpTransport::new(kp_a.clone());
        let transport_b = TcpTransport::new(kp_b.clone());

        let mut listener = transport_a.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().to_string();

        let (dialed_peer, stream_b) = transport_b.dial(&addr).await.unwrap();
        assert_eq!(dialed_peer, kp_a.peer_id());
        let (accepted_peer, stream_a) = listener.accept().await.unwrap();
        assert_eq!(accepted_peer, kp_b.peer_id());

        let (mut reader_a, mut writer_a) = stream_a.into_split();
        let (mut reader_b, mut writer_b) = stream_b.into_split();

        writer_b.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = reader_a.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        writer_a.write_all(b"pong").await.unwrap();
        let n = reader_b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn clean_shutdown_reads_as_eof() {
        let kp_a = Arc::new(Keypair::generate());
        let kp_b = Arc::new(Keypair::generate());
        let transport_a = TcpTransport::new(kp_a);
        let transport_b = TcpTransport::new(kp_b);

        let mut listener = transport_a.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().to_string();
        let (_, stream_b) = transport_b.dial(&addr).await.unwrap();
        let (_, stream_a) = listener.accept().await.unwrap();

        let (mut reader_a, _writer_a) = stream_a.into_split();
        let (_reader_b, mut writer_b) = stream_b.into_split();

        writer_b.write_all(b"bye").await.unwrap();
        writer_b.shutdown().await.unwrap();

        let mut buf = [0u8; 8];
        let n = reader_a.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"bye");
        assert_eq!(reader_a.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dial_unreachable_is_io_error() {
        let kp = Arc::new(Keypair::generate());
        let transport = TcpTransport::new(kp);
        // Reserved port on localhost with nothing listening.
        let err = transport.dial("127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[tokio::test]
    async fn small_reads_reassemble_records() {
        let kp_a = Arc::new(Keypair::generate());
        let kp_b = Arc::new(Keypair::generate());
        let transport_a = TcpTransport::new(kp_a);
        let transport_b = TcpTransport::new(kp_b);

        let mut listener = transport_a.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().to_string();
        let (_, stream_b) = transport_b.dial(&addr).await.unwrap();
        let (_, stream_a) = listener.accept().await.unwrap();

        let (mut reader_a, _wa) = stream_a.into_split();
        let (_rb, mut writer_b) = stream_b.into_split();

        let payload: Vec<u8> = (0..=255u8).collect();
        writer_b.write_all(&payload).await.unwrap();

        let mut got = Vec::new();
        let mut buf = [0u8; 7];
        while got.len() < payload.len() {
            let n = reader_a.read(&mut buf).await.unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, payload);
    }
}
