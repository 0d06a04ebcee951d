//! Peer-to-peer messaging core: length-prefixed framing, protocol-tagged
//! streams and a node that owns identity, listening and session lifecycles.
//!
//! The node consumes a [`transport::Transport`] for dialing and listening;
//! [`tcp::TcpTransport`] secures TCP connections with an X25519 handshake and
//! per-direction ChaCha20-Poly1305 keys, and [`memory::MemoryTransport`] wires
//! nodes together inside one process for tests and demos.

pub mod identity;
pub mod memory;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod tcp;
pub mod transport;
pub mod wire;

pub use identity::{Keypair, PeerId, PublicKey};
pub use node::{
    ConnectError, Node, NodeConfig, NodeError, NodeSession, NodeState, OpenStreamError,
    ShutdownError,
};
pub use protocol::{ProtocolId, ProtocolIdError};
pub use registry::{Handler, HandlerRegistry, Inbound, RegistryError};
pub use session::{SendError, SessionId, SessionState, StreamSession};
pub use tcp::TcpTransport;
pub use transport::{Listener, RawStream, StreamReader, StreamWriter, Transport, TransportError};
pub use wire::{FrameCodec, FrameDecodeError, FrameDecoder, FrameEncodeError};
