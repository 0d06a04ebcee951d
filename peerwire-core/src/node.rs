//! Node: local identity, listen/accept, the active-session set, shutdown.
//!
//! Errors local to one session never propagate to the node or to other
//! sessions; failure to acquire a listen address is fatal to startup and
//! surfaced to the caller.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::identity::PeerId;
use crate::protocol::{ProtocolId, MAX_PROTOCOL_ID_LEN};
use crate::registry::{Handler, HandlerRegistry, Inbound, RegistryError};
use crate::session::{self, SessionId, StreamSession};
use crate::transport::{Listener, RawStream, StreamReader, StreamWriter, Transport, TransportError};
use crate::wire::{FrameCodec, FrameDecoder, DEFAULT_MAX_FRAME_LEN};

/// Session type produced by a node over transport `T`.
pub type NodeSession<T> = StreamSession<<<T as Transport>::Stream as RawStream>::Writer>;

type SessionTable<W> = Arc<Mutex<HashMap<SessionId, StreamSession<W>>>>;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Maximum message payload length per frame.
    pub max_frame_len: u32,
    /// Deadline for dial plus transport handshake.
    pub connect_timeout: Duration,
    /// Deadline for an inbound stream to announce its protocol.
    pub negotiation_timeout: Duration,
    /// Optional per-read deadline on established sessions. None blocks forever.
    pub read_timeout: Option<Duration>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            connect_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(10),
            read_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    Created = 0,
    Listening = 1,
    ShuttingDown = 2,
    Closed = 3,
}

fn node_state_from_u8(v: u8) -> NodeState {
    match v {
        0 => NodeState::Created,
        1 => NodeState::Listening,
        2 => NodeState::ShuttingDown,
        _ => NodeState::Closed,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node has already been started")]
    AlreadyStarted,
    #[error("failed to acquire listen address: {0}")]
    Listen(#[source] TransportError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("peer unreachable: {0}")]
    UnreachablePeer(#[source] TransportError),
    #[error("connect timed out")]
    Timeout,
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("node is shutting down")]
    NodeClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum OpenStreamError {
    #[error("unknown peer; connect first")]
    UnknownPeer,
    #[error("dial failed: {0}")]
    Dial(#[source] TransportError),
    #[error("open timed out")]
    Timeout,
    #[error("failed to negotiate protocol: {0}")]
    Negotiation(#[source] io::Error),
    #[error("node is shutting down")]
    NodeClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("shutdown already in progress")]
    AlreadyShuttingDown,
    #[error("failed to close {} session(s)", .0.len())]
    SessionsFailed(Vec<SessionId>),
}

/// The local participant: owns identity (via the transport), the handler
/// registry and every active session.
pub struct Node<T: Transport> {
    transport: T,
    config: NodeConfig,
    codec: FrameCodec,
    registry: Arc<HandlerRegistry>,
    state: AtomicU8,
    cancel: CancellationToken,
    sessions: SessionTable<<T::Stream as RawStream>::Writer>,
    known_peers: Mutex<HashMap<PeerId, String>>,
}

impl<T: Transport> Node<T> {
    pub fn new(transport: T, config: NodeConfig) -> Self {
        let codec = FrameCodec::new(config.max_frame_len);
        Self {
            transport,
            config,
            codec,
            registry: Arc::new(HandlerRegistry::new()),
            state: AtomicU8::new(NodeState::Created as u8),
            cancel: CancellationToken::new(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            known_peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.transport.local_peer()
    }

    pub fn state(&self) -> NodeState {
        node_state_from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Register a handler for a protocol. Fails on duplicates.
    pub fn register_handler(&self, id: ProtocolId, handler: Handler) -> Result<(), RegistryError> {
        self.registry.register(id, handler)
    }

    pub fn register_fn<F>(&self, id: ProtocolId, f: F) -> Result<(), RegistryError>
    where
        F: Fn(Inbound) + Send + Sync + 'static,
    {
        self.registry.register_fn(id, f)
    }

    /// Number of sessions currently tracked, regardless of state.
    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Acquire the listen address and start accepting inbound streams.
    /// Returns the bound address. Listen failure is fatal to startup.
    pub async fn start(&self, addr: &str) -> Result<String, NodeError> {
        self.state
            .compare_exchange(
                NodeState::Created as u8,
                NodeState::Listening as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| NodeError::AlreadyStarted)?;

        let listener = match self.transport.listen(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                self.state.store(NodeState::Created as u8, Ordering::SeqCst);
                return Err(NodeError::Listen(err));
            }
        };
        let local_addr = listener.local_addr().to_string();

        tokio::spawn(accept_loop(
            listener,
            self.codec,
            self.registry.clone(),
            self.sessions.clone(),
            self.cancel.clone(),
            self.config.negotiation_timeout,
            self.config.read_timeout,
        ));
        info!(addr = %local_addr, peer = %self.local_peer(), "node listening");
        Ok(local_addr)
    }

    /// Establish a secured connection to learn and record the peer's identity.
    /// The probe stream is released; `open_stream` dials per stream and leaves
    /// multiplexing to the transport.
    pub async fn connect(&self, addr: &str) -> Result<PeerId, ConnectError> {
        if !self.is_active() {
            return Err(ConnectError::NodeClosed);
        }
        let (peer, stream) =
            match tokio::time::timeout(self.config.connect_timeout, self.transport.dial(addr))
                .await
            {
                Err(_) => return Err(ConnectError::Timeout),
                Ok(Err(TransportError::Handshake(msg))) => {
                    return Err(ConnectError::HandshakeFailed(msg))
                }
                Ok(Err(other)) => return Err(ConnectError::UnreachablePeer(other)),
                Ok(Ok(dialed)) => dialed,
            };
        let (_reader, mut writer) = stream.into_split();
        let _ = writer.shutdown().await;
        self.known_peers.lock().await.insert(peer, addr.to_string());
        debug!(%peer, %addr, "connected");
        Ok(peer)
    }

    /// Open an outbound stream on `protocol` to a previously connected peer.
    pub async fn open_stream(
        &self,
        peer: PeerId,
        protocol: ProtocolId,
    ) -> Result<NodeSession<T>, OpenStreamError> {
        if !self.is_active() {
            return Err(OpenStreamError::NodeClosed);
        }
        let addr = self
            .known_peers
            .lock()
            .await
            .get(&peer)
            .cloned()
            .ok_or(OpenStreamError::UnknownPeer)?;
        let (dialed_peer, stream) =
            match tokio::time::timeout(self.config.connect_timeout, self.transport.dial(&addr))
                .await
            {
                Err(_) => return Err(OpenStreamError::Timeout),
                Ok(Err(err)) => return Err(OpenStreamError::Dial(err)),
                Ok(Ok(dialed)) => dialed,
            };
        if dialed_peer != peer {
            return Err(OpenStreamError::Dial(TransportError::Handshake(
                "peer identity changed since connect".into(),
            )));
        }
        let (reader, mut writer) = stream.into_split();
        let preamble = self.codec.encode(protocol.as_str().as_bytes()).map_err(|_| {
            OpenStreamError::Negotiation(io::Error::new(
                io::ErrorKind::InvalidInput,
                "protocol id exceeds frame limit",
            ))
        })?;
        writer
            .write_all(&preamble)
            .await
            .map_err(OpenStreamError::Negotiation)?;

        // Outbound sessions deliver replies to the locally registered handler,
        // when one exists.
        let handler = self.registry.lookup(&protocol);
        let (session, registered) = register_session(
            peer,
            protocol,
            self.codec,
            Vec::new(),
            reader,
            writer,
            handler,
            self.sessions.clone(),
            self.config.read_timeout,
            &self.cancel,
        )
        .await;
        // Shutdown raced the dial: the session was closed instead of tracked.
        if !registered {
            return Err(OpenStreamError::NodeClosed);
        }
        debug!(%peer, session = %session.id(), protocol = %session.protocol(), "stream opened");
        Ok(session)
    }

    /// Stop accepting, close every active session, transition to Closed.
    /// A second call fails with `AlreadyShuttingDown`.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        let from_listening = self.state.compare_exchange(
            NodeState::Listening as u8,
            NodeState::ShuttingDown as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if from_listening.is_err()
            && self
                .state
                .compare_exchange(
                    NodeState::Created as u8,
                    NodeState::ShuttingDown as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
        {
            return Err(ShutdownError::AlreadyShuttingDown);
        }

        self.cancel.cancel();
        let mut failed = Vec::new();
        // Streams accepted just before the cancel may still be registering;
        // sweep until the table stays empty.
        loop {
            let drained: Vec<_> = {
                let mut sessions = self.sessions.lock().await;
                sessions.drain().map(|(_, session)| session).collect()
            };
            if drained.is_empty() {
                break;
            }
            for session in drained {
                if let Err(err) = session.close().await {
                    warn!(session = %session.id(), %err, "failed to close session");
                    failed.push(session.id());
                }
            }
        }
        self.state.store(NodeState::Closed as u8, Ordering::SeqCst);
        info!(peer = %self.local_peer(), "node shut down");
        if failed.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError::SessionsFailed(failed))
        }
    }

    fn is_active(&self) -> bool {
        matches!(self.state(), NodeState::Created | NodeState::Listening)
    }
}

async fn accept_loop<L: Listener>(
    mut listener: L,
    codec: FrameCodec,
    registry: Arc<HandlerRegistry>,
    sessions: SessionTable<<L::Stream as RawStream>::Writer>,
    cancel: CancellationToken,
    negotiation_timeout: Duration,
    read_timeout: Option<Duration>,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((peer, stream)) => {
                tokio::spawn(handle_inbound(
                    peer,
                    stream,
                    codec,
                    registry.clone(),
                    sessions.clone(),
                    cancel.clone(),
                    negotiation_timeout,
                    read_timeout,
                ));
            }
            Err(TransportError::Closed) => break,
            Err(err) => {
                warn!(%err, "accept failed");
                break;
            }
        }
    }
    debug!("accept loop stopped");
}

#[derive(Debug, thiserror::Error)]
enum PreambleError {
    #[error("stream closed before negotiation completed")]
    StreamClosed,
    #[error("malformed protocol preamble")]
    Malformed,
    #[error("i/o error: {0}")]
    Io(#[source] io::Error),
}

/// Read the opener's first frame: the protocol id. Returns any buffered bytes
/// past the preamble so the session does not lose them.
async fn read_preamble<R: StreamReader>(
    reader: &mut R,
) -> Result<(ProtocolId, Vec<u8>), PreambleError> {
    let mut decoder = FrameDecoder::new(FrameCodec::new(MAX_PROTOCOL_ID_LEN as u32));
    let mut buf = [0u8; 64];
    loop {
        match decoder.next_frame() {
            Ok(Some(frame)) => {
                let text = String::from_utf8(frame).map_err(|_| PreambleError::Malformed)?;
                let protocol = ProtocolId::new(text).map_err(|_| PreambleError::Malformed)?;
                return Ok((protocol, decoder.into_remaining()));
            }
            Ok(None) => {}
            Err(_) => return Err(PreambleError::Malformed),
        }
        let n = reader.read(&mut buf).await.map_err(PreambleError::Io)?;
        if n == 0 {
            return Err(PreambleError::StreamClosed);
        }
        decoder.feed(&buf[..n]);
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_inbound<S: RawStream>(
    peer: PeerId,
    stream: S,
    codec: FrameCodec,
    registry: Arc<HandlerRegistry>,
    sessions: SessionTable<S::Writer>,
    cancel: CancellationToken,
    negotiation_timeout: Duration,
    read_timeout: Option<Duration>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (protocol, leftover) =
        match tokio::time::timeout(negotiation_timeout, read_preamble(&mut reader)).await {
            Ok(Ok(result)) => result,
            Ok(Err(PreambleError::StreamClosed)) => {
                debug!(%peer, "stream closed before negotiation");
                let _ = writer.shutdown().await;
                return;
            }
            Ok(Err(err)) => {
                warn!(%peer, %err, "rejecting inbound stream");
                let _ = writer.shutdown().await;
                return;
            }
            Err(_) => {
                debug!(%peer, "protocol negotiation timed out");
                let _ = writer.shutdown().await;
                return;
            }
        };
    let Some(handler) = registry.lookup(&protocol) else {
        warn!(%peer, %protocol, "no handler registered, closing stream");
        let _ = writer.shutdown().await;
        return;
    };
    let (session, registered) = register_session(
        peer,
        protocol,
        codec,
        leftover,
        reader,
        writer,
        Some(handler),
        sessions,
        read_timeout,
        &cancel,
    )
    .await;
    if !registered {
        debug!(%peer, "inbound stream arrived during shutdown, closed");
        return;
    }
    debug!(%peer, session = %session.id(), protocol = %session.protocol(), "inbound stream accepted");
}

#[allow(clippy::too_many_arguments)]
async fn register_session<R, W>(
    peer: PeerId,
    protocol: ProtocolId,
    codec: FrameCodec,
    initial: Vec<u8>,
    reader: R,
    writer: W,
    handler: Option<Handler>,
    sessions: SessionTable<W>,
    read_timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> (StreamSession<W>, bool)
where
    R: StreamReader,
    W: StreamWriter,
{
    let table = sessions.clone();
    let (session, task) = session::start(
        peer,
        protocol,
        codec,
        read_timeout,
        initial,
        reader,
        writer,
        handler,
        move |id| {
            tokio::spawn(async move {
                table.lock().await.remove(&id);
            });
        },
    );
    // Shutdown cancels the token, then sweeps the table. Re-checking under
    // the table lock means a session is either inserted before the sweep
    // sees it, or observes the cancel and never tracks at all.
    {
        let mut table = sessions.lock().await;
        if cancel.is_cancelled() {
            drop(table);
            drop(task);
            if let Err(err) = session.close().await {
                debug!(session = %session.id(), %err, "close during shutdown failed");
            }
            return (session, false);
        }
        table.insert(session.id(), session.clone());
    }
    tokio::spawn(task);
    (session, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::memory::{MemoryNetwork, MemoryTransport};
    use crate::session::SessionState;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn demo_protocol() -> ProtocolId {
        ProtocolId::new("/demo/1.0.0").unwrap()
    }

    fn memory_node(network: &Arc<MemoryNetwork>) -> Node<MemoryTransport> {
        let transport = MemoryTransport::new(network.clone(), Arc::new(Keypair::generate()));
        Node::new(transport, NodeConfig::default())
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never satisfied");
    }

    #[tokio::test]
    async fn end_to_end_hello() {
        let network = MemoryNetwork::new();
        let node_a = memory_node(&network);
        let node_b = memory_node(&network);

        let (tx, mut rx) = mpsc::unbounded_channel();
        node_a
            .register_fn(demo_protocol(), move |inbound: Inbound| {
                let _ = tx.send((inbound.peer, inbound.payload));
            })
            .unwrap();
        let addr = node_a.start("mem:auto").await.unwrap();

        let peer = node_b.connect(&addr).await.unwrap();
        assert_eq!(peer, node_a.local_peer());
        let session = node_b.open_stream(peer, demo_protocol()).await.unwrap();
        session.send(b"Hello from sender!").await.unwrap();

        let (from, payload) = rx.recv().await.unwrap();
        assert_eq!(from, node_b.local_peer());
        assert_eq!(payload, b"Hello from sender!");
        assert!(rx.try_recv().is_err(), "exactly one message expected");

        session.close().await.unwrap();
        wait_until(|| session.state() == SessionState::Closed).await;

        node_a.shutdown().await.unwrap();
        node_b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn persistent_session_carries_multiple_messages() {
        let network = MemoryNetwork::new();
        let node_a = memory_node(&network);
        let node_b = memory_node(&network);

        let (tx, mut rx) = mpsc::unbounded_channel();
        node_a
            .register_fn(demo_protocol(), move |inbound: Inbound| {
                let _ = tx.send(inbound.payload);
            })
            .unwrap();
        let addr = node_a.start("mem:auto").await.unwrap();
        let peer = node_b.connect(&addr).await.unwrap();
        let session = node_b.open_stream(peer, demo_protocol()).await.unwrap();

        for i in 0..5u8 {
            session.send(&[i]).await.unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(rx.recv().await.unwrap(), vec![i]);
        }
        node_a.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unregistered_protocol_stream_is_closed_without_dispatch() {
        let network = MemoryNetwork::new();
        let node_a = memory_node(&network);
        let node_b = memory_node(&network);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        node_a
            .register_fn(demo_protocol(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let addr = node_a.start("mem:auto").await.unwrap();
        let peer = node_b.connect(&addr).await.unwrap();

        let session = node_b
            .open_stream(peer, ProtocolId::new("/unknown/1.0.0").unwrap())
            .await
            .unwrap();
        let _ = session.send(b"dropped").await;
        // The acceptor closes the stream; the opener observes it shortly.
        wait_until(|| session.state() == SessionState::Closed).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        node_a.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_sessions_and_rejects_new_streams() {
        let network = MemoryNetwork::new();
        let node_a = memory_node(&network);
        let node_b = memory_node(&network);

        node_a.register_fn(demo_protocol(), |_| {}).unwrap();
        let addr = node_a.start("mem:auto").await.unwrap();
        let peer = node_b.connect(&addr).await.unwrap();
        let session = node_b.open_stream(peer, demo_protocol()).await.unwrap();
        wait_until(|| inbound_registered(&node_a)).await;

        node_a.shutdown().await.unwrap();
        assert_eq!(node_a.state(), NodeState::Closed);
        assert_eq!(node_a.active_sessions().await, 0);
        // The peer side of the drained session observes the close.
        wait_until(|| session.state() == SessionState::Closed).await;

        // Second shutdown is an explicit error.
        assert!(matches!(
            node_a.shutdown().await,
            Err(ShutdownError::AlreadyShuttingDown)
        ));

        // Accept loop teardown is asynchronous; the address disappears shortly.
        let mut rejected = false;
        for _ in 0..200 {
            if node_b.connect(&addr).await.is_err() {
                rejected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(rejected, "listen address still accepting after shutdown");
    }

    #[tokio::test]
    async fn late_registration_during_shutdown_closes_instead_of_tracking() {
        use crate::transport::{IoStream, RawStream};

        let sessions: SessionTable<_> = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();
        // Shutdown has already cancelled and swept an empty table.
        cancel.cancel();

        let (probe, end) = tokio::io::duplex(1024);
        let (reader, writer) = IoStream(end).into_split();
        let peer = Keypair::generate().peer_id();
        let (session, registered) = register_session(
            peer,
            demo_protocol(),
            FrameCodec::default(),
            Vec::new(),
            reader,
            writer,
            None,
            sessions.clone(),
            None,
            &cancel,
        )
        .await;

        // The stream must not surface as a live session after shutdown.
        assert!(!registered);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(sessions.lock().await.is_empty());
        drop(probe);
    }

    // Inbound registration is asynchronous; poll until the node tracks it.
    fn inbound_registered(node: &Node<MemoryTransport>) -> bool {
        match node.sessions.try_lock() {
            Ok(sessions) => !sessions.is_empty(),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn connect_to_unknown_address_fails() {
        let network = MemoryNetwork::new();
        let node = memory_node(&network);
        let err = node.connect("mem:nowhere").await.unwrap_err();
        assert!(matches!(err, ConnectError::UnreachablePeer(_)));
    }

    #[tokio::test]
    async fn open_stream_requires_connect() {
        let network = MemoryNetwork::new();
        let node = memory_node(&network);
        let stranger = Keypair::generate().peer_id();
        let err = node.open_stream(stranger, demo_protocol()).await.unwrap_err();
        assert!(matches!(err, OpenStreamError::UnknownPeer));
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let network = MemoryNetwork::new();
        let node = memory_node(&network);
        node.start("mem:auto").await.unwrap();
        assert!(matches!(
            node.start("mem:auto").await,
            Err(NodeError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn listen_failure_is_fatal_and_surfaced() {
        let network = MemoryNetwork::new();
        let node_a = memory_node(&network);
        let node_b = memory_node(&network);
        node_a.start("mem:taken").await.unwrap();
        let err = node_b.start("mem:taken").await.unwrap_err();
        assert!(matches!(err, NodeError::Listen(_)));
        // Failed startup leaves the node usable as a client.
        assert_eq!(node_b.state(), NodeState::Created);
    }
}
