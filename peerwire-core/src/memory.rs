//! In-memory transport: duplex pipes registered on a process-local network.
//! Used by tests and single-process demos; streams are trusted by construction.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::identity::{Keypair, PeerId};
use crate::transport::{IoStream, Listener, Transport, TransportError};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Process-local address space for memory transports. Share one network
/// between every node that should be able to reach the others.
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: Mutex<HashMap<String, MemoryEndpoint>>,
}

struct MemoryEndpoint {
    peer: PeerId,
    tx: mpsc::UnboundedSender<(PeerId, DuplexStream)>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MemoryEndpoint>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    keypair: Arc<Keypair>,
}

impl MemoryTransport {
    pub fn new(network: Arc<MemoryNetwork>, keypair: Arc<Keypair>) -> Self {
        Self { network, keypair }
    }
}

impl Transport for MemoryTransport {
    type Stream = IoStream<DuplexStream>;
    type Listener = MemoryListener;

    fn local_peer(&self) -> PeerId {
        self.keypair.peer_id()
    }

    async fn listen(&self, addr: &str) -> Result<MemoryListener, TransportError> {
        let addr = if addr.is_empty() || addr == "mem:auto" {
            format!("mem:{}", uuid::Uuid::new_v4().simple())
        } else {
            addr.to_string()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut listeners = self.network.lock();
            if listeners.contains_key(&addr) {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    addr,
                )));
            }
            listeners.insert(
                addr.clone(),
                MemoryEndpoint {
                    peer: self.keypair.peer_id(),
                    tx,
                },
            );
        }
        Ok(MemoryListener {
            network: self.network.clone(),
            local_addr: addr,
            rx,
        })
    }

    async fn dial(&self, addr: &str) -> Result<(PeerId, IoStream<DuplexStream>), TransportError> {
        let (peer, tx) = {
            let listeners = self.network.lock();
            let endpoint = listeners
                .get(addr)
                .ok_or_else(|| TransportError::UnknownAddress(addr.to_string()))?;
            (endpoint.peer, endpoint.tx.clone())
        };
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        tx.send((self.keypair.peer_id(), remote))
            .map_err(|_| TransportError::UnknownAddress(addr.to_string()))?;
        Ok((peer, IoStream(local)))
    }
}

pub struct MemoryListener {
    network: Arc<MemoryNetwork>,
    local_addr: String,
    rx: mpsc::UnboundedReceiver<(PeerId, DuplexStream)>,
}

impl Listener for MemoryListener {
    type Stream = IoStream<DuplexStream>;

    async fn accept(&mut self) -> Result<(PeerId, IoStream<DuplexStream>), TransportError> {
        self.rx
            .recv()
            .await
            .map(|(peer, stream)| (peer, IoStream(stream)))
            .ok_or(TransportError::Closed)
    }

    fn local_addr(&self) -> &str {
        &self.local_addr
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.lock().remove(&self.local_addr);
    }
}
