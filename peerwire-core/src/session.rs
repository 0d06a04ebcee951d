//! Stream session: one transport stream bound to one peer and one protocol.
//!
//! Each session runs an inbound read loop as its own task, so a stalled peer
//! never blocks delivery for others. Outbound sends serialize through a mutex
//! so concurrent callers produce whole, non-interleaved frames.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::identity::PeerId;
use crate::protocol::ProtocolId;
use crate::registry::{Handler, Inbound};
use crate::transport::{StreamReader, StreamWriter};
use crate::wire::{FrameCodec, FrameDecoder, FrameEncodeError};

const READ_CHUNK: usize = 8 * 1024;

/// Unique id for one session, for logs and the node's session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

fn state_from_u8(v: u8) -> SessionState {
    match v {
        0 => SessionState::Open,
        1 => SessionState::Closing,
        _ => SessionState::Closed,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("session is closed")]
    Closed,
    #[error("message exceeds maximum frame length")]
    MessageTooLarge,
    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),
}

impl From<FrameEncodeError> for SendError {
    fn from(_: FrameEncodeError) -> Self {
        SendError::MessageTooLarge
    }
}

struct SessionShared<W> {
    id: SessionId,
    peer: PeerId,
    protocol: ProtocolId,
    codec: FrameCodec,
    state: AtomicU8,
    cancel: CancellationToken,
    writer: Mutex<W>,
}

impl<W> SessionShared<W> {
    fn state(&self) -> SessionState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    /// First caller wins and drives the teardown. Cancels the read loop.
    fn begin_close(&self) -> bool {
        let won = self
            .state
            .compare_exchange(
                SessionState::Open as u8,
                SessionState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if won {
            self.cancel.cancel();
        }
        won
    }

    fn finish_close(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::SeqCst);
    }
}

/// Handle to one open stream. Cheap to clone; all clones share state.
pub struct StreamSession<W: StreamWriter> {
    shared: Arc<SessionShared<W>>,
}

impl<W: StreamWriter> std::fmt::Debug for StreamSession<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

impl<W: StreamWriter> Clone for StreamSession<W> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<W: StreamWriter> StreamSession<W> {
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn peer(&self) -> PeerId {
        self.shared.peer
    }

    pub fn protocol(&self) -> &ProtocolId {
        &self.shared.protocol
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Encode and write one message. Transport errors close the session and
    /// are surfaced to the caller, never retried here.
    pub async fn send(&self, payload: &[u8]) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        let frame = self.shared.codec.encode(payload)?;
        let mut writer = self.shared.writer.lock().await;
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        match writer.write_all(&frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                drop(writer);
                self.shared.begin_close();
                self.shared.finish_close();
                Err(SendError::WriteFailed(err))
            }
        }
    }

    /// Idempotent close: unblocks the read loop and shuts the writer down.
    /// Concurrent sends observe `Closed` rather than hanging.
    pub async fn close(&self) -> io::Result<()> {
        if !self.shared.begin_close() {
            return Ok(());
        }
        let result = {
            let mut writer = self.shared.writer.lock().await;
            writer.shutdown().await
        };
        self.shared.finish_close();
        result
    }
}

/// Build a session and its read loop. The caller registers the returned
/// session before spawning the loop, so teardown never races registration.
pub(crate) fn start<R, W>(
    peer: PeerId,
    protocol: ProtocolId,
    codec: FrameCodec,
    read_timeout: Option<Duration>,
    initial: Vec<u8>,
    reader: R,
    writer: W,
    handler: Option<Handler>,
    on_close: impl FnOnce(SessionId) + Send + 'static,
) -> (StreamSession<W>, impl Future<Output = ()> + Send)
where
    R: StreamReader,
    W: StreamWriter,
{
    let shared = Arc::new(SessionShared {
        id: SessionId::new(),
        peer,
        protocol,
        codec,
        state: AtomicU8::new(SessionState::Open as u8),
        cancel: CancellationToken::new(),
        writer: Mutex::new(writer),
    });
    let session = StreamSession {
        shared: shared.clone(),
    };
    let id = shared.id;
    let task = async move {
        read_loop(shared, reader, handler, read_timeout, initial).await;
        on_close(id);
    };
    (session, task)
}

enum ReadOutcome {
    Data(usize),
    Timeout,
    Failed(io::Error),
}

async fn read_some<R: StreamReader>(
    reader: &mut R,
    buf: &mut [u8],
    read_timeout: Option<Duration>,
) -> ReadOutcome {
    let result = match read_timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read(buf)).await {
            Ok(res) => res,
            Err(_) => return ReadOutcome::Timeout,
        },
        None => reader.read(buf).await,
    };
    match result {
        Ok(n) => ReadOutcome::Data(n),
        Err(err) => ReadOutcome::Failed(err),
    }
}

async fn read_loop<R, W>(
    shared: Arc<SessionShared<W>>,
    mut reader: R,
    handler: Option<Handler>,
    read_timeout: Option<Duration>,
    initial: Vec<u8>,
) where
    R: StreamReader,
    W: StreamWriter,
{
    let mut decoder = FrameDecoder::new(shared.codec);
    decoder.feed(&initial);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        // Drain every complete frame before reading more bytes.
        loop {
            match decoder.next_frame() {
                Ok(Some(payload)) => match &handler {
                    Some(handle) => handle(Inbound {
                        peer: shared.peer,
                        protocol: shared.protocol.clone(),
                        payload,
                    }),
                    None => debug!(
                        session = %shared.id,
                        protocol = %shared.protocol,
                        "dropping inbound frame with no handler"
                    ),
                },
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        session = %shared.id,
                        peer = %shared.peer,
                        %err,
                        "malformed frame, closing session"
                    );
                    teardown(&shared).await;
                    return;
                }
            }
        }

        let outcome = tokio::select! {
            _ = shared.cancel.cancelled() => {
                teardown(&shared).await;
                return;
            }
            outcome = read_some(&mut reader, &mut buf, read_timeout) => outcome,
        };
        match outcome {
            ReadOutcome::Data(0) => {
                if decoder.has_partial() {
                    warn!(
                        session = %shared.id,
                        peer = %shared.peer,
                        "stream closed mid-frame"
                    );
                } else {
                    debug!(session = %shared.id, peer = %shared.peer, "stream closed");
                }
                teardown(&shared).await;
                return;
            }
            ReadOutcome::Data(n) => decoder.feed(&buf[..n]),
            ReadOutcome::Timeout => {
                warn!(session = %shared.id, peer = %shared.peer, "read timed out");
                teardown(&shared).await;
                return;
            }
            ReadOutcome::Failed(err) => {
                debug!(
                    session = %shared.id,
                    peer = %shared.peer,
                    %err,
                    "transport error, closing session"
                );
                teardown(&shared).await;
                return;
            }
        }
    }
}

async fn teardown<W: StreamWriter>(shared: &Arc<SessionShared<W>>) {
    if shared.begin_close() {
        let mut writer = shared.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            debug!(session = %shared.id, %err, "writer shutdown failed");
        }
    }
    shared.finish_close();
}
