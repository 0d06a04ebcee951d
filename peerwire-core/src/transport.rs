//! Transport provider abstraction: already-secured byte streams keyed by peer
//! identity. Discovery, NAT traversal and multiplexing are the transport's
//! concern; the node consumes streams and never reimplements them.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::identity::PeerId;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("no listener at address {0}")]
    UnknownAddress(String),
    #[error("transport closed")]
    Closed,
}

/// Read half of a secured stream. `Ok(0)` means the peer closed the stream.
pub trait StreamReader: Send + 'static {
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

/// Write half of a secured stream.
pub trait StreamWriter: Send + 'static {
    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
    fn shutdown(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// One bidirectional secured stream, split into independently owned halves so
/// the read loop and writers can run concurrently.
pub trait RawStream: Send + 'static {
    type Reader: StreamReader;
    type Writer: StreamWriter;
    fn into_split(self) -> (Self::Reader, Self::Writer);
}

/// Listen handle: yields authenticated inbound streams.
pub trait Listener: Send + 'static {
    type Stream: RawStream;
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<(PeerId, Self::Stream), TransportError>> + Send;
    fn local_addr(&self) -> &str;
}

/// Transport provider: dial and listen in the transport's own address format.
pub trait Transport: Send + Sync + 'static {
    type Stream: RawStream;
    type Listener: Listener<Stream = Self::Stream>;

    fn local_peer(&self) -> PeerId;

    fn listen(
        &self,
        addr: &str,
    ) -> impl Future<Output = Result<Self::Listener, TransportError>> + Send;

    fn dial(
        &self,
        addr: &str,
    ) -> impl Future<Output = Result<(PeerId, Self::Stream), TransportError>> + Send;
}

/// Adapter: any tokio byte stream is a `RawStream`. Transports whose streams
/// are secured below the byte level (e.g. the in-memory transport) hand these
/// out directly.
#[derive(Debug)]
pub struct IoStream<S>(pub S);

pub struct IoReader<R>(R);

pub struct IoWriter<W>(W);

impl<S> RawStream for IoStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Reader = IoReader<ReadHalf<S>>;
    type Writer = IoWriter<WriteHalf<S>>;

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        let (r, w) = tokio::io::split(self.0);
        (IoReader(r), IoWriter(w))
    }
}

impl<R> StreamReader for IoReader<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        AsyncReadExt::read(&mut self.0, buf).await
    }
}

impl<W> StreamWriter for IoWriter<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        AsyncWriteExt::write_all(&mut self.0, buf).await?;
        self.0.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        AsyncWriteExt::shutdown(&mut self.0).await
    }
}
