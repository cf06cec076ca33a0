//! Byte relay between a process's stdout and the next consumer.
//!
//! The source side is a lazy, finite, non-restartable sequence of chunks
//! ([`chunk_stream`]). The sink side is either another process's stdin or a
//! bounded channel feeding the HTTP body, so a slow consumer stalls the
//! relay, which stops reading, which lets the OS pipe fill and blocks the
//! producing process.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The consumer went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Destination for relayed chunks.
#[async_trait]
pub trait ChunkSink: Send {
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), SinkClosed>;

    /// Called once after the source is exhausted.
    async fn finish(&mut self) {}

    /// Resolves once the consumer is gone. Sinks that can only detect this
    /// on write never resolve.
    async fn closed(&mut self) {
        futures::future::pending::<()>().await
    }
}

/// Adapts any async writer (a child's stdin) into a [`ChunkSink`].
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> ChunkSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        self.writer.write_all(&chunk).await.map_err(|_| SinkClosed)
    }

    async fn finish(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

#[async_trait]
impl ChunkSink for mpsc::Sender<io::Result<Bytes>> {
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        self.send(Ok(chunk)).await.map_err(|_| SinkClosed)
    }

    async fn closed(&mut self) {
        mpsc::Sender::closed(self).await
    }
}

/// Read `reader` in chunks of at most `chunk_size` bytes until EOF or the
/// first error, after which the stream ends.
pub fn chunk_stream<R>(reader: R, chunk_size: usize) -> impl Stream<Item = io::Result<Bytes>> + Send
where
    R: AsyncRead + Unpin + Send + 'static,
{
    futures::stream::unfold(Some(reader), move |state| async move {
        let mut reader = state?;
        let mut buf = vec![0u8; chunk_size];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(reader)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
}

/// Why a relay stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnd {
    /// The producer reached end of stream.
    SourceExhausted,
    /// The consumer stopped accepting data.
    SinkClosed,
    /// The cancellation token fired.
    Cancelled,
    /// Reading from the producer failed.
    SourceError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub bytes: u64,
    pub chunks: u64,
    pub end: RelayEnd,
}

/// Copy every chunk from `source` into `sink`, in order, until one side
/// ends or `cancel` fires. Each iteration observes cancellation, and a
/// consumer that leaves while the source is stalled is noticed without
/// waiting for the next chunk.
pub async fn relay<S, K>(source: S, sink: &mut K, cancel: &CancellationToken) -> RelayOutcome
where
    S: Stream<Item = io::Result<Bytes>> + Send,
    K: ChunkSink + ?Sized,
{
    let mut source = std::pin::pin!(source);
    let mut bytes = 0u64;
    let mut chunks = 0u64;

    let end = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break RelayEnd::Cancelled,
            _ = sink.closed() => break RelayEnd::SinkClosed,
            next = source.next() => next,
        };
        let chunk = match next {
            None => {
                sink.finish().await;
                break RelayEnd::SourceExhausted;
            }
            Some(Err(e)) => break RelayEnd::SourceError(e.to_string()),
            Some(Ok(chunk)) => chunk,
        };

        let len = chunk.len() as u64;
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break RelayEnd::Cancelled,
            sent = sink.send_chunk(chunk) => sent,
        };
        if sent.is_err() {
            break RelayEnd::SinkClosed;
        }
        bytes += len;
        chunks += 1;
    };

    debug!(bytes, chunks, end = ?end, "Relay finished");
    RelayOutcome { bytes, chunks, end }
}
