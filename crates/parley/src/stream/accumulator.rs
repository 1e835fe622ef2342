//! Buffering of incrementally produced text.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use tokio::time::Instant;

use super::StreamError;

/// Durable destination of a stream.
#[async_trait]
pub trait StreamSink: Send {
    /// Append a segment to the stored content. Must be atomic: either the
    /// whole segment is stored or nothing is.
    async fn append(&mut self, segment: &str) -> Result<()>;

    /// Mark the stream as finished. Called once, after the final flush.
    async fn complete(&mut self) -> Result<()>;
}

/// How often a failed flush is retried before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// What a finished stream left behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub flushes: usize,
    pub flushed_bytes: usize,
}

/// Buffer for one stream target with a time based flush policy.
///
/// There is exactly one writer per target, so no locking happens here.
/// Flushed content is never rewritten: every flush appends what was buffered
/// since the previous one, in append order.
pub struct StreamAccumulator<S> {
    sink: S,
    buffer: String,
    last_flush_at: Instant,
    flush_interval: Duration,
    retry: RetryPolicy,
    summary: StreamSummary,
}

impl<S: StreamSink> StreamAccumulator<S> {
    pub fn new(sink: S, flush_interval: Duration) -> Self {
        Self {
            sink,
            buffer: String::new(),
            last_flush_at: Instant::now(),
            flush_interval,
            retry: RetryPolicy::default(),
            summary: StreamSummary::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Bytes appended but not yet flushed.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub fn summary(&self) -> StreamSummary {
        self.summary
    }

    /// Buffer a chunk. Empty chunks are ignored.
    pub fn append(&mut self, chunk: &str) {
        if !chunk.is_empty() {
            self.buffer.push_str(chunk);
        }
    }

    /// Flush if forced or if the interval has elapsed since the last flush.
    ///
    /// Returns whether anything was written. An empty buffer is never
    /// written. On failure the buffer is kept, so a later flush still
    /// carries the content.
    pub async fn maybe_flush(&mut self, force: bool) -> Result<bool, StreamError> {
        if self.buffer.is_empty() {
            return Ok(false);
        }
        if !force && self.last_flush_at.elapsed() < self.flush_interval {
            return Ok(false);
        }

        self.write_buffer().await?;
        Ok(true)
    }

    async fn write_buffer(&mut self) -> Result<(), StreamError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.sink.append(&self.buffer).await {
                Ok(()) => break,
                Err(e) if attempt < attempts => {
                    warn!(
                        "Flush attempt {}/{} failed ({} bytes): {:#}",
                        attempt,
                        attempts,
                        self.buffer.len(),
                        e
                    );
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(StreamError::Flush {
                        attempts,
                        reason: format!("{e:#}"),
                    });
                }
            }
        }

        debug!("Flushed {} bytes", self.buffer.len());
        self.summary.flushes += 1;
        self.summary.flushed_bytes += self.buffer.len();
        self.buffer.clear();
        self.last_flush_at = Instant::now();
        Ok(())
    }

    /// Force a final flush, then mark the sink complete.
    ///
    /// The sink is completed even when the final flush fails; the flush error
    /// is returned in that case.
    pub async fn finalize(mut self) -> Result<StreamSummary, StreamError> {
        let flushed = self.maybe_flush(true).await;
        let completed = self
            .sink
            .complete()
            .await
            .map_err(|e| StreamError::Complete(format!("{e:#}")));

        if let Err(e) = &flushed {
            warn!(
                "Final flush failed, {} bytes not stored: {}",
                self.buffer.len(),
                e
            );
        }
        flushed?;
        completed?;
        Ok(self.summary)
    }
}
