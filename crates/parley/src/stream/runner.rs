//! Drives a chunk stream into an accumulator.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use anyhow::Result;
use futures::{FutureExt, Stream, StreamExt};
use log::{error, warn};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use super::{StreamAccumulator, StreamSink, StreamSummary};

/// How the producing side ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
    /// Upstream error or a flush that kept failing.
    Failed(String),
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    pub outcome: StreamOutcome,
    pub summary: StreamSummary,
    /// Set when the final flush or completion failed.
    pub finalize_error: Option<String>,
}

/// Consume `chunks` into `acc` until the stream ends, fails, is cancelled or
/// panics, then finalize.
///
/// Finalization runs on every one of those paths, so whatever was produced
/// before the stop is stored. The accumulator is also flushed on an idle tick
/// so a stalled producer does not hold back buffered text.
pub async fn drive<S, C>(
    mut acc: StreamAccumulator<S>,
    mut chunks: C,
    cancel: CancellationToken,
) -> StreamReport
where
    S: StreamSink,
    C: Stream<Item = Result<String>> + Send + Unpin,
{
    let outcome = match AssertUnwindSafe(consume(&mut acc, &mut chunks, &cancel))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            error!("Stream producer panicked, finalizing buffered content");
            StreamOutcome::Panicked
        }
    };

    let pending_summary = acc.summary();
    let (summary, finalize_error) = match acc.finalize().await {
        Ok(summary) => (summary, None),
        Err(e) => {
            error!("Failed to finalize stream: {}", e);
            (pending_summary, Some(e.to_string()))
        }
    };

    StreamReport {
        outcome,
        summary,
        finalize_error,
    }
}

async fn consume<S, C>(
    acc: &mut StreamAccumulator<S>,
    chunks: &mut C,
    cancel: &CancellationToken,
) -> StreamOutcome
where
    S: StreamSink,
    C: Stream<Item = Result<String>> + Send + Unpin,
{
    let period = acc.flush_interval().max(Duration::from_millis(1));
    let mut idle = interval(period);
    idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let flushed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamOutcome::Cancelled,
            next = chunks.next() => match next {
                Some(Ok(chunk)) => {
                    acc.append(&chunk);
                    acc.maybe_flush(false).await
                }
                Some(Err(e)) => {
                    warn!("Upstream stream error: {:#}", e);
                    return StreamOutcome::Failed(format!("{e:#}"));
                }
                None => return StreamOutcome::Completed,
            },
            _ = idle.tick() => acc.maybe_flush(false).await,
        };

        if let Err(e) = flushed {
            return StreamOutcome::Failed(e.to_string());
        }
    }
}
