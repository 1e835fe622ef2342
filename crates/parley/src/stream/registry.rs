//! One writer per stream target.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::Stream;
use log::{info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{StreamAccumulator, StreamError, StreamReport, StreamSink, drive};

/// Active streams by target id.
#[derive(Default)]
pub struct StreamRegistry {
    active: DashMap<String, CancellationToken>,
    tasks: TaskTracker,
}

/// Removes the registry entry when the stream task ends, however it ends.
struct ActiveStream {
    registry: Arc<StreamRegistry>,
    target: String,
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.registry.active.remove(&self.target);
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start driving `chunks` into `acc` on a background task.
    ///
    /// Fails with [`StreamError::AlreadyStreaming`] if the target already has
    /// a writer.
    pub fn spawn<S, C>(
        self: &Arc<Self>,
        target: impl Into<String>,
        acc: StreamAccumulator<S>,
        chunks: C,
    ) -> Result<JoinHandle<StreamReport>, StreamError>
    where
        S: StreamSink + 'static,
        C: Stream<Item = Result<String>> + Send + Unpin + 'static,
    {
        let target = target.into();
        let cancel = CancellationToken::new();
        match self.active.entry(target.clone()) {
            Entry::Occupied(_) => return Err(StreamError::AlreadyStreaming(target)),
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
            }
        }

        let guard = ActiveStream {
            registry: Arc::clone(self),
            target,
        };
        Ok(self.tasks.spawn(async move {
            let report = drive(acc, chunks, cancel).await;
            info!(
                "Stream {} ended: {:?} ({} flushes, {} bytes)",
                guard.target, report.outcome, report.summary.flushes, report.summary.flushed_bytes
            );
            drop(guard);
            report
        }))
    }

    /// Ask the writer of `target` to stop. Returns whether one was running.
    pub fn cancel(&self, target: &str) -> bool {
        match self.active.get(target) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every active stream, e.g. at shutdown.
    pub fn cancel_all(&self) {
        for entry in self.active.iter() {
            entry.value().cancel();
        }
    }

    /// Cancel every stream and wait until each has finalized, for at most
    /// `bound`. Returns whether all of them finished in time.
    pub async fn shutdown(&self, bound: Duration) -> bool {
        self.cancel_all();
        self.tasks.close();
        let drained = tokio::time::timeout(bound, self.tasks.wait()).await.is_ok();
        if drained {
            info!("All streams finalized");
        } else {
            warn!(
                "{} stream(s) still finalizing after {:?}",
                self.tasks.len(),
                bound
            );
        }
        self.tasks.reopen();
        drained
    }

    pub fn is_active(&self, target: &str) -> bool {
        self.active.contains_key(target)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
