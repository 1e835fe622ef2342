//! Incremental content streaming.
//!
//! A producer (for example an assistant reply being generated) pushes chunks
//! through a [`StreamAccumulator`], which writes them to a [`StreamSink`] at
//! most once per flush interval. [`drive`] owns the loop and guarantees the
//! final flush on every exit path; [`StreamRegistry`] keeps one writer per
//! target and lets callers stop a stream.

mod accumulator;
mod registry;
mod runner;

use thiserror::Error;

pub use accumulator::{RetryPolicy, StreamAccumulator, StreamSink, StreamSummary};
pub use registry::StreamRegistry;
pub use runner::{StreamOutcome, StreamReport, drive};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("flush failed after {attempts} attempt(s): {reason}")]
    Flush { attempts: u32, reason: String },

    #[error("failed to complete stream: {0}")]
    Complete(String),

    #[error("{0} is already streaming")]
    AlreadyStreaming(String),
}
