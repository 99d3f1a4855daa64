//! Error taxonomy for the execution layer.
//!
//! All fallible APIs in this crate return [`anyhow::Result`]. Failures that the
//! surrounding scheduler needs to classify are raised as an [`ExecError`] and
//! travel inside the `anyhow::Error`; callers recover the class with
//! [`ExecError::classify`] (or `err.downcast_ref::<ExecError>()`).
//!
//! Classification guidance:
//! - [`ExecError::Planning`] / [`ExecError::InvalidBucketFile`]: raised while building or
//!   preparing a plan. Never retried.
//! - [`ExecError::Data`]: malformed input discovered while a task runs. Aborts the task.
//! - [`ExecError::FetchFailed`] / [`ExecError::StateStore`]: transient I/O. The task (or the
//!   upstream map stage) is re-executed by the scheduler.
//! - [`ExecError::TaskKilled`]: the scheduler interrupted the task.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    /// Unsupported partitioning combination, bad configuration, unresolvable plan.
    #[error("planning error: {0}")]
    Planning(String),

    /// A data file name does not carry a valid bucket id.
    #[error("invalid bucket file name: {0}")]
    InvalidBucketFile(String),

    /// Corrupt or malformed data encountered while executing a task.
    #[error("data error: {0}")]
    Data(String),

    /// Map output for a shuffle could not be fetched by a reduce task.
    #[error("fetch failed for shuffle {shuffle_id} map {map_index}: {reason}")]
    FetchFailed {
        shuffle_id: u64,
        map_index: usize,
        reason: String,
    },

    /// State store I/O failure.
    #[error("state store error: {0}")]
    StateStore(String),

    /// The task was interrupted by the scheduler.
    #[error("task killed: {0}")]
    TaskKilled(String),
}

impl ExecError {
    /// Returns true if the scheduler may re-run the failed task.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::FetchFailed { .. } | Self::StateStore(_))
    }

    /// Find the first `ExecError` in an error chain.
    #[must_use]
    pub fn classify(err: &anyhow::Error) -> Option<&Self> {
        err.chain().find_map(|e| e.downcast_ref::<Self>())
    }
}

/// Shorthand for `Err(ExecError::Planning(..).into())`.
pub fn planning_err<T>(msg: impl Into<String>) -> anyhow::Result<T> {
    Err(ExecError::Planning(msg.into()).into())
}

/// Shorthand for `Err(ExecError::Data(..).into())`.
pub fn data_err<T>(msg: impl Into<String>) -> anyhow::Result<T> {
    Err(ExecError::Data(msg.into()).into())
}
