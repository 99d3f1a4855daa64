//! Per-task execution context.

use crate::context::ExecContext;
use crate::error::ExecError;
use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Identity and control handle of one running task.
///
/// Operators receive a `&TaskContext` when asked for a partition iterator and
/// call [`check_interrupted`](Self::check_interrupted) at their suspension
/// points (opening a file, fetching a shuffle block, touching the state store).
#[derive(Clone, Debug)]
pub struct TaskContext {
    exec: Arc<ExecContext>,
    stage_id: u64,
    partition_id: usize,
    attempt: usize,
    executor_id: usize,
    interrupted: Arc<AtomicBool>,
}

impl TaskContext {
    #[must_use]
    pub fn new(exec: Arc<ExecContext>, stage_id: u64, partition_id: usize, attempt: usize) -> Self {
        let executor_id = partition_id % exec.config().num_executors.max(1);
        Self {
            exec,
            stage_id,
            partition_id,
            attempt,
            executor_id,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A first-attempt task outside any scheduled stage.
    #[must_use]
    pub fn for_partition(exec: &Arc<ExecContext>, partition_id: usize) -> Self {
        Self::new(Arc::clone(exec), 0, partition_id, 0)
    }

    #[must_use]
    pub const fn exec(&self) -> &Arc<ExecContext> {
        &self.exec
    }

    #[must_use]
    pub const fn stage_id(&self) -> u64 {
        self.stage_id
    }

    #[must_use]
    pub const fn partition_id(&self) -> usize {
        self.partition_id
    }

    #[must_use]
    pub const fn attempt(&self) -> usize {
        self.attempt
    }

    #[must_use]
    pub const fn executor_id(&self) -> usize {
        self.executor_id
    }

    /// Shared flag the scheduler sets to kill this task.
    #[must_use]
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    pub fn kill(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// # Errors
    ///
    /// Returns [`ExecError::TaskKilled`] once the task has been interrupted.
    pub fn check_interrupted(&self) -> Result<()> {
        if self.is_interrupted() {
            return Err(ExecError::TaskKilled(format!(
                "stage {} partition {} attempt {}",
                self.stage_id, self.partition_id, self.attempt
            ))
            .into());
        }
        Ok(())
    }
}
