//! Test fixtures for plans built from this crate's operators.
//!
//! - **Builders**: schemas, deterministic row sets and in-memory scans,
//!   optionally laid out by the same hash function the exchanges use.
//! - **Fixtures**: on-disk JSON-lines tables (plain, hive-partitioned or
//!   bucketed) written under a temporary directory.
//! - **Assertions**: row comparisons that ignore partition order.
//!
//! ```
//! use ironexec::testing::*;
//!
//! let schema = int_schema(&["k", "v"]);
//! let parts = sequential_rows(&schema, &[3, 2]);
//! assert_eq!(parts.iter().map(Vec::len).sum::<usize>(), 5);
//! ```

pub mod assertions;
pub mod builders;
pub mod fixtures;

pub use assertions::*;
pub use builders::*;
pub use fixtures::*;

use crate::config::ExecConfig;
use crate::context::ExecContext;
use crate::runner::{ExecMode, Runner};
use anyhow::Result;
use std::sync::Arc;

/// A sequential runner over a fresh context, with adaptive coalescing off so
/// partition counts in tests are exactly what the plan says.
///
/// # Errors
///
/// Returns an error if `config` is invalid.
pub fn test_runner(config: ExecConfig) -> Result<Runner> {
    crate::logging::init_test_tracing();
    let ctx = ExecContext::new(config.with_adaptive(false))?;
    Runner::new(ctx).with_mode(ExecMode::Sequential)
}

/// A small config for tests: few shuffle partitions and one executor.
#[must_use]
pub fn test_config() -> ExecConfig {
    ExecConfig::default()
        .with_shuffle_partitions(4)
        .with_default_parallelism(2)
}

/// Context for driving operators by hand.
///
/// # Errors
///
/// Returns an error if `config` is invalid.
pub fn test_context(config: ExecConfig) -> Result<Arc<ExecContext>> {
    crate::logging::init_test_tracing();
    ExecContext::new(config)
}
