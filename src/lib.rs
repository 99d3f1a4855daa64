//! # Ironexec
//!
//! The **physical execution layer** of a partitioned SQL engine. Given a tree
//! of physical operators annotated with what each operator requires of its
//! inputs, ironexec makes the tree executable and runs it:
//!
//! - **Rows** come in two formats: a compact packed binary layout and a boxed
//!   `Vec<Value>` form. Operators pull rows through a lending iterator, so a
//!   packed row borrowed from a producer must be copied before it is kept.
//! - **Planning** inserts shuffle and broadcast exchanges where a required
//!   distribution is not met, local sorts where a required ordering is
//!   missing, row-format converters, and fused whole-stage operators.
//! - **Exchanges** redistribute rows between partitions by hash, range,
//!   round-robin or single partitioning. Map outputs are byte-for-byte
//!   reproducible so lost outputs can be recomputed.
//! - **Scans** read JSON-lines files with hive-style partition directories,
//!   bucketed layouts, split packing and runtime partition pruning, or any
//!   pluggable in-process row source.
//! - **Stateful processing** runs user processors per grouping key over a
//!   versioned, checksummed state store, committing only once all output has
//!   been consumed.
//! - **Runner**: a local task harness that runs map stages, coalesces small
//!   post-shuffle partitions and retries failed tasks.
//!
//! ## Quick Start
//!
//! ```
//! use ironexec::exec::FilterExec;
//! use ironexec::expr::{col, lit};
//! use ironexec::plan::PlanRef;
//! use ironexec::testing::{int_schema, memory_scan, sequential_rows, test_config, test_runner};
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let schema = int_schema(&["id", "bucket"]);
//! let scan = memory_scan(&schema, sequential_rows(&schema, &[5, 5]))?;
//! let plan: PlanRef = Arc::new(FilterExec::new(col("bucket").equal(lit(0)), scan)?);
//!
//! let rows = test_runner(test_config())?.collect(&plan)?;
//! assert_eq!(rows.len(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `io-jsonl` (default): the JSON-lines file format for file scans.
//! - `spilling` (default): sorts spill sorted runs to temporary files once
//!   their buffer passes `sort_spill_threshold_bytes`.

pub mod config;
pub mod context;
pub mod error;
pub mod exchange;
pub mod exec;
pub mod expr;
pub mod hash;
pub mod logging;
pub mod metrics;
pub mod partitioning;
pub mod plan;
pub mod planner;
pub mod row;
pub mod runner;
pub mod scan;
pub mod state;
pub mod task;
pub mod testing;
pub mod types;
pub mod utils;

pub use config::ExecConfig;
pub use context::{ContextRegistry, ExecContext};
pub use error::ExecError;
pub use partitioning::{Distribution, Partitioning};
pub use plan::{ExecNode, PlanRef};
pub use planner::{PreparedPlan, prepare_for_execution};
pub use row::{GenericRow, PackedRow, Row};
pub use runner::{ExecMode, Runner};
pub use task::TaskContext;
pub use types::{DataType, Field, Schema, Value};
