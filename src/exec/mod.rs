//! Physical operators other than exchanges and scans.

pub mod basic;
pub mod codegen;
pub mod convert;
pub mod generate;
pub mod join;
pub mod limit;
pub mod sort;

pub use basic::{FilterExec, ProjectExec};
pub use codegen::WholeStageExec;
pub use convert::{ToBoxedExec, ToPackedExec};
pub use generate::{GenerateExec, Generator};
pub use join::{BroadcastHashJoinExec, SortMergeJoinExec};
pub use limit::{
    CollectLimitExec, GlobalLimitExec, GlobalLimitMode, LocalLimitExec, TakeOrderedAndProjectExec,
    compute_drops, compute_takes,
};
pub use sort::SortExec;
