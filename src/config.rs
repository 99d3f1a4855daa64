//! Execution configuration.
//!
//! [`ExecConfig`] carries every knob the execution layer reads. It has sensible
//! defaults, builder-style setters, and can be loaded from a JSON document where
//! missing fields fall back to their defaults.
//!
//! ```
//! use ironexec::config::ExecConfig;
//!
//! let cfg = ExecConfig::default()
//!     .with_shuffle_partitions(8)
//!     .with_adaptive(false);
//! assert_eq!(cfg.shuffle_partitions, 8);
//! ```

use anyhow::{Context, Result, ensure};
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};

const MIB: u64 = 1024 * 1024;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Partition count used for canonical hash/range partitionings inserted by the planner.
    pub shuffle_partitions: usize,
    /// Coalesce post-shuffle partitions once map statistics are known.
    pub adaptive_enabled: bool,
    /// Target size of a coalesced post-shuffle partition.
    pub advisory_partition_size_bytes: u64,
    /// Lower bound on the number of partitions coalescing may produce.
    pub coalesce_min_partitions: Option<usize>,
    /// A coalesced partition smaller than `factor * target` is merged into a neighbour.
    pub small_partition_factor: f64,
    /// Upper bound on the bytes packed into one file-scan partition.
    pub max_partition_bytes: u64,
    /// Estimated cost of opening a file, expressed in bytes.
    pub open_cost_bytes: u64,
    /// Number of task slots in the cluster; drives split sizing.
    pub default_parallelism: usize,
    /// Use bucketed reads when a relation carries a bucket spec.
    pub bucketing_enabled: bool,
    /// Fuse compilable operator chains into a single stage.
    pub whole_stage_codegen: bool,
    /// Growth factor for the number of partitions scanned by incremental collect-limit.
    pub limit_scale_up_factor: usize,
    /// Reduce partition count at or below which the shuffle writer serializes eagerly.
    pub bypass_merge_threshold: usize,
    /// In-memory bytes a sort buffers before spilling a sorted run.
    pub sort_spill_threshold_bytes: u64,
    /// Attempts per task before the harness gives up.
    pub max_task_attempts: usize,
    /// Attempts per shuffle map stage before the harness gives up.
    pub max_stage_attempts: usize,
    /// Number of simulated executors; used for local/remote block accounting.
    pub num_executors: usize,
    /// Default root directory for state stores.
    pub state_checkpoint_dir: Option<PathBuf>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            shuffle_partitions: 200,
            adaptive_enabled: true,
            advisory_partition_size_bytes: 64 * MIB,
            coalesce_min_partitions: None,
            small_partition_factor: 0.2,
            max_partition_bytes: 128 * MIB,
            open_cost_bytes: 4 * MIB,
            default_parallelism: num_cpus::get().max(2),
            bucketing_enabled: true,
            whole_stage_codegen: true,
            limit_scale_up_factor: 4,
            bypass_merge_threshold: 200,
            sort_spill_threshold_bytes: 64 * MIB,
            max_task_attempts: 4,
            max_stage_attempts: 4,
            num_executors: 1,
            state_checkpoint_dir: None,
        }
    }
}

impl ExecConfig {
    /// Load a configuration from a JSON file. Absent fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or fails validation.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&text)
            .with_context(|| format!("parse exec config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check that the configuration is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.shuffle_partitions > 0, "shuffle_partitions must be > 0");
        ensure!(self.default_parallelism > 0, "default_parallelism must be > 0");
        ensure!(self.max_partition_bytes > 0, "max_partition_bytes must be > 0");
        ensure!(self.limit_scale_up_factor >= 2, "limit_scale_up_factor must be >= 2");
        ensure!(self.max_task_attempts > 0, "max_task_attempts must be > 0");
        ensure!(self.max_stage_attempts > 0, "max_stage_attempts must be > 0");
        ensure!(self.num_executors > 0, "num_executors must be > 0");
        ensure!(
            (0.0..=1.0).contains(&self.small_partition_factor),
            "small_partition_factor must be within [0, 1]"
        );
        Ok(())
    }

    #[must_use]
    pub const fn with_shuffle_partitions(mut self, n: usize) -> Self {
        self.shuffle_partitions = n;
        self
    }

    #[must_use]
    pub const fn with_adaptive(mut self, enabled: bool) -> Self {
        self.adaptive_enabled = enabled;
        self
    }

    #[must_use]
    pub const fn with_advisory_partition_size(mut self, bytes: u64) -> Self {
        self.advisory_partition_size_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_whole_stage_codegen(mut self, enabled: bool) -> Self {
        self.whole_stage_codegen = enabled;
        self
    }

    #[must_use]
    pub const fn with_default_parallelism(mut self, n: usize) -> Self {
        self.default_parallelism = n;
        self
    }

    #[must_use]
    pub const fn with_bypass_merge_threshold(mut self, n: usize) -> Self {
        self.bypass_merge_threshold = n;
        self
    }

    #[must_use]
    pub const fn with_sort_spill_threshold(mut self, bytes: u64) -> Self {
        self.sort_spill_threshold_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_num_executors(mut self, n: usize) -> Self {
        self.num_executors = n;
        self
    }

    #[must_use]
    pub fn with_state_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_checkpoint_dir = Some(dir.into());
        self
    }

    /// Minimum partition count adaptive coalescing must preserve.
    #[must_use]
    pub fn min_coalesced_partitions(&self) -> usize {
        self.coalesce_min_partitions
            .unwrap_or(self.default_parallelism)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::TempDir;

    #[test]
    fn partial_json_keeps_remaining_defaults() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("exec.json");
        write(&path, r#"{"shuffle_partitions": 16, "adaptive_enabled": false}"#)?;
        let cfg = ExecConfig::from_json_file(&path)?;
        assert_eq!(cfg.shuffle_partitions, 16);
        assert!(!cfg.adaptive_enabled);
        assert_eq!(cfg.open_cost_bytes, 4 * MIB);
        assert_eq!(cfg.limit_scale_up_factor, 4);
        assert!(cfg.state_checkpoint_dir.is_none());
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected_on_load() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("exec.json");
        write(&path, r#"{"limit_scale_up_factor": 1}"#)?;
        let err = ExecConfig::from_json_file(&path).unwrap_err();
        assert!(err.to_string().contains("limit_scale_up_factor"));

        write(&path, "{ not json")?;
        assert!(ExecConfig::from_json_file(&path).is_err());
        assert!(ExecConfig::from_json_file(dir.path().join("missing.json")).is_err());
        Ok(())
    }

    #[test]
    fn validation_names_the_offending_field() {
        let zero = ExecConfig::default().with_shuffle_partitions(0);
        assert!(zero.validate().unwrap_err().to_string().contains("shuffle_partitions"));
        let factor = ExecConfig {
            small_partition_factor: 1.5,
            ..ExecConfig::default()
        };
        assert!(factor.validate().is_err());
        assert!(ExecConfig::default().validate().is_ok());
    }

    #[test]
    fn coalescing_floor_falls_back_to_parallelism() {
        let cfg = ExecConfig::default().with_default_parallelism(6);
        assert_eq!(cfg.min_coalesced_partitions(), 6);
        let pinned = ExecConfig {
            coalesce_min_partitions: Some(0),
            ..cfg
        };
        assert_eq!(pinned.min_coalesced_partitions(), 1);
    }
}
