//! Input splits and how they are grouped into scan partitions.
//!
//! Non-bucketed scans cut splittable files into pieces of at most
//! `max_split_bytes`, sort the pieces by size (largest first) and pack them
//! greedily, charging every piece a fixed open cost. Bucketed scans put every
//! file of bucket `i` into partition `i`, one partition per bucket.

use crate::config::ExecConfig;
use crate::error::ExecError;
use crate::types::Value;
use anyhow::Result;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::debug;

static BUCKET_FILE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r".*_(\d+)(?:\..*)?$").ok());

/// A file known to the index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStatus {
    pub path: PathBuf,
    pub size: u64,
    /// Hosts holding a replica of the file, for locality hints.
    pub hosts: Vec<String>,
}

impl FileStatus {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            hosts: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_hosts(mut self, hosts: Vec<String>) -> Self {
        self.hosts = hosts;
        self
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Files that share one set of partition column values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionDirectory {
    pub values: Vec<Value>,
    pub files: Vec<FileStatus>,
}

/// A byte range of one file together with its partition values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionedFile {
    pub path: PathBuf,
    pub start: u64,
    pub length: u64,
    pub partition_values: Vec<Value>,
    pub hosts: Vec<String>,
}

/// The splits one scan task reads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilePartition {
    pub index: usize,
    pub files: Vec<PartitionedFile>,
}

impl FilePartition {
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// Up to three hosts holding the most bytes of this partition.
    #[must_use]
    pub fn preferred_locations(&self) -> Vec<String> {
        let mut by_host: HashMap<&str, u64> = HashMap::new();
        for f in &self.files {
            for h in &f.hosts {
                *by_host.entry(h.as_str()).or_default() += f.length;
            }
        }
        let mut hosts: Vec<(&str, u64)> = by_host.into_iter().collect();
        hosts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        hosts.into_iter().take(3).map(|(h, _)| h.to_string()).collect()
    }
}

/// Bucket id encoded in a data file name, e.g. `part-00000_00003.jsonl` is
/// bucket 3.
#[must_use]
pub fn bucket_id_of(file_name: &str) -> Option<usize> {
    BUCKET_FILE
        .as_ref()?
        .captures(file_name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Target split size: the configured maximum, shrunk so every core gets work
/// but never below the open cost.
#[must_use]
pub fn max_split_bytes(config: &ExecConfig, selected: &[PartitionDirectory]) -> u64 {
    let open = config.open_cost_bytes;
    let total: u64 = selected
        .iter()
        .flat_map(|d| &d.files)
        .map(|f| f.size + open)
        .sum();
    let per_core = total / config.default_parallelism.max(1) as u64;
    config.max_partition_bytes.min(open.max(per_core))
}

/// Cut every file into splits of at most `max_split` bytes (or one split per
/// file if the format cannot be split), largest first. Splits cover each file
/// exactly and never cross files.
#[must_use]
pub fn split_files(
    selected: &[PartitionDirectory],
    max_split: u64,
    splittable: bool,
) -> Vec<PartitionedFile> {
    let mut splits = Vec::new();
    for dir in selected {
        for file in &dir.files {
            if splittable && max_split > 0 && file.size > max_split {
                let mut offset = 0;
                while offset < file.size {
                    let length = max_split.min(file.size - offset);
                    splits.push(PartitionedFile {
                        path: file.path.clone(),
                        start: offset,
                        length,
                        partition_values: dir.values.clone(),
                        hosts: file.hosts.clone(),
                    });
                    offset += length;
                }
            } else {
                splits.push(PartitionedFile {
                    path: file.path.clone(),
                    start: 0,
                    length: file.size,
                    partition_values: dir.values.clone(),
                    hosts: file.hosts.clone(),
                });
            }
        }
    }
    splits.sort_by(|a, b| b.length.cmp(&a.length));
    splits
}

/// Pack size-sorted splits into partitions. A partition is closed when adding
/// the next split plus its open cost would exceed `max_split`.
#[must_use]
pub fn pack_partitions(splits: Vec<PartitionedFile>, max_split: u64, open_cost: u64) -> Vec<FilePartition> {
    let mut partitions = Vec::new();
    let mut current: Vec<PartitionedFile> = Vec::new();
    let mut size = 0u64;
    for split in splits {
        if !current.is_empty() && size + split.length + open_cost > max_split {
            partitions.push(FilePartition {
                index: partitions.len(),
                files: std::mem::take(&mut current),
            });
            size = 0;
        }
        size += split.length + open_cost;
        current.push(split);
    }
    if !current.is_empty() {
        partitions.push(FilePartition {
            index: partitions.len(),
            files: current,
        });
    }
    debug!(partitions = partitions.len(), max_split, open_cost, "packed file splits");
    partitions
}

/// One partition per bucket. Files of buckets outside `keep` are dropped;
/// buckets without files yield empty partitions.
///
/// # Errors
///
/// Returns [`ExecError::InvalidBucketFile`] for a file name without a bucket id
/// or with an id outside `[0, num_buckets)`.
pub fn bucketed_partitions(
    selected: &[PartitionDirectory],
    num_buckets: usize,
    keep: Option<&BTreeSet<usize>>,
) -> Result<Vec<FilePartition>> {
    let mut partitions: Vec<FilePartition> = (0..num_buckets)
        .map(|index| FilePartition {
            index,
            files: Vec::new(),
        })
        .collect();
    for dir in selected {
        for file in &dir.files {
            let name = file.file_name();
            let Some(bucket) = bucket_id_of(&name).filter(|b| *b < num_buckets) else {
                return Err(ExecError::InvalidBucketFile(format!(
                    "{} (expected a bucket id below {num_buckets})",
                    file.path.display()
                ))
                .into());
            };
            if keep.is_some_and(|k| !k.contains(&bucket)) {
                continue;
            }
            partitions[bucket].files.push(PartitionedFile {
                path: file.path.clone(),
                start: 0,
                length: file.size,
                partition_values: dir.values.clone(),
                hosts: file.hosts.clone(),
            });
        }
    }
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bucket_ids() {
        assert_eq!(bucket_id_of("part-00000_00003.jsonl"), Some(3));
        assert_eq!(bucket_id_of("part-1_12"), Some(12));
        assert_eq!(bucket_id_of("part-00000.jsonl"), None);
    }

    #[test]
    fn splits_cover_each_file_exactly() {
        let dir = PartitionDirectory {
            values: Vec::new(),
            files: vec![FileStatus::new("/d/a", 25), FileStatus::new("/d/b", 7)],
        };
        let splits = split_files(&[dir], 10, true);
        let a: u64 = splits
            .iter()
            .filter(|s| s.path == PathBuf::from("/d/a"))
            .map(|s| s.length)
            .sum();
        assert_eq!(a, 25);
        assert_eq!(splits.len(), 4);
        assert!(splits.windows(2).all(|w| w[0].length >= w[1].length));
    }

    #[test]
    fn preferred_locations_rank_by_bytes() {
        let part = FilePartition {
            index: 0,
            files: vec![
                PartitionedFile {
                    path: "/a".into(),
                    start: 0,
                    length: 10,
                    partition_values: Vec::new(),
                    hosts: vec!["h1".into(), "h2".into()],
                },
                PartitionedFile {
                    path: "/b".into(),
                    start: 0,
                    length: 30,
                    partition_values: Vec::new(),
                    hosts: vec!["h2".into()],
                },
            ],
        };
        assert_eq!(part.preferred_locations(), vec!["h2".to_string(), "h1".to_string()]);
    }
}
