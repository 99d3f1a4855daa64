//! Reduce-side reads over a range of shuffle partitions.

use super::shuffle::{BlockRowIter, RowCodec};
use crate::metrics::{
    BYTES_READ, LOCAL_BLOCKS_FETCHED, MetricSet, RECORDS_READ, REMOTE_BLOCKS_FETCHED,
};
use crate::row::BoxRowIter;
use crate::task::TaskContext;
use anyhow::Result;
use std::ops::Range;
use tracing::trace;

/// One reduce-side read: the shuffle, how many map outputs it has, and the
/// `[start, end)` reduce partitions to concatenate.
#[derive(Clone, Debug)]
pub struct ShuffleRead {
    pub shuffle_id: u64,
    pub num_maps: usize,
    pub reduces: Range<usize>,
    pub codec: RowCodec,
}

impl ShuffleRead {
    /// Fetch every map output and iterate the selected reduce partitions in
    /// order. Blocks written by this task's executor count as local fetches.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::FetchFailed`](crate::error::ExecError::FetchFailed)
    /// for the first missing map output and
    /// [`ExecError::TaskKilled`](crate::error::ExecError::TaskKilled) if the
    /// task was interrupted while fetching.
    pub fn open(&self, task: &TaskContext, metrics: &MetricSet) -> Result<BoxRowIter> {
        let store = task.exec().shuffles();
        let mut outputs = Vec::with_capacity(self.num_maps);
        let (mut local, mut remote, mut bytes, mut records) = (0u64, 0u64, 0u64, 0u64);
        for map_index in 0..self.num_maps {
            task.check_interrupted()?;
            let output = store.fetch(self.shuffle_id, map_index)?;
            for r in self.reduces.clone() {
                let size = output.block(r).len() as u64;
                if size == 0 {
                    continue;
                }
                if output.executor_id == task.executor_id() {
                    local += 1;
                } else {
                    remote += 1;
                }
                bytes += size;
                records += output.records().get(r).copied().unwrap_or(0);
            }
            outputs.push(output);
        }
        metrics.add(LOCAL_BLOCKS_FETCHED, local);
        metrics.add(REMOTE_BLOCKS_FETCHED, remote);
        metrics.add(BYTES_READ, bytes);
        metrics.add(RECORDS_READ, records);
        trace!(
            shuffle_id = self.shuffle_id,
            start = self.reduces.start,
            end = self.reduces.end,
            local,
            remote,
            "fetched shuffle blocks"
        );
        Ok(Box::new(BlockRowIter::new(
            outputs,
            self.reduces.clone().collect(),
            self.codec.clone(),
        )))
    }
}
