//! Shuffle storage, map-side writers and the row codec.
//!
//! A map task turns one input partition into a [`MapOutput`]: one serialized
//! block per reduce partition. Blocks are a sequence of frames
//! `[u32 LE length][payload]`; the payload is the packed row bytes for packed
//! shuffles and a postcard-encoded [`GenericRow`] for boxed ones.
//!
//! Two writers produce the same layout:
//! - [`ShuffleWriterKind::BypassMerge`] appends each row straight into its
//!   reduce partition's buffer. Chosen when the reduce count is small.
//! - [`ShuffleWriterKind::Sort`] buffers copied records tagged with their
//!   partition id and stable-sorts them by id before laying out the blocks.
//!
//! Both keep input order inside a reduce partition, so re-running a map task
//! over the same input yields byte-identical output whichever path runs.

use super::partitioner::Partitioner;
use crate::error::{ExecError, data_err};
use crate::partitioning::Partitioning;
use crate::row::{GenericRow, PackedRowRef, RowFormat, RowIter, RowRef};
use crate::task::TaskContext;
use crate::types::Schema;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

/// How rows are serialized into shuffle blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RowCodec {
    Packed { num_fields: usize },
    Boxed,
}

impl RowCodec {
    /// Packed when the schema allows it.
    #[must_use]
    pub fn for_schema(schema: &Schema) -> Self {
        if schema.supports_packed() {
            Self::Packed {
                num_fields: schema.len(),
            }
        } else {
            Self::Boxed
        }
    }

    #[must_use]
    pub const fn format(&self) -> RowFormat {
        match self {
            Self::Packed { .. } => RowFormat::Packed,
            Self::Boxed => RowFormat::Boxed,
        }
    }

    /// Append one framed row to `out`. Serializing is the copy that lets the
    /// producer reuse its buffer.
    ///
    /// # Errors
    ///
    /// Returns a data error if a boxed row cannot be packed for this schema.
    pub fn encode(&self, row: RowRef<'_>, schema: &Schema, out: &mut Vec<u8>) -> Result<()> {
        match (self, row) {
            (Self::Packed { .. }, RowRef::Packed(p)) => frame(out, p.as_bytes()),
            (Self::Packed { .. }, RowRef::Boxed(_)) => {
                let packed = row.to_packed(schema)?;
                frame(out, packed.as_bytes())
            }
            (Self::Boxed, _) => {
                let g = row.to_generic(schema)?;
                let bytes = postcard::to_allocvec(&g).context("encode shuffle row")?;
                frame(out, &bytes)
            }
        }
    }
}

fn frame(out: &mut Vec<u8>, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).context("shuffle row exceeds 4 GiB")?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Split the next frame off `bytes`.
///
/// # Errors
///
/// Returns a data error if the block is truncated.
pub fn next_frame(bytes: &[u8]) -> Result<(&[u8], &[u8])> {
    let Some((len, rest)) = bytes.split_first_chunk::<4>() else {
        return data_err("truncated shuffle frame header");
    };
    let len = u32::from_le_bytes(*len) as usize;
    if rest.len() < len {
        return data_err(format!(
            "shuffle frame claims {len} bytes, {} remain",
            rest.len()
        ));
    }
    Ok(rest.split_at(len))
}

/// Serialized result of one map task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapOutput {
    pub map_index: usize,
    /// Executor that wrote the blocks; readers on the same executor fetch locally.
    pub executor_id: usize,
    blocks: Vec<Vec<u8>>,
    records: Vec<u64>,
}

impl MapOutput {
    #[must_use]
    pub fn block(&self, reduce: usize) -> &[u8] {
        self.blocks.get(reduce).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn block_sizes(&self) -> Vec<u64> {
        self.blocks.iter().map(|b| b.len() as u64).collect()
    }

    #[must_use]
    pub fn records(&self) -> &[u64] {
        &self.records
    }

    #[must_use]
    pub fn num_reduce_partitions(&self) -> usize {
        self.blocks.len()
    }

    /// Every block concatenated; used to compare outputs of repeated runs.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.blocks.concat()
    }
}

/// Per reduce partition totals across all map outputs of a shuffle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapOutputStatistics {
    pub shuffle_id: u64,
    pub bytes_by_partition: Vec<u64>,
    pub records_by_partition: Vec<u64>,
}

impl MapOutputStatistics {
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.bytes_by_partition.iter().sum()
    }
}

/// What the scheduler needs to run the two sides of a shuffle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShuffleDependency {
    pub shuffle_id: u64,
    pub num_map_partitions: usize,
    pub num_reduce_partitions: usize,
    pub partitioning: Partitioning,
    pub codec: RowCodec,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShuffleWriterKind {
    BypassMerge,
    Sort,
}

impl ShuffleWriterKind {
    /// Bypass when the reduce side has at most `threshold` partitions.
    #[must_use]
    pub const fn choose(num_reduce: usize, threshold: usize) -> Self {
        if num_reduce <= threshold {
            Self::BypassMerge
        } else {
            Self::Sort
        }
    }
}

/// Partition and serialize every row of `input`.
///
/// # Errors
///
/// Propagates producer failures, partitioner evaluation errors and encoding
/// errors, and [`ExecError::TaskKilled`] if the task is interrupted.
pub fn write_map_output(
    mut input: Box<dyn RowIter>,
    partitioner: &mut Partitioner,
    codec: &RowCodec,
    schema: &Schema,
    kind: ShuffleWriterKind,
    task: &TaskContext,
) -> Result<MapOutput> {
    let n = partitioner.num_partitions();
    let mut records = vec![0u64; n];
    let blocks = match kind {
        ShuffleWriterKind::BypassMerge => {
            let mut blocks = vec![Vec::new(); n];
            while let Some(row) = input.next_row()? {
                let p = partitioner.partition(row)?;
                codec.encode(row, schema, &mut blocks[p])?;
                records[p] += 1;
            }
            blocks
        }
        ShuffleWriterKind::Sort => {
            let mut tagged: Vec<(usize, Vec<u8>)> = Vec::new();
            let mut seen = 0u64;
            while let Some(row) = input.next_row()? {
                seen += 1;
                if seen % 4096 == 0 {
                    task.check_interrupted()?;
                }
                let p = partitioner.partition(row)?;
                let mut bytes = Vec::new();
                codec.encode(row, schema, &mut bytes)?;
                tagged.push((p, bytes));
                records[p] += 1;
            }
            tagged.sort_by_key(|(p, _)| *p);
            let mut blocks = vec![Vec::new(); n];
            for (p, bytes) in tagged {
                blocks[p].extend_from_slice(&bytes);
            }
            blocks
        }
    };
    task.check_interrupted()?;
    Ok(MapOutput {
        map_index: task.partition_id(),
        executor_id: task.executor_id(),
        blocks,
        records,
    })
}

struct ShuffleEntry {
    dependency: ShuffleDependency,
    outputs: Vec<Option<Arc<MapOutput>>>,
    /// Set once every map output has been present at the same time. Stays set
    /// when outputs are lost afterwards.
    completed: bool,
}

/// Registry of shuffles and their map outputs, shared by every task of an
/// [`ExecContext`](crate::context::ExecContext).
#[derive(Clone, Default)]
pub struct ShuffleStore {
    inner: Arc<Mutex<HashMap<u64, ShuffleEntry>>>,
}

impl ShuffleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<u64, ShuffleEntry>) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Number of registered shuffles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.with(|m| m.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a shuffle. Registering an id twice keeps the existing outputs.
    pub fn register(&self, dependency: ShuffleDependency) {
        self.with(|m| {
            m.entry(dependency.shuffle_id).or_insert_with(|| {
                debug!(
                    shuffle_id = dependency.shuffle_id,
                    maps = dependency.num_map_partitions,
                    reduces = dependency.num_reduce_partitions,
                    "registered shuffle"
                );
                ShuffleEntry {
                    outputs: vec![None; dependency.num_map_partitions],
                    completed: dependency.num_map_partitions == 0,
                    dependency,
                }
            });
        });
    }

    #[must_use]
    pub fn is_registered(&self, shuffle_id: u64) -> bool {
        self.with(|m| m.contains_key(&shuffle_id))
    }

    #[must_use]
    pub fn dependency(&self, shuffle_id: u64) -> Option<ShuffleDependency> {
        self.with(|m| m.get(&shuffle_id).map(|e| e.dependency.clone()))
    }

    /// Record the output of one map task, replacing any earlier attempt.
    ///
    /// # Errors
    ///
    /// Returns a planning error for an unknown shuffle or map index.
    pub fn put_map_output(&self, shuffle_id: u64, output: MapOutput) -> Result<()> {
        self.with(|m| {
            let Some(entry) = m.get_mut(&shuffle_id) else {
                return Err(ExecError::Planning(format!("shuffle {shuffle_id} is not registered")).into());
            };
            let map_index = output.map_index;
            let Some(slot) = entry.outputs.get_mut(map_index) else {
                return Err(ExecError::Planning(format!(
                    "shuffle {shuffle_id} has no map partition {map_index}"
                ))
                .into());
            };
            trace!(shuffle_id, map_index, "stored map output");
            *slot = Some(Arc::new(output));
            if !entry.completed && entry.outputs.iter().all(Option::is_some) {
                entry.completed = true;
            }
            Ok(())
        })
    }

    /// The output of a map task.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::FetchFailed`] if the output is missing.
    pub fn fetch(&self, shuffle_id: u64, map_index: usize) -> Result<Arc<MapOutput>> {
        self.with(|m| {
            m.get(&shuffle_id)
                .and_then(|e| e.outputs.get(map_index).cloned().flatten())
                .ok_or_else(|| {
                    ExecError::FetchFailed {
                        shuffle_id,
                        map_index,
                        reason: "map output is missing".to_string(),
                    }
                    .into()
                })
        })
    }

    /// Map indices whose output is not available.
    #[must_use]
    pub fn missing_maps(&self, shuffle_id: u64) -> Vec<usize> {
        self.with(|m| {
            m.get(&shuffle_id).map_or_else(Vec::new, |e| {
                e.outputs
                    .iter()
                    .enumerate()
                    .filter(|(_, o)| o.is_none())
                    .map(|(i, _)| i)
                    .collect()
            })
        })
    }

    /// Whether the map stage of `shuffle_id` has finished at least once.
    ///
    /// Unlike [`Self::is_complete`] this stays true after an output is lost,
    /// which is what separates a stage still running from a lost output.
    #[must_use]
    pub fn has_completed(&self, shuffle_id: u64) -> bool {
        self.with(|m| m.get(&shuffle_id).is_some_and(|e| e.completed))
    }

    #[must_use]
    pub fn is_complete(&self, shuffle_id: u64) -> bool {
        self.is_registered(shuffle_id) && self.missing_maps(shuffle_id).is_empty()
    }

    /// Totals per reduce partition, once every map output is present.
    #[must_use]
    pub fn statistics(&self, shuffle_id: u64) -> Option<MapOutputStatistics> {
        self.with(|m| {
            let entry = m.get(&shuffle_id)?;
            let n = entry.dependency.num_reduce_partitions;
            let mut bytes = vec![0u64; n];
            let mut records = vec![0u64; n];
            for output in &entry.outputs {
                let output = output.as_ref()?;
                for (r, size) in output.block_sizes().into_iter().enumerate().take(n) {
                    bytes[r] += size;
                }
                for (r, count) in output.records().iter().enumerate().take(n) {
                    records[r] += count;
                }
            }
            Some(MapOutputStatistics {
                shuffle_id,
                bytes_by_partition: bytes,
                records_by_partition: records,
            })
        })
    }

    /// Forget a single map output, as if the node holding it were lost.
    pub fn remove_map_output(&self, shuffle_id: u64, map_index: usize) {
        self.with(|m| {
            if let Some(slot) = m
                .get_mut(&shuffle_id)
                .and_then(|e| e.outputs.get_mut(map_index))
            {
                *slot = None;
            }
        });
    }

    /// Forget every map output written by `executor_id`. Returns how many were lost.
    pub fn remove_outputs_on_executor(&self, executor_id: usize) -> usize {
        self.with(|m| {
            let mut lost = 0;
            for entry in m.values_mut() {
                for slot in &mut entry.outputs {
                    if slot.as_ref().is_some_and(|o| o.executor_id == executor_id) {
                        *slot = None;
                        lost += 1;
                    }
                }
            }
            lost
        })
    }

    pub fn unregister(&self, shuffle_id: u64) {
        self.with(|m| {
            m.remove(&shuffle_id);
        });
    }
}

/// Iterates the rows of one reduce partition's blocks, in order.
pub struct BlockRowIter {
    blocks: Vec<Arc<MapOutput>>,
    reduces: Vec<usize>,
    codec: RowCodec,
    /// Index into `blocks x reduces`, reduce-major.
    cursor: usize,
    offset: usize,
    /// `(start, end)` of the current packed payload within the current block.
    current_packed: Option<(usize, usize)>,
    current_boxed: Option<GenericRow>,
}

impl BlockRowIter {
    /// Rows of `reduces` (in order) from every map output in `blocks`.
    #[must_use]
    pub const fn new(blocks: Vec<Arc<MapOutput>>, reduces: Vec<usize>, codec: RowCodec) -> Self {
        Self {
            blocks,
            reduces,
            codec,
            cursor: 0,
            offset: 0,
            current_packed: None,
            current_boxed: None,
        }
    }

    fn locate(&self, cursor: usize) -> Option<(&MapOutput, usize)> {
        let maps = self.blocks.len();
        if maps == 0 {
            return None;
        }
        let reduce = *self.reduces.get(cursor / maps)?;
        Some((&self.blocks[cursor % maps], reduce))
    }
}

impl RowIter for BlockRowIter {
    fn advance(&mut self) -> Result<bool> {
        self.current_packed = None;
        self.current_boxed = None;
        loop {
            let Some((output, reduce)) = self.locate(self.cursor) else {
                return Ok(false);
            };
            let block = output.block(reduce);
            if self.offset >= block.len() {
                self.cursor += 1;
                self.offset = 0;
                continue;
            }
            let (payload, _) = next_frame(&block[self.offset..])?;
            let start = self.offset + 4;
            let end = start + payload.len();
            match &self.codec {
                RowCodec::Packed { num_fields } => {
                    PackedRowRef::new(payload, *num_fields)?;
                    self.current_packed = Some((start, end));
                }
                RowCodec::Boxed => {
                    let row: GenericRow =
                        postcard::from_bytes(payload).context("decode shuffle row")?;
                    self.current_boxed = Some(row);
                }
            }
            self.offset = end;
            return Ok(true);
        }
    }

    fn current(&self) -> Option<RowRef<'_>> {
        if let Some(g) = &self.current_boxed {
            return Some(RowRef::Boxed(g));
        }
        let (start, end) = self.current_packed?;
        let RowCodec::Packed { num_fields } = self.codec else {
            return None;
        };
        let (output, reduce) = self.locate(self.cursor)?;
        PackedRowRef::new(&output.block(reduce)[start..end], num_fields)
            .ok()
            .map(RowRef::Packed)
    }
}
