//! Sort with spilling.
//!
//! Rows are copied into an in-memory buffer together with their sort key. When
//! the buffer's estimated footprint passes `sort_spill_threshold_bytes` it is
//! sorted and written to an anonymous temp file as one sorted run. At the end
//! the in-memory remainder and all runs are k-way merged. Spilling is reported
//! through `spillSize` / `numSpills` and is never an error.
//!
//! Run files are a sequence of `[u32 LE length][postcard-encoded Row]` records.

use crate::expr::{RowOrdering, SortOrder};
use crate::metrics::{MetricSet, NUM_OUTPUT_ROWS, NUM_SPILLS, SORT_TIME_MS, SPILL_SIZE};
use crate::partitioning::{Distribution, Partitioning};
use crate::plan::{ExecNode, FormatRequirement, MetricsEmitter, PlanRef, RowProducer, expect_children};
use crate::row::{BoxRowIter, Row, RowFormat, RowIter, RowRef};
use crate::task::TaskContext;
use crate::types::{Schema, Value};
use anyhow::{Context, Result};
use std::any::Any;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub struct SortExec {
    ordering: Vec<SortOrder>,
    /// A global sort requires its input range partitioned on the sort keys.
    global: bool,
    child: PlanRef,
    metrics: Arc<MetricSet>,
}

impl SortExec {
    /// # Errors
    ///
    /// Returns a planning error if a sort key does not bind to the child schema.
    pub fn new(ordering: Vec<SortOrder>, global: bool, child: PlanRef) -> Result<Self> {
        RowOrdering::new(&ordering, child.schema())?;
        Ok(Self {
            ordering,
            global,
            child,
            metrics: Arc::new(MetricSet::new(&[
                NUM_OUTPUT_ROWS,
                SPILL_SIZE,
                NUM_SPILLS,
                SORT_TIME_MS,
            ])),
        })
    }

    #[must_use]
    pub fn ordering(&self) -> &[SortOrder] {
        &self.ordering
    }

    #[must_use]
    pub const fn is_global(&self) -> bool {
        self.global
    }
}

impl RowProducer for SortExec {
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        let input = self.child.execute_partition(partition, task)?;
        let threshold = if cfg!(feature = "spilling") {
            task.exec().config().sort_spill_threshold_bytes
        } else {
            u64::MAX
        };
        Ok(Box::new(SortIter {
            state: SortState::Pending(input),
            ordering: Arc::new(RowOrdering::new(&self.ordering, self.child.schema())?),
            threshold,
            task: task.clone(),
            current: None,
            metrics: Arc::clone(&self.metrics),
        }))
    }
}

impl MetricsEmitter for SortExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl ExecNode for SortExec {
    fn name(&self) -> &'static str {
        "SortExec"
    }

    fn schema(&self) -> &Schema {
        self.child.schema()
    }

    fn children(&self) -> Vec<PlanRef> {
        vec![Arc::clone(&self.child)]
    }

    fn with_new_children(&self, children: Vec<PlanRef>) -> Result<PlanRef> {
        expect_children(self.name(), &children, 1)?;
        let mut children = children;
        Ok(Arc::new(Self::new(
            self.ordering.clone(),
            self.global,
            children.remove(0),
        )?))
    }

    fn output_partitioning(&self) -> Partitioning {
        self.child.output_partitioning()
    }

    fn output_ordering(&self) -> Vec<SortOrder> {
        self.ordering.clone()
    }

    fn required_child_distribution(&self) -> Vec<Distribution> {
        if self.global {
            vec![Distribution::Ordered(self.ordering.clone())]
        } else {
            vec![Distribution::Unspecified]
        }
    }

    fn output_format(&self) -> RowFormat {
        self.child.output_format()
    }

    fn required_input_format(&self) -> FormatRequirement {
        FormatRequirement::packed_if_supported(self.schema())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        let keys: Vec<String> = self.ordering.iter().map(ToString::to_string).collect();
        format!("SortExec [{}], global={}", keys.join(", "), self.global)
    }
}

enum SortState {
    Pending(BoxRowIter),
    Memory(std::vec::IntoIter<(Vec<Value>, Row)>),
    Merging(KWayMerge),
    Done,
}

struct SortIter {
    state: SortState,
    ordering: Arc<RowOrdering>,
    threshold: u64,
    task: TaskContext,
    current: Option<Row>,
    metrics: Arc<MetricSet>,
}

impl SortIter {
    fn sort_buffer(&self, buffer: &mut [(Vec<Value>, Row)]) {
        buffer.sort_by(|a, b| self.ordering.compare(&a.0, &b.0));
    }

    fn consume(&mut self, mut input: BoxRowIter) -> Result<SortState> {
        let started = Instant::now();
        let mut buffer: Vec<(Vec<Value>, Row)> = Vec::new();
        let mut buffered_bytes = 0u64;
        let mut runs: Vec<File> = Vec::new();
        let mut seen = 0u64;
        while let Some(row) = input.next_row()? {
            seen += 1;
            if seen % 4096 == 0 {
                self.task.check_interrupted()?;
            }
            let key = self.ordering.key(row)?;
            buffered_bytes += row.estimated_size() as u64;
            buffer.push((key, row.to_owned_row()));
            if buffered_bytes >= self.threshold {
                self.sort_buffer(&mut buffer);
                runs.push(self.spill(&mut buffer)?);
                buffered_bytes = 0;
            }
        }
        self.sort_buffer(&mut buffer);
        self.metrics.add_duration(SORT_TIME_MS, started.elapsed());
        if runs.is_empty() {
            return Ok(SortState::Memory(buffer.into_iter()));
        }
        let mut sources: Vec<RunSource> = runs
            .into_iter()
            .map(|f| RunSource::Spilled(BufReader::new(f)))
            .collect();
        sources.push(RunSource::Memory(buffer.into_iter()));
        Ok(SortState::Merging(KWayMerge::new(
            sources,
            Arc::clone(&self.ordering),
        )?))
    }

    fn spill(&self, buffer: &mut Vec<(Vec<Value>, Row)>) -> Result<File> {
        let file = tempfile::tempfile().context("create sort spill file")?;
        let mut out = BufWriter::new(file);
        let mut written = 0u64;
        for (_, row) in buffer.drain(..) {
            let bytes = postcard::to_allocvec(&row).context("encode spilled row")?;
            let len = u32::try_from(bytes.len()).context("spilled row exceeds 4 GiB")?;
            out.write_all(&len.to_le_bytes())?;
            out.write_all(&bytes)?;
            written += 4 + bytes.len() as u64;
        }
        let mut file = out.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        self.metrics.add(SPILL_SIZE, written);
        self.metrics.add(NUM_SPILLS, 1);
        debug!(
            partition = self.task.partition_id(),
            bytes = written,
            "sort spilled a sorted run"
        );
        Ok(file)
    }
}

impl RowIter for SortIter {
    fn advance(&mut self) -> Result<bool> {
        if let SortState::Pending(_) = self.state {
            let state = std::mem::replace(&mut self.state, SortState::Done);
            if let SortState::Pending(input) = state {
                self.state = self.consume(input)?;
            }
        }
        self.current = match &mut self.state {
            SortState::Memory(rows) => rows.next().map(|(_, r)| r),
            SortState::Merging(merge) => merge.next()?,
            SortState::Pending(_) | SortState::Done => None,
        };
        if self.current.is_some() {
            self.metrics.add(NUM_OUTPUT_ROWS, 1);
        } else {
            self.state = SortState::Done;
        }
        Ok(self.current.is_some())
    }

    fn current(&self) -> Option<RowRef<'_>> {
        self.current.as_ref().map(Row::as_ref)
    }
}

enum RunSource {
    Spilled(BufReader<File>),
    Memory(std::vec::IntoIter<(Vec<Value>, Row)>),
}

impl RunSource {
    fn next(&mut self, ordering: &RowOrdering) -> Result<Option<(Vec<Value>, Row)>> {
        match self {
            Self::Memory(rows) => Ok(rows.next()),
            Self::Spilled(reader) => {
                let mut len = [0u8; 4];
                match reader.read_exact(&mut len) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                    Err(e) => return Err(e).context("read sort spill run"),
                }
                let mut bytes = vec![0u8; u32::from_le_bytes(len) as usize];
                reader.read_exact(&mut bytes).context("read sort spill run")?;
                let row: Row = postcard::from_bytes(&bytes).context("decode spilled row")?;
                let key = ordering.key(row.as_ref())?;
                Ok(Some((key, row)))
            }
        }
    }
}

struct HeapEntry {
    key: Vec<Value>,
    row: Row,
    source: usize,
    ordering: Arc<RowOrdering>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed: BinaryHeap is a max-heap and the merge pops the smallest key.
    // Earlier sources win ties, keeping the merge stable.
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordering
            .compare(&other.key, &self.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

struct KWayMerge {
    sources: Vec<RunSource>,
    heap: BinaryHeap<HeapEntry>,
    ordering: Arc<RowOrdering>,
}

impl KWayMerge {
    fn new(mut sources: Vec<RunSource>, ordering: Arc<RowOrdering>) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (i, source) in sources.iter_mut().enumerate() {
            if let Some((key, row)) = source.next(&ordering)? {
                heap.push(HeapEntry {
                    key,
                    row,
                    source: i,
                    ordering: Arc::clone(&ordering),
                });
            }
        }
        Ok(Self {
            sources,
            heap,
            ordering,
        })
    }

    fn next(&mut self) -> Result<Option<Row>> {
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some((key, row)) = self.sources[top.source].next(&self.ordering)? {
            self.heap.push(HeapEntry {
                key,
                row,
                source: top.source,
                ordering: Arc::clone(&self.ordering),
            });
        }
        Ok(Some(top.row))
    }
}
