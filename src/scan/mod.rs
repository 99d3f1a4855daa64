//! Leaf operators that read data.
//!
//! Both flavours first list candidate splits and then build one row iterator
//! per split. [`FileSourceScanExec`] reads files through a [`FileIndex`]
//! listing; [`RowSourceScanExec`] reads a pluggable in-process source.
//!
//! File listing happens in two steps. Static partition filters are applied
//! once per plan instance and cached. Filters whose values only become known
//! at run time (dynamic partition pruning) are applied to that cached listing
//! lazily, and only once every runtime filter has been resolved; before that
//! the scan reads the statically selected partitions in full.
//!
//! [`FileIndex`]: format::InMemoryFileIndex

pub mod files;
pub mod format;
pub mod row_source;

pub use files::{
    FilePartition, FileStatus, PartitionDirectory, PartitionedFile, bucket_id_of,
    bucketed_partitions, max_split_bytes, pack_partitions, split_files,
};
#[cfg(feature = "io-jsonl")]
pub use format::JsonLinesFormat;
pub use format::{FileFormat, InMemoryFileIndex};
pub use row_source::{MemoryRowSource, RowSource, RowSourceScanExec};

use crate::config::ExecConfig;
use crate::error::planning_err;
use crate::expr::{Expr, col};
use crate::metrics::{
    FILES_SIZE, MetricSet, NUM_FILES, NUM_OUTPUT_ROWS, NUM_PARTITIONS, PRUNED_PARTITIONS,
};
use crate::partitioning::Partitioning;
use crate::plan::{ExecNode, MetricsEmitter, PlanRef, RowProducer, expect_children};
use crate::row::{BoxRowIter, ChainRowIter, EmptyRowIter, GenericRow, IterOpener, RowFormat, RowIter, RowRef};
use crate::task::TaskContext;
use crate::types::{Schema, Value};
use anyhow::Result;
use std::any::Any;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Static hash layout of stored data: file `*_i.*` holds the rows whose
/// bucket columns hash to `i`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketSpec {
    pub num_buckets: usize,
    pub bucket_columns: Vec<String>,
}

/// A table as the scan sees it.
#[derive(Debug)]
pub struct FileScanRelation {
    pub index: Arc<InMemoryFileIndex>,
    pub format: Arc<dyn FileFormat>,
    pub data_schema: Schema,
    pub bucket_spec: Option<BucketSpec>,
}

type Listing = Arc<Vec<PartitionDirectory>>;

/// Reads the files of a [`FileScanRelation`].
///
/// Output rows are the data columns followed by the partition columns.
#[derive(Debug)]
pub struct FileSourceScanExec {
    relation: Arc<FileScanRelation>,
    schema: Schema,
    partition_filters: Vec<Expr>,
    bucket_set: Option<BTreeSet<usize>>,
    disable_bucketed_scan: bool,
    config: ExecConfig,
    selected: Mutex<Option<Listing>>,
    dynamically_selected: Mutex<Option<Listing>>,
    file_partitions: Mutex<Option<Arc<Vec<FilePartition>>>>,
    metrics: Arc<MetricSet>,
}

impl FileSourceScanExec {
    /// # Errors
    ///
    /// Returns a planning error if a filter references a data column, a
    /// bucket column is unknown, or (for bucketed reads) a selected file name
    /// carries no valid bucket id.
    pub fn new(
        relation: Arc<FileScanRelation>,
        partition_filters: Vec<Expr>,
        config: &ExecConfig,
    ) -> Result<Self> {
        let schema = relation
            .data_schema
            .merge(relation.index.partition_schema());
        if let Some(spec) = &relation.bucket_spec {
            if spec.num_buckets == 0 {
                return planning_err("bucket spec needs at least one bucket");
            }
            for c in &spec.bucket_columns {
                schema.index_of(c)?;
            }
        }
        for f in &partition_filters {
            f.bind(relation.index.partition_schema())?;
        }
        let scan = Self {
            relation,
            schema,
            partition_filters,
            bucket_set: None,
            disable_bucketed_scan: false,
            config: config.clone(),
            selected: Mutex::new(None),
            dynamically_selected: Mutex::new(None),
            file_partitions: Mutex::new(None),
            metrics: Arc::new(MetricSet::new(&[
                NUM_OUTPUT_ROWS,
                NUM_FILES,
                FILES_SIZE,
                NUM_PARTITIONS,
                PRUNED_PARTITIONS,
            ])),
        };
        if let Some(spec) = scan.bucket_spec() {
            bucketed_partitions(&scan.selected_partitions()?, spec.num_buckets, None)?;
        }
        Ok(scan)
    }

    /// Read only the listed buckets; the others yield empty partitions.
    #[must_use]
    pub fn with_bucket_set(mut self, buckets: BTreeSet<usize>) -> Self {
        self.bucket_set = Some(buckets);
        self
    }

    /// Read a bucketed relation as if it were not bucketed.
    #[must_use]
    pub const fn without_bucketed_scan(mut self) -> Self {
        self.disable_bucketed_scan = true;
        self
    }

    fn fresh(&self) -> Self {
        Self {
            relation: Arc::clone(&self.relation),
            schema: self.schema.clone(),
            partition_filters: self.partition_filters.clone(),
            bucket_set: self.bucket_set.clone(),
            disable_bucketed_scan: self.disable_bucketed_scan,
            config: self.config.clone(),
            selected: Mutex::new(None),
            dynamically_selected: Mutex::new(None),
            file_partitions: Mutex::new(None),
            metrics: Arc::clone(&self.metrics),
        }
    }

    #[must_use]
    pub fn relation(&self) -> &Arc<FileScanRelation> {
        &self.relation
    }

    /// The bucket spec when this scan reads bucket by bucket.
    #[must_use]
    pub fn bucket_spec(&self) -> Option<&BucketSpec> {
        self.relation
            .bucket_spec
            .as_ref()
            .filter(|_| self.config.bucketing_enabled && !self.disable_bucketed_scan)
    }

    fn static_filters(&self) -> Vec<Expr> {
        self.partition_filters
            .iter()
            .filter(|f| !f.is_dynamic())
            .cloned()
            .collect()
    }

    fn dynamic_filters(&self) -> Vec<Expr> {
        self.partition_filters
            .iter()
            .filter(|f| f.is_dynamic())
            .cloned()
            .collect()
    }

    /// Directories passing the static filters. Listed at most once.
    ///
    /// # Errors
    ///
    /// Propagates filter evaluation failures.
    pub fn selected_partitions(&self) -> Result<Listing> {
        let mut slot = self.selected.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(listing) = slot.as_ref() {
            return Ok(Arc::clone(listing));
        }
        let listing = Arc::new(self.relation.index.list_files(&self.static_filters())?);
        self.record_listing(&listing);
        debug!(
            directories = listing.len(),
            total = self.relation.index.num_directories(),
            "selected partitions"
        );
        *slot = Some(Arc::clone(&listing));
        Ok(listing)
    }

    /// The static selection narrowed by the runtime filters.
    ///
    /// Without dynamic filters this is the static selection. While any
    /// runtime filter is unresolved no pruning happens and nothing is cached.
    ///
    /// # Errors
    ///
    /// Propagates filter evaluation failures.
    pub fn dynamically_selected_partitions(&self) -> Result<Listing> {
        let dynamic = self.dynamic_filters();
        if dynamic.is_empty() {
            return self.selected_partitions();
        }
        let mut slot = self
            .dynamically_selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(listing) = slot.as_ref() {
            return Ok(Arc::clone(listing));
        }
        let selected = self.selected_partitions()?;
        if !dynamic.iter().all(Expr::runtime_filters_resolved) {
            debug!("runtime filters unresolved, scanning the static selection");
            return Ok(selected);
        }
        let kept = Arc::new(format::prune_directories(
            &selected,
            &dynamic,
            self.relation.index.partition_schema(),
        )?);
        self.metrics
            .set(PRUNED_PARTITIONS, (selected.len() - kept.len()) as u64);
        self.record_listing(&kept);
        debug!(
            before = selected.len(),
            after = kept.len(),
            "applied dynamic partition pruning"
        );
        *slot = Some(Arc::clone(&kept));
        Ok(kept)
    }

    fn record_listing(&self, listing: &[PartitionDirectory]) {
        let files = listing.iter().flat_map(|d| &d.files);
        let (count, size) = files.fold((0u64, 0u64), |(n, s), f| (n + 1, s + f.size));
        self.metrics.set(NUM_FILES, count);
        self.metrics.set(FILES_SIZE, size);
        self.metrics.set(NUM_PARTITIONS, listing.len() as u64);
    }

    /// The splits of every scan task.
    ///
    /// Computed once and pinned, so the partition count never changes after
    /// it has been observed. If runtime filters are still unresolved at that
    /// point the splits cover the static selection, and pruning later happens
    /// per partition in [`Self::live_files`].
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::InvalidBucketFile`](crate::error::ExecError::InvalidBucketFile)
    /// for a malformed bucketed file name.
    pub fn file_partitions(&self) -> Result<Arc<Vec<FilePartition>>> {
        let mut slot = self
            .file_partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(parts) = slot.as_ref() {
            return Ok(Arc::clone(parts));
        }
        let listing = self.dynamically_selected_partitions()?;
        let parts = match self.bucket_spec() {
            Some(spec) => bucketed_partitions(&listing, spec.num_buckets, self.bucket_set.as_ref())?,
            None => {
                let max_split = max_split_bytes(&self.config, &listing);
                let splits = split_files(&listing, max_split, self.relation.format.is_splittable());
                pack_partitions(splits, max_split, self.config.open_cost_bytes)
            }
        };
        let parts = Arc::new(parts);
        *slot = Some(Arc::clone(&parts));
        Ok(parts)
    }

    /// The splits of `part` whose directory survives dynamic pruning.
    fn live_files(&self, part: &FilePartition) -> Result<Vec<PartitionedFile>> {
        if self.dynamic_filters().is_empty() {
            return Ok(part.files.clone());
        }
        let listing = self.dynamically_selected_partitions()?;
        let kept: BTreeSet<&[Value]> = listing.iter().map(|d| d.values.as_slice()).collect();
        Ok(part
            .files
            .iter()
            .filter(|f| kept.contains(f.partition_values.as_slice()))
            .cloned()
            .collect())
    }

    /// Hosts holding the most bytes of `partition`.
    ///
    /// # Errors
    ///
    /// Propagates listing failures.
    pub fn preferred_locations(&self, partition: usize) -> Result<Vec<String>> {
        Ok(self
            .file_partitions()?
            .get(partition)
            .map(FilePartition::preferred_locations)
            .unwrap_or_default())
    }
}

/// Appends a file's partition values to every data row read from it.
struct PartitionValuesIter {
    input: BoxRowIter,
    data_schema: Schema,
    values: Vec<Value>,
    row: Option<GenericRow>,
    metrics: Arc<MetricSet>,
}

impl RowIter for PartitionValuesIter {
    fn advance(&mut self) -> Result<bool> {
        let Some(data) = self.input.next_row()? else {
            self.row = None;
            return Ok(false);
        };
        let mut values = data.to_generic(&self.data_schema)?.into_values();
        values.extend(self.values.iter().cloned());
        self.row = Some(GenericRow::new(values));
        self.metrics.add(NUM_OUTPUT_ROWS, 1);
        Ok(true)
    }

    fn current(&self) -> Option<RowRef<'_>> {
        self.row.as_ref().map(RowRef::Boxed)
    }
}

impl RowProducer for FileSourceScanExec {
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        let parts = self.file_partitions()?;
        let Some(part) = parts.get(partition) else {
            return planning_err(format!(
                "scan has {} partitions, asked for {partition}",
                parts.len()
            ));
        };
        let files = self.live_files(part)?;
        if files.is_empty() {
            return Ok(Box::new(EmptyRowIter));
        }
        let openers: Vec<IterOpener> = files
            .into_iter()
            .map(|file| {
                let format = Arc::clone(&self.relation.format);
                let data_schema = self.relation.data_schema.clone();
                let metrics = Arc::clone(&self.metrics);
                let task = task.clone();
                let open: IterOpener = Box::new(move || {
                    task.check_interrupted()?;
                    let input = format.open_split(&file, &data_schema)?;
                    Ok(Box::new(PartitionValuesIter {
                        input,
                        data_schema,
                        values: file.partition_values,
                        row: None,
                        metrics,
                    }) as BoxRowIter)
                });
                open
            })
            .collect();
        Ok(Box::new(ChainRowIter::new(openers)))
    }
}

impl MetricsEmitter for FileSourceScanExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl ExecNode for FileSourceScanExec {
    fn name(&self) -> &'static str {
        "FileSourceScanExec"
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn children(&self) -> Vec<PlanRef> {
        Vec::new()
    }

    fn with_new_children(&self, children: Vec<PlanRef>) -> Result<PlanRef> {
        expect_children(self.name(), &children, 0)?;
        Ok(Arc::new(self.fresh()))
    }

    /// Bucketed reads are hash partitioned on the bucket columns, one
    /// partition per bucket, so they line up with a hash exchange.
    fn output_partitioning(&self) -> Partitioning {
        if let Some(spec) = self.bucket_spec() {
            let keys = spec.bucket_columns.iter().map(col).collect();
            return Partitioning::hash(keys, spec.num_buckets);
        }
        match self.file_partitions() {
            Ok(parts) => Partitioning::Unknown(parts.len()),
            Err(err) => {
                warn!(error = %err, "could not plan file splits");
                Partitioning::Unknown(0)
            }
        }
    }

    fn output_format(&self) -> RowFormat {
        RowFormat::Boxed
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        let filters: Vec<String> = self.partition_filters.iter().map(ToString::to_string).collect();
        let mut out = format!(
            "FileSourceScanExec {} [{}]",
            self.relation.format.name(),
            filters.join(", ")
        );
        if let Some(spec) = self.bucket_spec() {
            out.push_str(&format!(" bucketed({})", spec.num_buckets));
        }
        out
    }
}
