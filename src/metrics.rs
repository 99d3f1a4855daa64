//! Metrics collection and reporting for plan execution.
//!
//! Two layers:
//!
//! - [`MetricSet`]: the fixed, named counters one physical operator publishes
//!   (`numOutputRows`, `bytesWritten`, `spillSize`, ...). Counters are atomics so
//!   tasks running in parallel update them without locking.
//! - [`MetricsCollector`]: a thread-safe registry of [`Metric`]s for a whole
//!   execution. Operator metric sets are flattened into it with
//!   [`MetricsCollector::absorb`], keyed `"<operator>#<id>.<metric>"`.
//!
//! Metrics are a side channel. Nothing in the execution layer reads them back to
//! make decisions.
//!
//! # Example
//!
//! ```
//! use ironexec::metrics::{MetricSet, MetricsCollector};
//!
//! let set = MetricSet::new(&["numOutputRows"]);
//! set.add("numOutputRows", 3);
//!
//! let collector = MetricsCollector::new();
//! collector.absorb("FilterExec#1", &set);
//! assert_eq!(collector.counter("FilterExec#1.numOutputRows"), Some(3));
//! ```

use serde_json::{Value, json};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const NUM_OUTPUT_ROWS: &str = "numOutputRows";
pub const RECORDS_WRITTEN: &str = "recordsWritten";
pub const RECORDS_READ: &str = "recordsRead";
pub const BYTES_WRITTEN: &str = "bytesWritten";
pub const BYTES_READ: &str = "bytesRead";
pub const LOCAL_BLOCKS_FETCHED: &str = "localBlocksFetched";
pub const REMOTE_BLOCKS_FETCHED: &str = "remoteBlocksFetched";
pub const NUM_FILES: &str = "numFiles";
pub const FILES_SIZE: &str = "filesSize";
pub const NUM_PARTITIONS: &str = "numPartitions";
pub const PRUNED_PARTITIONS: &str = "numPrunedPartitions";
pub const SPILL_SIZE: &str = "spillSize";
pub const NUM_SPILLS: &str = "numSpills";
pub const SORT_TIME_MS: &str = "sortTimeMs";
pub const NUM_UPDATED_STATE_ROWS: &str = "numUpdatedStateRows";
pub const NUM_REMOVED_STATE_ROWS: &str = "numRemovedStateRows";
pub const NUM_EXPIRED_TIMERS: &str = "numExpiredTimers";
pub const COMMIT_TIME_MS: &str = "commitTimeMs";
pub const DATA_SIZE: &str = "dataSize";
pub const NUM_COALESCED_PARTITIONS: &str = "numCoalescedPartitions";

/// Trait for metrics held by a [`MetricsCollector`].
pub trait Metric: Send + Sync + Any {
    /// The name of this metric (e.g. `ShuffleExchangeExec#3.bytesWritten`).
    fn name(&self) -> &str;

    /// The current value as JSON.
    fn value(&self) -> Value;

    fn as_any(&self) -> &dyn Any;
}

/// Named atomic counters published by one operator.
///
/// The set of names is fixed at construction; adding to an unknown name is a
/// no-op rather than an error so a typo never fails a task.
#[derive(Debug, Default)]
pub struct MetricSet {
    counters: BTreeMap<&'static str, AtomicU64>,
}

impl MetricSet {
    #[must_use]
    pub fn new(names: &[&'static str]) -> Self {
        Self {
            counters: names.iter().map(|n| (*n, AtomicU64::new(0))).collect(),
        }
    }

    pub fn add(&self, name: &str, v: u64) {
        if let Some(c) = self.counters.get(name) {
            c.fetch_add(v, Ordering::Relaxed);
        }
    }

    pub fn set(&self, name: &str, v: u64) {
        if let Some(c) = self.counters.get(name) {
            c.store(v, Ordering::Relaxed);
        }
    }

    pub fn add_duration(&self, name: &str, d: Duration) {
        self.add(name, u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
    }

    /// Current value, `0` for unknown names.
    #[must_use]
    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        self.counters
            .iter()
            .map(|(k, v)| (*k, v.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Thread-safe container for execution-wide metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsCollectorInner>>,
}

struct MetricsCollectorInner {
    metrics: HashMap<String, Box<dyn Metric>>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsCollectorInner {
                metrics: HashMap::new(),
                start_time: None,
                end_time: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsCollectorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_start(&self) {
        self.lock().start_time = Some(Instant::now());
    }

    pub fn record_end(&self) {
        self.lock().end_time = Some(Instant::now());
    }

    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        let inner = self.lock();
        match (inner.start_time, inner.end_time) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    pub fn set_counter(&self, name: &str, value: u64) {
        self.lock().metrics.insert(
            name.to_string(),
            Box::new(CounterMetric::with_value(name, value)),
        );
    }

    #[must_use]
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.lock()
            .metrics
            .get(name)
            .and_then(|m| m.as_any().downcast_ref::<CounterMetric>())
            .map(|c| c.count)
    }

    /// Copy every counter of an operator's metric set in, prefixed with `scope`.
    pub fn absorb(&self, scope: &str, set: &MetricSet) {
        for (name, v) in set.snapshot() {
            self.set_counter(&format!("{scope}.{name}"), v);
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        let inner = self.lock();
        let mut metrics_json = serde_json::Map::new();
        for (name, metric) in &inner.metrics {
            let mut metric_obj = serde_json::Map::new();
            metric_obj.insert("value".to_string(), metric.value());
            metrics_json.insert(name.clone(), Value::Object(metric_obj));
        }
        if let (Some(start), Some(end)) = (inner.start_time, inner.end_time) {
            metrics_json.insert(
                "execution_time_ms".to_string(),
                json!({ "value": end.duration_since(start).as_millis() }),
            );
        }
        Value::Object(metrics_json)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CounterMetric {
    name: String,
    count: u64,
}

impl CounterMetric {
    pub fn with_value(name: impl Into<String>, count: u64) -> Self {
        Self {
            name: name.into(),
            count,
        }
    }
}

impl Metric for CounterMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.count)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
