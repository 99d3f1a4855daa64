//! The application context shared by planner, operators and task harness.
//!
//! There is no ambient global. An [`ExecContext`] is created explicitly and
//! handed around by `Arc`. When an application wants at most one live context,
//! it creates a [`ContextRegistry`] and builds contexts through
//! [`ExecContext::register`], which refuses while another registered context is
//! still alive.

use crate::config::ExecConfig;
use crate::error::planning_err;
use crate::exchange::shuffle::ShuffleStore;
use crate::metrics::MetricsCollector;
use crate::plan::PlanRef;
use crate::state::store::{FileStateStoreProvider, MemoryStateStoreProvider, StateStoreProvider};
use anyhow::Result;
use std::fmt::{Debug, Formatter, Result as FormatResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::debug;

/// A single lock-guarded slot holding the active context, if any.
#[derive(Default)]
pub struct ContextRegistry {
    slot: Mutex<Weak<ExecContext>>,
}

impl ContextRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registered context, if it is still alive.
    #[must_use]
    pub fn active(&self) -> Option<Arc<ExecContext>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }
}

pub struct ExecContext {
    config: ExecConfig,
    metrics: MetricsCollector,
    shuffles: ShuffleStore,
    state_provider: Arc<dyn StateStoreProvider>,
    next_shuffle_id: AtomicU64,
    next_stage_id: AtomicU64,
}

impl ExecContext {
    /// Build an unregistered context.
    ///
    /// # Errors
    ///
    /// Returns a planning error if `config` fails validation.
    pub fn new(config: ExecConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let state_provider: Arc<dyn StateStoreProvider> = match &config.state_checkpoint_dir {
            Some(dir) => Arc::new(FileStateStoreProvider::new(dir)),
            None => Arc::new(MemoryStateStoreProvider::new()),
        };
        Ok(Arc::new(Self {
            config,
            metrics: MetricsCollector::new(),
            shuffles: ShuffleStore::new(),
            state_provider,
            next_shuffle_id: AtomicU64::new(0),
            next_stage_id: AtomicU64::new(0),
        }))
    }

    /// Build a context and record it as the registry's active one.
    ///
    /// # Errors
    ///
    /// Returns a planning error if another context registered with `registry`
    /// is still alive, or if `config` is invalid.
    pub fn register(registry: &ContextRegistry, config: ExecConfig) -> Result<Arc<Self>> {
        let mut slot = registry.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.upgrade().is_some() {
            return planning_err("an execution context is already active in this registry");
        }
        let ctx = Self::new(config)?;
        *slot = Arc::downgrade(&ctx);
        debug!("registered execution context");
        Ok(ctx)
    }

    /// Replace the state store provider.
    #[must_use]
    pub fn with_state_provider(self: Arc<Self>, provider: Arc<dyn StateStoreProvider>) -> Arc<Self> {
        let next_shuffle_id = self.next_shuffle_id.load(Ordering::SeqCst);
        let next_stage_id = self.next_stage_id.load(Ordering::SeqCst);
        Arc::new(Self {
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            shuffles: self.shuffles.clone(),
            state_provider: provider,
            next_shuffle_id: AtomicU64::new(next_shuffle_id),
            next_stage_id: AtomicU64::new(next_stage_id),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ExecConfig {
        &self.config
    }

    #[must_use]
    pub const fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    #[must_use]
    pub const fn shuffles(&self) -> &ShuffleStore {
        &self.shuffles
    }

    #[must_use]
    pub fn state_provider(&self) -> Arc<dyn StateStoreProvider> {
        Arc::clone(&self.state_provider)
    }

    pub fn next_shuffle_id(&self) -> u64 {
        self.next_shuffle_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_stage_id(&self) -> u64 {
        self.next_stage_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Flatten every operator's metric set into the collector, scoping each
    /// counter as `<operator>#<pre-order position>.<metric>`.
    pub fn report_metrics(&self, plan: &PlanRef) {
        let mut next = 0usize;
        report_node(&self.metrics, plan, &mut next);
    }
}

fn report_node(collector: &MetricsCollector, node: &PlanRef, next: &mut usize) {
    let scope = format!("{}#{}", node.name(), *next);
    *next += 1;
    collector.absorb(&scope, node.metrics());
    for child in node.children() {
        report_node(collector, &child, next);
    }
}

impl Debug for ExecContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.debug_struct("ExecContext")
            .field("config", &self.config)
            .field("shuffles", &self.shuffles.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::FilterExec;
    use crate::expr::{col, lit};
    use crate::metrics::NUM_OUTPUT_ROWS;
    use crate::runner::{ExecMode, Runner};
    use crate::testing::{int_schema, memory_scan, sequential_rows};

    #[test]
    fn registry_admits_one_live_context() -> Result<()> {
        let registry = ContextRegistry::new();
        let first = ExecContext::register(&registry, ExecConfig::default())?;
        assert!(ExecContext::register(&registry, ExecConfig::default()).is_err());
        assert!(registry.active().is_some_and(|ctx| Arc::ptr_eq(&ctx, &first)));

        drop(first);
        assert!(registry.active().is_none());
        ExecContext::register(&registry, ExecConfig::default())?;
        Ok(())
    }

    #[test]
    fn invalid_config_builds_no_context() {
        let registry = ContextRegistry::new();
        let bad = ExecConfig::default().with_num_executors(0);
        assert!(ExecContext::register(&registry, bad).is_err());
        assert!(registry.active().is_none());
    }

    #[test]
    fn ids_are_unique_per_context() -> Result<()> {
        let ctx = ExecContext::new(ExecConfig::default())?;
        assert_eq!(ctx.next_shuffle_id(), 0);
        assert_eq!(ctx.next_shuffle_id(), 1);
        assert_eq!(ctx.next_stage_id(), 0);
        let other = ExecContext::new(ExecConfig::default())?;
        assert_eq!(other.next_shuffle_id(), 0);
        Ok(())
    }

    #[test]
    fn operator_metrics_are_scoped_by_position() -> Result<()> {
        let config = ExecConfig::default()
            .with_adaptive(false)
            .with_whole_stage_codegen(false);
        let ctx = ExecContext::new(config)?;
        let schema = int_schema(&["id", "bucket"]);
        let scan = memory_scan(&schema, sequential_rows(&schema, &[6, 4]))?;
        let plan: PlanRef = Arc::new(FilterExec::new(col("id").lt(lit(3)), scan)?);
        Runner::new(Arc::clone(&ctx))
            .with_mode(ExecMode::Sequential)?
            .execute_prepared(&plan)?;

        ctx.report_metrics(&plan);
        let filtered = format!("FilterExec#0.{NUM_OUTPUT_ROWS}");
        let scanned = format!("RowSourceScanExec#1.{NUM_OUTPUT_ROWS}");
        assert_eq!(ctx.metrics().counter(&filtered), Some(3));
        assert_eq!(ctx.metrics().counter(&scanned), Some(10));
        Ok(())
    }
}
