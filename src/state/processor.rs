//! The user-facing side of stateful processing.
//!
//! A [`StatefulProcessor`] is invoked once per grouping key with that key's
//! rows. Through the [`StatefulProcessorHandle`] it reads and writes typed
//! [`ValueState`] scoped to the current key and registers timers that fire in
//! a later call to [`StatefulProcessor::handle_expired_timer`].

use super::store::{StateStore, TIMERS_COL_FAMILY};
use crate::error::{ExecError, planning_err};
use crate::metrics::{MetricSet, NUM_REMOVED_STATE_ROWS, NUM_UPDATED_STATE_ROWS};
use crate::row::GenericRow;
use crate::types::Value;
use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

const RESERVED_PREFIX: char = '$';

/// Which clock drives timers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimeMode {
    /// Timers may not be registered.
    #[default]
    None,
    /// Timers fire when their expiry is before the batch timestamp.
    ProcessingTime,
    /// Timers fire when their expiry is before the event-time watermark.
    EventTime,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputMode {
    #[default]
    Append,
    Update,
    Complete,
}

/// Where the operator is in its per-partition lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProcessorState {
    Created,
    Initialized,
    DataProcessed,
    TimerProcessed,
    Closed,
}

/// The clocks of the current micro-batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimerValues {
    pub batch_timestamp_ms: Option<i64>,
    pub watermark_ms: Option<i64>,
}

impl TimerValues {
    /// The expiry bound below which timers of `mode` fire.
    #[must_use]
    pub const fn threshold(&self, mode: TimeMode) -> Option<i64> {
        match mode {
            TimeMode::None => None,
            TimeMode::ProcessingTime => self.batch_timestamp_ms,
            TimeMode::EventTime => self.watermark_ms,
        }
    }
}

/// User logic for a stateful transformation.
pub trait StatefulProcessor: Send + Sync {
    /// Called once per task before any rows.
    ///
    /// # Errors
    ///
    /// Any failure aborts the task.
    fn init(&self, _output_mode: OutputMode, _time_mode: TimeMode) -> Result<()> {
        Ok(())
    }

    /// Seed state for `key` from one initial-state row. Only called on the
    /// first batch.
    ///
    /// # Errors
    ///
    /// Any failure aborts the task.
    fn handle_initial_state(
        &self,
        _key: &[Value],
        _initial: &GenericRow,
        _handle: &mut StatefulProcessorHandle<'_>,
        _timers: &TimerValues,
    ) -> Result<()> {
        planning_err("processor does not accept initial state")
    }

    /// Process all rows of one key in this batch, returning output rows.
    ///
    /// # Errors
    ///
    /// Any failure aborts the task.
    fn handle_input_rows(
        &self,
        key: &[Value],
        rows: &[GenericRow],
        handle: &mut StatefulProcessorHandle<'_>,
        timers: &TimerValues,
    ) -> Result<Vec<GenericRow>>;

    /// A timer registered for `key` expired.
    ///
    /// # Errors
    ///
    /// Any failure aborts the task.
    fn handle_expired_timer(
        &self,
        _key: &[Value],
        _expiry_ms: i64,
        _handle: &mut StatefulProcessorHandle<'_>,
        _timers: &TimerValues,
    ) -> Result<Vec<GenericRow>> {
        Ok(Vec::new())
    }

    /// Called once after the last row and timer of the task.
    ///
    /// # Errors
    ///
    /// Any failure aborts the task.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Encode a grouping key as state store bytes.
///
/// # Errors
///
/// Returns an error if the key cannot be serialized.
pub fn encode_key(key: &[Value]) -> Result<Vec<u8>> {
    postcard::to_allocvec(key).context("encode grouping key")
}

/// # Errors
///
/// Returns a state store error for corrupt key bytes.
pub fn decode_key(bytes: &[u8]) -> Result<Vec<Value>> {
    postcard::from_bytes(bytes)
        .map_err(|e| ExecError::StateStore(format!("decode grouping key: {e}")).into())
}

/// Timer keys sort by expiry first: the sign-flipped big-endian expiry
/// followed by the grouping key bytes.
#[must_use]
pub fn timer_key(expiry_ms: i64, key: &[u8]) -> Vec<u8> {
    let mut out = ((expiry_ms as u64) ^ (1 << 63)).to_be_bytes().to_vec();
    out.extend_from_slice(key);
    out
}

/// Split a timer key into expiry and grouping key bytes.
///
/// # Errors
///
/// Returns a state store error if the key is too short.
pub fn split_timer_key(bytes: &[u8]) -> Result<(i64, &[u8])> {
    let Some((head, rest)) = bytes.split_first_chunk::<8>() else {
        return Err(ExecError::StateStore("truncated timer key".into()).into());
    };
    Ok(((u64::from_be_bytes(*head) ^ (1 << 63)) as i64, rest))
}

/// Access to the state of the key being processed.
pub struct StatefulProcessorHandle<'a> {
    store: &'a mut Box<dyn StateStore>,
    key: Vec<u8>,
    time_mode: TimeMode,
    metrics: &'a MetricSet,
}

impl<'a> StatefulProcessorHandle<'a> {
    pub(crate) fn new(
        store: &'a mut Box<dyn StateStore>,
        key: Vec<u8>,
        time_mode: TimeMode,
        metrics: &'a MetricSet,
    ) -> Self {
        Self {
            store,
            key,
            time_mode,
            metrics,
        }
    }

    /// Typed single-value state called `name` for the current key.
    ///
    /// # Errors
    ///
    /// Returns a planning error for names starting with `$`, which are
    /// reserved for the operator's own column families.
    pub fn value_state<T: Serialize + DeserializeOwned>(
        &mut self,
        name: &str,
    ) -> Result<ValueState<'_, T>> {
        if name.is_empty() || name.starts_with(RESERVED_PREFIX) {
            return planning_err(format!("invalid state name {name:?}"));
        }
        Ok(ValueState {
            store: &mut **self.store,
            key: &self.key,
            family: name.to_string(),
            metrics: self.metrics,
            _value: PhantomData,
        })
    }

    /// # Errors
    ///
    /// Returns a planning error when the operator runs without a time mode.
    pub fn register_timer(&mut self, expiry_ms: i64) -> Result<()> {
        self.require_timers()?;
        self.store
            .put(TIMERS_COL_FAMILY, timer_key(expiry_ms, &self.key), Vec::new())
    }

    /// # Errors
    ///
    /// Returns a planning error when the operator runs without a time mode.
    pub fn delete_timer(&mut self, expiry_ms: i64) -> Result<()> {
        self.require_timers()?;
        self.store
            .remove(TIMERS_COL_FAMILY, &timer_key(expiry_ms, &self.key))?;
        Ok(())
    }

    /// Expiries of the current key's timers, ascending.
    ///
    /// # Errors
    ///
    /// Propagates state store failures.
    pub fn list_timers(&self) -> Result<Vec<i64>> {
        let mut out = Vec::new();
        for (k, _) in self.store.entries(TIMERS_COL_FAMILY)? {
            let (expiry, key) = split_timer_key(&k)?;
            if key == self.key.as_slice() {
                out.push(expiry);
            }
        }
        Ok(out)
    }

    fn require_timers(&self) -> Result<()> {
        if self.time_mode == TimeMode::None {
            return planning_err("timers need a processing-time or event-time mode");
        }
        Ok(())
    }
}

/// One typed value per grouping key.
pub struct ValueState<'h, T> {
    store: &'h mut (dyn StateStore + 'static),
    key: &'h [u8],
    family: String,
    metrics: &'h MetricSet,
    _value: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> ValueState<'_, T> {
    /// # Errors
    ///
    /// Returns a state store error for undecodable state.
    pub fn get(&self) -> Result<Option<T>> {
        match self.store.get(&self.family, self.key)? {
            Some(bytes) => postcard::from_bytes(&bytes)
                .map(Some)
                .map_err(|e| ExecError::StateStore(format!("decode state '{}': {e}", self.family)).into()),
            None => Ok(None),
        }
    }

    /// # Errors
    ///
    /// Propagates state store failures.
    pub fn exists(&self) -> Result<bool> {
        Ok(self.store.get(&self.family, self.key)?.is_some())
    }

    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded.
    pub fn update(&mut self, value: &T) -> Result<()> {
        let bytes = postcard::to_allocvec(value).context("encode state value")?;
        self.store.put(&self.family, self.key.to_vec(), bytes)?;
        self.metrics.add(NUM_UPDATED_STATE_ROWS, 1);
        Ok(())
    }

    /// # Errors
    ///
    /// Propagates state store failures.
    pub fn clear(&mut self) -> Result<()> {
        if self.store.remove(&self.family, self.key)? {
            self.metrics.add(NUM_REMOVED_STATE_ROWS, 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_keys_order_by_expiry() {
        let a = timer_key(-5, b"z");
        let b = timer_key(3, b"a");
        let c = timer_key(40, b"a");
        assert!(a < b && b < c);
        let (expiry, key) = split_timer_key(&a).unwrap();
        assert_eq!(expiry, -5);
        assert_eq!(key, b"z");
    }
}
