//! The boxed row representation: one [`Value`] per field.

use crate::types::Value;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GenericRow {
    values: Vec<Value>,
}

impl GenericRow {
    #[must_use]
    pub const fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at `i`, or `Null` past the end.
    #[must_use]
    pub fn get(&self, i: usize) -> &Value {
        self.values.get(i).unwrap_or(&Value::Null)
    }

    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn set(&mut self, i: usize, v: Value) {
        if i >= self.values.len() {
            self.values.resize(i + 1, Value::Null);
        }
        self.values[i] = v;
    }
}

impl From<Vec<Value>> for GenericRow {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

/// Build a boxed row from heterogeneous literals: `row![1, "a", 2.5]`.
#[macro_export]
macro_rules! row {
    ($($v:expr),* $(,)?) => {
        $crate::row::GenericRow::new(vec![$($crate::types::Value::from($v)),*])
    };
}
