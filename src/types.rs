//! Data types, schemas and boxed values.
//!
//! [`Value`] is the element of the boxed row representation and the common
//! currency expressions evaluate to. Floats are wrapped in [`OrderedFloat`] so
//! values have a total order and can be hashed and used as map keys.

use crate::error::planning_err;
use anyhow::Result;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// Days since epoch.
    Date,
    /// Microseconds since epoch.
    Timestamp,
    String,
    Binary,
    Array(Box<DataType>),
    Struct(Vec<Field>),
    /// A type defined outside the engine. Values travel as opaque text and the
    /// packed row format cannot hold them.
    External(String),
}

impl DataType {
    /// Fixed-width types live entirely inside their 8-byte packed slot.
    #[must_use]
    pub const fn is_fixed_width(&self) -> bool {
        matches!(
            self,
            Self::Boolean
                | Self::Byte
                | Self::Short
                | Self::Int
                | Self::Long
                | Self::Float
                | Self::Double
                | Self::Date
                | Self::Timestamp
        )
    }

    /// Whether values of this type can be stored in a packed row.
    #[must_use]
    pub fn supports_packed(&self) -> bool {
        match self {
            Self::External(_) => false,
            Self::Array(elem) => elem.supports_packed(),
            Self::Struct(fields) => fields.iter().all(|f| f.data_type.supports_packed()),
            _ => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    #[must_use]
    pub const fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Position of the column called `name`.
    ///
    /// # Errors
    ///
    /// Returns a planning error if no column has that name.
    pub fn index_of(&self, name: &str) -> Result<usize> {
        match self.fields.iter().position(|f| f.name == name) {
            Some(i) => Ok(i),
            None => planning_err(format!(
                "column '{name}' not found in schema [{}]",
                self.field_names().join(", ")
            )),
        }
    }

    #[must_use]
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    #[must_use]
    pub fn supports_packed(&self) -> bool {
        self.fields.iter().all(|f| f.data_type.supports_packed())
    }

    /// Concatenate two schemas (join output).
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut fields = self.fields.clone();
        fields.extend(other.fields.iter().cloned());
        Self { fields }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(OrderedFloat<f32>),
    Double(OrderedFloat<f64>),
    Date(i32),
    Timestamp(i64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Struct(Vec<Value>),
    External(String),
}

impl Value {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integral view of the value, widening narrower integer types.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Byte(v) => Some(*v as i64),
            Self::Short(v) => Some(*v as i64),
            Self::Int(v) | Self::Date(v) => Some(*v as i64),
            Self::Long(v) | Self::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(f64::from(v.0)),
            Self::Double(v) => Some(v.0),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::External(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn double(v: f64) -> Self {
        Self::Double(OrderedFloat(v))
    }

    #[must_use]
    pub fn float(v: f32) -> Self {
        Self::Float(OrderedFloat(v))
    }

    /// Whether this value may be stored in a column of type `dt`.
    #[must_use]
    pub fn conforms_to(&self, dt: &DataType) -> bool {
        match (self, dt) {
            (Self::Null, _) => true,
            (Self::Boolean(_), DataType::Boolean)
            | (Self::Byte(_), DataType::Byte)
            | (Self::Short(_), DataType::Short)
            | (Self::Int(_), DataType::Int)
            | (Self::Long(_), DataType::Long)
            | (Self::Float(_), DataType::Float)
            | (Self::Double(_), DataType::Double)
            | (Self::Date(_), DataType::Date)
            | (Self::Timestamp(_), DataType::Timestamp)
            | (Self::String(_), DataType::String)
            | (Self::Binary(_), DataType::Binary)
            | (Self::External(_), DataType::External(_)) => true,
            (Self::Array(items), DataType::Array(elem)) => {
                items.iter().all(|v| v.conforms_to(elem))
            }
            (Self::Struct(vals), DataType::Struct(fields)) => {
                vals.len() == fields.len()
                    && vals
                        .iter()
                        .zip(fields)
                        .all(|(v, f)| v.conforms_to(&f.data_type))
            }
            _ => false,
        }
    }
}

/// Collapse `-0.0` onto `0.0` and every NaN onto one NaN, matching the
/// equality `OrderedFloat` gives [`Value`].
#[must_use]
pub fn canonical_f32(x: f32) -> f32 {
    if x.is_nan() {
        f32::NAN
    } else if x == 0.0 {
        0.0
    } else {
        x
    }
}

#[must_use]
pub fn canonical_f64(x: f64) -> f64 {
    if x.is_nan() {
        f64::NAN
    } else if x == 0.0 {
        0.0
    } else {
        x
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Byte(v) => write!(f, "{v}"),
            Self::Short(v) => write!(f, "{v}"),
            Self::Int(v) | Self::Date(v) => write!(f, "{v}"),
            Self::Long(v) | Self::Timestamp(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{}", v.0),
            Self::Double(v) => write!(f, "{}", v.0),
            Self::String(s) | Self::External(s) => write!(f, "{s}"),
            Self::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Self::Array(items) | Self::Struct(items) => {
                let open = if matches!(self, Self::Array(_)) { '[' } else { '{' };
                let close = if open == '[' { ']' } else { '}' };
                write!(f, "{open}")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "{close}")
            }
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::double(v)
    }
}
