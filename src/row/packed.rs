//! The packed binary row format.
//!
//! A packed row is one contiguous byte buffer:
//!
//! ```text
//! [ null bit set: ceil(n/64) * 8 bytes ][ n fixed 8-byte slots ][ variable-length region ]
//! ```
//!
//! Fixed-width values (booleans, integers, floats, dates, timestamps) are stored
//! little-endian inside their slot. Variable-length values (strings, binary,
//! arrays, structs) store `(offset << 32) | length` in the slot, with `offset`
//! relative to the start of the row; the bytes live in the variable-length
//! region, padded to a word boundary. Structs are nested packed rows; arrays are
//! an 8-byte element count followed by a packed body with one slot per element.
//!
//! Null slots are zeroed and padding is zeroed, and floats are written in
//! canonical form (`-0.0` as `0.0`, one NaN), so two rows holding equal values
//! have identical bytes. Equality, hashing and the shuffle codec rely on it.

use crate::error::{ExecError, data_err};
use crate::row::generic::GenericRow;
use crate::types::{DataType, Schema, Value, canonical_f32, canonical_f64};
use anyhow::Result;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

const WORD: usize = 8;

/// Width in bytes of the null bit set for `num_fields` fields.
#[must_use]
pub const fn bitset_width(num_fields: usize) -> usize {
    num_fields.div_ceil(64) * WORD
}

const fn round_to_word(n: usize) -> usize {
    n.div_ceil(WORD) * WORD
}

/// Borrowed view over packed bytes. Valid only while the producer keeps the
/// buffer untouched; call [`PackedRowRef::copy_row`] to retain it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PackedRowRef<'a> {
    bytes: &'a [u8],
    num_fields: usize,
}

/// An owned packed row.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackedRow {
    bytes: Vec<u8>,
    num_fields: usize,
}

impl<'a> PackedRowRef<'a> {
    /// Wrap `bytes` as a row of `num_fields` fields.
    ///
    /// # Errors
    ///
    /// Returns a data error if the buffer is too short for the fixed region.
    pub fn new(bytes: &'a [u8], num_fields: usize) -> Result<Self> {
        let fixed = bitset_width(num_fields) + num_fields * WORD;
        if bytes.len() < fixed {
            return data_err(format!(
                "packed row of {num_fields} fields needs at least {fixed} bytes, got {}",
                bytes.len()
            ));
        }
        Ok(Self { bytes, num_fields })
    }

    #[must_use]
    pub const fn num_fields(&self) -> usize {
        self.num_fields
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        self.bytes.len()
    }

    /// Copy the borrowed bytes into an owned row.
    #[must_use]
    pub fn copy_row(&self) -> PackedRow {
        PackedRow {
            bytes: self.bytes.to_vec(),
            num_fields: self.num_fields,
        }
    }

    fn slot(&self, i: usize) -> [u8; WORD] {
        debug_assert!(i < self.num_fields, "field {i} out of {}", self.num_fields);
        let at = bitset_width(self.num_fields) + i * WORD;
        let mut out = [0u8; WORD];
        out.copy_from_slice(&self.bytes[at..at + WORD]);
        out
    }

    #[must_use]
    pub fn is_null_at(&self, i: usize) -> bool {
        debug_assert!(i < self.num_fields);
        (self.bytes[i / 8] >> (i % 8)) & 1 == 1
    }

    #[must_use]
    pub fn any_null(&self) -> bool {
        self.bytes[..bitset_width(self.num_fields)]
            .iter()
            .any(|b| *b != 0)
    }

    #[must_use]
    pub fn get_boolean(&self, i: usize) -> bool {
        self.slot(i)[0] != 0
    }

    #[must_use]
    pub fn get_byte(&self, i: usize) -> i8 {
        i8::from_le_bytes([self.slot(i)[0]])
    }

    #[must_use]
    pub fn get_short(&self, i: usize) -> i16 {
        let s = self.slot(i);
        i16::from_le_bytes([s[0], s[1]])
    }

    #[must_use]
    pub fn get_int(&self, i: usize) -> i32 {
        let s = self.slot(i);
        i32::from_le_bytes([s[0], s[1], s[2], s[3]])
    }

    #[must_use]
    pub fn get_long(&self, i: usize) -> i64 {
        i64::from_le_bytes(self.slot(i))
    }

    #[must_use]
    pub fn get_float(&self, i: usize) -> f32 {
        f32::from_bits(self.get_int(i) as u32)
    }

    #[must_use]
    pub fn get_double(&self, i: usize) -> f64 {
        f64::from_bits(self.get_long(i) as u64)
    }

    /// Raw bytes of a variable-length field.
    ///
    /// # Errors
    ///
    /// Returns a data error if the slot points outside the row.
    pub fn get_var_bytes(&self, i: usize) -> Result<&'a [u8]> {
        let packed = u64::from_le_bytes(self.slot(i));
        let offset = (packed >> 32) as usize;
        let len = (packed & 0xFFFF_FFFF) as usize;
        self.bytes.get(offset..offset + len).ok_or_else(|| {
            ExecError::Data(format!(
                "field {i} points at [{offset}, {}) beyond row of {} bytes",
                offset + len,
                self.bytes.len()
            ))
            .into()
        })
    }

    /// # Errors
    ///
    /// Returns a data error if the bytes are out of range or not UTF-8.
    pub fn get_string(&self, i: usize) -> Result<&'a str> {
        let raw = self.get_var_bytes(i)?;
        std::str::from_utf8(raw)
            .map_err(|e| ExecError::Data(format!("field {i} is not valid UTF-8: {e}")).into())
    }

    /// Nested struct as a packed row of `num_fields` fields.
    ///
    /// # Errors
    ///
    /// Returns a data error if the nested bytes are malformed.
    pub fn get_struct(&self, i: usize, num_fields: usize) -> Result<PackedRowRef<'a>> {
        PackedRowRef::new(self.get_var_bytes(i)?, num_fields)
    }

    /// Array elements exposed as the fields of a packed body.
    ///
    /// # Errors
    ///
    /// Returns a data error if the array header or body is malformed.
    pub fn get_array(&self, i: usize) -> Result<PackedRowRef<'a>> {
        let raw = self.get_var_bytes(i)?;
        let Some(header) = raw.get(..WORD) else {
            return data_err(format!("array field {i} is missing its length header"));
        };
        let mut count = [0u8; WORD];
        count.copy_from_slice(header);
        let count = usize::try_from(u64::from_le_bytes(count))
            .map_err(|_| ExecError::Data(format!("array field {i} has an oversized count")))?;
        PackedRowRef::new(&raw[WORD..], count)
    }

    /// Decode field `i` as a boxed value of type `dt`.
    ///
    /// # Errors
    ///
    /// Returns a data error for malformed variable-length data or unsupported types.
    pub fn value_at(&self, i: usize, dt: &DataType) -> Result<Value> {
        if self.is_null_at(i) {
            return Ok(Value::Null);
        }
        Ok(match dt {
            DataType::Boolean => Value::Boolean(self.get_boolean(i)),
            DataType::Byte => Value::Byte(self.get_byte(i)),
            DataType::Short => Value::Short(self.get_short(i)),
            DataType::Int => Value::Int(self.get_int(i)),
            DataType::Long => Value::Long(self.get_long(i)),
            DataType::Float => Value::Float(OrderedFloat(self.get_float(i))),
            DataType::Double => Value::Double(OrderedFloat(self.get_double(i))),
            DataType::Date => Value::Date(self.get_int(i)),
            DataType::Timestamp => Value::Timestamp(self.get_long(i)),
            DataType::String => Value::String(self.get_string(i)?.to_string()),
            DataType::Binary => Value::Binary(self.get_var_bytes(i)?.to_vec()),
            DataType::Struct(fields) => {
                let nested = self.get_struct(i, fields.len())?;
                let mut vals = Vec::with_capacity(fields.len());
                for (j, f) in fields.iter().enumerate() {
                    vals.push(nested.value_at(j, &f.data_type)?);
                }
                Value::Struct(vals)
            }
            DataType::Array(elem) => {
                let body = self.get_array(i)?;
                let mut vals = Vec::with_capacity(body.num_fields());
                for j in 0..body.num_fields() {
                    vals.push(body.value_at(j, elem)?);
                }
                Value::Array(vals)
            }
            DataType::External(name) => {
                return data_err(format!("external type '{name}' cannot live in a packed row"));
            }
        })
    }

    /// Decode every field into a boxed row.
    ///
    /// # Errors
    ///
    /// Returns a data error if the schema arity differs or a field is malformed.
    pub fn to_generic(&self, schema: &Schema) -> Result<GenericRow> {
        if schema.len() != self.num_fields {
            return data_err(format!(
                "schema has {} fields but packed row has {}",
                schema.len(),
                self.num_fields
            ));
        }
        let mut vals = Vec::with_capacity(self.num_fields);
        for (i, f) in schema.fields.iter().enumerate() {
            vals.push(self.value_at(i, &f.data_type)?);
        }
        Ok(GenericRow::new(vals))
    }
}

impl PackedRow {
    /// Encode `values` according to `schema` into a freshly allocated row.
    ///
    /// # Errors
    ///
    /// Returns a data error on arity or type mismatch.
    pub fn from_values(values: &[Value], schema: &Schema) -> Result<Self> {
        let mut bytes = Vec::new();
        encode_row(&mut bytes, values, schema)?;
        Ok(Self {
            bytes,
            num_fields: values.len(),
        })
    }

    /// Rebuild an owned row from bytes read off the wire.
    ///
    /// # Errors
    ///
    /// Returns a data error if the bytes are too short for `num_fields`.
    pub fn from_bytes(bytes: Vec<u8>, num_fields: usize) -> Result<Self> {
        PackedRowRef::new(&bytes, num_fields)?;
        Ok(Self { bytes, num_fields })
    }

    #[must_use]
    pub fn as_ref(&self) -> PackedRowRef<'_> {
        PackedRowRef {
            bytes: &self.bytes,
            num_fields: self.num_fields,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub const fn num_fields(&self) -> usize {
        self.num_fields
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Reusable encoder. Each [`write`](PackedRowWriter::write) overwrites the
/// previous row, so the returned view is only valid until the next call.
#[derive(Debug, Default)]
pub struct PackedRowWriter {
    buf: Vec<u8>,
    num_fields: usize,
    has_row: bool,
}

impl PackedRowWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `values` into the shared buffer.
    ///
    /// # Errors
    ///
    /// Returns a data error on arity or type mismatch.
    pub fn write(&mut self, values: &[Value], schema: &Schema) -> Result<PackedRowRef<'_>> {
        self.buf.clear();
        self.has_row = false;
        encode_row(&mut self.buf, values, schema)?;
        self.num_fields = values.len();
        self.has_row = true;
        Ok(self.row())
    }

    /// Copy already packed bytes into the shared buffer.
    pub fn write_bytes(&mut self, row: PackedRowRef<'_>) -> PackedRowRef<'_> {
        self.buf.clear();
        self.buf.extend_from_slice(row.as_bytes());
        self.num_fields = row.num_fields();
        self.has_row = true;
        self.row()
    }

    /// The last written row, or `None` if nothing was written since the
    /// last [`clear`](Self::clear).
    #[must_use]
    pub fn current(&self) -> Option<PackedRowRef<'_>> {
        self.has_row.then(|| self.row())
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.has_row = false;
    }

    /// View of the most recently written row.
    #[must_use]
    pub fn row(&self) -> PackedRowRef<'_> {
        PackedRowRef {
            bytes: &self.buf,
            num_fields: self.num_fields,
        }
    }
}

fn encode_row(buf: &mut Vec<u8>, values: &[Value], schema: &Schema) -> Result<()> {
    if values.len() != schema.len() {
        return data_err(format!(
            "row has {} values but schema has {} fields",
            values.len(),
            schema.len()
        ));
    }
    write_body(buf, values, &|i| &schema.fields[i].data_type)
}

fn write_body<'t>(
    buf: &mut Vec<u8>,
    values: &[Value],
    type_at: &dyn Fn(usize) -> &'t DataType,
) -> Result<()> {
    let start = buf.len();
    let n = values.len();
    let bits = bitset_width(n);
    buf.resize(start + bits + n * WORD, 0);

    for (i, v) in values.iter().enumerate() {
        let dt = type_at(i);
        let slot = start + bits + i * WORD;
        if v.is_null() {
            buf[start + i / 8] |= 1 << (i % 8);
            continue;
        }
        let fixed: Option<[u8; WORD]> = match (v, dt) {
            (Value::Boolean(b), DataType::Boolean) => Some(widen(&[u8::from(*b)])),
            (Value::Byte(x), DataType::Byte) => Some(widen(&x.to_le_bytes())),
            (Value::Short(x), DataType::Short) => Some(widen(&x.to_le_bytes())),
            (Value::Int(x), DataType::Int) | (Value::Date(x), DataType::Date) => {
                Some(widen(&x.to_le_bytes()))
            }
            (Value::Long(x), DataType::Long) | (Value::Timestamp(x), DataType::Timestamp) => {
                Some(x.to_le_bytes())
            }
            (Value::Float(x), DataType::Float) => {
                Some(widen(&canonical_f32(x.0).to_bits().to_le_bytes()))
            }
            (Value::Double(x), DataType::Double) => Some(canonical_f64(x.0).to_bits().to_le_bytes()),
            _ => None,
        };
        if let Some(bytes) = fixed {
            buf[slot..slot + WORD].copy_from_slice(&bytes);
            continue;
        }

        let offset = buf.len() - start;
        match (v, dt) {
            (Value::String(s), DataType::String) => buf.extend_from_slice(s.as_bytes()),
            (Value::Binary(b), DataType::Binary) => buf.extend_from_slice(b),
            (Value::Struct(vals), DataType::Struct(fields)) => {
                if vals.len() != fields.len() {
                    return data_err(format!(
                        "struct value has {} fields, type declares {}",
                        vals.len(),
                        fields.len()
                    ));
                }
                write_body(buf, vals, &|j| &fields[j].data_type)?;
            }
            (Value::Array(items), DataType::Array(elem)) => {
                buf.extend_from_slice(&(items.len() as u64).to_le_bytes());
                let elem: &DataType = elem;
                write_body(buf, items, &|_| elem)?;
            }
            (_, DataType::External(name)) => {
                return data_err(format!("external type '{name}' cannot live in a packed row"));
            }
            (other, dt) => {
                return data_err(format!("value {other} does not conform to type {dt:?}"));
            }
        }
        let len = buf.len() - start - offset;
        let (Ok(off32), Ok(len32)) = (u32::try_from(offset), u32::try_from(len)) else {
            return data_err("packed row exceeds 4 GiB");
        };
        let padded = start + round_to_word(buf.len() - start);
        buf.resize(padded, 0);
        let packed = (u64::from(off32) << 32) | u64::from(len32);
        buf[slot..slot + WORD].copy_from_slice(&packed.to_le_bytes());
    }
    Ok(())
}

fn widen(bytes: &[u8]) -> [u8; WORD] {
    let mut out = [0u8; WORD];
    out[..bytes.len()].copy_from_slice(bytes);
    out
}
