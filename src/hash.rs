//! Murmur3 (x86, 32-bit) hashing of values.
//!
//! Hash partitioning and bucketing share this function. A bucketed table written
//! with `n` buckets therefore has exactly the layout a hash exchange into `n`
//! partitions on the same keys would produce, which is what lets bucketed scans
//! skip the shuffle.

use crate::types::{Value, canonical_f32, canonical_f64};

/// Seed of the first column hash; each later column is hashed with the previous
/// result as its seed.
pub const HASH_SEED: u32 = 42;

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

const fn mix_k1(mut k1: u32) -> u32 {
    k1 = k1.wrapping_mul(C1);
    k1 = k1.rotate_left(15);
    k1.wrapping_mul(C2)
}

const fn mix_h1(mut h1: u32, k1: u32) -> u32 {
    h1 ^= k1;
    h1 = h1.rotate_left(13);
    h1.wrapping_mul(5).wrapping_add(0xe654_6b64)
}

const fn fmix(mut h1: u32, len: u32) -> u32 {
    h1 ^= len;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^ (h1 >> 16)
}

#[must_use]
pub const fn hash_int(v: i32, seed: u32) -> u32 {
    let h1 = mix_h1(seed, mix_k1(v as u32));
    fmix(h1, 4)
}

#[must_use]
pub const fn hash_long(v: i64, seed: u32) -> u32 {
    let low = v as u32;
    let high = (v >> 32) as u32;
    let mut h1 = mix_h1(seed, mix_k1(low));
    h1 = mix_h1(h1, mix_k1(high));
    fmix(h1, 8)
}

/// Murmur3 over an arbitrary byte string.
#[must_use]
pub fn hash_bytes(bytes: &[u8], seed: u32) -> u32 {
    let mut h1 = seed;
    let mut chunks = bytes.chunks_exact(4);
    for chunk in &mut chunks {
        let k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        h1 = mix_h1(h1, mix_k1(k1));
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (i, b) in tail.iter().enumerate() {
            k1 ^= u32::from(*b) << (8 * i);
        }
        h1 ^= mix_k1(k1);
    }
    fmix(h1, bytes.len() as u32)
}

/// Hash one value. Nulls leave the seed untouched.
#[must_use]
pub fn hash_value(v: &Value, seed: u32) -> u32 {
    match v {
        Value::Null => seed,
        Value::Boolean(b) => hash_int(i32::from(*b), seed),
        Value::Byte(x) => hash_int(i32::from(*x), seed),
        Value::Short(x) => hash_int(i32::from(*x), seed),
        Value::Int(x) | Value::Date(x) => hash_int(*x, seed),
        Value::Long(x) | Value::Timestamp(x) => hash_long(*x, seed),
        // Values that compare equal must land in the same partition.
        Value::Float(f) => hash_int(canonical_f32(f.0).to_bits() as i32, seed),
        Value::Double(d) => hash_long(canonical_f64(d.0).to_bits() as i64, seed),
        Value::String(s) | Value::External(s) => hash_bytes(s.as_bytes(), seed),
        Value::Binary(b) => hash_bytes(b, seed),
        Value::Array(items) | Value::Struct(items) => {
            items.iter().fold(seed, |h, item| hash_value(item, h))
        }
    }
}

/// Hash a key tuple, chaining the seed through the columns.
#[must_use]
pub fn hash_values(values: &[Value]) -> u32 {
    values.iter().fold(HASH_SEED, |h, v| hash_value(v, h))
}

/// Non-negative modulo of a signed hash.
#[must_use]
pub const fn pmod(hash: u32, n: usize) -> usize {
    let h = hash as i32 as i64;
    let n = n as i64;
    (((h % n) + n) % n) as usize
}

/// Partition (or bucket) id of a key tuple.
#[must_use]
pub fn partition_for(values: &[Value], num_partitions: usize) -> usize {
    if num_partitions <= 1 {
        return 0;
    }
    pmod(hash_values(values), num_partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordered_float::OrderedFloat;

    #[test]
    fn known_vectors() {
        assert_eq!(hash_bytes(b"", 0), 0);
        assert_eq!(hash_bytes(b"", 1), 0x514e_28b7);
        assert_eq!(hash_bytes(b"hello", 0), 0x248b_fa47);
    }

    #[test]
    fn equal_floats_hash_alike() {
        let zero = hash_value(&Value::Double(OrderedFloat(0.0)), HASH_SEED);
        assert_eq!(hash_value(&Value::Double(OrderedFloat(-0.0)), HASH_SEED), zero);
        let nan = hash_value(&Value::Float(OrderedFloat(f32::NAN)), HASH_SEED);
        let other_nan = f32::from_bits(f32::NAN.to_bits() | 1);
        assert_eq!(hash_value(&Value::Float(OrderedFloat(other_nan)), HASH_SEED), nan);
    }

    #[test]
    fn pmod_is_non_negative() {
        assert_eq!(pmod(u32::MAX, 4), 3);
        assert_eq!(pmod(5, 4), 1);
    }
}
