//! Dynamic row values.
//!
//! Rows travel through the engine as field-id keyed maps of [`FieldValue`]s.
//! [`ScalarValue`] carries a total order (floats via `total_cmp`) and a
//! bit-exact hash so it can key the analyze histogram and the scalar bucket
//! membership map.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};

use crate::{schema::DataType, timestamp::Timestamp};

/// A scalar cell value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ScalarValue {
    /// Boolean.
    Bool(bool),
    /// 8-bit signed integer.
    Int8(i8),
    /// 16-bit signed integer.
    Int16(i16),
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 32-bit float, ordered by `total_cmp`.
    Float(f32),
    /// 64-bit float, ordered by `total_cmp`.
    Double(f64),
    /// UTF-8 string.
    VarChar(String),
}

impl ScalarValue {
    /// Logical type of the value.
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::Bool(_) => DataType::Bool,
            ScalarValue::Int8(_) => DataType::Int8,
            ScalarValue::Int16(_) => DataType::Int16,
            ScalarValue::Int32(_) => DataType::Int32,
            ScalarValue::Int64(_) => DataType::Int64,
            ScalarValue::Float(_) => DataType::Float,
            ScalarValue::Double(_) => DataType::Double,
            ScalarValue::VarChar(_) => DataType::VarChar,
        }
    }

    /// Rough in-memory footprint in bytes, used for residency accounting.
    pub fn memory_size(&self) -> i64 {
        match self {
            ScalarValue::Bool(_) | ScalarValue::Int8(_) => 1,
            ScalarValue::Int16(_) => 2,
            ScalarValue::Int32(_) | ScalarValue::Float(_) => 4,
            ScalarValue::Int64(_) | ScalarValue::Double(_) => 8,
            ScalarValue::VarChar(s) => s.len() as i64 + 16,
        }
    }

    fn type_order(&self) -> u8 {
        match self {
            ScalarValue::Bool(_) => 0,
            ScalarValue::Int8(_) => 1,
            ScalarValue::Int16(_) => 2,
            ScalarValue::Int32(_) => 3,
            ScalarValue::Int64(_) => 4,
            ScalarValue::Float(_) => 5,
            ScalarValue::Double(_) => 6,
            ScalarValue::VarChar(_) => 7,
        }
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ScalarValue::Bool(a), ScalarValue::Bool(b)) => a == b,
            (ScalarValue::Int8(a), ScalarValue::Int8(b)) => a == b,
            (ScalarValue::Int16(a), ScalarValue::Int16(b)) => a == b,
            (ScalarValue::Int32(a), ScalarValue::Int32(b)) => a == b,
            (ScalarValue::Int64(a), ScalarValue::Int64(b)) => a == b,
            (ScalarValue::Float(a), ScalarValue::Float(b)) => a.to_bits() == b.to_bits(),
            (ScalarValue::Double(a), ScalarValue::Double(b)) => a.to_bits() == b.to_bits(),
            (ScalarValue::VarChar(a), ScalarValue::VarChar(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ScalarValue {}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_order().hash(state);
        match self {
            ScalarValue::Bool(v) => v.hash(state),
            ScalarValue::Int8(v) => v.hash(state),
            ScalarValue::Int16(v) => v.hash(state),
            ScalarValue::Int32(v) => v.hash(state),
            ScalarValue::Int64(v) => v.hash(state),
            ScalarValue::Float(v) => v.to_bits().hash(state),
            ScalarValue::Double(v) => v.to_bits().hash(state),
            ScalarValue::VarChar(v) => v.hash(state),
        }
    }
}

impl Ord for ScalarValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ScalarValue::Bool(a), ScalarValue::Bool(b)) => a.cmp(b),
            (ScalarValue::Int8(a), ScalarValue::Int8(b)) => a.cmp(b),
            (ScalarValue::Int16(a), ScalarValue::Int16(b)) => a.cmp(b),
            (ScalarValue::Int32(a), ScalarValue::Int32(b)) => a.cmp(b),
            (ScalarValue::Int64(a), ScalarValue::Int64(b)) => a.cmp(b),
            (ScalarValue::Float(a), ScalarValue::Float(b)) => a.total_cmp(b),
            (ScalarValue::Double(a), ScalarValue::Double(b)) => a.total_cmp(b),
            (ScalarValue::VarChar(a), ScalarValue::VarChar(b)) => a.cmp(b),
            _ => self.type_order().cmp(&other.type_order()),
        }
    }
}

impl PartialOrd for ScalarValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A cell value: scalar or dense vector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Scalar cell.
    Scalar(ScalarValue),
    /// Dense float-vector cell.
    Vector(Vec<f32>),
}

impl FieldValue {
    /// Rough in-memory footprint in bytes.
    pub fn memory_size(&self) -> i64 {
        match self {
            FieldValue::Scalar(s) => 16 + s.memory_size(),
            FieldValue::Vector(v) => 24 + 4 * v.len() as i64,
        }
    }

    /// Borrow the scalar payload, if this is a scalar cell.
    pub fn as_scalar(&self) -> Option<&ScalarValue> {
        match self {
            FieldValue::Scalar(s) => Some(s),
            FieldValue::Vector(_) => None,
        }
    }
}

/// One reassembled row: primary key, version timestamp, and every schema
/// field by id.
#[derive(Clone, Debug)]
pub struct Row {
    /// Primary-key value, duplicated out of `fields` for filter hot paths.
    pub pk: ScalarValue,
    /// Hybrid logical timestamp of the row version.
    pub timestamp: Timestamp,
    /// All field values keyed by field id, system fields included.
    pub fields: BTreeMap<i64, FieldValue>,
}

impl Row {
    /// Rough in-memory footprint in bytes.
    pub fn memory_size(&self) -> i64 {
        let fields: i64 = self.fields.values().map(|v| 8 + v.memory_size()).sum();
        self.pk.memory_size() + 8 + fields
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use super::*;

    fn hash_of(v: &ScalarValue) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn scalar_natural_order() {
        let mut keys = vec![
            ScalarValue::Int64(30),
            ScalarValue::Int64(-1),
            ScalarValue::Int64(7),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                ScalarValue::Int64(-1),
                ScalarValue::Int64(7),
                ScalarValue::Int64(30)
            ]
        );

        let mut names = vec![
            ScalarValue::VarChar("pear".into()),
            ScalarValue::VarChar("apple".into()),
        ];
        names.sort();
        assert_eq!(names[0], ScalarValue::VarChar("apple".into()));
    }

    #[test]
    fn float_order_and_hash_are_bitwise_consistent() {
        let nan = ScalarValue::Double(f64::NAN);
        assert_eq!(nan, nan.clone());
        assert_eq!(hash_of(&nan), hash_of(&nan.clone()));
        assert_eq!(nan.cmp(&nan.clone()), Ordering::Equal);
        assert!(ScalarValue::Double(-0.0) < ScalarValue::Double(0.0));
    }

    #[test]
    fn varchar_size_tracks_length() {
        let short = ScalarValue::VarChar("a".into());
        let long = ScalarValue::VarChar("a".repeat(100));
        assert!(long.memory_size() > short.memory_size());
    }
}
