//! Collection schema types and the field-id layout shared with the
//! coordinator.

use serde::{Deserialize, Serialize};

/// Reserved field id of the implicit row-id column.
pub const ROW_ID_FIELD_ID: i64 = 0;
/// Reserved field id of the implicit timestamp column.
pub const TIMESTAMP_FIELD_ID: i64 = 1;
/// User-declared fields start at this id; everything below is reserved.
pub const START_OF_USER_FIELD_ID: i64 = 100;

/// Logical type of a schema field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// Boolean scalar.
    Bool,
    /// 8-bit signed integer.
    Int8,
    /// 16-bit signed integer.
    Int16,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// UTF-8 string.
    VarChar,
    /// Dense 32-bit float vector.
    FloatVector,
}

impl DataType {
    /// Whether the type is a vector type.
    pub fn is_vector(&self) -> bool {
        matches!(self, DataType::FloatVector)
    }

    /// Whether the type is allowed for a primary-key field.
    pub fn is_primary_key_type(&self) -> bool {
        matches!(self, DataType::Int64 | DataType::VarChar)
    }
}

/// One field of a collection schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldSchema {
    /// Unique field id within the collection.
    pub field_id: i64,
    /// Human-readable field name.
    pub name: String,
    /// Logical type of the field.
    pub data_type: DataType,
    /// Whether this field carries the row's logical identity.
    pub is_primary_key: bool,
}

impl FieldSchema {
    /// Build a plain (non-key) field.
    pub fn new(field_id: i64, name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            field_id,
            name: name.into(),
            data_type,
            is_primary_key: false,
        }
    }

    /// Mark the field as the primary key.
    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }
}

/// Persisted schema of one collection: the reserved system fields plus the
/// user-declared fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionSchema {
    /// All persisted fields, system fields included.
    pub fields: Vec<FieldSchema>,
}

impl CollectionSchema {
    /// Build a schema from an explicit field list.
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self { fields }
    }

    /// Build a schema by prepending the reserved row-id and timestamp
    /// fields to `user_fields`.
    pub fn with_system_fields(user_fields: Vec<FieldSchema>) -> Self {
        let mut fields = vec![
            FieldSchema::new(ROW_ID_FIELD_ID, "row_id", DataType::Int64),
            FieldSchema::new(TIMESTAMP_FIELD_ID, "timestamp", DataType::Int64),
        ];
        fields.extend(user_fields);
        Self { fields }
    }

    /// Look up a field by id.
    pub fn field(&self, field_id: i64) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.field_id == field_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_fields_are_prepended() {
        let schema = CollectionSchema::with_system_fields(vec![FieldSchema::new(
            100,
            "pk",
            DataType::Int64,
        )
        .primary_key()]);
        assert_eq!(schema.fields.len(), 3);
        assert_eq!(schema.fields[0].field_id, ROW_ID_FIELD_ID);
        assert_eq!(schema.fields[1].field_id, TIMESTAMP_FIELD_ID);
        assert!(schema.field(100).is_some_and(|f| f.is_primary_key));
    }
}
