//! Binlog payload codec.
//!
//! One blob holds one field's values for one flush, encoded as a bincode
//! column of [`FieldValue`]s. Delete logs are bincode lists of
//! [`DeleteLog`] entries. Row reassembly zips aligned columns back into
//! [`Row`]s.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    schema::TIMESTAMP_FIELD_ID,
    timestamp::Timestamp,
    value::{FieldValue, Row, ScalarValue},
};

/// Errors produced while encoding or decoding persisted payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Binary (bincode) encode/decode failure.
    #[error("binary codec: {0}")]
    Binary(#[from] bincode::Error),
    /// JSON encode/decode failure.
    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),
    /// Aligned columns disagree on row count.
    #[error("column of field {field_id} holds {got} rows, expected {expected}")]
    ColumnLength {
        /// Field whose column is misaligned.
        field_id: i64,
        /// Rows found.
        got: usize,
        /// Rows expected.
        expected: usize,
    },
    /// A required column is absent from the blob set.
    #[error("missing column for field {0}")]
    MissingColumn(i64),
    /// A cell's shape does not match its field's declared type.
    #[error("field {0} holds a value of unexpected shape")]
    UnexpectedShape(i64),
}

/// One tombstone record: primary key and the delete-event timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteLog {
    /// Primary key of the deleted row.
    pub pk: ScalarValue,
    /// Hybrid timestamp of the delete event.
    pub timestamp: Timestamp,
}

/// Encode one field column.
pub fn encode_column(values: &[FieldValue]) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(bincode::serialize(values)?))
}

/// Decode one field column.
pub fn decode_column(bytes: &Bytes) -> Result<Vec<FieldValue>, CodecError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Encode a delete log.
pub fn encode_delete_log(entries: &[DeleteLog]) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(bincode::serialize(entries)?))
}

/// Decode a delete log.
pub fn decode_delete_log(bytes: &Bytes) -> Result<Vec<DeleteLog>, CodecError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Narrow a decoded column to scalars, failing on vector cells.
pub(crate) fn scalar_column(
    field_id: i64,
    values: Vec<FieldValue>,
) -> Result<Vec<ScalarValue>, CodecError> {
    values
        .into_iter()
        .map(|v| match v {
            FieldValue::Scalar(s) => Ok(s),
            FieldValue::Vector(_) => Err(CodecError::UnexpectedShape(field_id)),
        })
        .collect()
}

/// Narrow a decoded column to hybrid timestamps.
pub(crate) fn timestamp_column(values: Vec<FieldValue>) -> Result<Vec<Timestamp>, CodecError> {
    values
        .into_iter()
        .map(|v| match v {
            FieldValue::Scalar(ScalarValue::Int64(ts)) => Ok(ts as Timestamp),
            _ => Err(CodecError::UnexpectedShape(TIMESTAMP_FIELD_ID)),
        })
        .collect()
}

/// Reassemble rows from aligned field columns.
///
/// `columns` must contain the primary-key column and the timestamp column;
/// every column must hold the same number of rows.
pub(crate) fn decode_rows(
    pk_field_id: i64,
    columns: Vec<(i64, Vec<FieldValue>)>,
) -> Result<Vec<Row>, CodecError> {
    let expected = columns
        .first()
        .map(|(_, values)| values.len())
        .unwrap_or(0);
    for (field_id, values) in &columns {
        if values.len() != expected {
            return Err(CodecError::ColumnLength {
                field_id: *field_id,
                got: values.len(),
                expected,
            });
        }
    }
    if !columns.iter().any(|(id, _)| *id == pk_field_id) {
        return Err(CodecError::MissingColumn(pk_field_id));
    }
    if !columns.iter().any(|(id, _)| *id == TIMESTAMP_FIELD_ID) {
        return Err(CodecError::MissingColumn(TIMESTAMP_FIELD_ID));
    }

    let mut iters: Vec<(i64, std::vec::IntoIter<FieldValue>)> = columns
        .into_iter()
        .map(|(id, values)| (id, values.into_iter()))
        .collect();

    let mut rows = Vec::with_capacity(expected);
    for _ in 0..expected {
        let mut fields = BTreeMap::new();
        for (field_id, iter) in iters.iter_mut() {
            let value = iter
                .next()
                .ok_or(CodecError::MissingColumn(*field_id))?;
            fields.insert(*field_id, value);
        }
        let pk = match fields.get(&pk_field_id) {
            Some(FieldValue::Scalar(s)) => s.clone(),
            _ => return Err(CodecError::UnexpectedShape(pk_field_id)),
        };
        let timestamp = match fields.get(&TIMESTAMP_FIELD_ID) {
            Some(FieldValue::Scalar(ScalarValue::Int64(ts))) => *ts as Timestamp,
            _ => return Err(CodecError::UnexpectedShape(TIMESTAMP_FIELD_ID)),
        };
        rows.push(Row {
            pk,
            timestamp,
            fields,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_column(values: &[i64]) -> Vec<FieldValue> {
        values
            .iter()
            .map(|v| FieldValue::Scalar(ScalarValue::Int64(*v)))
            .collect()
    }

    #[test]
    fn column_round_trip() {
        let column = vec![
            FieldValue::Scalar(ScalarValue::VarChar("a".into())),
            FieldValue::Vector(vec![1.0, 2.0]),
        ];
        let bytes = encode_column(&column).unwrap();
        assert_eq!(decode_column(&bytes).unwrap(), column);
    }

    #[test]
    fn delete_log_round_trip() {
        let entries = vec![
            DeleteLog {
                pk: ScalarValue::Int64(1),
                timestamp: 10,
            },
            DeleteLog {
                pk: ScalarValue::VarChar("k".into()),
                timestamp: 20,
            },
        ];
        let bytes = encode_delete_log(&entries).unwrap();
        assert_eq!(decode_delete_log(&bytes).unwrap(), entries);
    }

    #[test]
    fn rows_are_reassembled_in_order() {
        let columns = vec![
            (0, int_column(&[1000, 1001])),
            (1, int_column(&[5, 6])),
            (100, int_column(&[42, 43])),
        ];
        let rows = decode_rows(100, columns).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].pk, ScalarValue::Int64(42));
        assert_eq!(rows[0].timestamp, 5);
        assert_eq!(rows[1].pk, ScalarValue::Int64(43));
        assert_eq!(rows[1].fields.len(), 3);
    }

    #[test]
    fn misaligned_columns_are_rejected() {
        let columns = vec![(1, int_column(&[5, 6])), (100, int_column(&[42]))];
        let err = decode_rows(100, columns).unwrap_err();
        assert!(matches!(err, CodecError::ColumnLength { field_id: 100, .. }));
    }

    #[test]
    fn missing_pk_column_is_rejected() {
        let columns = vec![(1, int_column(&[5]))];
        let err = decode_rows(100, columns).unwrap_err();
        assert!(matches!(err, CodecError::MissingColumn(100)));
    }
}
