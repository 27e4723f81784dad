//! Field, segment, and partition statistics plus the analyzer artifacts
//! the vector planner consumes.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{codec::CodecError, schema::DataType, value::ScalarValue};

/// Statistics of one field over some row set: scalar min/max, or the
/// centroid a vector bucket was built around.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    /// Field the stats describe.
    pub field_id: i64,
    /// Logical type of the field.
    pub data_type: DataType,
    /// Smallest observed scalar value.
    pub min: Option<ScalarValue>,
    /// Largest observed scalar value.
    pub max: Option<ScalarValue>,
    /// Centroid vector, set in vector mode only.
    pub centroid: Option<Vec<f32>>,
}

impl FieldStats {
    /// Empty stats for a field.
    pub fn new(field_id: i64, data_type: DataType) -> Self {
        Self {
            field_id,
            data_type,
            min: None,
            max: None,
            centroid: None,
        }
    }

    /// Widen min/max to cover `value`.
    pub fn update_min_max(&mut self, value: &ScalarValue) {
        match &self.min {
            Some(min) if min <= value => {}
            _ => self.min = Some(value.clone()),
        }
        match &self.max {
            Some(max) if max >= value => {}
            _ => self.max = Some(value.clone()),
        }
    }

    /// Attach the centroid vector of a vector-mode bucket.
    pub fn set_centroid(&mut self, centroid: Vec<f32>) {
        self.centroid = Some(centroid);
    }

    /// Widen these stats to cover everything `other` covers.
    pub fn merge(&mut self, other: &FieldStats) {
        if let Some(min) = &other.min {
            self.update_min_max(min);
        }
        if let Some(max) = &other.max {
            self.update_min_max(max);
        }
    }
}

/// Statistics of one sealed output segment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SegmentStats {
    /// Stats of the clustering key over the segment's rows.
    pub field_stats: Vec<FieldStats>,
    /// Total rows in the segment.
    pub num_rows: i64,
}

/// Versioned union of output-segment stats published for the query planner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionStatsSnapshot {
    /// Snapshot version; equals the producing plan's id.
    pub version: i64,
    /// Stats keyed by output segment id.
    pub segment_stats: HashMap<i64, SegmentStats>,
}

impl PartitionStatsSnapshot {
    /// Empty snapshot at `version`.
    pub fn new(version: i64) -> Self {
        Self {
            version,
            segment_stats: HashMap::new(),
        }
    }

    /// Serialize to the published JSON form.
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse a published snapshot.
    pub fn from_bytes(bytes: &Bytes) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Primary-key stats log written beside each sealed output segment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrimaryKeyStats {
    /// Primary-key field id.
    pub field_id: i64,
    /// Primary-key type.
    pub data_type: DataType,
    /// Smallest primary key in the segment.
    pub min: Option<ScalarValue>,
    /// Largest primary key in the segment.
    pub max: Option<ScalarValue>,
    /// Rows covered by the stats.
    pub row_count: i64,
}

impl PrimaryKeyStats {
    /// Serialize to the persisted JSON form.
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse a persisted stats log.
    pub fn from_bytes(bytes: &Bytes) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Centroid list produced by the external analyzer for one partition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CentroidStats {
    /// One centroid vector per output bucket.
    pub centroids: Vec<Vec<f32>>,
}

impl CentroidStats {
    /// Serialize to the persisted binary form.
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Parse a persisted centroid list.
    pub fn from_bytes(bytes: &Bytes) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Row-index to centroid-index mapping of one input segment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CentroidIdMapping {
    /// Centroid index per row offset.
    pub centroid_id_mapping: Vec<u32>,
}

impl CentroidIdMapping {
    /// Serialize to the persisted binary form.
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Parse a persisted mapping.
    pub fn from_bytes(bytes: &Bytes) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_max_widens_only_outward() {
        let mut stats = FieldStats::new(101, DataType::Int64);
        stats.update_min_max(&ScalarValue::Int64(10));
        stats.update_min_max(&ScalarValue::Int64(3));
        stats.update_min_max(&ScalarValue::Int64(7));
        assert_eq!(stats.min, Some(ScalarValue::Int64(3)));
        assert_eq!(stats.max, Some(ScalarValue::Int64(10)));
    }

    #[test]
    fn merge_covers_both_ranges() {
        let mut a = FieldStats::new(101, DataType::Int64);
        a.update_min_max(&ScalarValue::Int64(5));
        let mut b = FieldStats::new(101, DataType::Int64);
        b.update_min_max(&ScalarValue::Int64(-2));
        b.update_min_max(&ScalarValue::Int64(9));
        a.merge(&b);
        assert_eq!(a.min, Some(ScalarValue::Int64(-2)));
        assert_eq!(a.max, Some(ScalarValue::Int64(9)));
    }

    #[test]
    fn snapshot_json_round_trip() {
        let mut snapshot = PartitionStatsSnapshot::new(77);
        snapshot.segment_stats.insert(
            5,
            SegmentStats {
                field_stats: vec![FieldStats::new(101, DataType::VarChar)],
                num_rows: 12,
            },
        );
        let bytes = snapshot.to_bytes().unwrap();
        let parsed = PartitionStatsSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.version, 77);
        assert_eq!(parsed.segment_stats.len(), 1);
        assert_eq!(parsed.segment_stats[&5].num_rows, 12);
    }

    #[test]
    fn centroid_artifacts_round_trip() {
        let centroids = CentroidStats {
            centroids: vec![vec![0.0, 1.0], vec![1.0, 0.0]],
        };
        let parsed = CentroidStats::from_bytes(&centroids.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, centroids);

        let mapping = CentroidIdMapping {
            centroid_id_mapping: vec![0, 1, 0, 1],
        };
        let parsed = CentroidIdMapping::from_bytes(&mapping.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, mapping);
    }
}
