//! Bus records and the DLQ envelope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message as delivered to a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub topic: String,
    pub partition: usize,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
    pub produced_at: DateTime<Utc>,
}

impl Record {
    /// Decode the JSON payload into a wire event
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// What actually sits in a sled partition tree, keyed by big-endian offset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoredRecord {
    pub key: String,
    #[serde(with = "serde_bytes_vec")]
    pub payload: Vec<u8>,
    pub produced_at: DateTime<Utc>,
}

// Compact payload encoding: JSON string of the raw bytes interpreted as
// latin-1, reversible for arbitrary byte values.
mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let text: String = bytes.iter().map(|&b| b as char).collect();
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(text.chars().map(|c| c as u8).collect())
    }
}

/// Wrapper around a poison message routed to `datapoints.dlq`.
/// The original payload is preserved byte-for-byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEnvelope {
    pub original_topic: String,
    pub original_partition: usize,
    pub original_offset: u64,
    pub original_key: String,
    #[serde(with = "serde_bytes_vec")]
    pub payload: Vec<u8>,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DlqEnvelope {
    pub fn from_record(record: &Record, reason: impl Into<String>) -> Self {
        Self {
            original_topic: record.topic.clone(),
            original_partition: record.partition,
            original_offset: record.offset,
            original_key: record.key.clone(),
            payload: record.payload.clone(),
            reason: reason.into(),
            failed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_record_roundtrip_arbitrary_bytes() {
        let stored = StoredRecord {
            key: "plant/line1".to_string(),
            payload: (0..=255u8).collect(),
            produced_at: Utc::now(),
        };
        let json = serde_json::to_vec(&stored).unwrap();
        let back: StoredRecord = serde_json::from_slice(&json).unwrap();
        assert_eq!(stored, back);
    }

    #[test]
    fn test_dlq_envelope_preserves_payload() {
        let record = Record {
            topic: "datapoints.raw".to_string(),
            partition: 2,
            offset: 41,
            key: "k".to_string(),
            payload: b"{not json".to_vec(),
            produced_at: Utc::now(),
        };
        let envelope = DlqEnvelope::from_record(&record, "undecodable batch");
        assert_eq!(envelope.payload, record.payload);
        assert_eq!(envelope.original_offset, 41);

        let json = serde_json::to_vec(&envelope).unwrap();
        let back: DlqEnvelope = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.payload, record.payload);
    }
}
