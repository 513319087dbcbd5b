//! Columnar time-series storage
//!
//! The writer is batched and keyed by (sequence_id, timestamp), so applying
//! the same batch twice lands on the same keys and the row count never
//! double-grows. The on-disk encoding is an implementation detail; readers
//! get range scans and last-value lookups.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sled::Batch;
use std::path::Path;
use tagmine_core::{Quality, Sample, TagmineError, TagmineResult, Value};

fn storage(e: sled::Error) -> TagmineError {
    TagmineError::Storage(e.to_string())
}

/// Stored cell: everything except the key components
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Cell {
    value: Value,
    quality: Quality,
}

/// 12-byte key: sequence id then sign-flipped millisecond timestamp, both
/// big-endian so lexicographic order equals (sequence, time) order.
fn encode_key(sequence_id: u32, timestamp_ms: i64) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(&sequence_id.to_be_bytes());
    key[4..].copy_from_slice(&((timestamp_ms as u64) ^ (1 << 63)).to_be_bytes());
    key
}

fn decode_key(key: &[u8]) -> (u32, i64) {
    let mut seq = [0u8; 4];
    seq.copy_from_slice(&key[..4]);
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&key[4..12]);
    (
        u32::from_be_bytes(seq),
        (u64::from_be_bytes(ts) ^ (1 << 63)) as i64,
    )
}

pub struct TimeSeriesStore {
    tree: sled::Tree,
}

impl TimeSeriesStore {
    pub fn open<P: AsRef<Path>>(path: P) -> TagmineResult<Self> {
        let db = sled::open(path).map_err(storage)?;
        Self::with_db(&db)
    }

    /// Open inside an existing sled database (shared data dir)
    pub fn with_db(db: &sled::Db) -> TagmineResult<Self> {
        Ok(Self {
            tree: db.open_tree("series").map_err(storage)?,
        })
    }

    /// Write a batch of samples. Overlapping keys are overwritten, so a
    /// replayed batch leaves the store unchanged.
    pub fn write_batch(&self, samples: &[Sample]) -> TagmineResult<usize> {
        if samples.is_empty() {
            return Ok(0);
        }
        let mut batch = Batch::default();
        for sample in samples {
            let cell = Cell {
                value: sample.value.clone(),
                quality: sample.quality,
            };
            let encoded = serde_json::to_vec(&cell)
                .map_err(|e| TagmineError::Storage(format!("cell encode failed: {}", e)))?;
            batch.insert(
                &encode_key(sample.sequence_id, sample.timestamp.timestamp_millis()),
                encoded,
            );
        }
        self.tree.apply_batch(batch).map_err(storage)?;
        Ok(samples.len())
    }

    /// Ordered samples for one point in [from, to]
    pub fn range(
        &self,
        sequence_id: u32,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> TagmineResult<Vec<Sample>> {
        let lo = encode_key(sequence_id, from.timestamp_millis());
        let hi = encode_key(sequence_id, to.timestamp_millis());
        let mut samples = Vec::new();
        for entry in self.tree.range(lo..=hi) {
            let (key, value) = entry.map_err(storage)?;
            samples.push(decode_sample(&key, &value)?);
        }
        Ok(samples)
    }

    /// The most recent sample for one point
    pub fn last_value(&self, sequence_id: u32) -> TagmineResult<Option<Sample>> {
        let entry = self
            .tree
            .scan_prefix(sequence_id.to_be_bytes())
            .last()
            .transpose()
            .map_err(storage)?;
        entry.map(|(key, value)| decode_sample(&key, &value)).transpose()
    }

    /// Stored rows for one point
    pub fn count(&self, sequence_id: u32) -> usize {
        self.tree.scan_prefix(sequence_id.to_be_bytes()).count()
    }

    /// Stored rows across all points
    pub fn total_rows(&self) -> usize {
        self.tree.len()
    }

    pub fn flush(&self) -> TagmineResult<()> {
        self.tree.flush().map_err(storage)?;
        Ok(())
    }
}

fn decode_sample(key: &[u8], value: &[u8]) -> TagmineResult<Sample> {
    let (sequence_id, timestamp_ms) = decode_key(key);
    let cell: Cell = serde_json::from_slice(value)
        .map_err(|e| TagmineError::Storage(format!("cell decode failed: {}", e)))?;
    let timestamp = Utc
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .ok_or_else(|| TagmineError::Storage(format!("bad stored timestamp {}", timestamp_ms)))?;
    Ok(Sample {
        sequence_id,
        timestamp,
        value: cell.value,
        quality: cell.quality,
    })
}
