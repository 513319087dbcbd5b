//! The message bus: topic logs, partitions, offset book-keeping

use crate::consumer::Consumer;
use crate::record::{DlqEnvelope, Record, StoredRecord};
use crate::topics;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tagmine_core::{TagmineError, TagmineResult};

/// Recent records kept in memory per partition for hot reads
const TAIL_CAPACITY: usize = 1024;

fn storage(e: sled::Error) -> TagmineError {
    TagmineError::Storage(e.to_string())
}

/// Durable partitioned append-only log
pub struct MessageBus {
    db: sled::Db,
    partitions: usize,
    topics: DashMap<String, Arc<TopicLog>>,
    offsets: sled::Tree,
}

pub(crate) struct TopicLog {
    pub(crate) partitions: Vec<PartitionLog>,
}

pub(crate) struct PartitionLog {
    tree: sled::Tree,
    /// Next offset to assign. The lock also serializes the insert so a
    /// reader never observes offset n+1 before offset n exists.
    next_offset: Mutex<u64>,
    tail: RwLock<VecDeque<(u64, StoredRecord)>>,
}

impl PartitionLog {
    pub(crate) fn open(db: &sled::Db, topic: &str, partition: usize) -> TagmineResult<Self> {
        let tree = db
            .open_tree(format!("log/{}/{}", topic, partition))
            .map_err(storage)?;
        let next = match tree.last().map_err(storage)? {
            Some((key, _)) => decode_offset(&key) + 1,
            None => 0,
        };
        Ok(Self {
            tree,
            next_offset: Mutex::new(next),
            tail: RwLock::new(VecDeque::new()),
        })
    }

    fn append(&self, stored: StoredRecord) -> TagmineResult<u64> {
        let encoded = serde_json::to_vec(&stored)
            .map_err(|e| TagmineError::Storage(format!("record encode failed: {}", e)))?;
        let mut next = self.next_offset.lock();
        let offset = *next;
        self.tree
            .insert(offset.to_be_bytes(), encoded)
            .map_err(storage)?;
        *next = offset + 1;

        let mut tail = self.tail.write();
        if tail.len() == TAIL_CAPACITY {
            tail.pop_front();
        }
        tail.push_back((offset, stored));
        Ok(offset)
    }

    pub(crate) fn fetch(
        &self,
        topic: &str,
        partition: usize,
        from: u64,
        max: usize,
    ) -> TagmineResult<Vec<Record>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        // Hot path: the requested range is still in the in-memory tail
        {
            let tail = self.tail.read();
            if let Some(&(front, _)) = tail.front() {
                if from >= front {
                    return Ok(tail
                        .iter()
                        .skip((from - front) as usize)
                        .take(max)
                        .map(|(offset, stored)| to_record(topic, partition, *offset, stored.clone()))
                        .collect());
                }
            }
        }

        // Cold path: replay from sled
        let mut records = Vec::new();
        for entry in self.tree.range(from.to_be_bytes()..) {
            let (key, value) = entry.map_err(storage)?;
            let stored: StoredRecord = serde_json::from_slice(&value)
                .map_err(|e| TagmineError::Storage(format!("record decode failed: {}", e)))?;
            records.push(to_record(topic, partition, decode_offset(&key), stored));
            if records.len() == max {
                break;
            }
        }
        Ok(records)
    }

    pub(crate) fn end_offset(&self) -> u64 {
        *self.next_offset.lock()
    }
}

fn to_record(topic: &str, partition: usize, offset: u64, stored: StoredRecord) -> Record {
    Record {
        topic: topic.to_string(),
        partition,
        offset,
        key: stored.key,
        payload: stored.payload,
        produced_at: stored.produced_at,
    }
}

pub(crate) fn decode_offset(key: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&key[..8]);
    u64::from_be_bytes(bytes)
}

/// Committed-offset key for one (group, topic, partition)
pub(crate) fn offset_key(group: &str, topic: &str, partition: usize) -> String {
    format!("{}/{}/{}", group, topic, partition)
}

/// FNV-1a over the message key; all messages with one key share a partition
fn key_hash(key: &str) -> u64 {
    const FNV_OFFSET: u64 = 14695981039346656037;
    const FNV_PRIME: u64 = 1099511628211;
    let mut hash = FNV_OFFSET;
    for byte in key.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl MessageBus {
    /// Open (or recover) the bus at the given directory with a fixed
    /// partition count per topic. All well-known topics are created eagerly.
    pub fn open<P: AsRef<Path>>(path: P, partitions: usize) -> TagmineResult<Arc<Self>> {
        if partitions == 0 {
            return Err(TagmineError::Configuration(
                "bus partition count must be > 0".to_string(),
            ));
        }
        let db = sled::open(path).map_err(storage)?;
        let offsets = db.open_tree("offsets").map_err(storage)?;
        let bus = Arc::new(Self {
            db,
            partitions,
            topics: DashMap::new(),
            offsets,
        });
        for topic in topics::ALL {
            bus.topic(topic)?;
        }
        Ok(bus)
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    fn topic(&self, name: &str) -> TagmineResult<Arc<TopicLog>> {
        if let Some(log) = self.topics.get(name) {
            return Ok(log.clone());
        }
        let mut parts = Vec::with_capacity(self.partitions);
        for p in 0..self.partitions {
            parts.push(PartitionLog::open(&self.db, name, p)?);
        }
        let log = Arc::new(TopicLog { partitions: parts });
        Ok(self
            .topics
            .entry(name.to_string())
            .or_insert(log)
            .value()
            .clone())
    }

    pub fn partition_for_key(&self, key: &str) -> usize {
        (key_hash(key) % self.partitions as u64) as usize
    }

    /// Publish a JSON-encodable event keyed for partition colocation.
    /// Returns the (partition, offset) the record landed at.
    pub fn publish<T: serde::Serialize>(
        &self,
        topic: &str,
        key: &str,
        event: &T,
    ) -> TagmineResult<(usize, u64)> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| TagmineError::ContractViolation(format!("event encode failed: {}", e)))?;
        self.publish_raw(topic, key, payload)
    }

    /// Publish pre-encoded bytes (used by the DLQ path to preserve payloads)
    pub fn publish_raw(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> TagmineResult<(usize, u64)> {
        let log = self.topic(topic)?;
        let partition = self.partition_for_key(key);
        let offset = log.partitions[partition].append(StoredRecord {
            key: key.to_string(),
            payload,
            produced_at: chrono::Utc::now(),
        })?;
        Ok((partition, offset))
    }

    /// Wrap a poison record and append it to the DLQ topic
    pub fn route_to_dlq(&self, record: &Record, reason: &str) -> TagmineResult<()> {
        let envelope = DlqEnvelope::from_record(record, reason);
        tracing::warn!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            reason,
            "routing poison message to dlq"
        );
        self.publish(topics::DATAPOINTS_DLQ, &record.key, &envelope)?;
        Ok(())
    }

    pub(crate) fn fetch(
        &self,
        topic: &str,
        partition: usize,
        from: u64,
        max: usize,
    ) -> TagmineResult<Vec<Record>> {
        let log = self.topic(topic)?;
        let part = log
            .partitions
            .get(partition)
            .ok_or_else(|| TagmineError::NotFound(format!("partition {}", partition)))?;
        part.fetch(topic, partition, from, max)
    }

    pub fn end_offset(&self, topic: &str, partition: usize) -> TagmineResult<u64> {
        let log = self.topic(topic)?;
        let part = log
            .partitions
            .get(partition)
            .ok_or_else(|| TagmineError::NotFound(format!("partition {}", partition)))?;
        Ok(part.end_offset())
    }

    /// Next offset the group should read from; 0 when never committed
    pub fn committed_offset(
        &self,
        group: &str,
        topic: &str,
        partition: usize,
    ) -> TagmineResult<u64> {
        Ok(self
            .offsets
            .get(offset_key(group, topic, partition))
            .map_err(storage)?
            .map(|v| decode_offset(&v))
            .unwrap_or(0))
    }

    /// Record that everything below `next` was fully processed
    pub fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: usize,
        next: u64,
    ) -> TagmineResult<()> {
        self.offsets
            .insert(offset_key(group, topic, partition), &next.to_be_bytes())
            .map_err(storage)?;
        Ok(())
    }

    /// Build a consumer over an assigned partition subset
    pub fn consumer(
        &self,
        group: &str,
        topic: &str,
        assigned: Vec<usize>,
    ) -> TagmineResult<Consumer> {
        Consumer::new(self.topic(topic)?, self.offsets.clone(), group, topic, assigned)
    }

    /// Consumer assigned every partition of a topic
    pub fn consumer_all(&self, group: &str, topic: &str) -> TagmineResult<Consumer> {
        self.consumer(group, topic, (0..self.partitions).collect())
    }

    /// Force pending writes to disk (shutdown path)
    pub fn flush(&self) -> TagmineResult<()> {
        self.db.flush().map_err(storage)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_bus(partitions: usize) -> (Arc<MessageBus>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bus = MessageBus::open(dir.path(), partitions).unwrap();
        (bus, dir)
    }

    #[test]
    fn test_publish_assigns_sequential_offsets() {
        let (bus, _dir) = open_bus(1);
        let (_, o1) = bus.publish(topics::DATAPOINTS_RAW, "k", &1u32).unwrap();
        let (_, o2) = bus.publish(topics::DATAPOINTS_RAW, "k", &2u32).unwrap();
        assert_eq!(o1, 0);
        assert_eq!(o2, 1);
    }

    #[test]
    fn test_same_key_same_partition() {
        let (bus, _dir) = open_bus(8);
        let p1 = bus.partition_for_key("plant/chiller1/power");
        let p2 = bus.partition_for_key("plant/chiller1/power");
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_fetch_returns_in_order() {
        let (bus, _dir) = open_bus(1);
        for i in 0..10u32 {
            bus.publish(topics::POINTS_BEHAVIOR, "k", &i).unwrap();
        }
        let records = bus.fetch(topics::POINTS_BEHAVIOR, 0, 3, 4).unwrap();
        let values: Vec<u32> = records.iter().map(|r| r.decode().unwrap()).collect();
        assert_eq!(values, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let bus = MessageBus::open(dir.path(), 1).unwrap();
            bus.publish(topics::DATAPOINTS_RAW, "k", &"persisted").unwrap();
            bus.flush().unwrap();
        }
        let bus = MessageBus::open(dir.path(), 1).unwrap();
        // Appends continue after the recovered tail
        let (_, offset) = bus.publish(topics::DATAPOINTS_RAW, "k", &"next").unwrap();
        assert_eq!(offset, 1);
        let records = bus.fetch(topics::DATAPOINTS_RAW, 0, 0, 10).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_committed_offset_roundtrip() {
        let (bus, _dir) = open_bus(2);
        assert_eq!(bus.committed_offset("g", topics::DATAPOINTS_RAW, 0).unwrap(), 0);
        bus.commit_offset("g", topics::DATAPOINTS_RAW, 0, 5).unwrap();
        assert_eq!(bus.committed_offset("g", topics::DATAPOINTS_RAW, 0).unwrap(), 5);
        // Other partitions and groups are untouched
        assert_eq!(bus.committed_offset("g", topics::DATAPOINTS_RAW, 1).unwrap(), 0);
        assert_eq!(bus.committed_offset("h", topics::DATAPOINTS_RAW, 0).unwrap(), 0);
    }

    #[test]
    fn test_dlq_preserves_payload() {
        let (bus, _dir) = open_bus(1);
        let record = Record {
            topic: topics::DATAPOINTS_RAW.to_string(),
            partition: 0,
            offset: 9,
            key: "bad".to_string(),
            payload: b"\xff\xfe not json".to_vec(),
            produced_at: chrono::Utc::now(),
        };
        bus.route_to_dlq(&record, "undecodable").unwrap();
        let dlq = bus.fetch(topics::DATAPOINTS_DLQ, bus.partition_for_key("bad"), 0, 10).unwrap();
        assert_eq!(dlq.len(), 1);
        let envelope: DlqEnvelope = dlq[0].decode().unwrap();
        assert_eq!(envelope.payload, record.payload);
        assert_eq!(envelope.original_offset, 9);
    }

    #[test]
    fn test_cold_fetch_beyond_tail() {
        let (bus, _dir) = open_bus(1);
        // Overflow the in-memory tail so early offsets only exist in sled
        for i in 0..(TAIL_CAPACITY as u32 + 50) {
            bus.publish(topics::DATAPOINTS_RAW, "k", &i).unwrap();
        }
        let records = bus.fetch(topics::DATAPOINTS_RAW, 0, 0, 2).unwrap();
        let values: Vec<u32> = records.iter().map(|r| r.decode().unwrap()).collect();
        assert_eq!(values, vec![0, 1]);
    }
}
