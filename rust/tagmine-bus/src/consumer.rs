//! Consumer-group reads with explicit offset management
//!
//! A consumer tracks an uncommitted read position per assigned partition.
//! `poll` advances positions; `commit` persists them. After a crash or an
//! explicit `rewind`, reading restarts at the last committed offset, which
//! gives at-least-once delivery.

use crate::bus::{decode_offset, offset_key, TopicLog};
use crate::record::Record;
use std::collections::HashMap;
use std::sync::Arc;
use tagmine_core::{TagmineError, TagmineResult};

fn storage(e: sled::Error) -> TagmineError {
    TagmineError::Storage(e.to_string())
}

pub struct Consumer {
    log: Arc<TopicLog>,
    offsets: sled::Tree,
    group: String,
    topic: String,
    assigned: Vec<usize>,
    /// Next offset to read per partition (may be ahead of the commit)
    positions: HashMap<usize, u64>,
    /// Round-robin start index so one busy partition cannot starve the rest
    cursor: usize,
}

impl Consumer {
    pub(crate) fn new(
        log: Arc<TopicLog>,
        offsets: sled::Tree,
        group: &str,
        topic: &str,
        assigned: Vec<usize>,
    ) -> TagmineResult<Self> {
        for &p in &assigned {
            if p >= log.partitions.len() {
                return Err(TagmineError::NotFound(format!(
                    "partition {} of topic {}",
                    p, topic
                )));
            }
        }
        let mut consumer = Self {
            log,
            offsets,
            group: group.to_string(),
            topic: topic.to_string(),
            assigned,
            positions: HashMap::new(),
            cursor: 0,
        };
        consumer.rewind()?;
        Ok(consumer)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn assigned(&self) -> &[usize] {
        &self.assigned
    }

    fn committed(&self, partition: usize) -> TagmineResult<u64> {
        Ok(self
            .offsets
            .get(offset_key(&self.group, &self.topic, partition))
            .map_err(storage)?
            .map(|v| decode_offset(&v))
            .unwrap_or(0))
    }

    /// Read up to `max` records across assigned partitions, in partition
    /// order within each partition. Advances the uncommitted positions.
    pub fn poll(&mut self, max: usize) -> TagmineResult<Vec<Record>> {
        let mut records = Vec::new();
        let n = self.assigned.len();
        for i in 0..n {
            if records.len() >= max {
                break;
            }
            let partition = self.assigned[(self.cursor + i) % n];
            let position = self.positions[&partition];
            let batch = self.log.partitions[partition].fetch(
                &self.topic,
                partition,
                position,
                max - records.len(),
            )?;
            if let Some(last) = batch.last() {
                self.positions.insert(partition, last.offset + 1);
            }
            records.extend(batch);
        }
        if n > 0 {
            self.cursor = (self.cursor + 1) % n;
        }
        Ok(records)
    }

    /// Commit through a processed record: everything at or below its offset
    /// counts as done. Call only after side-effects succeeded.
    pub fn commit(&self, record: &Record) -> TagmineResult<()> {
        self.offsets
            .insert(
                offset_key(&self.group, &self.topic, record.partition),
                &(record.offset + 1).to_be_bytes(),
            )
            .map_err(storage)?;
        Ok(())
    }

    /// Forget uncommitted progress and restart from the committed offsets.
    /// Used when processing failed mid-batch and must be retried.
    pub fn rewind(&mut self) -> TagmineResult<()> {
        for i in 0..self.assigned.len() {
            let partition = self.assigned[i];
            let committed = self.committed(partition)?;
            self.positions.insert(partition, committed);
        }
        Ok(())
    }

    /// Unread records across assigned partitions
    pub fn lag(&self) -> TagmineResult<u64> {
        let mut lag = 0;
        for &p in &self.assigned {
            let end = self.log.partitions[p].end_offset();
            lag += end.saturating_sub(self.positions[&p]);
        }
        Ok(lag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::topics;

    fn open_bus() -> (Arc<MessageBus>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bus = MessageBus::open(dir.path(), 2).unwrap();
        (bus, dir)
    }

    #[test]
    fn test_poll_advances_and_drains() {
        let (bus, _dir) = open_bus();
        for i in 0..6u32 {
            bus.publish(topics::POINTS_BEHAVIOR, &format!("key{}", i), &i)
                .unwrap();
        }
        let mut consumer = bus.consumer_all("g", topics::POINTS_BEHAVIOR).unwrap();
        let first = consumer.poll(100).unwrap();
        assert_eq!(first.len(), 6);
        // Position advanced: nothing more to read
        assert!(consumer.poll(100).unwrap().is_empty());
        assert_eq!(consumer.lag().unwrap(), 0);
    }

    #[test]
    fn test_uncommitted_records_redelivered_after_rewind() {
        let (bus, _dir) = open_bus();
        bus.publish(topics::DATAPOINTS_RAW, "k", &"payload").unwrap();

        let mut consumer = bus.consumer_all("g", topics::DATAPOINTS_RAW).unwrap();
        let records = consumer.poll(10).unwrap();
        assert_eq!(records.len(), 1);

        // No commit happened: a rewind sees the record again
        consumer.rewind().unwrap();
        let again = consumer.poll(10).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].offset, records[0].offset);
    }

    #[test]
    fn test_commit_is_durable_per_group() {
        let (bus, _dir) = open_bus();
        bus.publish(topics::DATAPOINTS_RAW, "k", &"one").unwrap();

        let mut consumer = bus.consumer_all("g", topics::DATAPOINTS_RAW).unwrap();
        let records = consumer.poll(10).unwrap();
        consumer.commit(&records[0]).unwrap();

        // A fresh consumer of the same group starts after the commit
        let mut fresh = bus.consumer_all("g", topics::DATAPOINTS_RAW).unwrap();
        assert!(fresh.poll(10).unwrap().is_empty());

        // A different group replays from the beginning
        let mut other = bus.consumer_all("other", topics::DATAPOINTS_RAW).unwrap();
        assert_eq!(other.poll(10).unwrap().len(), 1);
    }

    #[test]
    fn test_partition_subset_assignment() {
        let (bus, _dir) = open_bus();
        // Land records across both partitions
        for i in 0..32u32 {
            bus.publish(topics::DATAPOINTS_RAW, &format!("key{}", i), &i)
                .unwrap();
        }
        let total: u64 = (0..2)
            .map(|p| bus.end_offset(topics::DATAPOINTS_RAW, p).unwrap())
            .sum();
        assert_eq!(total, 32);

        let mut only_zero = bus.consumer("g", topics::DATAPOINTS_RAW, vec![0]).unwrap();
        let records = only_zero.poll(100).unwrap();
        assert!(records.iter().all(|r| r.partition == 0));
        let expected = bus.end_offset(topics::DATAPOINTS_RAW, 0).unwrap();
        assert_eq!(records.len() as u64, expected);
    }

    #[test]
    fn test_unknown_partition_rejected() {
        let (bus, _dir) = open_bus();
        assert!(bus.consumer("g", topics::DATAPOINTS_RAW, vec![7]).is_err());
    }
}
