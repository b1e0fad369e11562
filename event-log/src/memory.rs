use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{EventConsumer, EventLogError, EventProducer, LogRecord, Result};

/// In-process event log for tests and single-host runs.
///
/// Records are kept per topic per partition; consumer groups share a read
/// cursor (so two members split records) plus a committed offset per
/// partition. [MemoryConsumer::reset_to_committed] simulates a restart or a
/// rebalance: the cursor snaps back to the committed offsets and everything
/// uncommitted is redelivered, which is exactly the at-least-once behavior
/// the resolver's manual-commit discipline relies on.
#[derive(Clone)]
pub struct MemoryEventLog {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct Inner {
    topics: HashMap<String, Topic>,
    groups: HashMap<String, GroupState>,
}

struct Topic {
    partitions: Vec<Vec<StoredRecord>>,
}

struct StoredRecord {
    key: Option<String>,
    payload: Vec<u8>,
}

#[derive(Default)]
struct GroupState {
    /// (topic, partition) -> next offset to deliver.
    cursors: HashMap<(String, i32), i64>,
    /// (topic, partition) -> first uncommitted offset.
    committed: HashMap<(String, i32), i64>,
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventLog {
    pub fn new() -> Self {
        let log = Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            notify: Arc::new(Notify::new()),
        };
        // The standard TRINETRA layout.
        log.create_topic(
            trinetra_types::DETECTIONS_TOPIC,
            trinetra_types::DETECTIONS_PARTITIONS,
        );
        log.create_topic(
            trinetra_types::IDENTITIES_TOPIC,
            trinetra_types::IDENTITIES_PARTITIONS,
        );
        log.create_topic(
            trinetra_types::ALERTS_TOPIC,
            trinetra_types::ALERTS_PARTITIONS,
        );
        log
    }

    pub fn create_topic(&self, name: &str, partitions: i32) {
        let mut inner = self.inner.lock();
        inner.topics.entry(name.to_string()).or_insert_with(|| Topic {
            partitions: (0..partitions).map(|_| Vec::new()).collect(),
        });
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer { log: self.clone() }
    }

    pub fn consumer(&self, group: &str, topics: &[&str]) -> MemoryConsumer {
        MemoryConsumer {
            log: self.clone(),
            group: group.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// All payloads currently on a topic, in partition-then-offset order.
    /// Test helper.
    pub fn drain_payloads(&self, topic: &str) -> Vec<Vec<u8>> {
        let inner = self.inner.lock();
        let Some(t) = inner.topics.get(topic) else {
            return Vec::new();
        };
        t.partitions
            .iter()
            .flat_map(|p| p.iter().map(|r| r.payload.clone()))
            .collect()
    }

    /// Number of records on a topic. Test helper.
    pub fn topic_len(&self, topic: &str) -> usize {
        let inner = self.inner.lock();
        inner
            .topics
            .get(topic)
            .map(|t| t.partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

fn partition_for(key: &str, partitions: usize) -> i32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as i32
}

#[derive(Clone)]
pub struct MemoryProducer {
    log: MemoryEventLog,
}

#[async_trait::async_trait]
impl EventProducer for MemoryProducer {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        {
            let mut inner = self.log.inner.lock();
            let t = inner
                .topics
                .get_mut(topic)
                .ok_or_else(|| EventLogError::Unavailable(format!("no topic \"{topic}\"")))?;
            let partition = partition_for(key, t.partitions.len());
            t.partitions[partition as usize].push(StoredRecord {
                key: Some(key.to_string()),
                payload: payload.to_vec(),
            });
        }
        self.log.notify.notify_waiters();
        Ok(())
    }
}

pub struct MemoryConsumer {
    log: MemoryEventLog,
    group: String,
    topics: Vec<String>,
}

impl MemoryConsumer {
    /// Snap the group's read cursor back to the committed offsets, as a
    /// restarted consumer would.
    pub fn reset_to_committed(&self) {
        let mut inner = self.log.inner.lock();
        let group = inner.groups.entry(self.group.clone()).or_default();
        let committed = group.committed.clone();
        for (tp, cursor) in group.cursors.iter_mut() {
            *cursor = committed.get(tp).copied().unwrap_or(0);
        }
    }

    fn try_poll(&self) -> Option<LogRecord> {
        let mut inner = self.log.inner.lock();
        let Inner { topics, groups } = &mut *inner;
        let group = groups.entry(self.group.clone()).or_default();
        for topic_name in &self.topics {
            let Some(topic) = topics.get(topic_name) else {
                continue;
            };
            for (p, records) in topic.partitions.iter().enumerate() {
                let tp = (topic_name.clone(), p as i32);
                let cursor = group.cursors.entry(tp.clone()).or_insert(0);
                if (*cursor as usize) < records.len() {
                    let offset = *cursor;
                    *cursor += 1;
                    let stored = &records[offset as usize];
                    return Some(LogRecord {
                        topic: topic_name.clone(),
                        partition: p as i32,
                        offset,
                        key: stored.key.clone(),
                        payload: stored.payload.clone(),
                    });
                }
            }
        }
        None
    }
}

#[async_trait::async_trait]
impl EventConsumer for MemoryConsumer {
    async fn poll(&self, block_ms: u64) -> Result<Option<LogRecord>> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(block_ms);
        loop {
            let notified = self.log.notify.notified();
            if let Some(record) = self.try_poll() {
                return Ok(Some(record));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    async fn commit(&self, record: &LogRecord) -> Result<()> {
        let mut inner = self.log.inner.lock();
        let group = inner.groups.entry(self.group.clone()).or_default();
        let tp = (record.topic.clone(), record.partition);
        let committed = group.committed.entry(tp).or_insert(0);
        *committed = (*committed).max(record.offset + 1);
        Ok(())
    }

    async fn lag(&self) -> Result<Option<u64>> {
        let mut inner = self.log.inner.lock();
        let Inner { topics, groups } = &mut *inner;
        let group = groups.entry(self.group.clone()).or_default();
        let mut lag = 0u64;
        for topic_name in &self.topics {
            let Some(topic) = topics.get(topic_name) else {
                continue;
            };
            for (p, records) in topic.partitions.iter().enumerate() {
                let committed = group
                    .committed
                    .get(&(topic_name.clone(), p as i32))
                    .copied()
                    .unwrap_or(0);
                lag += records.len() as u64 - committed.min(records.len() as i64) as u64;
            }
        }
        Ok(Some(lag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventConsumer;

    #[tokio::test]
    async fn same_key_preserves_order() {
        let log = MemoryEventLog::new();
        let producer = log.producer();
        for i in 0..5u8 {
            producer
                .publish("detections", "cam_01", &[i])
                .await
                .unwrap();
        }
        let consumer = log.consumer("resolvers", &["detections"]);
        let mut seen = Vec::new();
        while let Some(r) = consumer.poll(0).await.unwrap() {
            seen.push(r.payload[0]);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn uncommitted_records_redeliver_after_reset() {
        let log = MemoryEventLog::new();
        let producer = log.producer();
        for i in 0..4u8 {
            producer
                .publish("detections", "cam_01", &[i])
                .await
                .unwrap();
        }
        let consumer = log.consumer("resolvers", &["detections"]);
        let first = consumer.poll(0).await.unwrap().unwrap();
        let second = consumer.poll(0).await.unwrap().unwrap();
        consumer.commit(&first).await.unwrap();
        drop(second); // read but never committed

        consumer.reset_to_committed();
        let redelivered = consumer.poll(0).await.unwrap().unwrap();
        assert_eq!(redelivered.payload, vec![1]);
    }

    #[tokio::test]
    async fn lag_tracks_committed_offsets() {
        let log = MemoryEventLog::new();
        let producer = log.producer();
        for i in 0..10u8 {
            producer
                .publish("detections", "cam_01", &[i])
                .await
                .unwrap();
        }
        let consumer = log.consumer("resolvers", &["detections"]);
        assert_eq!(consumer.lag().await.unwrap(), Some(10));
        for _ in 0..6 {
            let r = consumer.poll(0).await.unwrap().unwrap();
            consumer.commit(&r).await.unwrap();
        }
        assert_eq!(consumer.lag().await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn distinct_groups_both_see_all_records() {
        let log = MemoryEventLog::new();
        let producer = log.producer();
        producer.publish("alerts", "VIP_DETECTED", b"a").await.unwrap();
        let g1 = log.consumer("dashboard", &["alerts"]);
        let g2 = log.consumer("pager", &["alerts"]);
        assert!(g1.poll(0).await.unwrap().is_some());
        assert!(g2.poll(0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_topic_errors_on_publish() {
        let log = MemoryEventLog::new();
        let producer = log.producer();
        assert!(matches!(
            producer.publish("nope", "k", b"x").await,
            Err(EventLogError::Unavailable(_))
        ));
    }
}
