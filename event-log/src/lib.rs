//! Durable, partitioned, at-least-once event delivery between services.
//!
//! Detection, identity and alert events travel on keyed topics: per-key
//! ordering comes from partitioning (`camera_id` for detections,
//! `customer_id` for identities, alert kind for alerts), and consumer groups
//! with *manual* offset commit give the resolver its replay discipline.
//! The Kafka backend is the production one; the in-memory backend exists for
//! tests and exercises the same commit/lag semantics.
//!
//! Topic provisioning (partition counts, retention >= 24h) is an operational
//! concern; this crate only records the expected layout in
//! [trinetra_types]'s topic constants.

use std::time::Duration;

mod kafka;
mod memory;

pub use kafka::{KafkaConsumer, KafkaProducer};
pub use memory::{MemoryConsumer, MemoryEventLog, MemoryProducer};

#[derive(thiserror::Error, Debug)]
pub enum EventLogError {
    #[error("event log unavailable: {0}")]
    Unavailable(String),
    #[error("publish to \"{topic}\" failed after {attempts} attempts: {last}")]
    PublishExhausted {
        topic: String,
        attempts: u32,
        last: String,
    },
    #[error("{source}")]
    Kafka {
        #[from]
        source: rdkafka::error::KafkaError,
    },
}

pub type Result<T> = std::result::Result<T, EventLogError>;

/// A record as consumed from the log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Keyed producer with acknowledged writes.
#[async_trait::async_trait]
pub trait EventProducer: Send + Sync {
    /// Publish one record, awaiting the broker acknowledgement.
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()>;
}

/// Group consumer with manual offset commit.
///
/// `poll` delivers records in partition order without advancing the
/// committed offset; a record only stops being redelivered after a restart
/// once `commit` has been called for it (or a later record of the same
/// partition).
#[async_trait::async_trait]
pub trait EventConsumer: Send + Sync {
    /// Await the next record for up to `block_ms`. `None` on timeout.
    async fn poll(&self, block_ms: u64) -> Result<Option<LogRecord>>;

    /// Mark everything up to and including `record` as processed.
    async fn commit(&self, record: &LogRecord) -> Result<()>;

    /// Total records between the committed offsets and the log tail, when
    /// the backend can compute it.
    async fn lag(&self) -> Result<Option<u64>>;
}

/// Publish with bounded exponential-backoff retries: 100ms, 200ms, 400ms...
/// capped at 5s between attempts. Returns [EventLogError::PublishExhausted]
/// once `max_attempts` have failed; the caller decides whether that is
/// accepted loss (worker) or fatal (resolver).
pub async fn publish_with_retry(
    producer: &dyn EventProducer,
    topic: &str,
    key: &str,
    payload: &[u8],
    max_attempts: u32,
) -> Result<()> {
    let mut backoff = Duration::from_millis(100);
    let mut last = String::new();
    for attempt in 1..=max_attempts {
        match producer.publish(topic, key, payload).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(topic, attempt, error = %e, "event publish failed");
                metrics::counter!("publish_errors", "topic" => topic.to_string()).increment(1);
                last = e.to_string();
            }
        }
        if attempt < max_attempts {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
    }
    Err(EventLogError::PublishExhausted {
        topic: topic.to_string(),
        attempts: max_attempts,
        last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProducer {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl EventProducer for FlakyProducer {
        async fn publish(&self, _topic: &str, _key: &str, _payload: &[u8]) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(EventLogError::Unavailable("broker down".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_transient_failures() {
        let p = FlakyProducer {
            fail_first: 2,
            calls: AtomicU32::new(0),
        };
        publish_with_retry(&p, "detections", "cam_01", b"{}", 5)
            .await
            .unwrap();
        assert_eq!(p.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhausts_and_reports() {
        let p = FlakyProducer {
            fail_first: u32::MAX,
            calls: AtomicU32::new(0),
        };
        match publish_with_retry(&p, "detections", "cam_01", b"{}", 3).await {
            Err(EventLogError::PublishExhausted {
                topic, attempts, ..
            }) => {
                assert_eq!(topic, "detections");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(p.calls.load(Ordering::SeqCst), 3);
    }
}
