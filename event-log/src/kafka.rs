use std::time::Duration;

use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};

use crate::{EventConsumer, EventProducer, LogRecord, Result};

/// Broker acknowledgement deadline for one produced record.
const PRODUCER_ACK_TIMEOUT: Timeout = Timeout::After(Duration::from_secs(2));

/// Keyed producer over rdkafka's [FutureProducer].
#[derive(Clone)]
pub struct KafkaProducer {
    inner: FutureProducer,
}

impl KafkaProducer {
    pub fn connect(bootstrap: &str) -> Result<Self> {
        let inner: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap)
            .set("message.timeout.ms", "2000")
            .create()?;
        Ok(Self { inner })
    }
}

#[async_trait::async_trait]
impl EventProducer for KafkaProducer {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        self.inner
            .send(record, PRODUCER_ACK_TIMEOUT)
            .await
            .map_err(|(e, _msg)| e)?;
        Ok(())
    }
}

/// Group consumer over rdkafka's [StreamConsumer] with auto-commit disabled:
/// offsets only advance through [EventConsumer::commit], which is what lets
/// the resolver replay detections after an ANN outage.
pub struct KafkaConsumer {
    inner: StreamConsumer,
}

impl KafkaConsumer {
    pub fn connect(bootstrap: &str, group: &str, topics: &[&str]) -> Result<Self> {
        let inner: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .create()?;
        inner.subscribe(topics)?;
        Ok(Self { inner })
    }
}

#[async_trait::async_trait]
impl EventConsumer for KafkaConsumer {
    async fn poll(&self, block_ms: u64) -> Result<Option<LogRecord>> {
        match tokio::time::timeout(Duration::from_millis(block_ms), self.inner.recv()).await {
            Err(_elapsed) => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(msg)) => Ok(Some(LogRecord {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg
                    .key()
                    .map(|k| String::from_utf8_lossy(k).into_owned()),
                payload: msg.payload().unwrap_or_default().to_vec(),
            })),
        }
    }

    async fn commit(&self, record: &LogRecord) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &record.topic,
            record.partition,
            Offset::Offset(record.offset + 1),
        )?;
        self.inner.commit(&tpl, CommitMode::Async)?;
        Ok(())
    }

    async fn lag(&self) -> Result<Option<u64>> {
        // Watermark and committed-offset fetches are synchronous librdkafka
        // calls; keep them off the async worker threads.
        let assignment = self.inner.assignment()?;
        let committed = tokio::task::block_in_place(|| {
            self.inner
                .committed(Timeout::After(Duration::from_millis(500)))
        })?;
        let mut lag: u64 = 0;
        for elem in assignment.elements() {
            let (_, high) = tokio::task::block_in_place(|| {
                self.inner.fetch_watermarks(
                    elem.topic(),
                    elem.partition(),
                    Timeout::After(Duration::from_millis(500)),
                )
            })?;
            let committed_offset = committed
                .find_partition(elem.topic(), elem.partition())
                .and_then(|p| p.offset().to_raw())
                .unwrap_or(0);
            lag += (high - committed_offset).max(0) as u64;
        }
        Ok(Some(lag))
    }
}
