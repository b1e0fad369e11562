//! Bounded, ordered, group-consumable per-camera frame streams.
//!
//! Each camera owns a distinct stream keyed `frames:{camera_id}` with an
//! approximate length cap: when a publish would exceed the cap, the oldest
//! entries are silently discarded (recency wins over completeness). Within a
//! consumer group each entry is delivered to exactly one consumer and stays
//! claimable until acknowledged, which is the crash-recovery primitive the
//! inference workers rely on.
//!
//! Two backends implement the contract: [MemoryFrameBus] for tests and
//! single-process deployments, and [RedisFrameBus] over Redis Streams
//! (XADD/XREADGROUP/XACK/XPENDING/XCLAIM).

use bytes::Bytes;

use trinetra_types::{CameraId, Frame, FrameMeta};

mod memory;
mod redis_bus;

pub use memory::MemoryFrameBus;
pub use redis_bus::RedisFrameBus;

#[derive(thiserror::Error, Debug)]
pub enum FrameBusError {
    #[error("frame bus backing store unavailable: {0}")]
    Unavailable(String),
    #[error("malformed entry id \"{0}\"")]
    MalformedEntryId(String),
    #[error("malformed entry payload: {0}")]
    MalformedEntry(String),
    #[error("{source}")]
    Redis {
        #[from]
        source: redis::RedisError,
    },
}

pub type Result<T> = std::result::Result<T, FrameBusError>;

/// Bus-assigned entry id, monotonically increasing per stream. Mirrors the
/// Redis stream id shape `<ms>-<seq>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub fn new(ms: u64, seq: u64) -> Self {
        EntryId { ms, seq }
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl std::str::FromStr for EntryId {
    type Err = FrameBusError;
    fn from_str(s: &str) -> Result<Self> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| FrameBusError::MalformedEntryId(s.to_string()))?;
        Ok(EntryId {
            ms: ms
                .parse()
                .map_err(|_| FrameBusError::MalformedEntryId(s.to_string()))?,
            seq: seq
                .parse()
                .map_err(|_| FrameBusError::MalformedEntryId(s.to_string()))?,
        })
    }
}

/// One frame as delivered to a consumer.
#[derive(Debug, Clone)]
pub struct BusEntry {
    /// Stream the entry came from, `frames:{camera_id}`.
    pub stream: String,
    pub id: EntryId,
    pub meta: FrameMeta,
    pub jpeg: Bytes,
}

impl BusEntry {
    pub fn camera_id(&self) -> &CameraId {
        &self.meta.camera_id
    }
}

/// The per-camera bounded stream contract.
///
/// Guarantees: per-stream FIFO; within a consumer group each entry is
/// processed by at most one consumer to completion (at-least-once if a
/// consumer crashes before ack); across groups entries are broadcast
/// independently. No durability across restarts of the bus itself.
#[async_trait::async_trait]
pub trait FrameBus: Send + Sync {
    /// Append a frame to its camera stream. O(1) amortized, never blocks for
    /// capacity: the oldest entries are trimmed to stay under the cap. On a
    /// backing-store failure the frame is dropped, the per-camera drop
    /// counter is incremented and the error is returned.
    async fn publish(&self, frame: &Frame) -> Result<EntryId>;

    /// Read at most `count` entries across `streams` on behalf of
    /// `(group, consumer)`, blocking up to `block_ms` for at least one entry.
    /// Entries are distributed within the group so each is delivered to
    /// exactly one member.
    async fn consume(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<BusEntry>>;

    /// Mark entries processed. Unacked entries remain claimable.
    async fn ack(&self, group: &str, stream: &str, ids: &[EntryId]) -> Result<()>;

    /// Reassign entries of `stream` whose owner has been idle at least
    /// `idle_ms` to `consumer`, returning them for processing.
    async fn reclaim(
        &self,
        group: &str,
        consumer: &str,
        stream: &str,
        idle_ms: u64,
    ) -> Result<Vec<BusEntry>>;

    async fn length(&self, camera_id: &CameraId) -> Result<usize>;

    async fn fill_ratio(&self, camera_id: &CameraId) -> Result<f64> {
        Ok(self.length(camera_id).await? as f64 / self.maxlen() as f64)
    }

    /// Configured per-stream cap.
    fn maxlen(&self) -> usize;

    /// Small-blob checkpoint facet, used for tracker state keyed
    /// `tracker:{camera_id}`. Checkpoints share the bus's availability, not
    /// its retention: they are plain keys, not stream entries.
    async fn store_checkpoint(&self, key: &str, blob: &[u8]) -> Result<()>;
    async fn load_checkpoint(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

pub(crate) fn record_tail_drop(camera_id: &str, n: u64) {
    metrics::counter!("frames_dropped", "camera_id" => camera_id.to_string(), "reason" => "tail_drop")
        .increment(n);
}

pub(crate) fn record_publish_drop(camera_id: &str) {
    metrics::counter!("frames_dropped", "camera_id" => camera_id.to_string(), "reason" => "publish_error")
        .increment(1);
}
