use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;

use trinetra_types::{CameraId, Frame, FrameMeta};

use crate::{record_tail_drop, BusEntry, EntryId, FrameBus, Result};

/// In-process implementation of the frame bus contract.
///
/// Used by tests and single-host deployments. Semantics mirror the Redis
/// backend: approximate-cap tail-drop (exact here), consumer groups with
/// pending lists, idle-based reclaim. A pending entry keeps its payload even
/// after the stream trims it, so reclaim after a crash still yields data —
/// the same observable behavior as a Redis pending-entries list read before
/// the trim catches up.
#[derive(Clone)]
pub struct MemoryFrameBus {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    maxlen: usize,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    checkpoints: HashMap<String, Vec<u8>>,
    dropped: HashMap<String, u64>,
}

#[derive(Default)]
struct StreamState {
    entries: VecDeque<Stored>,
    next_id: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Clone)]
struct Stored {
    id: EntryId,
    meta: FrameMeta,
    jpeg: bytes::Bytes,
}

#[derive(Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    stored: Stored,
}

impl MemoryFrameBus {
    pub fn new(maxlen: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            notify: Arc::new(Notify::new()),
            maxlen,
        }
    }

    /// Tail-drop count for one camera. Test and debugging aid; production
    /// observability goes through the `frames_dropped` counter.
    pub fn dropped(&self, camera_id: &CameraId) -> u64 {
        self.inner
            .lock()
            .dropped
            .get(camera_id.as_str())
            .copied()
            .unwrap_or(0)
    }

    fn try_consume(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
    ) -> Vec<BusEntry> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        // Round-robin across streams, one entry per stream per pass, so a
        // busy camera cannot starve the others out of a batch.
        loop {
            let before = out.len();
            for stream in streams {
                if out.len() >= count {
                    break;
                }
                let Some(state) = inner.streams.get_mut(stream) else {
                    continue;
                };
                let gs = state.groups.entry(group.to_string()).or_default();
                let next = state
                    .entries
                    .iter()
                    .find(|e| e.id > gs.last_delivered)
                    .cloned();
                if let Some(stored) = next {
                    gs.last_delivered = stored.id;
                    gs.pending.insert(
                        stored.id,
                        PendingEntry {
                            consumer: consumer.to_string(),
                            delivered_at: Instant::now(),
                            stored: stored.clone(),
                        },
                    );
                    out.push(BusEntry {
                        stream: stream.clone(),
                        id: stored.id,
                        meta: stored.meta,
                        jpeg: stored.jpeg,
                    });
                }
            }
            if out.len() >= count || out.len() == before {
                return out;
            }
        }
    }
}

#[async_trait::async_trait]
impl FrameBus for MemoryFrameBus {
    async fn publish(&self, frame: &Frame) -> Result<EntryId> {
        let stream = frame.meta.camera_id.frame_stream_key();
        let mut inner = self.inner.lock();
        let state = inner.streams.entry(stream).or_default();
        state.next_id += 1;
        let id = EntryId::new(state.next_id, 0);
        state.entries.push_back(Stored {
            id,
            meta: frame.meta.clone(),
            jpeg: frame.jpeg.clone(),
        });
        let mut trimmed = 0u64;
        while state.entries.len() > self.maxlen {
            state.entries.pop_front();
            trimmed += 1;
        }
        if trimmed > 0 {
            let cam = frame.meta.camera_id.as_str().to_string();
            *inner.dropped.entry(cam.clone()).or_default() += trimmed;
            record_tail_drop(&cam, trimmed);
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn consume(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<BusEntry>> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(block_ms);
        loop {
            // Register interest before checking state so a publish between
            // the check and the await cannot be missed.
            let notified = self.notify.notified();
            let got = self.try_consume(group, consumer, streams, count);
            if !got.is_empty() {
                return Ok(got);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    async fn ack(&self, group: &str, stream: &str, ids: &[EntryId]) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.streams.get_mut(stream) {
            if let Some(gs) = state.groups.get_mut(group) {
                for id in ids {
                    gs.pending.remove(id);
                }
            }
        }
        Ok(())
    }

    async fn reclaim(
        &self,
        group: &str,
        consumer: &str,
        stream: &str,
        idle_ms: u64,
    ) -> Result<Vec<BusEntry>> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        if let Some(state) = inner.streams.get_mut(stream) {
            if let Some(gs) = state.groups.get_mut(group) {
                let idle = std::time::Duration::from_millis(idle_ms);
                for pending in gs.pending.values_mut() {
                    if pending.delivered_at.elapsed() >= idle {
                        pending.consumer = consumer.to_string();
                        pending.delivered_at = Instant::now();
                        out.push(BusEntry {
                            stream: stream.to_string(),
                            id: pending.stored.id,
                            meta: pending.stored.meta.clone(),
                            jpeg: pending.stored.jpeg.clone(),
                        });
                    }
                }
            }
        }
        Ok(out)
    }

    async fn length(&self, camera_id: &CameraId) -> Result<usize> {
        Ok(self
            .inner
            .lock()
            .streams
            .get(&camera_id.frame_stream_key())
            .map(|s| s.entries.len())
            .unwrap_or(0))
    }

    fn maxlen(&self) -> usize {
        self.maxlen
    }

    async fn store_checkpoint(&self, key: &str, blob: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .checkpoints
            .insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    async fn load_checkpoint(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().checkpoints.get(key).cloned())
    }
}
