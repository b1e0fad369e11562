use std::time::{Duration, Instant};

use frame_bus::BusEntry;

/// Micro-batch assembly: flush at `capacity` frames or `timeout` from the
/// first accumulated frame, whichever fires first. Balances GPU efficiency
/// against per-frame latency.
pub struct MicroBatchAccumulator {
    capacity: usize,
    timeout: Duration,
    items: Vec<BusEntry>,
    started: Option<Instant>,
}

impl MicroBatchAccumulator {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            timeout,
            items: Vec::new(),
            started: None,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Room left before a size flush.
    pub fn remaining(&self) -> usize {
        self.capacity - self.items.len()
    }

    /// Add entries; returns a full batch if the size cap was reached.
    pub fn push(&mut self, entries: Vec<BusEntry>) -> Option<Vec<BusEntry>> {
        if self.items.is_empty() && !entries.is_empty() {
            self.started = Some(Instant::now());
        }
        self.items.extend(entries);
        if self.items.len() >= self.capacity {
            Some(self.flush())
        } else {
            None
        }
    }

    /// The partial batch, if its timeout has elapsed.
    pub fn take_if_expired(&mut self) -> Option<Vec<BusEntry>> {
        match self.started {
            Some(started) if started.elapsed() >= self.timeout && !self.items.is_empty() => {
                Some(self.flush())
            }
            _ => None,
        }
    }

    pub fn flush(&mut self) -> Vec<BusEntry> {
        self.started = None;
        std::mem::take(&mut self.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trinetra_types::{CameraId, FrameIndex, FrameMeta, Timestamp};

    fn entry(index: u64) -> BusEntry {
        BusEntry {
            stream: "frames:cam_01".into(),
            id: frame_bus::EntryId::new(index + 1, 0),
            meta: FrameMeta {
                camera_id: CameraId::new("cam_01"),
                frame_index: FrameIndex(index),
                ingest_ts: Timestamp::from_f64(0.0),
                frame_ts: None,
            },
            jpeg: bytes::Bytes::new(),
        }
    }

    #[test]
    fn flushes_on_size() {
        let mut acc = MicroBatchAccumulator::new(4, Duration::from_millis(20));
        assert!(acc.push(vec![entry(0), entry(1)]).is_none());
        let batch = acc.push(vec![entry(2), entry(3)]).expect("size flush");
        assert_eq!(batch.len(), 4);
        assert!(acc.is_empty());
    }

    #[test]
    fn flushes_on_timeout() {
        let mut acc = MicroBatchAccumulator::new(4, Duration::from_millis(0));
        acc.push(vec![entry(0)]);
        let batch = acc.take_if_expired().expect("timeout flush");
        assert_eq!(batch.len(), 1);
        assert!(acc.take_if_expired().is_none());
    }

    #[test]
    fn empty_accumulator_never_expires() {
        let mut acc = MicroBatchAccumulator::new(4, Duration::from_millis(0));
        assert!(acc.take_if_expired().is_none());
    }

    #[test]
    fn timeout_counts_from_first_frame() {
        let mut acc = MicroBatchAccumulator::new(8, Duration::from_millis(50));
        acc.push(vec![entry(0)]);
        // Fresh accumulation: not yet expired.
        assert!(acc.take_if_expired().is_none());
    }
}
