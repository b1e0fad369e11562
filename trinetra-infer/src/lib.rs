//! Inference worker: the only GPU-bearing component of the core.
//!
//! Consumes frames from every camera stream fairly, assembles micro-batches,
//! invokes the detector and embedder operators, maintains per-camera tracker
//! state and publishes exactly one DetectionEvent per input frame, keyed by
//! camera so per-camera order survives into the event log. Horizontal
//! scaling is by running more worker processes in the same consumer group.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use tokio::sync::watch;

use event_log::{publish_with_retry, EventProducer};
use frame_bus::{BusEntry, EntryId, FrameBus};
use trinetra_types::{CameraId, Detection, DetectionEvent, Embedding, DETECTIONS_TOPIC};

mod batch;
mod operators;
mod preprocess;
mod tracker;

pub use batch::MicroBatchAccumulator;
pub use operators::{
    Detector, DeviceStats, Embedder, NullDetector, NullEmbedder, OperatorError, RawDetection,
    TensorBatch, Tracker,
};
pub use preprocess::{crops_to_batch, decode_jpeg, face_crop, frames_to_batch};
pub use tracker::IouTracker;

/// All worker processes join this group; the bus delivers each frame to
/// exactly one of them.
pub const CONSUMER_GROUP: &str = "inference-workers";

/// Entries abandoned by a dead worker are taken over after this idle time.
const RECLAIM_IDLE_MS: u64 = 60_000;
/// Face crops per embedder invocation.
const EMBED_SUBBATCH: usize = 16;
/// Publish attempts before a DetectionEvent is accepted as lost.
const PUBLISH_ATTEMPTS: u32 = 5;
/// Backoff after a failed bus consume.
const CONSUME_RETRY: Duration = Duration::from_millis(500);

#[derive(thiserror::Error, Debug)]
pub enum InferError {
    #[error("jpeg decode failed: {0}")]
    Decode(String),
    #[error("{source}")]
    Bus {
        #[from]
        source: frame_bus::FrameBusError,
    },
    #[error("{source}")]
    Log {
        #[from]
        source: event_log::EventLogError,
    },
    #[error("{source}")]
    Operator {
        #[from]
        source: OperatorError,
    },
}

pub fn describe_metrics() {
    metrics::describe_histogram!(
        "detection_latency_ms",
        metrics::Unit::Milliseconds,
        "Detector invocation latency"
    );
    metrics::describe_histogram!(
        "embedding_latency_ms",
        metrics::Unit::Milliseconds,
        "Embedder invocation latency"
    );
    metrics::describe_gauge!("batch_fill_ratio", "Frames per micro-batch over capacity");
    metrics::describe_gauge!("gpu_vram_used_mb", "Device memory in use");
    metrics::describe_gauge!("gpu_utilization_pct", "Device utilization");
    metrics::describe_counter!(
        "frames_processed",
        metrics::Unit::Count,
        "Frames through the inference loop"
    );
    metrics::describe_counter!(
        "detections",
        metrics::Unit::Count,
        "Detections emitted per camera"
    );
    metrics::describe_counter!(
        "publish_errors",
        metrics::Unit::Count,
        "Failed event publish attempts"
    );
}

pub struct WorkerConfig {
    pub cameras: Vec<CameraId>,
    /// Cameras whose events go to `billing_topic` when it is set.
    pub billing_cameras: HashSet<CameraId>,
    pub billing_topic: Option<String>,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// Distinguishes this process within the consumer group.
    pub consumer_name: String,
}

pub struct Worker {
    bus: Arc<dyn FrameBus>,
    producer: Arc<dyn EventProducer>,
    detector: Arc<dyn Detector>,
    embedder: Arc<dyn Embedder>,
    tracker: Box<dyn Tracker>,
    cfg: WorkerConfig,
    streams: Vec<String>,
}

impl Worker {
    pub fn new(
        bus: Arc<dyn FrameBus>,
        producer: Arc<dyn EventProducer>,
        detector: Arc<dyn Detector>,
        embedder: Arc<dyn Embedder>,
        tracker: Box<dyn Tracker>,
        cfg: WorkerConfig,
    ) -> Self {
        let streams = cfg.cameras.iter().map(|c| c.frame_stream_key()).collect();
        Self {
            bus,
            producer,
            detector,
            embedder,
            tracker,
            cfg,
            streams,
        }
    }

    fn topic_for(&self, camera: &CameraId) -> &str {
        match &self.cfg.billing_topic {
            Some(topic) if self.cfg.billing_cameras.contains(camera) => topic,
            _ => DETECTIONS_TOPIC,
        }
    }

    /// Main loop: reclaim abandoned work, then consume/batch/infer until
    /// shutdown, draining the in-flight batch and checkpointing tracker
    /// state on the way out.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<(), InferError> {
        self.restore_tracker_state().await;
        self.takeover_abandoned().await;

        let mut acc =
            MicroBatchAccumulator::new(self.cfg.batch_size, self.cfg.batch_timeout);
        let block_ms = self.cfg.batch_timeout.as_millis() as u64;
        loop {
            if *shutdown.borrow() {
                let tail = acc.flush();
                if !tail.is_empty() {
                    self.process_batch(tail).await;
                }
                break;
            }
            let wanted = acc.remaining();
            match self
                .bus
                .consume(
                    CONSUMER_GROUP,
                    &self.cfg.consumer_name,
                    &self.streams,
                    wanted,
                    block_ms,
                )
                .await
            {
                Ok(entries) => {
                    if let Some(full) = acc.push(entries) {
                        self.process_batch(full).await;
                    } else if let Some(expired) = acc.take_if_expired() {
                        self.process_batch(expired).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "frame bus consume failed, backing off");
                    tokio::time::sleep(CONSUME_RETRY).await;
                }
            }
        }
        self.checkpoint_tracker_state().await;
        Ok(())
    }

    async fn restore_tracker_state(&mut self) {
        for camera in &self.cfg.cameras {
            let key = camera.tracker_checkpoint_key();
            match self.bus.load_checkpoint(&key).await {
                Ok(Some(blob)) => match self.tracker.restore(camera, &blob) {
                    Ok(()) => tracing::info!(camera = %camera, "tracker state restored"),
                    Err(e) => {
                        tracing::warn!(camera = %camera, error = %e, "tracker restore failed")
                    }
                },
                Ok(None) => {}
                Err(e) => tracing::warn!(camera = %camera, error = %e, "checkpoint load failed"),
            }
        }
    }

    async fn checkpoint_tracker_state(&self) {
        for camera in &self.cfg.cameras {
            match self.tracker.checkpoint(camera) {
                Ok(blob) => {
                    let key = camera.tracker_checkpoint_key();
                    if let Err(e) = self.bus.store_checkpoint(&key, &blob).await {
                        tracing::warn!(camera = %camera, error = %e, "checkpoint store failed");
                    }
                }
                Err(e) => tracing::warn!(camera = %camera, error = %e, "checkpoint failed"),
            }
        }
    }

    async fn takeover_abandoned(&mut self) {
        for stream in self.streams.clone() {
            match self
                .bus
                .reclaim(
                    CONSUMER_GROUP,
                    &self.cfg.consumer_name,
                    &stream,
                    RECLAIM_IDLE_MS,
                )
                .await
            {
                Ok(entries) if !entries.is_empty() => {
                    tracing::info!(
                        stream = %stream,
                        count = entries.len(),
                        "reclaimed abandoned frames"
                    );
                    self.process_batch(entries).await;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(stream = %stream, error = %e, "reclaim failed"),
            }
        }
    }

    /// Decode, detect, embed, track, publish, ack. Never fails the loop:
    /// every entry in the batch ends acked, with event loss handled by the
    /// documented per-failure policies.
    async fn process_batch(&mut self, entries: Vec<BusEntry>) {
        metrics::gauge!("batch_fill_ratio")
            .set(entries.len() as f64 / self.cfg.batch_size as f64);

        let mut acks: HashMap<String, Vec<EntryId>> = HashMap::new();
        let mut frames: Vec<RgbImage> = Vec::with_capacity(entries.len());
        let mut decoded: Vec<BusEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            acks.entry(entry.stream.clone()).or_default().push(entry.id);
            match decode_jpeg(&entry.jpeg) {
                Ok(img) => {
                    frames.push(img);
                    decoded.push(entry);
                }
                Err(e) => {
                    // Input corruption: ack and drop, never retry into the
                    // same decode error.
                    tracing::debug!(stream = %entry.stream, error = %e, "frame decode failed");
                    metrics::counter!("decode_failures").increment(1);
                }
            }
        }

        if !decoded.is_empty() {
            let per_frame = self.detect_frames(&frames);
            let embeddings = self.embed_detections(&frames, &per_frame);
            self.emit_events(&decoded, per_frame, embeddings).await;
        }

        for (stream, ids) in acks {
            if let Err(e) = self.bus.ack(CONSUMER_GROUP, &stream, &ids).await {
                tracing::warn!(stream = %stream, error = %e, "ack failed, entries will be reclaimed");
            }
        }

        if let Some(stats) = self.detector.device_stats() {
            metrics::gauge!("gpu_vram_used_mb").set(stats.vram_used_mb);
            metrics::gauge!("gpu_utilization_pct").set(stats.utilization_pct);
        }
    }

    fn detect_frames(&self, frames: &[RgbImage]) -> Vec<Vec<RawDetection>> {
        let started = Instant::now();
        let batch = frames_to_batch(frames);
        let result = match self.detector.detect(&batch) {
            Ok(per_frame) if per_frame.len() == frames.len() => per_frame,
            Ok(mut per_frame) => {
                tracing::warn!(
                    got = per_frame.len(),
                    want = frames.len(),
                    "detector returned wrong batch size"
                );
                per_frame.resize_with(frames.len(), Vec::new);
                per_frame
            }
            Err(OperatorError::OutOfMemory) => {
                // Empty caches and retry once per frame at batch size 1;
                // frames that still fail get an empty result.
                self.detector.release_cached_memory();
                frames
                    .iter()
                    .map(|frame| {
                        let single = frames_to_batch(std::slice::from_ref(frame));
                        self.detector
                            .detect(&single)
                            .ok()
                            .and_then(|mut v| v.pop())
                            .unwrap_or_default()
                    })
                    .collect()
            }
            Err(e) => {
                tracing::error!(error = %e, "detector failed, emitting empty results");
                vec![Vec::new(); frames.len()]
            }
        };
        metrics::histogram!("detection_latency_ms")
            .record(started.elapsed().as_secs_f64() * 1e3);
        result
    }

    /// Embeddings for every (frame, detection) pair with a usable face
    /// crop, keyed by position.
    fn embed_detections(
        &self,
        frames: &[RgbImage],
        per_frame: &[Vec<RawDetection>],
    ) -> HashMap<(usize, usize), Embedding> {
        let mut crops: Vec<RgbImage> = Vec::new();
        let mut positions: Vec<(usize, usize)> = Vec::new();
        for (frame_idx, detections) in per_frame.iter().enumerate() {
            for (det_idx, det) in detections.iter().enumerate() {
                if let Some(crop) = face_crop(&frames[frame_idx], det.bbox) {
                    crops.push(crop);
                    positions.push((frame_idx, det_idx));
                }
            }
        }
        let mut out = HashMap::new();
        if crops.is_empty() {
            return out;
        }
        let started = Instant::now();
        let mut offset = 0;
        for chunk in crops.chunks(EMBED_SUBBATCH) {
            let embeddings = self.embed_chunk(chunk);
            for (i, embedding) in embeddings.into_iter().enumerate() {
                if let Some(e) = embedding {
                    out.insert(positions[offset + i], e);
                }
            }
            offset += chunk.len();
        }
        metrics::histogram!("embedding_latency_ms")
            .record(started.elapsed().as_secs_f64() * 1e3);
        out
    }

    fn embed_chunk(&self, chunk: &[RgbImage]) -> Vec<Option<Embedding>> {
        let batch = crops_to_batch(chunk);
        match self.embedder.embed(&batch) {
            Ok(embeddings) if embeddings.len() == chunk.len() => {
                embeddings.into_iter().map(Some).collect()
            }
            Ok(_) => {
                tracing::warn!("embedder returned wrong batch size");
                vec![None; chunk.len()]
            }
            Err(OperatorError::OutOfMemory) => {
                self.embedder.release_cached_memory();
                chunk
                    .iter()
                    .map(|crop| {
                        let single = crops_to_batch(std::slice::from_ref(crop));
                        self.embedder
                            .embed(&single)
                            .ok()
                            .and_then(|mut v| v.pop())
                    })
                    .collect()
            }
            Err(e) => {
                tracing::error!(error = %e, "embedder failed, detections go out bare");
                vec![None; chunk.len()]
            }
        }
    }

    async fn emit_events(
        &mut self,
        decoded: &[BusEntry],
        per_frame: Vec<Vec<RawDetection>>,
        mut embeddings: HashMap<(usize, usize), Embedding>,
    ) {
        for (frame_idx, (entry, raw)) in decoded.iter().zip(per_frame).enumerate() {
            let camera = entry.meta.camera_id.clone();
            let effective_ts = entry.meta.effective_ts();
            let detections: Vec<Detection> = raw
                .into_iter()
                .enumerate()
                .map(|(det_idx, d)| Detection {
                    bbox: d.bbox,
                    conf: d.conf,
                    track_id: None,
                    embedding: embeddings.remove(&(frame_idx, det_idx)),
                })
                .collect();
            let tracked = self.tracker.assign(&camera, detections, effective_ts);

            let cam_label = camera.as_str().to_string();
            metrics::counter!("frames_processed", "camera_id" => cam_label.clone()).increment(1);
            metrics::counter!("detections", "camera_id" => cam_label.clone())
                .increment(tracked.len() as u64);

            let event = DetectionEvent {
                camera_id: camera.clone(),
                frame_index: entry.meta.frame_index,
                effective_ts,
                detections: tracked,
            };
            let payload = match event.to_json() {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(error = %e, "detection event serialization failed");
                    continue;
                }
            };
            let topic = self.topic_for(&camera).to_string();
            if let Err(e) = publish_with_retry(
                self.producer.as_ref(),
                &topic,
                camera.as_str(),
                &payload,
                PUBLISH_ATTEMPTS,
            )
            .await
            {
                // Accepted loss: the frame is acked regardless. Log backbone
                // availability is an SLA dependency, not a crash condition
                // for the worker.
                tracing::error!(camera = %camera, error = %e, "detection event lost");
            }
        }
    }
}
