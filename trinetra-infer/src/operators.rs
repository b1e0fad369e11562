//! Contracts for the GPU-side vision operators.
//!
//! The worker is the only GPU-bearing component of the core, but the models
//! themselves are external: implementations of these traits are loaded by
//! the deployment (TorchScript, TensorRT, ONNX runtimes). The core ships
//! null implementations for bring-up and tests; the tracker, being pure
//! bookkeeping, has a real in-crate implementation.

use trinetra_types::{CameraId, Detection, Embedding, Timestamp};

#[derive(thiserror::Error, Debug)]
pub enum OperatorError {
    /// The device ran out of memory. The worker reacts by emptying caches
    /// and retrying once at the smallest batch size.
    #[error("operator out of device memory")]
    OutOfMemory,
    #[error("operator failed: {0}")]
    Failed(String),
}

/// Dense float tensor in NCHW layout.
pub struct TensorBatch {
    pub data: Vec<f32>,
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl TensorBatch {
    pub fn len_per_item(&self) -> usize {
        self.channels * self.height * self.width
    }
}

/// One detection as reported by the detector, before tracking or embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    /// (x1, y1, x2, y2) in input pixels.
    pub bbox: [f32; 4],
    pub conf: f32,
}

/// Optional device telemetry an operator can surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceStats {
    pub vram_used_mb: f64,
    pub utilization_pct: f64,
}

/// Person/face detector. Input is `(B, 3, 640, 640)` with values scaled to
/// `[0, 1]`; the latency budget is 50 ms at B=4.
pub trait Detector: Send + Sync {
    fn detect(&self, batch: &TensorBatch) -> Result<Vec<Vec<RawDetection>>, OperatorError>;

    /// Called after an OOM before the retry.
    fn release_cached_memory(&self) {}

    fn device_stats(&self) -> Option<DeviceStats> {
        None
    }
}

/// Face embedder. Input is `(C, 3, 112, 112)` normalized `(x-127.5)/127.5`;
/// outputs are L2-normalized 512-d vectors (enforced by [Embedding]'s
/// constructor at the trait boundary). Latency budget 20 ms at C=16.
pub trait Embedder: Send + Sync {
    fn embed(&self, crops: &TensorBatch) -> Result<Vec<Embedding>, OperatorError>;

    fn release_cached_memory(&self) {}
}

/// Per-camera multi-object tracker. Holds state in-process; `checkpoint` /
/// `restore` round-trip that state through the frame bus blob store across
/// clean restarts. Short crashes are absorbed by pending-entry reclaim
/// instead, which replays the same frames.
pub trait Tracker: Send {
    /// Assign `track_id`s to the detections of one frame.
    fn assign(
        &mut self,
        camera: &CameraId,
        detections: Vec<Detection>,
        ts: Timestamp,
    ) -> Vec<Detection>;

    fn checkpoint(&self, camera: &CameraId) -> Result<Vec<u8>, OperatorError>;

    fn restore(&mut self, camera: &CameraId, blob: &[u8]) -> Result<(), OperatorError>;
}

/// Detector that sees nothing. Pipeline bring-up without a model.
#[derive(Default)]
pub struct NullDetector;

impl Detector for NullDetector {
    fn detect(&self, batch: &TensorBatch) -> Result<Vec<Vec<RawDetection>>, OperatorError> {
        Ok(vec![Vec::new(); batch.batch])
    }
}

/// Embedder that returns axis-aligned unit vectors. Deterministic, useful
/// only for plumbing tests.
#[derive(Default)]
pub struct NullEmbedder;

impl Embedder for NullEmbedder {
    fn embed(&self, crops: &TensorBatch) -> Result<Vec<Embedding>, OperatorError> {
        Ok((0..crops.batch).map(Embedding::unit_in_dim).collect())
    }
}
