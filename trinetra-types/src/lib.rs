use serde::{Deserialize, Serialize};

mod embedding;
mod timestamp;

pub use embedding::{Embedding, EMBED_DIM, UNIT_NORM_TOLERANCE};
pub use timestamp::Timestamp;

// Topics on the event log. Partition counts are provisioned by the broker
// config; they are recorded here because partition-key choices depend on them.
pub const DETECTIONS_TOPIC: &str = "detections";
pub const DETECTIONS_PARTITIONS: i32 = 8;
pub const IDENTITIES_TOPIC: &str = "identities";
pub const IDENTITIES_PARTITIONS: i32 = 8;
pub const ALERTS_TOPIC: &str = "alerts";
pub const ALERTS_PARTITIONS: i32 = 3;

/// Side length of the square frame published on the frame bus.
pub const FRAME_SIDE: u32 = 640;
/// Side length of the square face crop handed to the embedder.
pub const FACE_CROP_SIDE: u32 = 112;

/// The customer id emitted when no identity could be confirmed.
pub const UNKNOWN_CUSTOMER: &str = "UNKNOWN";

#[derive(thiserror::Error, Debug)]
pub enum TypesError {
    #[error("embedding has {got} dimensions, expected {EMBED_DIM}")]
    EmbeddingDimension { got: usize },
    #[error("embedding norm {norm} outside unit tolerance")]
    EmbeddingNotUnit { norm: f32 },
    #[error("{source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

/// Short configured camera name, e.g. "cam_01".
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, Eq, PartialOrd, Ord, Hash)]
pub struct CameraId(String);

impl CameraId {
    pub fn new<S: Into<String>>(s: S) -> Self {
        CameraId(s.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
    /// Key of this camera's stream on the frame bus.
    pub fn frame_stream_key(&self) -> String {
        format!("frames:{}", self.0)
    }
    /// Key under which the inference worker checkpoints tracker state.
    pub fn tracker_checkpoint_key(&self) -> String {
        format!("tracker:{}", self.0)
    }
}

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.0)
    }
}

/// Gallery identity. `CustomerId::unknown()` is the reserved sentinel emitted
/// when resolution does not produce a confirmed match.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, Eq, PartialOrd, Ord, Hash)]
pub struct CustomerId(String);

impl CustomerId {
    pub fn new<S: Into<String>>(s: S) -> Self {
        CustomerId(s.into())
    }
    pub fn unknown() -> Self {
        CustomerId(UNKNOWN_CUSTOMER.to_string())
    }
    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_CUSTOMER
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CustomerId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.0)
    }
}

/// Tracker-assigned id, stable across frames within one camera. Distinct from
/// [CustomerId].
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize, Eq, PartialOrd, Ord, Hash)]
pub struct TrackId(pub u64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.0)
    }
}

/// Per-camera frame counter, restarting at 0 each ingestor run. Strictly
/// increasing within one (ingestor epoch, camera) pair.
#[derive(
    Debug, PartialEq, Clone, Copy, Serialize, Deserialize, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct FrameIndex(pub u64);

impl FrameIndex {
    pub fn next(self) -> FrameIndex {
        FrameIndex(self.0 + 1)
    }
}

impl std::fmt::Display for FrameIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.0)
    }
}

/// Role of a camera in the store topology.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CameraKind {
    Entrance,
    FaceCapture,
    Tracking,
    Billing,
    Vehicle,
    Emotion,
}

impl CameraKind {
    /// Entrance and billing frames may only be dropped by the burst
    /// suppressor, never by the adaptive sampler. Footfall monotonicity and
    /// financial correlation depend on these feeds.
    pub fn exempt_from_sampling(&self) -> bool {
        matches!(self, CameraKind::Entrance | CameraKind::Billing)
    }
}

/// Metadata carried alongside the JPEG bytes of one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMeta {
    pub camera_id: CameraId,
    pub frame_index: FrameIndex,
    /// Wall clock at the ingestor when the frame was decoded.
    pub ingest_ts: Timestamp,
    /// Camera-reported capture time, when the source provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_ts: Option<Timestamp>,
}

impl FrameMeta {
    /// Camera-reported time if present, else the ingestor wall clock.
    pub fn effective_ts(&self) -> Timestamp {
        self.frame_ts.unwrap_or(self.ingest_ts)
    }
}

/// A decoded, resized, JPEG-encoded frame ready for the frame bus.
#[derive(Debug, Clone)]
pub struct Frame {
    pub meta: FrameMeta,
    pub jpeg: bytes::Bytes,
}

/// One person detected in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Pixel coordinates (x1, y1, x2, y2) within the 640x640 frame.
    pub bbox: [f32; 4],
    pub conf: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<TrackId>,
    /// L2-normalized face embedding, present only when a face crop was
    /// extractable from the detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Embedding>,
}

/// One published record per processed frame. Partitioned by `camera_id` so
/// per-camera order survives the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub camera_id: CameraId,
    pub frame_index: FrameIndex,
    pub effective_ts: Timestamp,
    pub detections: Vec<Detection>,
}

impl DetectionEvent {
    pub fn partition_key(&self) -> &str {
        self.camera_id.as_str()
    }
    pub fn to_json(&self) -> Result<Vec<u8>, TypesError> {
        Ok(serde_json::to_vec(self)?)
    }
    pub fn from_json(bytes: &[u8]) -> Result<Self, TypesError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// How a per-detection resolution concluded. Every resolution produces
/// exactly one [IdentityEvent]; callers branch on this enum, never on
/// presence-of-error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    Matched,
    GatedUnknown,
    QdrantUnavailable,
    InsufficientHistory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityEvent {
    pub camera_id: CameraId,
    pub track_id: TrackId,
    pub effective_ts: Timestamp,
    pub customer_id: CustomerId,
    /// In [0, 1]. For `matched` events this is the average history score.
    pub confidence: f32,
    pub source: IdentitySource,
}

impl IdentityEvent {
    pub fn partition_key(&self) -> &str {
        self.customer_id.as_str()
    }
    pub fn to_json(&self) -> Result<Vec<u8>, TypesError> {
        Ok(serde_json::to_vec(self)?)
    }
    pub fn from_json(bytes: &[u8]) -> Result<Self, TypesError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    UnknownAtBilling,
    FalseMergeSuspect,
    VipDetected,
    DriftWarning,
    ConsumerLag,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::UnknownAtBilling => "UNKNOWN_AT_BILLING",
            AlertKind::FalseMergeSuspect => "FALSE_MERGE_SUSPECT",
            AlertKind::VipDetected => "VIP_DETECTED",
            AlertKind::DriftWarning => "DRIFT_WARNING",
            AlertKind::ConsumerLag => "CONSUMER_LAG",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub severity: Severity,
    pub camera_id: CameraId,
    pub customer_id: Option<CustomerId>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub details: std::collections::BTreeMap<String, serde_json::Value>,
}

impl AlertEvent {
    pub fn new(kind: AlertKind, severity: Severity, camera_id: CameraId) -> Self {
        Self {
            kind,
            severity,
            camera_id,
            customer_id: None,
            details: Default::default(),
        }
    }
    pub fn customer(mut self, customer_id: CustomerId) -> Self {
        self.customer_id = Some(customer_id);
        self
    }
    pub fn detail<S: Into<String>, V: Into<serde_json::Value>>(mut self, key: S, value: V) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
    /// Alerts are partitioned by kind.
    pub fn partition_key(&self) -> &'static str {
        self.kind.as_str()
    }
    pub fn to_json(&self) -> Result<Vec<u8>, TypesError> {
        Ok(serde_json::to_vec(self)?)
    }
    pub fn from_json(bytes: &[u8]) -> Result<Self, TypesError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_ts_prefers_camera_clock() {
        let mut meta = FrameMeta {
            camera_id: CameraId::new("cam_01"),
            frame_index: FrameIndex(7),
            ingest_ts: Timestamp::from_f64(100.0),
            frame_ts: None,
        };
        assert_eq!(meta.effective_ts(), Timestamp::from_f64(100.0));
        meta.frame_ts = Some(Timestamp::from_f64(99.5));
        assert_eq!(meta.effective_ts(), Timestamp::from_f64(99.5));
    }

    #[test]
    fn detection_event_wire_format() {
        let e = Embedding::unit_in_dim(3);
        let event = DetectionEvent {
            camera_id: CameraId::new("cam_01"),
            frame_index: FrameIndex(12345),
            effective_ts: Timestamp::from_f64(1708790400.123),
            detections: vec![Detection {
                bbox: [1.0, 2.0, 3.0, 4.0],
                conf: 0.88,
                track_id: Some(TrackId(42)),
                embedding: Some(e),
            }],
        };
        let bytes = event.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["camera_id"], "cam_01");
        assert_eq!(value["frame_index"], 12345);
        assert_eq!(value["detections"][0]["conf"], 0.88);
        assert_eq!(value["detections"][0]["track_id"], 42);
        assert_eq!(
            value["detections"][0]["embedding"]
                .as_array()
                .unwrap()
                .len(),
            EMBED_DIM
        );
        let back = DetectionEvent::from_json(&bytes).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn optional_fields_are_omitted() {
        let event = DetectionEvent {
            camera_id: CameraId::new("cam_02"),
            frame_index: FrameIndex(0),
            effective_ts: Timestamp::from_f64(0.0),
            detections: vec![Detection {
                bbox: [0.0; 4],
                conf: 0.5,
                track_id: None,
                embedding: None,
            }],
        };
        let value: serde_json::Value =
            serde_json::from_slice(&event.to_json().unwrap()).unwrap();
        assert!(value["detections"][0].get("track_id").is_none());
        assert!(value["detections"][0].get("embedding").is_none());
    }

    #[test]
    fn identity_source_wire_names() {
        for (source, expected) in [
            (IdentitySource::Matched, "\"matched\""),
            (IdentitySource::GatedUnknown, "\"gated_unknown\""),
            (IdentitySource::QdrantUnavailable, "\"qdrant_unavailable\""),
            (
                IdentitySource::InsufficientHistory,
                "\"insufficient_history\"",
            ),
        ] {
            assert_eq!(serde_json::to_string(&source).unwrap(), expected);
        }
    }

    #[test]
    fn alert_wire_names_and_key() {
        let alert = AlertEvent::new(
            AlertKind::UnknownAtBilling,
            Severity::High,
            CameraId::new("cam_03"),
        )
        .detail("track_id", 9);
        assert_eq!(alert.partition_key(), "UNKNOWN_AT_BILLING");
        let value: serde_json::Value =
            serde_json::from_slice(&alert.to_json().unwrap()).unwrap();
        assert_eq!(value["kind"], "UNKNOWN_AT_BILLING");
        assert_eq!(value["severity"], "high");
        assert_eq!(value["customer_id"], serde_json::Value::Null);
        assert_eq!(value["details"]["track_id"], 9);
    }

    #[test]
    fn stream_and_checkpoint_keys() {
        let cam = CameraId::new("cam_01");
        assert_eq!(cam.frame_stream_key(), "frames:cam_01");
        assert_eq!(cam.tracker_checkpoint_key(), "tracker:cam_01");
    }
}
