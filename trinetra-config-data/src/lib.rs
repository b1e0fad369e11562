use std::collections::BTreeMap;
use std::net::{IpAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};

use trinetra_types::{CameraId, CameraKind};

mod tuning;

pub use tuning::Tuning;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("YAML deserialization error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },
    #[error("invalid RTSP URL \"{url}\": {reason}")]
    InvalidRtspUrl { url: String, reason: String },
    #[error("camera \"{camera}\" host {addr} is outside the RTSP allowlist")]
    AllowlistViolation { camera: String, addr: IpAddr },
    #[error("duplicate camera id \"{0}\"")]
    DuplicateCameraId(String),
    #[error("camera \"{camera}\" priority tier {tier} exceeds 5")]
    PriorityTierOutOfRange { camera: String, tier: u8 },
}

type Result<T> = std::result::Result<T, Error>;

fn default_target_fps() -> f64 {
    10.0
}

fn default_priority_tier() -> u8 {
    2
}

/// Static per-camera configuration, immutable for a service lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    pub id: CameraId,
    /// RTSP URL of the camera feed, e.g. `rtsp://10.0.3.17:554/stream1`.
    pub url: String,
    pub kind: CameraKind,
    /// Sampling target after the adaptive sampler, frames per second.
    #[serde(default = "default_target_fps")]
    pub target_fps: f64,
    /// 0 is the highest priority, 5 the lowest.
    #[serde(default = "default_priority_tier")]
    pub priority_tier: u8,
}

/// Minimum plausible walking time between camera pairs, derived from the
/// floor plan. Missing pairs mean "no constraint".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TravelTimeMatrix {
    seconds: BTreeMap<CameraId, BTreeMap<CameraId, f64>>,
}

/// Safety factor applied to measured travel times to absorb residual
/// cross-camera clock skew.
pub const TRAVEL_TIME_SAFETY_FACTOR: f64 = 0.9;

impl TravelTimeMatrix {
    pub fn insert(&mut self, from: CameraId, to: CameraId, seconds: f64) {
        self.seconds.entry(from).or_default().insert(to, seconds);
    }

    /// Measured minimum travel time between two cameras, if constrained.
    pub fn measured_seconds(&self, from: &CameraId, to: &CameraId) -> Option<f64> {
        self.seconds.get(from).and_then(|m| m.get(to)).copied()
    }

    /// The travel time the spatiotemporal gate enforces: measured time
    /// derated by [TRAVEL_TIME_SAFETY_FACTOR].
    pub fn gate_seconds(&self, from: &CameraId, to: &CameraId) -> Option<f64> {
        self.measured_seconds(from, to)
            .map(|s| s * TRAVEL_TIME_SAFETY_FACTOR)
    }
}

/// Top-level contents of the `CAMERAS_CONFIG` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrinetraConfig {
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub travel_times: TravelTimeMatrix,
    /// CIDR ranges RTSP camera hosts must fall within. An empty list
    /// disables the check (lab setups).
    #[serde(default)]
    pub rtsp_allowlist: Vec<ipnet::IpNet>,
    /// When set, DetectionEvents from billing cameras are routed to this
    /// topic instead of the shared detections topic.
    #[serde(default)]
    pub billing_detections_topic: Option<String>,
}

impl TrinetraConfig {
    pub fn camera(&self, id: &CameraId) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| &c.id == id)
    }

    pub fn kind_of(&self, id: &CameraId) -> Option<CameraKind> {
        self.camera(id).map(|c| c.kind)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for cam in &self.cameras {
            if !seen.insert(cam.id.clone()) {
                return Err(Error::DuplicateCameraId(cam.id.to_string()));
            }
            if cam.priority_tier > 5 {
                return Err(Error::PriorityTierOutOfRange {
                    camera: cam.id.to_string(),
                    tier: cam.priority_tier,
                });
            }
            validate_rtsp_url(&cam.id, &cam.url, &self.rtsp_allowlist)?;
        }
        Ok(())
    }
}

/// Reject non-RTSP URLs and, when an allowlist is configured, any camera
/// whose host does not fall inside the allowed CIDR ranges. This runs once
/// at startup and prevents configuration-driven SSRF.
fn validate_rtsp_url(
    camera: &CameraId,
    raw: &str,
    allowlist: &[ipnet::IpNet],
) -> Result<()> {
    let parsed = url::Url::parse(raw).map_err(|e| Error::InvalidRtspUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if parsed.scheme() != "rtsp" && parsed.scheme() != "rtsps" {
        return Err(Error::InvalidRtspUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme \"{}\"", parsed.scheme()),
        });
    }
    let host = parsed.host_str().ok_or_else(|| Error::InvalidRtspUrl {
        url: raw.to_string(),
        reason: "missing host".to_string(),
    })?;
    if allowlist.is_empty() {
        return Ok(());
    }
    let port = parsed.port().unwrap_or(554);
    let addrs: Vec<IpAddr> = match host.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::InvalidRtspUrl {
                url: raw.to_string(),
                reason: format!("host did not resolve: {e}"),
            })?
            .map(|sa| sa.ip())
            .collect(),
    };
    for addr in addrs {
        if !allowlist.iter().any(|net| net.contains(&addr)) {
            return Err(Error::AllowlistViolation {
                camera: camera.to_string(),
                addr,
            });
        }
    }
    Ok(())
}

pub fn parse_config_file<P: AsRef<std::path::Path>>(fname: P) -> Result<TrinetraConfig> {
    let contents = std::fs::read_to_string(fname.as_ref())?;
    parse_config_str(&contents)
}

pub fn parse_config_str(contents: &str) -> Result<TrinetraConfig> {
    let cfg: TrinetraConfig = serde_yaml::from_str(contents)?;
    cfg.validate()?;
    tracing::debug!(cameras = cfg.cameras.len(), "parsed camera config");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
cameras:
  - id: cam_entrance
    url: rtsp://192.168.10.11:554/stream1
    kind: entrance
    target_fps: 8.0
  - id: cam_billing
    url: rtsp://192.168.10.12:554/stream1
    kind: billing
    priority_tier: 0
travel_times:
  cam_billing:
    cam_entrance: 25.0
rtsp_allowlist:
  - 192.168.10.0/24
"#;

    #[test]
    fn parses_sample_config() {
        let cfg = parse_config_str(SAMPLE).unwrap();
        assert_eq!(cfg.cameras.len(), 2);
        let billing = cfg.camera(&CameraId::new("cam_billing")).unwrap();
        assert_eq!(billing.kind, CameraKind::Billing);
        assert_eq!(billing.priority_tier, 0);
        // defaults applied
        assert_eq!(billing.target_fps, 10.0);
        assert_eq!(
            cfg.travel_times.measured_seconds(
                &CameraId::new("cam_billing"),
                &CameraId::new("cam_entrance")
            ),
            Some(25.0)
        );
        assert!(cfg.billing_detections_topic.is_none());
    }

    #[test]
    fn gate_seconds_applies_safety_factor() {
        let cfg = parse_config_str(SAMPLE).unwrap();
        let gated = cfg
            .travel_times
            .gate_seconds(&CameraId::new("cam_billing"), &CameraId::new("cam_entrance"))
            .unwrap();
        assert!((gated - 22.5).abs() < 1e-9);
        assert_eq!(
            cfg.travel_times.gate_seconds(
                &CameraId::new("cam_entrance"),
                &CameraId::new("cam_billing")
            ),
            None
        );
    }

    #[test]
    fn rejects_host_outside_allowlist() {
        let bad = SAMPLE.replace("rtsp://192.168.10.12", "rtsp://10.9.9.9");
        match parse_config_str(&bad) {
            Err(Error::AllowlistViolation { camera, .. }) => {
                assert_eq!(camera, "cam_billing");
            }
            other => panic!("expected allowlist violation, got {other:?}"),
        }
    }

    #[test]
    fn rejects_non_rtsp_scheme() {
        let bad = SAMPLE.replace("rtsp://192.168.10.11", "http://192.168.10.11");
        assert!(matches!(
            parse_config_str(&bad),
            Err(Error::InvalidRtspUrl { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let bad = SAMPLE.replace("cam_billing", "cam_entrance");
        assert!(matches!(
            parse_config_str(&bad),
            Err(Error::DuplicateCameraId(_))
        ));
    }

    #[test]
    fn empty_allowlist_disables_check() {
        let open = SAMPLE.replace("rtsp_allowlist:\n  - 192.168.10.0/24\n", "");
        let open = open.replace("rtsp://192.168.10.11", "rtsp://203.0.113.5");
        assert!(parse_config_str(&open).is_ok());
    }
}
