use trinetra_config_data::TravelTimeMatrix;
use trinetra_types::{CameraId, Timestamp};

use crate::registry::RegistryEntry;

/// Cross-camera timestamp comparisons tolerate this much clock skew.
pub const SKEW_TOLERANCE_S: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Candidate is physically plausible.
    Allow,
    /// The registry entry predates the gate window: treat it as expired
    /// (the caller lazily evicts it) and allow the candidate.
    AllowExpired,
    /// The implied movement between cameras is faster than the floor plan
    /// permits.
    Reject,
}

/// Spatiotemporal plausibility check for one candidate.
///
/// Same-camera re-sightings always pass. Cross-camera transitions must
/// respect the derated travel-time matrix; the skew tolerance band keeps
/// marginal timestamps from producing spurious rejections.
pub fn gate_candidate(
    entry: Option<&RegistryEntry>,
    current_camera: &CameraId,
    effective_ts: Timestamp,
    travel: &TravelTimeMatrix,
    window_s: f64,
) -> GateOutcome {
    let Some(entry) = entry else {
        return GateOutcome::Allow;
    };
    let dt = effective_ts.seconds_since(entry.last_seen);
    if dt >= window_s {
        return GateOutcome::AllowExpired;
    }
    if entry.camera == *current_camera {
        return GateOutcome::Allow;
    }
    match travel.gate_seconds(&entry.camera, current_camera) {
        Some(min_travel) if dt + SKEW_TOLERANCE_S < min_travel => GateOutcome::Reject,
        _ => GateOutcome::Allow,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trinetra_types::Embedding;

    fn entry(camera: &str, ts: f64) -> RegistryEntry {
        RegistryEntry {
            camera: CameraId::new(camera),
            last_seen: Timestamp::from_f64(ts),
            embedding: Embedding::unit_in_dim(0),
        }
    }

    fn travel_billing_to_entrance(seconds: f64) -> TravelTimeMatrix {
        let mut m = TravelTimeMatrix::default();
        m.insert(CameraId::new("billing"), CameraId::new("entrance"), seconds);
        m
    }

    #[test]
    fn unseen_customer_is_allowed() {
        let travel = travel_billing_to_entrance(25.0);
        let outcome = gate_candidate(
            None,
            &CameraId::new("entrance"),
            Timestamp::from_f64(1510.0),
            &travel,
            3600.0,
        );
        assert_eq!(outcome, GateOutcome::Allow);
    }

    #[test]
    fn same_camera_always_passes() {
        let travel = travel_billing_to_entrance(25.0);
        let e = entry("entrance", 1509.9);
        let outcome = gate_candidate(
            Some(&e),
            &CameraId::new("entrance"),
            Timestamp::from_f64(1510.0),
            &travel,
            3600.0,
        );
        assert_eq!(outcome, GateOutcome::Allow);
    }

    #[test]
    fn impossible_transition_is_rejected() {
        // 10 seconds to cover a 25-second walk (22.5 after derating).
        let travel = travel_billing_to_entrance(25.0);
        let e = entry("billing", 1500.0);
        let outcome = gate_candidate(
            Some(&e),
            &CameraId::new("entrance"),
            Timestamp::from_f64(1510.0),
            &travel,
            3600.0,
        );
        assert_eq!(outcome, GateOutcome::Reject);
    }

    #[test]
    fn plausible_transition_passes() {
        let travel = travel_billing_to_entrance(25.0);
        let e = entry("billing", 1500.0);
        let outcome = gate_candidate(
            Some(&e),
            &CameraId::new("entrance"),
            Timestamp::from_f64(1530.0),
            &travel,
            3600.0,
        );
        assert_eq!(outcome, GateOutcome::Allow);
    }

    #[test]
    fn skew_band_rescues_marginal_timing() {
        // Derated requirement is 22.5s; 22.2s elapsed is within the band.
        let travel = travel_billing_to_entrance(25.0);
        let e = entry("billing", 1500.0);
        let outcome = gate_candidate(
            Some(&e),
            &CameraId::new("entrance"),
            Timestamp::from_f64(1522.2),
            &travel,
            3600.0,
        );
        assert_eq!(outcome, GateOutcome::Allow);
    }

    #[test]
    fn unconstrained_pair_passes() {
        let travel = TravelTimeMatrix::default();
        let e = entry("billing", 1500.0);
        let outcome = gate_candidate(
            Some(&e),
            &CameraId::new("entrance"),
            Timestamp::from_f64(1501.0),
            &travel,
            3600.0,
        );
        assert_eq!(outcome, GateOutcome::Allow);
    }

    #[test]
    fn entry_older_than_window_is_expired() {
        let travel = travel_billing_to_entrance(25.0);
        let e = entry("billing", 0.0);
        let outcome = gate_candidate(
            Some(&e),
            &CameraId::new("entrance"),
            Timestamp::from_f64(4000.0),
            &travel,
            3600.0,
        );
        assert_eq!(outcome, GateOutcome::AllowExpired);
    }
}
