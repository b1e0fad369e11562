use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use trinetra_types::{CameraId, Detection, Timestamp, TrackId};

use crate::operators::{OperatorError, Tracker};

/// Minimum IoU between a detection and a live track to continue it.
const IOU_THRESHOLD: f32 = 0.3;
/// A track unseen for this long is dropped before matching.
const MAX_COAST_S: f64 = 5.0;

#[derive(Serialize, Deserialize, Default, Clone)]
struct CameraTracks {
    next_track: u64,
    tracks: Vec<TrackState>,
}

#[derive(Serialize, Deserialize, Clone)]
struct TrackState {
    track_id: TrackId,
    bbox: [f32; 4],
    last_seen: Timestamp,
}

/// Greedy IoU-association tracker.
///
/// Detections are matched to live tracks highest-confidence first; an
/// unmatched detection opens a new track. Track ids are stable across
/// frames within one camera and never reused within a checkpoint lineage.
#[derive(Default)]
pub struct IouTracker {
    cameras: HashMap<CameraId, CameraTracks>,
}

impl IouTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);
    let iw = (ix2 - ix1).max(0.0);
    let ih = (iy2 - iy1).max(0.0);
    let inter = iw * ih;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

impl Tracker for IouTracker {
    fn assign(
        &mut self,
        camera: &CameraId,
        mut detections: Vec<Detection>,
        ts: Timestamp,
    ) -> Vec<Detection> {
        let state = self.cameras.entry(camera.clone()).or_default();
        state
            .tracks
            .retain(|t| ts.seconds_since(t.last_seen) <= MAX_COAST_S);

        // Highest-confidence detections pick their tracks first.
        let mut order: Vec<usize> = (0..detections.len()).collect();
        order.sort_by(|&a, &b| detections[b].conf.total_cmp(&detections[a].conf));

        let mut taken = vec![false; state.tracks.len()];
        for det_idx in order {
            let bbox = detections[det_idx].bbox;
            let mut best: Option<(usize, f32)> = None;
            for (track_idx, track) in state.tracks.iter().enumerate() {
                if taken[track_idx] {
                    continue;
                }
                let overlap = iou(&bbox, &track.bbox);
                if overlap >= IOU_THRESHOLD
                    && best.map(|(_, score)| overlap > score).unwrap_or(true)
                {
                    best = Some((track_idx, overlap));
                }
            }
            let track_id = match best {
                Some((track_idx, _)) => {
                    taken[track_idx] = true;
                    let track = &mut state.tracks[track_idx];
                    track.bbox = bbox;
                    track.last_seen = ts;
                    track.track_id
                }
                None => {
                    let track_id = TrackId(state.next_track);
                    state.next_track += 1;
                    state.tracks.push(TrackState {
                        track_id,
                        bbox,
                        last_seen: ts,
                    });
                    taken.push(true);
                    track_id
                }
            };
            detections[det_idx].track_id = Some(track_id);
        }
        detections
    }

    fn checkpoint(&self, camera: &CameraId) -> Result<Vec<u8>, OperatorError> {
        let state = self.cameras.get(camera).cloned().unwrap_or_default();
        serde_json::to_vec(&state).map_err(|e| OperatorError::Failed(e.to_string()))
    }

    fn restore(&mut self, camera: &CameraId, blob: &[u8]) -> Result<(), OperatorError> {
        let state: CameraTracks =
            serde_json::from_slice(blob).map_err(|e| OperatorError::Failed(e.to_string()))?;
        self.cameras.insert(camera.clone(), state);
        Ok(())
    }
}
