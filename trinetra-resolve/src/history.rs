use std::collections::{HashMap, VecDeque};

use trinetra_types::{CameraId, CustomerId, Timestamp, TrackId};

/// Entries kept per track for majority-vote confirmation.
pub const HISTORY_LEN: usize = 5;
/// Votes the winning id needs within a full ring.
pub const MAJORITY: usize = 3;
/// A track silent for this long has its ring cleared.
pub const TRACK_STALE_S: f64 = 30.0;
/// Consecutive disagreements that demote a resolved track back to
/// collecting (identity flicker).
const FLICKER_DEMOTION: u32 = 3;

/// Fixed-size queue of recent `(candidate, cosine)` assignments for one
/// track.
#[derive(Debug, Clone, Default)]
pub struct HistoryRing {
    entries: VecDeque<(CustomerId, f32)>,
}

impl HistoryRing {
    pub fn push(&mut self, candidate: CustomerId, score: f32) {
        if self.entries.len() == HISTORY_LEN {
            self.entries.pop_front();
        }
        self.entries.push_back((candidate, score));
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= HISTORY_LEN
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn last(&self) -> Option<&(CustomerId, f32)> {
        self.entries.back()
    }

    /// The id with the most votes in the ring, with its vote count and
    /// average score. Ties break toward the id seen most recently.
    pub fn majority(&self) -> Option<(CustomerId, usize, f32)> {
        let mut votes: HashMap<&CustomerId, (usize, f32)> = HashMap::new();
        for (id, score) in &self.entries {
            let entry = votes.entry(id).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += score;
        }
        let mut best: Option<(CustomerId, usize, f32)> = None;
        for (id, _) in self.entries.iter().rev() {
            let (count, total) = votes[id];
            let avg = total / count as f32;
            if best
                .as_ref()
                .map(|(_, best_count, _)| count > *best_count)
                .unwrap_or(true)
            {
                best = Some((id.clone(), count, avg));
            }
        }
        best
    }
}

/// Resolution phase of one track. A separate `Stale` phase is unnecessary:
/// staleness clears the ring and drops the state back to `New` on the next
/// event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackPhase {
    New,
    Collecting,
    Resolved(CustomerId),
}

#[derive(Debug)]
pub struct TrackState {
    pub ring: HistoryRing,
    pub phase: TrackPhase,
    pub camera: CameraId,
    pub last_event: Timestamp,
    /// Best candidate the spatiotemporal gate refused for this track, kept
    /// for the false-merge reverse-index scan: a rejected assignment is
    /// exactly the "same customer in two places" signal that scan hunts.
    pub last_gated: Option<(CustomerId, Timestamp)>,
    disagreements: u32,
}

impl TrackState {
    fn new(camera: CameraId, ts: Timestamp) -> Self {
        Self {
            ring: HistoryRing::default(),
            phase: TrackPhase::New,
            camera,
            last_event: ts,
            last_gated: None,
            disagreements: 0,
        }
    }

    /// Apply the confirmation rule after a vote was pushed. Returns the
    /// confirmed `(customer, avg_score)` when the track is resolved, and
    /// whether this call demoted a previously resolved track (flicker).
    pub fn confirm(&mut self, history_threshold: f32) -> (Option<(CustomerId, f32)>, bool) {
        let majority = self.ring.majority();
        let confirmed = match majority {
            Some((id, count, avg))
                if self.ring.is_full() && count >= MAJORITY && avg >= history_threshold =>
            {
                Some((id, avg))
            }
            _ => None,
        };
        match (&self.phase, &confirmed) {
            (TrackPhase::Resolved(current), Some((winner, _))) if winner == current => {
                self.disagreements = 0;
            }
            (TrackPhase::Resolved(_), _) => {
                self.disagreements += 1;
                if self.disagreements >= FLICKER_DEMOTION {
                    self.phase = TrackPhase::Collecting;
                    self.disagreements = 0;
                    return (None, true);
                }
                // Still resolved but the vote no longer confirms: emit
                // nothing new as matched this round.
                return (None, false);
            }
            _ => {}
        }
        if let Some((winner, avg)) = confirmed {
            self.phase = TrackPhase::Resolved(winner.clone());
            (Some((winner, avg)), false)
        } else {
            if self.phase == TrackPhase::New && !self.ring.entries.is_empty() {
                self.phase = TrackPhase::Collecting;
            }
            (None, false)
        }
    }
}

/// All live per-track state, keyed by (camera, track) since track ids are
/// only unique within a camera.
#[derive(Default)]
pub struct TrackLedger {
    tracks: HashMap<(CameraId, TrackId), TrackState>,
}

impl TrackLedger {
    /// Fetch the state for a track, clearing it first if it went stale.
    pub fn touch(&mut self, camera: &CameraId, track: TrackId, ts: Timestamp) -> &mut TrackState {
        let key = (camera.clone(), track);
        let state = self
            .tracks
            .entry(key)
            .or_insert_with(|| TrackState::new(camera.clone(), ts));
        if ts.seconds_since(state.last_event) > TRACK_STALE_S {
            state.ring.clear();
            state.phase = TrackPhase::New;
            state.last_gated = None;
            state.disagreements = 0;
        }
        state.last_event = ts;
        state.camera = camera.clone();
        state
    }

    /// Current candidate of every live track, resolved or not: the most
    /// recent ring entry, or the gate-rejected candidate for tracks the
    /// gate starved. Input to the false-merge scan.
    pub fn current_candidates(&self) -> Vec<(CameraId, TrackId, CustomerId, Timestamp)> {
        self.tracks
            .iter()
            .filter_map(|((camera, track), state)| {
                let candidate = state
                    .ring
                    .last()
                    .map(|(id, _)| (id.clone(), state.last_event))
                    .or_else(|| state.last_gated.clone());
                candidate.map(|(id, ts)| (camera.clone(), *track, id, ts))
            })
            .collect()
    }

    /// Drop tracks unseen for longer than the gate window; their rings are
    /// dead weight.
    pub fn sweep(&mut self, now: Timestamp, window_s: f64) {
        self.tracks
            .retain(|_, state| now.seconds_since(state.last_event) <= window_s);
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
