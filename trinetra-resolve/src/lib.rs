//! Identity resolver: turns detection events into identity events,
//! suppressing physically impossible matches and single-frame flickers.
//!
//! One consumer task owns all mutable state (registry, per-track history),
//! so the per-event path never suspends while mutating it. Offsets are
//! committed manually and only after the identity events of a detection
//! event were published with the ANN backend reachable; an outage therefore
//! leaves the input uncommitted for replay. Every per-detection resolution
//! produces exactly one [IdentityEvent] whose `source` enumerates the
//! outcome; no control flow rides on errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use event_log::{publish_with_retry, EventConsumer, EventProducer};
use sim_search::{Candidate, SimilaritySearch};
use trinetra_config_data::{TravelTimeMatrix, Tuning};
use trinetra_types::{
    AlertEvent, AlertKind, CameraId, CameraKind, CustomerId, DetectionEvent, Embedding,
    IdentityEvent, IdentitySource, Severity, Timestamp, TrackId, ALERTS_TOPIC, IDENTITIES_TOPIC,
};

mod gate;
mod history;
mod registry;

pub use gate::{gate_candidate, GateOutcome, SKEW_TOLERANCE_S};
pub use history::{HistoryRing, TrackLedger, TrackPhase, TrackState, HISTORY_LEN, MAJORITY};
pub use registry::{ActiveIdentityRegistry, RegistryEntry};

/// Gallery candidates fetched per lookup.
const ANN_TOP_K: usize = 5;
/// HNSW search width for billing cameras and everything else.
const EF_BILLING: usize = 128;
const EF_DEFAULT: usize = 50;
/// Gallery EMA blend factor, applied only above [EMA_MIN_SCORE].
const EMA_ALPHA: f32 = 0.05;
const EMA_MIN_SCORE: f32 = 0.85;
/// An EMA base this far from the fresh embedding suggests the gallery
/// entry has drifted or merged; warn instead of silently blending.
const DRIFT_WARN_COSINE: f32 = 0.5;
/// Publish attempts before the resolver gives up and crashes (supervisor
/// restarts it; continuing would silently lose events).
const PUBLISH_ATTEMPTS: u32 = 5;
const CONSUME_BLOCK_MS: u64 = 50;
const POLL_RETRY: Duration = Duration::from_millis(500);
/// Registry sweep cadence: every N events or this much wall time.
const SWEEP_EVERY_EVENTS: u64 = 1000;
const SWEEP_EVERY: Duration = Duration::from_secs(60);
/// Consumer lag on the detections topic that trips the backlog alert.
const DETECTIONS_LAG_ALERT: u64 = 5000;

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("{source}")]
    Log {
        #[from]
        source: event_log::EventLogError,
    },
    #[error("{source}")]
    Types {
        #[from]
        source: trinetra_types::TypesError,
    },
}

pub fn describe_metrics() {
    metrics::describe_counter!(
        "identity_events",
        metrics::Unit::Count,
        "Identity events emitted, labelled by source"
    );
    metrics::describe_counter!(
        "gate_rejections",
        metrics::Unit::Count,
        "Candidates rejected by the spatiotemporal gate"
    );
    metrics::describe_counter!(
        "deserialization_errors",
        metrics::Unit::Count,
        "Detection events that failed to parse"
    );
    metrics::describe_counter!(
        "identity_flicker",
        metrics::Unit::Count,
        "Resolved tracks demoted by disagreeing votes"
    );
    metrics::describe_counter!(
        "alerts_emitted",
        metrics::Unit::Count,
        "Alert events published, labelled by kind"
    );
    metrics::describe_gauge!("registry_size", "Active identities in memory");
    metrics::describe_gauge!("consumer_lag", "Uncommitted detections backlog");
}

pub struct ResolverConfig {
    pub tuning: Tuning,
    pub camera_kinds: HashMap<CameraId, CameraKind>,
    pub travel_times: TravelTimeMatrix,
    /// Reverse-index false-merge scan cadence, in processed events.
    pub false_merge_scan_every: u64,
}

impl ResolverConfig {
    pub fn new(
        tuning: Tuning,
        camera_kinds: HashMap<CameraId, CameraKind>,
        travel_times: TravelTimeMatrix,
    ) -> Self {
        Self {
            tuning,
            camera_kinds,
            travel_times,
            false_merge_scan_every: 100,
        }
    }
}

struct Resolution {
    event: IdentityEvent,
    ann_unavailable: bool,
    vip: bool,
    drift_suspect: bool,
}

pub struct Resolver {
    search: Arc<dyn SimilaritySearch>,
    producer: Arc<dyn EventProducer>,
    consumer: Box<dyn EventConsumer>,
    cfg: ResolverConfig,
    registry: ActiveIdentityRegistry,
    ledger: TrackLedger,
    events_processed: u64,
    /// Latest effective timestamp seen; the event-time clock all expiry
    /// decisions use, which keeps replay deterministic.
    event_clock: Timestamp,
    last_sweep: Instant,
    lag_alerted: bool,
}

impl Resolver {
    pub fn new(
        search: Arc<dyn SimilaritySearch>,
        producer: Arc<dyn EventProducer>,
        consumer: Box<dyn EventConsumer>,
        cfg: ResolverConfig,
    ) -> Self {
        Self {
            search,
            producer,
            consumer,
            cfg,
            registry: ActiveIdentityRegistry::default(),
            ledger: TrackLedger::default(),
            events_processed: 0,
            event_clock: Timestamp::from_f64(0.0),
            last_sweep: Instant::now(),
            lag_alerted: false,
        }
    }

    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<(), ResolveError> {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let record = match self.consumer.poll(CONSUME_BLOCK_MS).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    self.maybe_sweep();
                    self.check_lag().await?;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "event log poll failed, backing off");
                    tokio::time::sleep(POLL_RETRY).await;
                    continue;
                }
            };
            let event = match DetectionEvent::from_json(&record.payload) {
                Ok(event) => event,
                Err(e) => {
                    // Protocol violation: skip, advance, count.
                    tracing::warn!(error = %e, offset = record.offset, "bad detection event");
                    metrics::counter!("deserialization_errors").increment(1);
                    if let Err(e) = self.consumer.commit(&record).await {
                        tracing::warn!(error = %e, "commit failed after skip");
                    }
                    continue;
                }
            };
            let advance = self.process_event(&event).await?;
            if advance {
                if let Err(e) = self.consumer.commit(&record).await {
                    tracing::warn!(error = %e, "commit failed, event may redeliver");
                }
            }

            self.events_processed += 1;
            if self.events_processed % self.cfg.false_merge_scan_every == 0 {
                self.scan_false_merges().await?;
                self.check_lag().await?;
            }
            if self.events_processed % SWEEP_EVERY_EVENTS == 0 {
                self.sweep();
            } else {
                self.maybe_sweep();
            }
        }
        Ok(())
    }

    /// Resolve every embedded detection of one event. Returns whether the
    /// offset may advance: it must not while the ANN backend is down, so
    /// the same detections replay after recovery.
    async fn process_event(&mut self, event: &DetectionEvent) -> Result<bool, ResolveError> {
        let camera = &event.camera_id;
        let kind = self.cfg.camera_kinds.get(camera).copied();
        if event.effective_ts > self.event_clock {
            self.event_clock = event.effective_ts;
        }
        let mut advance = true;
        for detection in &event.detections {
            let (Some(embedding), Some(track_id)) = (&detection.embedding, detection.track_id)
            else {
                continue;
            };
            let resolution = self
                .resolve_detection(camera, kind, track_id, event.effective_ts, embedding)
                .await;
            let identity = &resolution.event;
            publish_with_retry(
                self.producer.as_ref(),
                IDENTITIES_TOPIC,
                identity.partition_key(),
                &identity.to_json()?,
                PUBLISH_ATTEMPTS,
            )
            .await?;
            metrics::counter!(
                "identity_events",
                "source" => source_label(identity.source)
            )
            .increment(1);
            if resolution.ann_unavailable {
                advance = false;
            }
            self.emit_alerts(&resolution, kind).await?;
        }
        Ok(advance)
    }

    async fn resolve_detection(
        &mut self,
        camera: &CameraId,
        kind: Option<CameraKind>,
        track_id: TrackId,
        effective_ts: Timestamp,
        embedding: &Embedding,
    ) -> Resolution {
        let ef = match kind {
            Some(CameraKind::Billing) => EF_BILLING,
            _ => EF_DEFAULT,
        };
        let candidates = match self.search.top_k(embedding, ANN_TOP_K, ef).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!(camera = %camera, error = %e, "similarity search unavailable");
                // No state is mutated on this path, so the eventual replay
                // of the same detection resolves from a clean slate.
                return Resolution {
                    event: self.unknown_event(
                        camera,
                        track_id,
                        effective_ts,
                        IdentitySource::QdrantUnavailable,
                    ),
                    ann_unavailable: true,
                    vip: false,
                    drift_suspect: false,
                };
            }
        };

        let above: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.score >= self.cfg.tuning.cosine_threshold)
            .collect();
        let any_above_threshold = !above.is_empty();

        let window = self.cfg.tuning.temporal_gate_window_s;
        let mut survivors: Vec<&Candidate> = Vec::new();
        let mut rejected: Vec<&Candidate> = Vec::new();
        let mut expired: Vec<CustomerId> = Vec::new();
        for candidate in above {
            match gate_candidate(
                self.registry.get(&candidate.customer_id),
                camera,
                effective_ts,
                &self.cfg.travel_times,
                window,
            ) {
                GateOutcome::Allow => survivors.push(candidate),
                GateOutcome::AllowExpired => {
                    expired.push(candidate.customer_id.clone());
                    survivors.push(candidate);
                }
                GateOutcome::Reject => {
                    metrics::counter!("gate_rejections", "reason" => "impossible_transition")
                        .increment(1);
                    rejected.push(candidate);
                }
            }
        }
        for customer in expired {
            self.registry.remove(&customer);
        }

        let top = survivors
            .into_iter()
            .max_by(|a, b| a.score.total_cmp(&b.score));
        let Some(top) = top else {
            let source = if any_above_threshold {
                IdentitySource::GatedUnknown
            } else {
                IdentitySource::InsufficientHistory
            };
            // The track stays live even without a usable candidate, and the
            // best gate-rejected candidate is remembered so the false-merge
            // scan can see where this body would have matched.
            let state = self.ledger.touch(camera, track_id, effective_ts);
            if let Some(best_rejected) = rejected
                .iter()
                .max_by(|a, b| a.score.total_cmp(&b.score))
            {
                state.last_gated = Some((best_rejected.customer_id.clone(), effective_ts));
            }
            return Resolution {
                event: self.unknown_event(camera, track_id, effective_ts, source),
                ann_unavailable: false,
                vip: false,
                drift_suspect: false,
            };
        };
        let top_customer = top.customer_id.clone();
        let top_score = top.score;

        let state = self.ledger.touch(camera, track_id, effective_ts);
        state.last_gated = None;
        state.ring.push(top_customer.clone(), top_score);
        let (confirmed, flickered) = state.confirm(self.cfg.tuning.history_threshold);
        if flickered {
            metrics::counter!("identity_flicker").increment(1);
        }

        let Some((customer, avg_score)) = confirmed else {
            return Resolution {
                event: self.unknown_event(
                    camera,
                    track_id,
                    effective_ts,
                    IdentitySource::InsufficientHistory,
                ),
                ann_unavailable: false,
                vip: false,
                drift_suspect: false,
            };
        };

        // Gallery EMA write-back, gated stricter than matching so a
        // borderline match cannot drag its own threshold along (drift
        // amplification).
        let mut drift_suspect = false;
        if top_score >= EMA_MIN_SCORE && customer == top_customer {
            let base = self
                .registry
                .get(&customer)
                .map(|entry| entry.embedding.clone());
            if let Some(base) = base {
                if base.cosine(embedding) < DRIFT_WARN_COSINE {
                    drift_suspect = true;
                } else {
                    let blended = base.ema_update(embedding, EMA_ALPHA);
                    if let Err(e) = self.search.update(&customer, &blended).await {
                        tracing::warn!(%customer, error = %e, "gallery EMA update failed");
                    }
                }
            }
        }

        let vip = candidates
            .iter()
            .find(|c| c.customer_id == customer)
            .map(|c| c.payload.vip)
            .unwrap_or(false);

        self.registry.set(
            customer.clone(),
            camera.clone(),
            effective_ts,
            embedding.clone(),
        );

        Resolution {
            event: IdentityEvent {
                camera_id: camera.clone(),
                track_id,
                effective_ts,
                customer_id: customer,
                confidence: avg_score.clamp(0.0, 1.0),
                source: IdentitySource::Matched,
            },
            ann_unavailable: false,
            vip,
            drift_suspect,
        }
    }

    fn unknown_event(
        &self,
        camera: &CameraId,
        track_id: TrackId,
        effective_ts: Timestamp,
        source: IdentitySource,
    ) -> IdentityEvent {
        IdentityEvent {
            camera_id: camera.clone(),
            track_id,
            effective_ts,
            customer_id: CustomerId::unknown(),
            confidence: 0.0,
            source,
        }
    }

    async fn emit_alerts(
        &mut self,
        resolution: &Resolution,
        kind: Option<CameraKind>,
    ) -> Result<(), ResolveError> {
        let identity = &resolution.event;
        if identity.source != IdentitySource::Matched && kind == Some(CameraKind::Billing) {
            let alert = AlertEvent::new(
                AlertKind::UnknownAtBilling,
                Severity::High,
                identity.camera_id.clone(),
            )
            .detail("track_id", identity.track_id.0)
            .detail("source", source_label(identity.source));
            self.publish_alert(alert).await?;
        }
        if identity.source == IdentitySource::Matched && resolution.vip {
            let alert = AlertEvent::new(
                AlertKind::VipDetected,
                Severity::Medium,
                identity.camera_id.clone(),
            )
            .customer(identity.customer_id.clone())
            .detail("confidence", f64::from(identity.confidence));
            self.publish_alert(alert).await?;
        }
        if resolution.drift_suspect {
            let alert = AlertEvent::new(
                AlertKind::DriftWarning,
                Severity::Medium,
                identity.camera_id.clone(),
            )
            .customer(identity.customer_id.clone())
            .detail("reason", "ema_base_divergence");
            self.publish_alert(alert).await?;
        }
        Ok(())
    }

    async fn publish_alert(&self, alert: AlertEvent) -> Result<(), ResolveError> {
        metrics::counter!("alerts_emitted", "kind" => alert.kind.as_str()).increment(1);
        publish_with_retry(
            self.producer.as_ref(),
            ALERTS_TOPIC,
            alert.partition_key(),
            &alert.to_json()?,
            PUBLISH_ATTEMPTS,
        )
        .await?;
        Ok(())
    }

    /// Reverse-index check: the same customer currently held as candidate
    /// by tracks on two cameras whose timing violates the travel matrix is
    /// a suspected false merge.
    async fn scan_false_merges(&mut self) -> Result<(), ResolveError> {
        let mut by_customer: HashMap<CustomerId, Vec<(CameraId, TrackId, Timestamp)>> =
            HashMap::new();
        for (camera, track, customer, ts) in self.ledger.current_candidates() {
            by_customer
                .entry(customer)
                .or_default()
                .push((camera, track, ts));
        }
        for (customer, sightings) in by_customer {
            if sightings.len() < 2 {
                continue;
            }
            for i in 0..sightings.len() {
                for j in (i + 1)..sightings.len() {
                    let (cam_a, track_a, ts_a) = &sightings[i];
                    let (cam_b, track_b, ts_b) = &sightings[j];
                    if cam_a == cam_b {
                        continue;
                    }
                    let min_travel = self
                        .cfg
                        .travel_times
                        .gate_seconds(cam_a, cam_b)
                        .or_else(|| self.cfg.travel_times.gate_seconds(cam_b, cam_a));
                    let Some(min_travel) = min_travel else {
                        continue;
                    };
                    let dt = ts_b.seconds_since(*ts_a).abs();
                    if dt + SKEW_TOLERANCE_S < min_travel {
                        let (late_cam, late_track) =
                            if ts_b >= ts_a { (cam_b, track_b) } else { (cam_a, track_a) };
                        tracing::warn!(
                            %customer,
                            cam_a = %cam_a,
                            cam_b = %cam_b,
                            dt,
                            "suspected false merge"
                        );
                        let alert = AlertEvent::new(
                            AlertKind::FalseMergeSuspect,
                            Severity::High,
                            late_cam.clone(),
                        )
                        .customer(customer.clone())
                        .detail("other_camera", other_camera_name(late_cam, cam_a, cam_b))
                        .detail("track_id", late_track.0)
                        .detail("dt_seconds", dt);
                        self.publish_alert(alert).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn check_lag(&mut self) -> Result<(), ResolveError> {
        let lag = match self.consumer.lag().await {
            Ok(Some(lag)) => lag,
            _ => return Ok(()),
        };
        metrics::gauge!("consumer_lag").set(lag as f64);
        if lag > DETECTIONS_LAG_ALERT && !self.lag_alerted {
            self.lag_alerted = true;
            tracing::error!(lag, "detections backlog exceeds alert threshold");
            let alert = AlertEvent::new(
                AlertKind::ConsumerLag,
                Severity::High,
                CameraId::new("pipeline"),
            )
            .detail("lag", lag);
            self.publish_alert(alert).await?;
        } else if lag <= DETECTIONS_LAG_ALERT {
            self.lag_alerted = false;
        }
        Ok(())
    }

    fn maybe_sweep(&mut self) {
        if self.last_sweep.elapsed() >= SWEEP_EVERY {
            self.sweep();
        }
    }

    fn sweep(&mut self) {
        let window = self.cfg.tuning.temporal_gate_window_s;
        let removed = self.registry.sweep_expired(self.event_clock, window);
        self.ledger.sweep(self.event_clock, window);
        if removed > 0 {
            tracing::debug!(removed, "swept expired identities");
        }
        metrics::gauge!("registry_size").set(self.registry.len() as f64);
        self.last_sweep = Instant::now();
    }
}

fn source_label(source: IdentitySource) -> &'static str {
    match source {
        IdentitySource::Matched => "matched",
        IdentitySource::GatedUnknown => "gated_unknown",
        IdentitySource::QdrantUnavailable => "qdrant_unavailable",
        IdentitySource::InsufficientHistory => "insufficient_history",
    }
}

fn other_camera_name(late: &CameraId, a: &CameraId, b: &CameraId) -> String {
    if late == a {
        b.to_string()
    } else {
        a.to_string()
    }
}
