//! End-to-end resolver scenarios over the in-memory event log and gallery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use event_log::{EventProducer, MemoryConsumer, MemoryEventLog};
use sim_search::{GalleryPayload, MemoryGallery};
use trinetra_resolve::{Resolver, ResolverConfig};
use trinetra_types::{
    AlertEvent, AlertKind, CameraId, CameraKind, CustomerId, Detection, DetectionEvent, Embedding,
    IdentityEvent, IdentitySource, Timestamp, TrackId, ALERTS_TOPIC, DETECTIONS_TOPIC,
    IDENTITIES_TOPIC,
};

const GROUP: &str = "identity-resolvers";

fn detection_event(camera: &str, track: u64, ts: f64, embedding: &Embedding) -> DetectionEvent {
    DetectionEvent {
        camera_id: CameraId::new(camera),
        frame_index: trinetra_types::FrameIndex(0),
        effective_ts: Timestamp::from_f64(ts),
        detections: vec![Detection {
            bbox: [100.0, 100.0, 200.0, 300.0],
            conf: 0.9,
            track_id: Some(TrackId(track)),
            embedding: Some(embedding.clone()),
        }],
    }
}

async fn publish_all(log: &MemoryEventLog, events: &[DetectionEvent]) {
    let producer = log.producer();
    for event in events {
        producer
            .publish(
                DETECTIONS_TOPIC,
                event.camera_id.as_str(),
                &event.to_json().unwrap(),
            )
            .await
            .unwrap();
    }
}

fn config(
    kinds: &[(&str, CameraKind)],
    travel: &[(&str, &str, f64)],
    scan_every: u64,
) -> ResolverConfig {
    let camera_kinds: HashMap<CameraId, CameraKind> = kinds
        .iter()
        .map(|(id, kind)| (CameraId::new(*id), *kind))
        .collect();
    let mut travel_times = trinetra_config_data::TravelTimeMatrix::default();
    for (from, to, seconds) in travel {
        travel_times.insert(CameraId::new(*from), CameraId::new(*to), *seconds);
    }
    let mut cfg = ResolverConfig::new(
        trinetra_config_data::Tuning::default(),
        camera_kinds,
        travel_times,
    );
    cfg.false_merge_scan_every = scan_every;
    cfg
}

struct RunningResolver {
    handle: tokio::task::JoinHandle<Result<(), trinetra_resolve::ResolveError>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
}

fn spawn_resolver(
    log: &MemoryEventLog,
    gallery: &MemoryGallery,
    consumer: MemoryConsumer,
    cfg: ResolverConfig,
) -> RunningResolver {
    let resolver = Resolver::new(
        Arc::new(gallery.clone()),
        Arc::new(log.producer()),
        Box::new(consumer),
        cfg,
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(resolver.run(shutdown_rx));
    RunningResolver {
        handle,
        shutdown_tx,
    }
}

async fn wait_identities(log: &MemoryEventLog, want: usize) {
    for _ in 0..500 {
        if log.topic_len(IDENTITIES_TOPIC) >= want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "identities topic never reached {want} events (got {})",
        log.topic_len(IDENTITIES_TOPIC)
    );
}

impl RunningResolver {
    async fn stop(self) {
        self.shutdown_tx.send(true).unwrap();
        self.handle.await.unwrap().unwrap();
    }
}

/// Run a resolver over the log until `want` identity events exist, then
/// shut it down and return the identities sorted by effective timestamp.
async fn run_until(
    log: &MemoryEventLog,
    gallery: &MemoryGallery,
    consumer: MemoryConsumer,
    cfg: ResolverConfig,
    want: usize,
) -> Vec<IdentityEvent> {
    let running = spawn_resolver(log, gallery, consumer, cfg);
    wait_identities(log, want).await;
    running.stop().await;
    identities(log)
}

fn identities(log: &MemoryEventLog) -> Vec<IdentityEvent> {
    let mut events: Vec<IdentityEvent> = log
        .drain_payloads(IDENTITIES_TOPIC)
        .iter()
        .map(|p| IdentityEvent::from_json(p).unwrap())
        .collect();
    events.sort_by(|a, b| a.effective_ts.partial_cmp(&b.effective_ts).unwrap());
    events
}

fn alerts(log: &MemoryEventLog) -> Vec<AlertEvent> {
    log.drain_payloads(ALERTS_TOPIC)
        .iter()
        .map(|p| AlertEvent::from_json(p).unwrap())
        .collect()
}

#[tokio::test]
async fn scenario_clean_match_confirms_on_fifth_sighting() {
    let log = MemoryEventLog::new();
    let gallery = MemoryGallery::new();
    let e_a = Embedding::unit_in_dim(0);
    gallery.insert(CustomerId::new("cust_a"), e_a.clone(), GalleryPayload::default());

    let events: Vec<DetectionEvent> = (0..5)
        .map(|i| detection_event("entrance", 1, 1000.0 + i as f64 * 0.1, &e_a))
        .collect();
    publish_all(&log, &events).await;

    let got = run_until(
        &log,
        &gallery,
        log.consumer(GROUP, &[DETECTIONS_TOPIC]),
        config(&[("entrance", CameraKind::Entrance)], &[], 100),
        5,
    )
    .await;

    assert_eq!(got.len(), 5);
    for event in &got[..4] {
        assert_eq!(event.source, IdentitySource::InsufficientHistory);
        assert!(event.customer_id.is_unknown());
    }
    let fifth = &got[4];
    assert_eq!(fifth.source, IdentitySource::Matched);
    assert_eq!(fifth.customer_id, CustomerId::new("cust_a"));
    assert!(fifth.confidence >= 0.99);
}

#[tokio::test]
async fn scenario_gate_rejects_impossible_transition() {
    let log = MemoryEventLog::new();
    let gallery = MemoryGallery::new();
    let e_b = Embedding::unit_in_dim(1);
    gallery.insert(CustomerId::new("cust_b"), e_b.clone(), GalleryPayload::default());

    let running = spawn_resolver(
        &log,
        &gallery,
        log.consumer(GROUP, &[DETECTIONS_TOPIC]),
        config(
            &[
                ("entrance", CameraKind::Entrance),
                ("billing", CameraKind::Billing),
            ],
            &[("billing", "entrance", 25.0)],
            100,
        ),
    );

    // Five billing sightings put cust_b in the registry at t=1500...
    let seed: Vec<DetectionEvent> = (0..5)
        .map(|i| detection_event("billing", 7, 1499.6 + i as f64 * 0.1, &e_b))
        .collect();
    publish_all(&log, &seed).await;
    wait_identities(&log, 5).await;

    // ...then an entrance sighting only 10 seconds later, against a
    // 25-second (22.5 derated) walk.
    publish_all(&log, &[detection_event("entrance", 1, 1510.0, &e_b)]).await;
    wait_identities(&log, 6).await;
    running.stop().await;

    let got = identities(&log);
    assert_eq!(got.len(), 6);
    assert_eq!(got[4].source, IdentitySource::Matched);
    let gated = &got[5];
    assert_eq!(gated.camera_id, CameraId::new("entrance"));
    assert_eq!(gated.source, IdentitySource::GatedUnknown);
    assert!(gated.customer_id.is_unknown());
}

#[tokio::test]
async fn scenario_ann_outage_holds_offsets_and_replays() {
    let log = MemoryEventLog::new();
    let gallery = MemoryGallery::new();
    let e_a = Embedding::unit_in_dim(0);
    gallery.insert(CustomerId::new("cust_a"), e_a.clone(), GalleryPayload::default());
    gallery.set_unavailable(true);

    let events: Vec<DetectionEvent> = (0..5)
        .map(|i| detection_event("entrance", 1, 2000.0 + i as f64 * 0.1, &e_a))
        .collect();
    publish_all(&log, &events).await;

    let during_outage = run_until(
        &log,
        &gallery,
        log.consumer(GROUP, &[DETECTIONS_TOPIC]),
        config(&[("entrance", CameraKind::Entrance)], &[], 100),
        5,
    )
    .await;
    assert_eq!(during_outage.len(), 5);
    for event in &during_outage {
        assert_eq!(event.source, IdentitySource::QdrantUnavailable);
        assert!(event.customer_id.is_unknown());
    }
    // Nothing was committed: a fresh member of the group still sees the
    // whole backlog.
    use event_log::EventConsumer as _;
    let probe = log.consumer(GROUP, &[DETECTIONS_TOPIC]);
    assert_eq!(probe.lag().await.unwrap(), Some(5));

    // Recovery: a restarted resolver replays the same detections and now
    // resolves them for real.
    gallery.set_unavailable(false);
    let consumer = log.consumer(GROUP, &[DETECTIONS_TOPIC]);
    consumer.reset_to_committed();
    let after_recovery = run_until(
        &log,
        &gallery,
        consumer,
        config(&[("entrance", CameraKind::Entrance)], &[], 100),
        10,
    )
    .await;
    assert_eq!(after_recovery.len(), 10);
    let replayed: Vec<&IdentityEvent> = after_recovery
        .iter()
        .filter(|e| e.source != IdentitySource::QdrantUnavailable)
        .collect();
    assert_eq!(replayed.len(), 5);
    assert_eq!(replayed[4].source, IdentitySource::Matched);
    assert_eq!(replayed[4].customer_id, CustomerId::new("cust_a"));

    let probe = log.consumer(GROUP, &[DETECTIONS_TOPIC]);
    assert_eq!(probe.lag().await.unwrap(), Some(0));
}

#[tokio::test]
async fn scenario_false_merge_suspected_across_cameras() {
    let log = MemoryEventLog::new();
    let gallery = MemoryGallery::new();
    let e_z = Embedding::unit_in_dim(2);
    gallery.insert(CustomerId::new("cust_z"), e_z.clone(), GalleryPayload::default());

    let running = spawn_resolver(
        &log,
        &gallery,
        log.consumer(GROUP, &[DETECTIONS_TOPIC]),
        config(
            &[
                ("entrance", CameraKind::Entrance),
                ("billing", CameraKind::Billing),
            ],
            &[("entrance", "billing", 25.0)],
            1, // scan after every event so the test observes the alert
        ),
    );

    // cust_z resolves on the entrance camera around t=2000.
    let seed: Vec<DetectionEvent> = (0..5)
        .map(|i| detection_event("entrance", 1, 1999.6 + i as f64 * 0.1, &e_z))
        .collect();
    publish_all(&log, &seed).await;
    wait_identities(&log, 5).await;

    // One second later the same face shows up at billing on another track.
    publish_all(&log, &[detection_event("billing", 9, 2001.0, &e_z)]).await;
    wait_identities(&log, 6).await;
    running.stop().await;

    // The teleporting assignment itself is refused...
    let got = identities(&log);
    let last = got.last().unwrap();
    assert_eq!(last.source, IdentitySource::GatedUnknown);

    // ...and the reverse-index scan raises the false-merge alarm.
    let false_merges: Vec<AlertEvent> = alerts(&log)
        .into_iter()
        .filter(|a| a.kind == AlertKind::FalseMergeSuspect)
        .collect();
    assert!(!false_merges.is_empty());
    let alert = &false_merges[0];
    assert_eq!(alert.customer_id, Some(CustomerId::new("cust_z")));
    assert_eq!(alert.camera_id, CameraId::new("billing"));
}

#[tokio::test]
async fn unknown_at_billing_raises_alert() {
    let log = MemoryEventLog::new();
    let gallery = MemoryGallery::new(); // empty gallery: nobody matches

    publish_all(
        &log,
        &[detection_event(
            "billing",
            3,
            3000.0,
            &Embedding::unit_in_dim(4),
        )],
    )
    .await;

    run_until(
        &log,
        &gallery,
        log.consumer(GROUP, &[DETECTIONS_TOPIC]),
        config(&[("billing", CameraKind::Billing)], &[], 100),
        1,
    )
    .await;

    let billing_alerts: Vec<AlertEvent> = alerts(&log)
        .into_iter()
        .filter(|a| a.kind == AlertKind::UnknownAtBilling)
        .collect();
    assert_eq!(billing_alerts.len(), 1);
    assert_eq!(billing_alerts[0].severity, trinetra_types::Severity::High);
    assert_eq!(billing_alerts[0].details["track_id"], 3);
}

#[tokio::test]
async fn vip_match_raises_alert() {
    let log = MemoryEventLog::new();
    let gallery = MemoryGallery::new();
    let e_v = Embedding::unit_in_dim(5);
    gallery.insert(
        CustomerId::new("cust_vip"),
        e_v.clone(),
        GalleryPayload {
            vip: true,
            metadata: Default::default(),
        },
    );

    let events: Vec<DetectionEvent> = (0..5)
        .map(|i| detection_event("entrance", 2, 4000.0 + i as f64 * 0.1, &e_v))
        .collect();
    publish_all(&log, &events).await;

    run_until(
        &log,
        &gallery,
        log.consumer(GROUP, &[DETECTIONS_TOPIC]),
        config(&[("entrance", CameraKind::Entrance)], &[], 100),
        5,
    )
    .await;

    let vip_alerts: Vec<AlertEvent> = alerts(&log)
        .into_iter()
        .filter(|a| a.kind == AlertKind::VipDetected)
        .collect();
    assert_eq!(vip_alerts.len(), 1);
    assert_eq!(vip_alerts[0].customer_id, Some(CustomerId::new("cust_vip")));
}

#[tokio::test]
async fn replay_of_identical_input_is_deterministic() {
    let e_a = Embedding::unit_in_dim(0);
    let e_b = Embedding::unit_in_dim(1);
    let mut events = Vec::new();
    for i in 0..5 {
        events.push(detection_event("entrance", 1, 5000.0 + i as f64 * 0.2, &e_a));
        events.push(detection_event("tracking", 2, 5000.1 + i as f64 * 0.2, &e_b));
    }

    let mut runs: Vec<Vec<IdentityEvent>> = Vec::new();
    for _ in 0..2 {
        let log = MemoryEventLog::new();
        let gallery = MemoryGallery::new();
        gallery.insert(CustomerId::new("cust_a"), e_a.clone(), GalleryPayload::default());
        gallery.insert(CustomerId::new("cust_b"), e_b.clone(), GalleryPayload::default());
        publish_all(&log, &events).await;
        let got = run_until(
            &log,
            &gallery,
            log.consumer(GROUP, &[DETECTIONS_TOPIC]),
            config(
                &[
                    ("entrance", CameraKind::Entrance),
                    ("tracking", CameraKind::Tracking),
                ],
                &[],
                100,
            ),
            10,
        )
        .await;
        runs.push(got);
    }
    assert_eq!(runs[0], runs[1]);
}

#[tokio::test]
async fn malformed_events_are_skipped_and_committed() {
    let log = MemoryEventLog::new();
    let gallery = MemoryGallery::new();
    let producer = log.producer();
    producer
        .publish(DETECTIONS_TOPIC, "cam_01", b"{ not json")
        .await
        .unwrap();
    let e = Embedding::unit_in_dim(0);
    publish_all(&log, &[detection_event("cam_01", 1, 6000.0, &e)]).await;

    run_until(
        &log,
        &gallery,
        log.consumer(GROUP, &[DETECTIONS_TOPIC]),
        config(&[("cam_01", CameraKind::Tracking)], &[], 100),
        1,
    )
    .await;

    // Both records committed: the bad one skipped, the good one processed.
    use event_log::EventConsumer as _;
    let probe = log.consumer(GROUP, &[DETECTIONS_TOPIC]);
    assert_eq!(probe.lag().await.unwrap(), Some(0));
    assert_eq!(log.topic_len(IDENTITIES_TOPIC), 1);
}
