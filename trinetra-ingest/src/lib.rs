//! Stream ingestor: owns all RTSP-decoder state and presents a clean frame
//! stream on the frame bus. No inference happens here.
//!
//! One independent task group runs per camera, sharing nothing with its
//! siblings: a blocking reader thread (the only place a thread blocks on
//! network I/O) hands decoded frames over a bounded queue to an async task
//! that validates, samples, suppresses bursts, JPEG-encodes and publishes.
//! All per-camera state is lost on restart; tracker state on the inference
//! side carries the system through an ingestor restart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use frame_bus::FrameBus;
use trinetra_config_data::CameraConfig;
use trinetra_types::{CameraId, Frame, FrameIndex, FrameMeta, Timestamp, FRAME_SIDE};

mod backoff;
mod bucket;
mod motion;
mod rtsp;
mod sampler;
mod validate;

pub use backoff::ReconnectBackoff;
pub use bucket::TokenBucket;
pub use motion::MotionEstimator;
pub use rtsp::{FrameSource, RawFrame, RtspSource};
pub use sampler::AdaptiveSampler;
pub use validate::{validate_frame, FrameDefect};

/// Capacity of the in-process queue between the reader thread and the
/// publisher task.
const READER_QUEUE_CAP: usize = 30;

#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error("failed to open source: {0}")]
    SourceOpen(String),
    #[error("source read timed out")]
    SourceTimeout,
    #[error("source read failed: {0}")]
    SourceRead(String),
    #[error("jpeg encode failed: {0}")]
    Encode(String),
    #[error("{source}")]
    Bus {
        #[from]
        source: frame_bus::FrameBusError,
    },
}

/// Creates a fresh source on every (re)connect attempt.
pub type SourceFactory = Box<dyn Fn() -> Result<Box<dyn FrameSource>, IngestError> + Send>;

pub fn describe_metrics() {
    metrics::describe_counter!(
        "frames_ingested",
        metrics::Unit::Count,
        "Frames published to the frame bus"
    );
    metrics::describe_counter!(
        "frames_dropped",
        metrics::Unit::Count,
        "Frames dropped, labelled by reason"
    );
    metrics::describe_counter!(
        "reconnects",
        metrics::Unit::Count,
        "RTSP reconnect attempts"
    );
    metrics::describe_gauge!(
        "stream_fill_ratio",
        "Frame bus fill ratio per camera stream"
    );
    metrics::describe_histogram!(
        "frame_latency",
        metrics::Unit::Seconds,
        "Decode-to-publish latency"
    );
}

fn drop_frame(camera: &str, reason: &'static str) {
    metrics::counter!("frames_dropped", "camera_id" => camera.to_string(), "reason" => reason)
        .increment(1);
}

/// Spawn one supervisor task per configured camera.
pub fn spawn_cameras(
    cameras: &[CameraConfig],
    bus: Arc<dyn FrameBus>,
    shutdown: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    cameras
        .iter()
        .cloned()
        .map(|cam| {
            let bus = bus.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let url = cam.url.clone();
                let factory: SourceFactory = Box::new(move || {
                    Ok(Box::new(RtspSource::open(&url, FRAME_SIDE)?) as Box<dyn FrameSource>)
                });
                run_camera(cam, bus, factory, shutdown).await;
            })
        })
        .collect()
}

/// Drive one camera until shutdown. Owns the full per-camera pipeline:
/// reader thread, validator, motion estimator, adaptive sampler, token
/// bucket, JPEG encoder, bus publisher.
pub async fn run_camera(
    cfg: CameraConfig,
    bus: Arc<dyn FrameBus>,
    factory: SourceFactory,
    mut shutdown: watch::Receiver<bool>,
) {
    let camera = cfg.id.clone();
    let cam_label = camera.as_str().to_string();
    let (tx, mut rx) = mpsc::channel::<RawFrame>(READER_QUEUE_CAP);
    let stop = Arc::new(AtomicBool::new(false));
    let reader = spawn_reader(camera.clone(), factory, tx, stop.clone());

    let mut sampler = AdaptiveSampler::new(1, cfg.kind.exempt_from_sampling());
    let mut bucket = TokenBucket::new(cfg.target_fps);
    let mut motion = MotionEstimator::new();
    let mut frame_index = FrameIndex::default();

    tracing::info!(camera = %camera, kind = ?cfg.kind, "camera pipeline started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            maybe_raw = rx.recv() => {
                let Some(raw) = maybe_raw else { break };
                let ingest_ts = Timestamp::now();

                if let Err(defect) = validate_frame(&raw.rgb) {
                    drop_frame(&cam_label, defect.as_str());
                    continue;
                }

                let motion_score = motion.score(&raw.rgb, raw.width, raw.height);
                let fill = bus.fill_ratio(&camera).await.unwrap_or(0.0);
                metrics::gauge!("stream_fill_ratio", "camera_id" => cam_label.clone()).set(fill);

                if !sampler.admit(fill, motion_score) {
                    drop_frame(&cam_label, "sampled");
                    continue;
                }
                if !bucket.try_acquire() {
                    drop_frame(&cam_label, "burst");
                    continue;
                }

                let frame = match encode_frame(&camera, frame_index, ingest_ts, raw) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(camera = %camera, error = %e, "frame encode failed");
                        drop_frame(&cam_label, "encode");
                        continue;
                    }
                };
                match bus.publish(&frame).await {
                    Ok(_entry) => {
                        frame_index = frame_index.next();
                        metrics::counter!("frames_ingested", "camera_id" => cam_label.clone())
                            .increment(1);
                        metrics::histogram!("frame_latency", "camera_id" => cam_label.clone())
                            .record(Timestamp::now().seconds_since(ingest_ts).max(0.0));
                    }
                    Err(e) => {
                        // The bus already counted the drop; the frame is gone.
                        tracing::warn!(camera = %camera, error = %e, "frame publish failed");
                    }
                }
            }
        }
    }

    stop.store(true, Ordering::Relaxed);
    drop(rx);
    let _ = tokio::task::spawn_blocking(move || {
        let _ = reader.join();
    })
    .await;
    tracing::info!(camera = %camera, "camera pipeline stopped");
}

fn spawn_reader(
    camera: CameraId,
    factory: SourceFactory,
    tx: mpsc::Sender<RawFrame>,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    let cam_label = camera.as_str().to_string();
    std::thread::Builder::new()
        .name(format!("rtsp-{camera}"))
        .spawn(move || {
            let mut backoff = ReconnectBackoff::new();
            'outer: while !stop.load(Ordering::Relaxed) {
                let mut source = match factory() {
                    Ok(source) => source,
                    Err(e) => {
                        tracing::warn!(camera = %camera, error = %e, "source open failed");
                        metrics::counter!("reconnects", "camera_id" => cam_label.clone())
                            .increment(1);
                        sleep_with_stop(&stop, backoff.next_delay());
                        continue;
                    }
                };
                loop {
                    if stop.load(Ordering::Relaxed) {
                        break 'outer;
                    }
                    match source.read() {
                        Ok(raw) => {
                            backoff.reset();
                            if tx.blocking_send(raw).is_err() {
                                break 'outer;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(camera = %camera, error = %e, "source read failed, reconnecting");
                            metrics::counter!("reconnects", "camera_id" => cam_label.clone())
                                .increment(1);
                            sleep_with_stop(&stop, backoff.next_delay());
                            continue 'outer;
                        }
                    }
                }
            }
        })
        .expect("spawn rtsp reader thread")
}

/// Sleep that wakes early once the stop flag is raised, so shutdown is not
/// held hostage by a 30s reconnect backoff.
fn sleep_with_stop(stop: &AtomicBool, total: std::time::Duration) {
    let slice = std::time::Duration::from_millis(50);
    let mut remaining = total;
    while !stop.load(Ordering::Relaxed) && remaining > std::time::Duration::ZERO {
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
}

fn encode_frame(
    camera_id: &CameraId,
    frame_index: FrameIndex,
    ingest_ts: Timestamp,
    raw: RawFrame,
) -> Result<Frame, IngestError> {
    let frame_ts = raw.frame_ts;
    let img = to_square_rgb(raw)?;
    let mut jpeg = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 85);
    encoder
        .encode_image(&img)
        .map_err(|e| IngestError::Encode(e.to_string()))?;
    Ok(Frame {
        meta: FrameMeta {
            camera_id: camera_id.clone(),
            frame_index,
            ingest_ts,
            frame_ts,
        },
        jpeg: bytes::Bytes::from(jpeg),
    })
}

/// The gstreamer pipeline already scales to 640x640; this is the fallback
/// for sources that deliver other geometries.
fn to_square_rgb(raw: RawFrame) -> Result<image::RgbImage, IngestError> {
    let img = image::RgbImage::from_raw(raw.width, raw.height, raw.rgb)
        .ok_or_else(|| IngestError::Encode("buffer size does not match geometry".into()))?;
    if raw.width == FRAME_SIDE && raw.height == FRAME_SIDE {
        Ok(img)
    } else {
        Ok(image::imageops::resize(
            &img,
            FRAME_SIDE,
            FRAME_SIDE,
            image::imageops::FilterType::Triangle,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_bus::MemoryFrameBus;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use trinetra_types::CameraKind;

    struct ScriptedSource {
        frames: VecDeque<RawFrame>,
    }

    impl FrameSource for ScriptedSource {
        fn read(&mut self) -> Result<RawFrame, IngestError> {
            self.frames
                .pop_front()
                .ok_or_else(|| IngestError::SourceRead("script exhausted".into()))
        }
    }

    fn textured(side: u32, seed: u8) -> RawFrame {
        let mut rgb = vec![0u8; (side * side * 3) as usize];
        for (i, px) in rgb.iter_mut().enumerate() {
            *px = ((i as u32).wrapping_mul(31).wrapping_add(u32::from(seed) * 7) % 211) as u8;
        }
        RawFrame {
            width: side,
            height: side,
            rgb,
            frame_ts: None,
        }
    }

    fn black(side: u32) -> RawFrame {
        RawFrame {
            width: side,
            height: side,
            rgb: vec![0u8; (side * side * 3) as usize],
            frame_ts: None,
        }
    }

    fn scripted_factory(frames: Vec<RawFrame>) -> SourceFactory {
        let frames = Mutex::new(Some(frames));
        Box::new(move || match frames.lock().take() {
            Some(frames) => Ok(Box::new(ScriptedSource {
                frames: frames.into(),
            }) as Box<dyn FrameSource>),
            None => Err(IngestError::SourceOpen("script finished".into())),
        })
    }

    fn camera(kind: CameraKind) -> CameraConfig {
        CameraConfig {
            id: CameraId::new("cam_01"),
            url: "rtsp://192.0.2.1:554/stream1".into(),
            kind,
            target_fps: 30.0,
            priority_tier: 2,
        }
    }

    async fn wait_for_length(bus: &MemoryFrameBus, cam: &CameraId, want: usize) {
        for _ in 0..200 {
            if bus.length(cam).await.unwrap() >= want {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("bus never reached {want} entries");
    }

    #[tokio::test]
    async fn publishes_valid_frames_with_increasing_indices() {
        let bus = Arc::new(MemoryFrameBus::new(100));
        let cam = camera(CameraKind::Tracking);
        let frames = vec![textured(64, 1), black(64), textured(64, 2), textured(64, 3)];
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_camera(
            cam.clone(),
            bus.clone(),
            scripted_factory(frames),
            shutdown_rx,
        ));

        wait_for_length(&bus, &cam.id, 3).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let entries = bus
            .consume("test", "t", &[cam.id.frame_stream_key()], 10, 0)
            .await
            .unwrap();
        assert_eq!(entries.len(), 3, "black frame must be dropped");
        let indices: Vec<u64> = entries.iter().map(|e| e.meta.frame_index.0).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        // Published payloads decode back to 640x640 JPEG.
        let decoded = image::load_from_memory(&entries[0].jpeg).unwrap();
        assert_eq!(decoded.width(), FRAME_SIDE);
        assert_eq!(decoded.height(), FRAME_SIDE);
    }

    #[tokio::test]
    async fn shutdown_stops_idle_pipeline() {
        let bus = Arc::new(MemoryFrameBus::new(100));
        let cam = camera(CameraKind::Tracking);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_camera(
            cam,
            bus,
            scripted_factory(Vec::new()),
            shutdown_rx,
        ));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("pipeline must honor shutdown promptly")
            .unwrap();
    }
}
