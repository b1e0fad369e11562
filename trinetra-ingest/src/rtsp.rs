use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

use trinetra_types::Timestamp;

use crate::IngestError;

/// One decoded RGB frame from a camera source.
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
    /// Camera-reported capture time, when the source can provide one.
    pub frame_ts: Option<Timestamp>,
}

/// Blocking source of decoded frames. The RTSP implementation lives on a
/// dedicated reader thread; tests substitute scripted sources.
pub trait FrameSource: Send {
    fn read(&mut self) -> Result<RawFrame, IngestError>;
}

/// Deadline for one RTSP read before the connection is considered dead.
const READ_TIMEOUT: gst::ClockTime = gst::ClockTime::from_seconds(5);

/// RTSP over TCP decoded through gstreamer, scaled to 640x640 RGB in the
/// pipeline. `drop-on-latency` plus a single-buffer appsink keep the decoder
/// preferring freshness over completeness.
pub struct RtspSource {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

impl RtspSource {
    pub fn open(url: &str, side: u32) -> Result<Self, IngestError> {
        gst::init().map_err(|e| IngestError::SourceOpen(e.to_string()))?;
        let pipeline_str = format!(
            "rtspsrc location=\"{url}\" protocols=tcp latency=100 drop-on-latency=true ! \
             rtph264depay ! h264parse ! avdec_h264 ! \
             videoconvert ! videoscale method=bilinear ! \
             video/x-raw,format=RGB,width={side},height={side} ! \
             appsink name=sink max-buffers=1 drop=true sync=false"
        );
        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| IngestError::SourceOpen(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| IngestError::SourceOpen("not a pipeline".into()))?;
        let appsink = pipeline
            .by_name("sink")
            .and_then(|e| e.dynamic_cast::<gst_app::AppSink>().ok())
            .ok_or_else(|| IngestError::SourceOpen("missing appsink".into()))?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| IngestError::SourceOpen(e.to_string()))?;
        Ok(Self { pipeline, appsink })
    }
}

impl FrameSource for RtspSource {
    fn read(&mut self) -> Result<RawFrame, IngestError> {
        let sample = self
            .appsink
            .try_pull_sample(READ_TIMEOUT)
            .ok_or(IngestError::SourceTimeout)?;
        let caps = sample
            .caps()
            .ok_or_else(|| IngestError::SourceRead("sample without caps".into()))?;
        let structure = caps
            .structure(0)
            .ok_or_else(|| IngestError::SourceRead("caps without structure".into()))?;
        let width = structure
            .get::<i32>("width")
            .map_err(|e| IngestError::SourceRead(e.to_string()))? as u32;
        let height = structure
            .get::<i32>("height")
            .map_err(|e| IngestError::SourceRead(e.to_string()))? as u32;
        let buffer = sample
            .buffer()
            .ok_or_else(|| IngestError::SourceRead("sample without buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| IngestError::SourceRead(e.to_string()))?;
        Ok(RawFrame {
            width,
            height,
            rgb: map.as_slice().to_vec(),
            // RTP timestamps are pipeline-relative, not wall clock, so no
            // camera-reported time is claimed here.
            frame_ts: None,
        })
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
