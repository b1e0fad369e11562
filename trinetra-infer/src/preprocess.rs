//! CPU-side tensor preparation: JPEG decode, NCHW assembly, face crops.

use image::RgbImage;

use trinetra_types::{FACE_CROP_SIDE, FRAME_SIDE};

use crate::operators::TensorBatch;
use crate::InferError;

/// Decode one JPEG frame to RGB. A failure here is input corruption: the
/// caller acks and drops the frame rather than retrying into the same error.
pub fn decode_jpeg(jpeg: &[u8]) -> Result<RgbImage, InferError> {
    let img = image::load_from_memory(jpeg)
        .map_err(|e| InferError::Decode(e.to_string()))?;
    Ok(img.to_rgb8())
}

/// Assemble decoded frames into a `(B, 3, 640, 640)` batch scaled to [0, 1].
pub fn frames_to_batch(frames: &[RgbImage]) -> TensorBatch {
    let side = FRAME_SIDE as usize;
    let mut data = Vec::with_capacity(frames.len() * 3 * side * side);
    for frame in frames {
        push_chw(&mut data, frame, |v| f32::from(v) / 255.0);
    }
    TensorBatch {
        data,
        batch: frames.len(),
        channels: 3,
        height: side,
        width: side,
    }
}

/// Crop the face region of a detection, resize to 112x112 and normalize
/// `(x - 127.5) / 127.5`. Returns `None` for degenerate boxes.
pub fn face_crop(frame: &RgbImage, bbox: [f32; 4]) -> Option<RgbImage> {
    let (w, h) = (frame.width() as f32, frame.height() as f32);
    let x1 = bbox[0].clamp(0.0, w - 1.0);
    let y1 = bbox[1].clamp(0.0, h - 1.0);
    let x2 = bbox[2].clamp(0.0, w);
    let y2 = bbox[3].clamp(0.0, h);
    let cw = (x2 - x1) as u32;
    let ch = (y2 - y1) as u32;
    if cw < 4 || ch < 4 {
        return None;
    }
    let cropped =
        image::imageops::crop_imm(frame, x1 as u32, y1 as u32, cw, ch).to_image();
    Some(image::imageops::resize(
        &cropped,
        FACE_CROP_SIDE,
        FACE_CROP_SIDE,
        image::imageops::FilterType::Triangle,
    ))
}

/// Assemble face crops into a `(C, 3, 112, 112)` embedder batch.
pub fn crops_to_batch(crops: &[RgbImage]) -> TensorBatch {
    let side = FACE_CROP_SIDE as usize;
    let mut data = Vec::with_capacity(crops.len() * 3 * side * side);
    for crop in crops {
        push_chw(&mut data, crop, |v| (f32::from(v) - 127.5) / 127.5);
    }
    TensorBatch {
        data,
        batch: crops.len(),
        channels: 3,
        height: side,
        width: side,
    }
}

fn push_chw<F: Fn(u8) -> f32>(data: &mut Vec<f32>, img: &RgbImage, normalize: F) {
    let raw = img.as_raw();
    for channel in 0..3 {
        for px in raw.chunks_exact(3) {
            data.push(normalize(px[channel]));
        }
    }
}
