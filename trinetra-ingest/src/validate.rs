/// Why a decoded frame was rejected before sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDefect {
    /// Mean pixel value below 2: signal lost or lens covered.
    Dark,
    /// Mean pixel value above 253: blown out or test pattern.
    Saturated,
    /// Pixel standard deviation below 5: uniform content, likely a frozen
    /// or corrupted decode.
    LowVariance,
}

impl FrameDefect {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameDefect::Dark => "dark",
            FrameDefect::Saturated => "saturated",
            FrameDefect::LowVariance => "low_variance",
        }
    }
}

const MEAN_MIN: f64 = 2.0;
const MEAN_MAX: f64 = 253.0;
const STDDEV_MIN: f64 = 5.0;

/// Cheap whole-frame statistics gate. Runs on the raw interleaved RGB bytes
/// before any further work is spent on the frame.
pub fn validate_frame(pixels: &[u8]) -> Result<(), FrameDefect> {
    if pixels.is_empty() {
        return Err(FrameDefect::LowVariance);
    }
    let n = pixels.len() as f64;
    let mut sum = 0u64;
    let mut sum_sq = 0u64;
    for &p in pixels {
        sum += u64::from(p);
        sum_sq += u64::from(p) * u64::from(p);
    }
    let mean = sum as f64 / n;
    if mean < MEAN_MIN {
        return Err(FrameDefect::Dark);
    }
    if mean > MEAN_MAX {
        return Err(FrameDefect::Saturated);
    }
    let variance = sum_sq as f64 / n - mean * mean;
    if variance.max(0.0).sqrt() < STDDEV_MIN {
        return Err(FrameDefect::LowVariance);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_black_frame() {
        assert_eq!(validate_frame(&[0u8; 1024]), Err(FrameDefect::Dark));
    }

    #[test]
    fn rejects_blown_out_frame() {
        assert_eq!(validate_frame(&[255u8; 1024]), Err(FrameDefect::Saturated));
    }

    #[test]
    fn rejects_uniform_frame() {
        assert_eq!(
            validate_frame(&[128u8; 1024]),
            Err(FrameDefect::LowVariance)
        );
    }

    #[test]
    fn accepts_textured_frame() {
        let pixels: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        assert_eq!(validate_frame(&pixels), Ok(()));
    }
}
