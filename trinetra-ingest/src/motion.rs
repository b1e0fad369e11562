//! Cheap inter-frame motion score.
//!
//! Dense optical flow approximated by block matching on a downsampled luma
//! plane: the frame is reduced to [GRID]x[GRID] luma, split into 8x8 blocks,
//! and each block is searched within a +/-[SEARCH] pixel window of the
//! previous frame. The score is the mean displacement magnitude over all
//! blocks, scaled back to full-resolution pixels so the sampler threshold is
//! resolution independent.

const GRID: usize = 160;
const BLOCK: usize = 8;
const SEARCH: isize = 3;

pub struct MotionEstimator {
    prev: Option<Vec<u8>>,
}

impl Default for MotionEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionEstimator {
    pub fn new() -> Self {
        Self { prev: None }
    }

    /// Score motion between this frame and the previous call. The first
    /// frame scores 0.0.
    pub fn score(&mut self, rgb: &[u8], width: u32, height: u32) -> f32 {
        let luma = downsample_luma(rgb, width as usize, height as usize);
        let score = match &self.prev {
            None => 0.0,
            Some(prev) => {
                let scale = width as f32 / GRID as f32;
                mean_block_displacement(prev, &luma) * scale
            }
        };
        self.prev = Some(luma);
        score
    }
}

/// Box-filter the interleaved RGB image down to a GRID x GRID luma plane.
fn downsample_luma(rgb: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut out = vec![0u8; GRID * GRID];
    if width == 0 || height == 0 {
        return out;
    }
    for gy in 0..GRID {
        for gx in 0..GRID {
            let x0 = gx * width / GRID;
            let x1 = ((gx + 1) * width / GRID).max(x0 + 1).min(width);
            let y0 = gy * height / GRID;
            let y1 = ((gy + 1) * height / GRID).max(y0 + 1).min(height);
            let mut acc = 0u32;
            let mut count = 0u32;
            for y in y0..y1 {
                for x in x0..x1 {
                    let i = (y * width + x) * 3;
                    if i + 2 < rgb.len() {
                        // Integer Rec.601 luma.
                        let l = 299 * u32::from(rgb[i])
                            + 587 * u32::from(rgb[i + 1])
                            + 114 * u32::from(rgb[i + 2]);
                        acc += l / 1000;
                        count += 1;
                    }
                }
            }
            if count > 0 {
                out[gy * GRID + gx] = (acc / count) as u8;
            }
        }
    }
    out
}

fn sad(prev: &[u8], cur: &[u8], bx: usize, by: usize, dx: isize, dy: isize) -> Option<u32> {
    let mut total = 0u32;
    for y in 0..BLOCK {
        for x in 0..BLOCK {
            let cx = (bx * BLOCK + x) as isize;
            let cy = (by * BLOCK + y) as isize;
            let px = cx + dx;
            let py = cy + dy;
            if px < 0 || py < 0 || px >= GRID as isize || py >= GRID as isize {
                return None;
            }
            let c = cur[cy as usize * GRID + cx as usize];
            let p = prev[py as usize * GRID + px as usize];
            total += u32::from(c.abs_diff(p));
        }
    }
    Some(total)
}

fn mean_block_displacement(prev: &[u8], cur: &[u8]) -> f32 {
    let blocks = GRID / BLOCK;
    let mut total_mag = 0.0f32;
    let mut counted = 0u32;
    for by in 0..blocks {
        for bx in 0..blocks {
            let mut best = match sad(prev, cur, bx, by, 0, 0) {
                Some(s) => s,
                None => continue,
            };
            let mut best_d = (0isize, 0isize);
            // Zero-motion blocks shortcut: a perfect hold needs no search.
            if best > 0 {
                for dy in -SEARCH..=SEARCH {
                    for dx in -SEARCH..=SEARCH {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        if let Some(s) = sad(prev, cur, bx, by, dx, dy) {
                            if s < best {
                                best = s;
                                best_d = (dx, dy);
                            }
                        }
                    }
                }
            }
            let (dx, dy) = best_d;
            total_mag += ((dx * dx + dy * dy) as f32).sqrt();
            counted += 1;
        }
    }
    if counted == 0 {
        0.0
    } else {
        total_mag / counted as f32
    }
}
