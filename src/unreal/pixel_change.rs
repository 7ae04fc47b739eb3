use anyhow::{Result, ensure};

use crate::model::PC_MAP;
use crate::{IMAGE_CHANNELS, IMAGE_LEN, IMAGE_SIZE};

const CROP: usize = 2;
const CELL: usize = 4;

/// Intensity change between two frames on the 20x20 pixel-control grid.
///
/// The absolute per-pixel difference is averaged over channels on the centre
/// 80x80 crop, then over 4x4 cells. Returns `PC_MAP * PC_MAP` values, row-major.
pub fn pixel_change(prev: &[f32], next: &[f32]) -> Result<Vec<f32>> {
    ensure!(
        prev.len() == IMAGE_LEN && next.len() == IMAGE_LEN,
        "pixel change expects two {IMAGE_LEN}-value frames, got {} and {}",
        prev.len(),
        next.len()
    );
    let plane = IMAGE_SIZE * IMAGE_SIZE;
    let mut out = vec![0f32; PC_MAP * PC_MAP];
    for y in 0..PC_MAP * CELL {
        for x in 0..PC_MAP * CELL {
            let offset = (y + CROP) * IMAGE_SIZE + x + CROP;
            let diff: f32 = (0..IMAGE_CHANNELS)
                .map(|c| (next[c * plane + offset] - prev[c * plane + offset]).abs())
                .sum();
            out[(y / CELL) * PC_MAP + x / CELL] += diff;
        }
    }
    let norm = (IMAGE_CHANNELS * CELL * CELL) as f32;
    out.iter_mut().for_each(|v| *v /= norm);
    Ok(out)
}
