//! Semi-global matching: block costs smoothed along scanline paths.
//!
//! Each path carries `L(p, d) = C(p, d) + min(L(p-r, d), L(p-r, d±1) + P1,
//! min_k L(p-r, k) + P2) - min_k L(p-r, k)` and the paths are summed before
//! the winner is picked. The whole `width * height * num_disparities`
//! volume is held twice as `u16`.

use crate::disparity::{left_right_check, sad_row, winner_take_all};
use crate::{DepthError, DisparityMap, StereoMatcher};
use image::GrayImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use stereoscope_core::ImageSize;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Volume entry for a window that leaves either image.
const NO_COST: u16 = u16::MAX;

/// Largest block whose SAD still fits below [`NO_COST`].
const MAX_BLOCK: u32 = 15;

/// Scanline directions summed into the volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SgmPaths {
    /// Horizontal and vertical.
    Four,
    /// Horizontal, vertical and diagonal.
    Eight,
}

impl SgmPaths {
    fn directions(self) -> &'static [(i64, i64)] {
        const ALL: [(i64, i64); 8] = [
            (1, 0),
            (-1, 0),
            (0, 1),
            (0, -1),
            (1, 1),
            (-1, 1),
            (1, -1),
            (-1, -1),
        ];
        match self {
            Self::Four => &ALL[..4],
            Self::Eight => &ALL,
        }
    }
}

/// Parameters of [`SgmMatcher`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgmParams {
    pub min_disparity: i32,
    /// Size of the disparity search range.
    pub num_disparities: u32,
    /// Odd side length of the matching window, at most 15.
    pub block_size: u32,
    /// Penalty for a one-pixel disparity step along a path;
    /// `None` uses `8 * block_size²`.
    pub p1: Option<u32>,
    /// Penalty for larger jumps; `None` uses `32 * block_size²`.
    pub p2: Option<u32>,
    pub paths: SgmPaths,
    /// Percent margin the best aggregated cost must win by against any
    /// non-adjacent candidate.
    pub uniqueness_ratio: u32,
    /// Maximum allowed left-right disagreement in pixels; `None` skips the check.
    pub disp12_max_diff: Option<u32>,
    /// Blobs of at most this many pixels are cleared; 0 turns the filter off.
    pub speckle_window_size: u32,
    /// Disparity step in pixels that splits two blobs.
    pub speckle_range: f32,
    /// Fit a parabola through the cost minimum.
    pub subpixel: bool,
    /// Build the cost volume and pick winners on the rayon pool.
    pub parallel: bool,
}

impl Default for SgmParams {
    fn default() -> Self {
        Self {
            min_disparity: 0,
            num_disparities: 128,
            block_size: 5,
            p1: None,
            p2: None,
            paths: SgmPaths::Eight,
            uniqueness_ratio: 10,
            disp12_max_diff: Some(1),
            speckle_window_size: 100,
            speckle_range: 32.0,
            subpixel: true,
            parallel: true,
        }
    }
}

impl SgmParams {
    fn penalties(&self) -> (u32, u32) {
        let area = self.block_size * self.block_size;
        (
            self.p1.unwrap_or(8 * area),
            self.p2.unwrap_or(32 * area),
        )
    }
}

/// Semi-global matcher over block SAD costs.
#[derive(Clone, Debug)]
pub struct SgmMatcher {
    params: SgmParams,
    p1: u32,
    p2: u32,
}

impl Default for SgmMatcher {
    fn default() -> Self {
        let params = SgmParams::default();
        let (p1, p2) = params.penalties();
        Self { params, p1, p2 }
    }
}

impl SgmMatcher {
    pub fn new(params: SgmParams) -> Result<Self, DepthError> {
        if params.block_size == 0 || params.block_size % 2 == 0 || params.block_size > MAX_BLOCK {
            return Err(DepthError::InvalidParams(format!(
                "block_size must be odd and in 1..={MAX_BLOCK}, got {}",
                params.block_size
            )));
        }
        if params.num_disparities == 0 {
            return Err(DepthError::InvalidParams(
                "num_disparities must be positive".into(),
            ));
        }
        let (p1, p2) = params.penalties();
        if p1 >= p2 {
            return Err(DepthError::InvalidParams(format!(
                "p1 must be below p2, got {p1} and {p2}"
            )));
        }
        if !(params.speckle_range.is_finite() && params.speckle_range >= 0.0) {
            return Err(DepthError::InvalidParams(format!(
                "speckle_range must be non-negative, got {}",
                params.speckle_range
            )));
        }
        Ok(Self { params, p1, p2 })
    }

    pub fn params(&self) -> &SgmParams {
        &self.params
    }

    /// Left-referenced block SAD for every pixel and candidate.
    fn cost_volume(&self, left: &GrayImage, right: &GrayImage) -> Vec<u16> {
        let w = left.width() as usize;
        let nd = self.params.num_disparities as usize;
        let mut volume = vec![NO_COST; left.as_raw().len() * nd];
        if w == 0 {
            return volume;
        }
        let fill = |(y, row): (usize, &mut [u16])| {
            let p = &self.params;
            if let Some(cost) = sad_row(left, right, -1, y, p.block_size, p.min_disparity, nd) {
                for (v, &c) in row.iter_mut().zip(&cost) {
                    *v = if c == u32::MAX { NO_COST } else { c as u16 };
                }
            }
        };
        if self.params.parallel {
            volume.par_chunks_mut(w * nd).enumerate().for_each(fill);
        } else {
            volume.chunks_mut(w * nd).enumerate().for_each(fill);
        }
        volume
    }

    fn aggregate(&self, volume: &[u16], w: usize, h: usize) -> Vec<u16> {
        let mut sum = vec![0u16; volume.len()];
        for &(dx, dy) in self.params.paths.directions() {
            self.aggregate_path(volume, &mut sum, w, h, dx, dy);
        }
        sum
    }

    /// Add one path's costs to `sum`, sweeping so that `(x - dx, y - dy)`
    /// is always visited before `(x, y)`.
    fn aggregate_path(
        &self,
        volume: &[u16],
        sum: &mut [u16],
        w: usize,
        h: usize,
        dx: i64,
        dy: i64,
    ) {
        let nd = self.params.num_disparities as usize;
        let block = self.params.block_size;
        let max_cost = block * block * 255;
        let (p1, p2) = (self.p1, self.p2);

        let mut prev = vec![0u32; w * nd];
        let mut cur = vec![0u32; w * nd];
        let mut prev_min = vec![0u32; w];
        let mut cur_min = vec![0u32; w];
        let mut last = vec![0u32; nd];

        let rows: Vec<usize> = if dy >= 0 {
            (0..h).collect()
        } else {
            (0..h).rev().collect()
        };
        let cols: Vec<usize> = if dx >= 0 {
            (0..w).collect()
        } else {
            (0..w).rev().collect()
        };

        for &y in &rows {
            let py = y as i64 - dy;
            let row_has_prev = py >= 0 && py < h as i64;
            for &x in &cols {
                let px = x as i64 - dx;
                let from = if px >= 0 && px < w as i64 && row_has_prev {
                    let px = px as usize;
                    let (src, mins) = if dy == 0 {
                        (&cur, &cur_min)
                    } else {
                        (&prev, &prev_min)
                    };
                    last.copy_from_slice(&src[px * nd..(px + 1) * nd]);
                    Some(mins[px])
                } else {
                    None
                };

                let base = (y * w + x) * nd;
                let costs = &volume[base..base + nd];
                let out = &mut cur[x * nd..(x + 1) * nd];
                let mut lowest = u32::MAX;
                for d in 0..nd {
                    let c = match costs[d] {
                        NO_COST => max_cost,
                        c => c as u32,
                    };
                    let l = match from {
                        None => c,
                        Some(m) => {
                            let mut best = last[d].min(m.saturating_add(p2));
                            if d > 0 {
                                best = best.min(last[d - 1].saturating_add(p1));
                            }
                            if d + 1 < nd {
                                best = best.min(last[d + 1].saturating_add(p1));
                            }
                            c.saturating_add(best - m)
                        }
                    };
                    out[d] = l;
                    lowest = lowest.min(l);
                    let s = &mut sum[base + d];
                    *s = s.saturating_add(l.min(u16::MAX as u32) as u16);
                }
                cur_min[x] = lowest;
            }
            std::mem::swap(&mut prev, &mut cur);
            std::mem::swap(&mut prev_min, &mut cur_min);
        }
    }

    fn select(&self, volume: &[u16], sum: &[u16], w: usize) -> Vec<f32> {
        let nd = self.params.num_disparities as usize;
        let mut out = vec![f32::NAN; volume.len() / nd];
        if w == 0 {
            return out;
        }
        let pick = |(y, row): (usize, &mut [f32])| {
            let p = &self.params;
            let mut curve = vec![u32::MAX; nd];
            for (x, o) in row.iter_mut().enumerate() {
                let base = (y * w + x) * nd;
                for ((c, &v), &s) in curve
                    .iter_mut()
                    .zip(&volume[base..base + nd])
                    .zip(&sum[base..base + nd])
                {
                    *c = if v == NO_COST { u32::MAX } else { s as u32 };
                }
                *o = winner_take_all(&curve, p.min_disparity, p.uniqueness_ratio, p.subpixel);
            }
        };
        if self.params.parallel {
            out.par_chunks_mut(w).enumerate().for_each(pick);
        } else {
            out.chunks_mut(w).enumerate().for_each(pick);
        }
        out
    }

    /// Integer right-referenced disparities read off the same volume: the
    /// right pixel `xr` sees left pixel `xr + d` at candidate `d`.
    fn right_disparities(&self, volume: &[u16], sum: &[u16], w: usize) -> Vec<f32> {
        let nd = self.params.num_disparities as usize;
        let min_d = self.params.min_disparity as i64;
        let mut out = vec![f32::NAN; volume.len() / nd];
        if w == 0 {
            return out;
        }
        for (y, row) in out.chunks_mut(w).enumerate() {
            for (xr, o) in row.iter_mut().enumerate() {
                let mut best: Option<(u16, usize)> = None;
                for di in 0..nd {
                    let x = xr as i64 + min_d + di as i64;
                    if x < 0 || x >= w as i64 {
                        continue;
                    }
                    let i = (y * w + x as usize) * nd + di;
                    if volume[i] == NO_COST {
                        continue;
                    }
                    if best.map_or(true, |(c, _)| sum[i] < c) {
                        best = Some((sum[i], di));
                    }
                }
                if let Some((_, di)) = best {
                    *o = (min_d + di as i64) as f32;
                }
            }
        }
        out
    }
}

impl StereoMatcher for SgmMatcher {
    #[cfg_attr(
        feature = "tracing",
        instrument(
            level = "info",
            skip(self, left, right),
            fields(width = left.width(), height = left.height())
        )
    )]
    fn compute(&self, left: &GrayImage, right: &GrayImage) -> Result<DisparityMap, DepthError> {
        if left.dimensions() != right.dimensions() {
            return Err(DepthError::SizeMismatch {
                expected: ImageSize::new(left.width(), left.height()),
                got: ImageSize::new(right.width(), right.height()),
            });
        }
        let (w, h) = left.dimensions();
        let volume = self.cost_volume(left, right);
        let sum = self.aggregate(&volume, w as usize, h as usize);
        let mut disp = self.select(&volume, &sum, w as usize);

        if let Some(max_diff) = self.params.disp12_max_diff {
            let back = self.right_disparities(&volume, &sum, w as usize);
            let rejected = left_right_check(&mut disp, &back, w as usize, max_diff);
            log::debug!("left-right check rejected {rejected} matches");
        }

        let mut map = DisparityMap::from_vec(w, h, disp)?;
        if self.params.speckle_window_size > 0 {
            let cleared = map.filter_speckles(
                self.params.speckle_window_size as usize,
                self.params.speckle_range,
            );
            log::debug!("speckle filter cleared {cleared} pixels");
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disparity::tests::{shifted, textured};
    use crate::{BlockMatcher, BlockMatcherParams};
    use image::Luma;

    fn params() -> SgmParams {
        SgmParams {
            num_disparities: 16,
            ..SgmParams::default()
        }
    }

    #[test]
    fn recovers_constant_shift() {
        let left = textured(64, 32, 7);
        let right = shifted(&left, 6);
        let disp = SgmMatcher::new(params()).unwrap().compute(&left, &right).unwrap();
        assert!(disp.valid_count() > 64 * 20);
        for y in 4..28 {
            for x in 24..60 {
                if let Some(d) = disp.get(x, y) {
                    assert!((d - 6.0).abs() < 0.5, "({x},{y}) -> {d}");
                }
            }
        }
        assert!(disp.get(40, 16).is_some());
    }

    #[test]
    fn sequential_and_parallel_agree() {
        let left = textured(48, 24, 3);
        let right = shifted(&left, 4);
        let par = SgmMatcher::new(params()).unwrap().compute(&left, &right).unwrap();
        let seq = SgmMatcher::new(SgmParams {
            parallel: false,
            ..params()
        })
        .unwrap()
        .compute(&left, &right)
        .unwrap();
        assert_eq!(
            par.data().iter().map(|d| d.to_bits()).collect::<Vec<_>>(),
            seq.data().iter().map(|d| d.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn textureless_pair_is_ambiguous() {
        let flat = GrayImage::from_pixel(32, 16, Luma([128]));
        let disp = SgmMatcher::new(params()).unwrap().compute(&flat, &flat).unwrap();
        assert_eq!(disp.valid_count(), 0);
    }

    #[test]
    fn slanted_plane_has_fewer_holes_and_outliers_than_block_matching() {
        let (w, h) = (96u32, 48u32);
        let texture = textured(w, h, 0x9e37_79b9);
        let left_noise = textured(w, h, 0x7f4a_7c15);
        let right_noise = textured(w, h, 0x94d0_49bb);
        // weak texture, linearly resampled, under noise of the same strength
        let surface = |x: f32, y: u32| {
            let x = x.clamp(0.0, (w - 1) as f32);
            let x0 = x.floor() as u32;
            let x1 = (x0 + 1).min(w - 1);
            let t = x - x0 as f32;
            let a = texture.get_pixel(x0, y)[0] as f32 / 8.0;
            let b = texture.get_pixel(x1, y)[0] as f32 / 8.0;
            a + t * (b - a)
        };
        let left = GrayImage::from_fn(w, h, |x, y| {
            let v = 96.0 + surface(x as f32, y) + left_noise.get_pixel(x, y)[0] as f32 / 8.0;
            Luma([v as u8])
        });
        // right pixel xr sees the surface at xr + 4 + xr / 24
        let right = GrayImage::from_fn(w, h, |x, y| {
            let xs = x as f32 + 4.0 + x as f32 / 24.0;
            let v = 96.0 + surface(xs, y) + right_noise.get_pixel(x, y)[0] as f32 / 8.0;
            Luma([v as u8])
        });
        let truth = |x: u32| (96.0 + x as f32) / 25.0;
        let misses = |disp: &DisparityMap| {
            let mut n = 0;
            for y in 4..h - 4 {
                for x in 12..88 {
                    match disp.get(x, y) {
                        Some(d) if (d - truth(x)).abs() <= 1.0 => {}
                        _ => n += 1,
                    }
                }
            }
            n
        };

        let block = BlockMatcher::new(BlockMatcherParams {
            num_disparities: 16,
            ..BlockMatcherParams::default()
        })
        .unwrap()
        .compute(&left, &right)
        .unwrap();
        let sgm = SgmMatcher::new(params()).unwrap().compute(&left, &right).unwrap();

        let (block_misses, sgm_misses) = (misses(&block), misses(&sgm));
        assert!(
            sgm_misses < block_misses,
            "sgm missed {sgm_misses}, block matching {block_misses}"
        );
    }

    #[test]
    fn four_paths_also_recover_shift() {
        let left = textured(48, 24, 5);
        let right = shifted(&left, 3);
        let disp = SgmMatcher::new(SgmParams {
            paths: SgmPaths::Four,
            ..params()
        })
        .unwrap()
        .compute(&left, &right)
        .unwrap();
        assert!((disp.get(30, 12).unwrap() - 3.0).abs() < 0.5);
    }

    #[test]
    fn rejects_bad_params() {
        for block_size in [4, 17] {
            assert!(SgmMatcher::new(SgmParams {
                block_size,
                ..params()
            })
            .is_err());
        }
        assert!(SgmMatcher::new(SgmParams {
            p1: Some(500),
            p2: Some(100),
            ..params()
        })
        .is_err());
        let err = SgmMatcher::new(params())
            .unwrap()
            .compute(&textured(16, 16, 1), &textured(17, 16, 1))
            .unwrap_err();
        assert!(matches!(err, DepthError::SizeMismatch { .. }));
    }
}
