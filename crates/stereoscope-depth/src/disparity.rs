//! Dense disparity estimation on rectified pairs.

use crate::sgm::{SgmMatcher, SgmParams};
use crate::DepthError;
use image::GrayImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use stereoscope_core::{ImageSize, PixelRect};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Horizontal disparity in pixels; non-finite entries carry no match.
#[derive(Clone, Debug, PartialEq)]
pub struct DisparityMap {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl DisparityMap {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![f32::NAN; width as usize * height as usize],
        }
    }

    pub fn from_vec(width: u32, height: u32, data: Vec<f32>) -> Result<Self, DepthError> {
        let size = ImageSize::new(width, height);
        if data.len() != size.area() {
            return Err(DepthError::InvalidParams(format!(
                "disparity buffer holds {} values, {}x{} needs {}",
                data.len(),
                width,
                height,
                size.area()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    #[inline]
    pub fn size(&self) -> ImageSize {
        ImageSize::new(self.width, self.height)
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Valid disparity at `(x, y)`.
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let d = self.data[y as usize * self.width as usize + x as usize];
        d.is_finite().then_some(d)
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|d| d.is_finite()).count()
    }

    /// Copy out a sub-rectangle, aligned with [`stereoscope_core::DepthMap::crop`].
    pub fn crop(&self, rect: PixelRect) -> Result<DisparityMap, DepthError> {
        if rect.is_empty() || !rect.fits(self.size()) {
            return Err(DepthError::InvalidParams(format!(
                "crop {rect:?} outside {}x{} disparity map",
                self.width, self.height
            )));
        }
        let w = self.width as usize;
        let mut data = Vec::with_capacity(rect.size().area());
        for y in rect.y as usize..rect.y as usize + rect.height as usize {
            let start = y * w + rect.x as usize;
            data.extend_from_slice(&self.data[start..start + rect.width as usize]);
        }
        DisparityMap::from_vec(rect.width, rect.height, data)
    }

    /// Invalidate small blobs. Four-connected neighbours whose disparities
    /// differ by at most `max_diff` share a blob; blobs of at most
    /// `max_size` pixels are cleared. Returns the number of cleared pixels.
    pub fn filter_speckles(&mut self, max_size: usize, max_diff: f32) -> usize {
        let w = self.width as usize;
        let h = self.height as usize;
        let mut seen = vec![false; w * h];
        let mut stack = Vec::new();
        let mut blob = Vec::new();
        let mut removed = 0usize;

        for start in 0..w * h {
            if seen[start] || !self.data[start].is_finite() {
                continue;
            }
            seen[start] = true;
            stack.push(start);
            blob.clear();
            let data = &self.data;
            while let Some(i) = stack.pop() {
                blob.push(i);
                let (x, y) = (i % w, i / w);
                let d = data[i];
                let mut visit = |j: usize| {
                    if !seen[j] && data[j].is_finite() && (data[j] - d).abs() <= max_diff {
                        seen[j] = true;
                        stack.push(j);
                    }
                };
                if x > 0 {
                    visit(i - 1);
                }
                if x + 1 < w {
                    visit(i + 1);
                }
                if y > 0 {
                    visit(i - w);
                }
                if y + 1 < h {
                    visit(i + w);
                }
            }
            if blob.len() <= max_size {
                for &i in &blob {
                    self.data[i] = f32::NAN;
                }
                removed += blob.len();
            }
        }
        removed
    }
}

/// Produces a left-referenced disparity map from a rectified grey pair.
pub trait StereoMatcher {
    fn compute(&self, left: &GrayImage, right: &GrayImage) -> Result<DisparityMap, DepthError>;
}

/// Parameters of [`BlockMatcher`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockMatcherParams {
    pub min_disparity: i32,
    /// Size of the disparity search range.
    pub num_disparities: u32,
    /// Odd side length of the matching window.
    pub block_size: u32,
    /// Percent margin the best cost must win by against any non-adjacent
    /// candidate.
    pub uniqueness_ratio: u32,
    /// Maximum allowed left-right disagreement in pixels; `None` skips the check.
    pub disp12_max_diff: Option<u32>,
    /// Fit a parabola through the cost minimum.
    pub subpixel: bool,
    /// Match rows on the rayon pool.
    pub parallel: bool,
}

impl Default for BlockMatcherParams {
    fn default() -> Self {
        Self {
            min_disparity: 0,
            num_disparities: 128,
            block_size: 5,
            uniqueness_ratio: 10,
            disp12_max_diff: Some(1),
            subpixel: true,
            parallel: true,
        }
    }
}

/// Sum-of-absolute-differences block matcher.
#[derive(Clone, Debug, Default)]
pub struct BlockMatcher {
    params: BlockMatcherParams,
}

impl BlockMatcher {
    pub fn new(params: BlockMatcherParams) -> Result<Self, DepthError> {
        if params.block_size == 0 || params.block_size % 2 == 0 {
            return Err(DepthError::InvalidParams(format!(
                "block_size must be odd and positive, got {}",
                params.block_size
            )));
        }
        if params.num_disparities == 0 {
            return Err(DepthError::InvalidParams(
                "num_disparities must be positive".into(),
            ));
        }
        Ok(Self { params })
    }

    pub fn params(&self) -> &BlockMatcherParams {
        &self.params
    }

    /// Disparities of `base` against `other`, where a match at disparity `d`
    /// sits at `x + dir * d` in `other`.
    fn match_image(&self, base: &GrayImage, other: &GrayImage, dir: i64) -> Vec<f32> {
        let w = base.width() as usize;
        let mut out = vec![f32::NAN; base.as_raw().len()];
        if w == 0 {
            return out;
        }
        if self.params.parallel {
            out.par_chunks_mut(w)
                .enumerate()
                .for_each(|(y, row)| self.match_row(base, other, dir, y, row));
        } else {
            out.chunks_mut(w)
                .enumerate()
                .for_each(|(y, row)| self.match_row(base, other, dir, y, row));
        }
        out
    }

    fn match_row(&self, base: &GrayImage, other: &GrayImage, dir: i64, y: usize, row: &mut [f32]) {
        let p = &self.params;
        let nd = p.num_disparities as usize;
        let Some(cost) = sad_row(base, other, dir, y, p.block_size, p.min_disparity, nd) else {
            return;
        };
        for (x, out) in row.iter_mut().enumerate() {
            *out = winner_take_all(
                &cost[x * nd..(x + 1) * nd],
                p.min_disparity,
                p.uniqueness_ratio,
                p.subpixel,
            );
        }
    }
}

/// Block SAD of row `y` for every column and candidate, laid out as
/// `cost[x * nd + di]`; `u32::MAX` marks windows that leave either image.
/// `None` when the window does not fit vertically.
pub(crate) fn sad_row(
    base: &GrayImage,
    other: &GrayImage,
    dir: i64,
    y: usize,
    block_size: u32,
    min_disparity: i32,
    nd: usize,
) -> Option<Vec<u32>> {
    let w = base.width() as usize;
    let h = base.height() as usize;
    let block = block_size as usize;
    let half = block / 2;
    if y < half || y + half >= h || w < block {
        return None;
    }
    let b = base.as_raw();
    let o = other.as_raw();

    let mut cost = vec![u32::MAX; w * nd];
    let mut col = vec![0u32; w];
    for di in 0..nd {
        let d = min_disparity as i64 + di as i64;
        let shift = dir * d;
        // columns whose counterpart lies inside `other`
        let lo = (-shift).max(0) as usize;
        let hi = (w as i64 - shift).min(w as i64).max(0) as usize;
        if hi <= lo || hi - lo < block {
            continue;
        }
        for (x, c) in col.iter_mut().enumerate().take(hi).skip(lo) {
            let xo = (x as i64 + shift) as usize;
            let mut s = 0u32;
            for yy in y - half..=y + half {
                let r = yy * w;
                s += (b[r + x] as i32 - o[r + xo] as i32).unsigned_abs();
            }
            *c = s;
        }
        let mut sum: u32 = col[lo..lo + block].iter().sum();
        for x in lo + half..hi - half {
            cost[x * nd + di] = sum;
            if x + half + 1 < hi {
                sum += col[x + half + 1];
                sum -= col[x - half];
            }
        }
    }
    Some(cost)
}

/// Winner-take-all over one pixel's cost curve; `u32::MAX` entries are
/// not candidates.
pub(crate) fn winner_take_all(
    costs: &[u32],
    min_disparity: i32,
    uniqueness_ratio: u32,
    subpixel: bool,
) -> f32 {
    let Some((best, &min)) = costs
        .iter()
        .enumerate()
        .filter(|(_, c)| **c != u32::MAX)
        .min_by_key(|(_, c)| **c)
    else {
        return f32::NAN;
    };

    let margin = min as u64 * (100 + uniqueness_ratio as u64);
    let ambiguous = costs
        .iter()
        .enumerate()
        .any(|(i, &c)| c != u32::MAX && i.abs_diff(best) > 1 && (c as u64) * 100 <= margin);
    if ambiguous {
        return f32::NAN;
    }

    let mut d = (min_disparity as i64 + best as i64) as f32;
    if subpixel && best > 0 && best + 1 < costs.len() {
        let (l, r) = (costs[best - 1], costs[best + 1]);
        if l != u32::MAX && r != u32::MAX {
            let denom = l as f32 - 2.0 * min as f32 + r as f32;
            if denom > 0.0 {
                d += 0.5 * (l as f32 - r as f32) / denom;
            }
        }
    }
    d
}

impl StereoMatcher for BlockMatcher {
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
        let mut disp = self.match_image(left, right, -1);

        if let Some(max_diff) = self.params.disp12_max_diff {
            let back = self.match_image(right, left, 1);
            let rejected = left_right_check(&mut disp, &back, w as usize, max_diff);
            log::debug!("left-right check rejected {rejected} matches");
        }

        DisparityMap::from_vec(w, h, disp)
    }
}

/// Clear left disparities whose right-view counterpart disagrees by more
/// than `max_diff` pixels. Returns the number of cleared matches.
pub(crate) fn left_right_check(disp: &mut [f32], back: &[f32], w: usize, max_diff: u32) -> usize {
    let mut rejected = 0usize;
    for (y, row) in disp.chunks_mut(w).enumerate() {
        for (x, d) in row.iter_mut().enumerate() {
            if !d.is_finite() {
                continue;
            }
            let xr = x as i64 - d.round() as i64;
            let consistent = xr >= 0
                && (xr as usize) < w
                && back[y * w + xr as usize].is_finite()
                && (back[y * w + xr as usize] - *d).abs() <= max_diff as f32;
            if !consistent {
                *d = f32::NAN;
                rejected += 1;
            }
        }
    }
    rejected
}

/// Which matcher a configuration asks for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatcherParams {
    Sgm(SgmParams),
    Block(BlockMatcherParams),
}

impl Default for MatcherParams {
    fn default() -> Self {
        Self::Sgm(SgmParams::default())
    }
}

/// A configured matcher of either kind.
#[derive(Clone, Debug)]
pub enum Matcher {
    Sgm(SgmMatcher),
    Block(BlockMatcher),
}

impl Matcher {
    pub fn new(params: MatcherParams) -> Result<Self, DepthError> {
        Ok(match params {
            MatcherParams::Sgm(p) => Self::Sgm(SgmMatcher::new(p)?),
            MatcherParams::Block(p) => Self::Block(BlockMatcher::new(p)?),
        })
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::Sgm(SgmMatcher::default())
    }
}

impl StereoMatcher for Matcher {
    fn compute(&self, left: &GrayImage, right: &GrayImage) -> Result<DisparityMap, DepthError> {
        match self {
            Self::Sgm(m) => m.compute(left, right),
            Self::Block(m) => m.compute(left, right),
        }
    }
}
