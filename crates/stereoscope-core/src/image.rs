//! Pixel containers shared by the correction, depth and measurement crates.
//!
//! Colour frames use `image::RgbImage`. Metric depth lives in [`DepthMap`],
//! a row-major `f32` buffer in millimetres where any value that is not
//! finite or not strictly positive means "no depth".

use image::RgbImage;
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

/// Errors produced when building or slicing pixel containers.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ImageError {
    #[error("buffer size mismatch (expected {expected} values, got {got})")]
    SizeMismatch { expected: usize, got: usize },
    #[error("image has zero area ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("rectangle {rect:?} does not fit inside a {width}x{height} image")]
    RectOutOfBounds {
        rect: PixelRect,
        width: u32,
        height: u32,
    },
}

/// Image dimensions in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn of(img: &RgbImage) -> Self {
        Self::new(img.width(), img.height())
    }

    #[inline]
    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// True when the continuous coordinate lies on a pixel of this image.
    #[inline]
    pub fn contains(&self, p: Point2<f64>) -> bool {
        p.x >= 0.0 && p.y >= 0.0 && p.x < self.width as f64 && p.y < self.height as f64
    }

    /// Per-axis factor mapping coordinates of `self` onto `other`.
    pub fn scale_to(&self, other: ImageSize) -> Vector2<f64> {
        Vector2::new(
            other.width as f64 / self.width.max(1) as f64,
            other.height as f64 / self.height.max(1) as f64,
        )
    }

    pub fn diagonal(&self) -> f64 {
        (self.width as f64).hypot(self.height as f64)
    }
}

/// Axis-aligned pixel rectangle (OpenCV `Rect` semantics).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full(size: ImageSize) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[inline]
    pub fn origin(&self) -> Vector2<f64> {
        Vector2::new(self.x as f64, self.y as f64)
    }

    #[inline]
    pub fn size(&self) -> ImageSize {
        ImageSize::new(self.width, self.height)
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    /// True when the rectangle lies entirely inside an image of `size`.
    pub fn fits(&self, size: ImageSize) -> bool {
        self.x >= 0
            && self.y >= 0
            && self.right() <= size.width as i64
            && self.bottom() <= size.height as i64
    }

    /// Intersection with the image bounds; may be empty.
    pub fn clamp_to(&self, size: ImageSize) -> PixelRect {
        let x0 = (self.x as i64).clamp(0, size.width as i64);
        let y0 = (self.y as i64).clamp(0, size.height as i64);
        let x1 = self.right().clamp(0, size.width as i64);
        let y1 = self.bottom().clamp(0, size.height as i64);
        PixelRect::new(
            x0 as i32,
            y0 as i32,
            (x1 - x0).max(0) as u32,
            (y1 - y0).max(0) as u32,
        )
    }

    /// Largest rectangle of aspect `aspect_w:aspect_h` centred inside `size`.
    pub fn centered_aspect(size: ImageSize, aspect_w: u32, aspect_h: u32) -> PixelRect {
        if size.is_empty() || aspect_w == 0 || aspect_h == 0 {
            return PixelRect::full(size);
        }
        let target = aspect_w as f64 / aspect_h as f64;
        let current = size.width as f64 / size.height as f64;
        if current > target {
            let w = (size.height as f64 * target).round() as u32;
            let x = (size.width - w.min(size.width)) / 2;
            PixelRect::new(x as i32, 0, w.min(size.width), size.height)
        } else {
            let h = (size.width as f64 / target).round() as u32;
            let y = (size.height - h.min(size.height)) / 2;
            PixelRect::new(0, y as i32, size.width, h.min(size.height))
        }
    }
}

/// Copy a rectangle out of a colour image.
pub fn crop_rgb(img: &RgbImage, rect: PixelRect) -> Result<RgbImage, ImageError> {
    let size = ImageSize::of(img);
    if rect.is_empty() || !rect.fits(size) {
        return Err(ImageError::RectOutOfBounds {
            rect,
            width: size.width,
            height: size.height,
        });
    }
    Ok(image::imageops::crop_imm(img, rect.x as u32, rect.y as u32, rect.width, rect.height)
        .to_image())
}

/// `true` for depth samples that carry information.
#[inline]
pub fn is_valid_depth(value: f32) -> bool {
    value.is_finite() && value > 0.0
}

/// Result of a nearest-valid depth search.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NearestDepth {
    pub x: u32,
    pub y: u32,
    pub depth_mm: f32,
}

/// Dense metric depth in millimetres.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthMap {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl DepthMap {
    /// A map of the given size where every pixel is invalid.
    pub fn new(width: u32, height: u32) -> Self {
        Self::filled(width, height, f32::NAN)
    }

    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self {
            width,
            height,
            data: vec![value; width as usize * height as usize],
        }
    }

    pub fn from_vec(width: u32, height: u32, data: Vec<f32>) -> Result<Self, ImageError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(ImageError::SizeMismatch {
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Build a map by evaluating `f(x, y)` for every pixel.
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> f32) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn size(&self) -> ImageSize {
        ImageSize::new(self.width, self.height)
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    #[inline]
    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    /// Raw stored value; panics outside the image like slice indexing.
    #[inline]
    pub fn raw(&self, x: u32, y: u32) -> f32 {
        self.data[self.index(x, y)]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: f32) {
        let idx = self.index(x, y);
        self.data[idx] = value;
    }

    /// Valid depth at an integer pixel, `None` for holes and out-of-range.
    pub fn get(&self, x: i64, y: i64) -> Option<f32> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        let v = self.raw(x as u32, y as u32);
        is_valid_depth(v).then_some(v)
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| is_valid_depth(**v)).count()
    }

    /// Minimum and maximum valid depth.
    pub fn valid_range(&self) -> Option<(f32, f32)> {
        let mut it = self.data.iter().copied().filter(|v| is_valid_depth(*v));
        let first = it.next()?;
        Some(it.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
    }

    /// Bilinear sample that only blends valid neighbours.
    pub fn sample_bilinear(&self, x: f64, y: f64) -> Option<f32> {
        let x0 = x.floor() as i64;
        let y0 = y.floor() as i64;
        let fx = (x - x0 as f64) as f32;
        let fy = (y - y0 as f64) as f32;

        let taps = [
            (x0, y0, (1.0 - fx) * (1.0 - fy)),
            (x0 + 1, y0, fx * (1.0 - fy)),
            (x0, y0 + 1, (1.0 - fx) * fy),
            (x0 + 1, y0 + 1, fx * fy),
        ];
        let mut acc = 0.0f32;
        let mut wsum = 0.0f32;
        for (tx, ty, w) in taps {
            if w <= 0.0 {
                continue;
            }
            if let Some(v) = self.get(tx, ty) {
                acc += v * w;
                wsum += w;
            }
        }
        (wsum > 1e-6).then(|| acc / wsum)
    }

    /// Closest valid pixel within a square window of half-size `radius`.
    ///
    /// Rings are visited outwards; the search stops as soon as no further
    /// ring can hold a closer pixel. Ties resolve to the larger depth.
    /// With `radius == 0` only the target pixel itself is considered.
    pub fn nearest_valid(&self, x: i64, y: i64, radius: u32) -> Option<NearestDepth> {
        if let Some(v) = self.get(x, y) {
            return Some(NearestDepth {
                x: x as u32,
                y: y as u32,
                depth_mm: v,
            });
        }

        let mut best: Option<(i64, NearestDepth)> = None;
        for r in 1..=radius as i64 {
            for dy in -r..=r {
                for dx in -r..=r {
                    if dx.abs() != r && dy.abs() != r {
                        continue;
                    }
                    let Some(v) = self.get(x + dx, y + dy) else {
                        continue;
                    };
                    let d2 = dx * dx + dy * dy;
                    let better = match &best {
                        None => true,
                        Some((bd2, b)) => d2 < *bd2 || (d2 == *bd2 && v > b.depth_mm),
                    };
                    if better {
                        best = Some((
                            d2,
                            NearestDepth {
                                x: (x + dx) as u32,
                                y: (y + dy) as u32,
                                depth_mm: v,
                            },
                        ));
                    }
                }
            }
            if let Some((bd2, _)) = &best {
                if *bd2 < (r + 1) * (r + 1) {
                    break;
                }
            }
        }
        best.map(|(_, n)| n)
    }

    /// Copy out a sub-rectangle.
    pub fn crop(&self, rect: PixelRect) -> Result<DepthMap, ImageError> {
        if rect.is_empty() || !rect.fits(self.size()) {
            return Err(ImageError::RectOutOfBounds {
                rect,
                width: self.width,
                height: self.height,
            });
        }
        let mut data = Vec::with_capacity(rect.size().area());
        for y in rect.y as u32..rect.y as u32 + rect.height {
            let start = self.index(rect.x as u32, y);
            data.extend_from_slice(&self.data[start..start + rect.width as usize]);
        }
        DepthMap::from_vec(rect.width, rect.height, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_rejects_wrong_length() {
        let err = DepthMap::from_vec(4, 4, vec![1.0; 15]).unwrap_err();
        assert_eq!(
            err,
            ImageError::SizeMismatch {
                expected: 16,
                got: 15
            }
        );
    }

    #[test]
    fn invalid_values_are_holes() {
        let mut map = DepthMap::filled(3, 3, 100.0);
        map.set(0, 0, 0.0);
        map.set(1, 0, -5.0);
        map.set(2, 0, f32::INFINITY);
        assert_eq!(map.get(0, 0), None);
        assert_eq!(map.get(1, 0), None);
        assert_eq!(map.get(2, 0), None);
        assert_eq!(map.get(1, 1), Some(100.0));
        assert_eq!(map.get(-1, 1), None);
        assert_eq!(map.valid_count(), 6);
    }

    #[test]
    fn nearest_valid_radius_zero_is_the_pixel_itself() {
        let mut map = DepthMap::new(5, 5);
        map.set(2, 2, 42.0);
        assert_eq!(map.nearest_valid(2, 2, 0).map(|n| n.depth_mm), Some(42.0));
        assert_eq!(map.nearest_valid(1, 2, 0), None);
    }

    #[test]
    fn nearest_valid_prefers_euclidean_closest() {
        let mut map = DepthMap::new(9, 9);
        // corner of ring 2 (distance sqrt(8)) vs edge of ring 2 (distance 2)
        map.set(6, 6, 10.0);
        map.set(4, 6, 20.0);
        let hit = map.nearest_valid(4, 4, 3).unwrap();
        assert_eq!((hit.x, hit.y, hit.depth_mm), (4, 6, 20.0));
    }

    #[test]
    fn nearest_valid_breaks_ties_towards_larger_depth() {
        let mut map = DepthMap::new(5, 5);
        map.set(1, 2, 300.0);
        map.set(3, 2, 500.0);
        let hit = map.nearest_valid(2, 2, 2).unwrap();
        assert_eq!(hit.depth_mm, 500.0);
    }

    #[test]
    fn nearest_valid_respects_radius() {
        let mut map = DepthMap::new(9, 9);
        map.set(8, 8, 1.0);
        assert!(map.nearest_valid(0, 0, 7).is_none());
        assert!(map.nearest_valid(0, 0, 8).is_some());
    }

    #[test]
    fn bilinear_skips_holes() {
        let mut map = DepthMap::filled(2, 2, 100.0);
        map.set(1, 0, f32::NAN);
        let v = map.sample_bilinear(0.5, 0.0).unwrap();
        assert!((v - 100.0).abs() < 1e-4);
    }

    #[test]
    fn crop_copies_rows() {
        let map = DepthMap::from_fn(4, 3, |x, y| (y * 10 + x) as f32 + 1.0);
        let c = map.crop(PixelRect::new(1, 1, 2, 2)).unwrap();
        assert_eq!(c.data(), &[12.0, 13.0, 22.0, 23.0]);
        assert!(map.crop(PixelRect::new(3, 0, 2, 1)).is_err());
    }

    #[test]
    fn centered_aspect_crop_for_three_by_four() {
        let r = PixelRect::centered_aspect(ImageSize::new(1280, 720), 3, 4);
        assert_eq!(r, PixelRect::new(370, 0, 540, 720));
        let tall = PixelRect::centered_aspect(ImageSize::new(300, 800), 3, 4);
        assert_eq!(tall, PixelRect::new(0, 200, 300, 400));
    }
}
