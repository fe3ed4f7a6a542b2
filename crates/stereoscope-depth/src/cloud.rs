//! Back-projected point cloud with a pixel to point index.

use crate::DepthError;
use image::{GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::io::Write;
use stereoscope_core::{flip_y, is_valid_depth, DepthMap, ImageSize, Intrinsics};

#[cfg(feature = "tracing")]
use tracing::instrument;

const NO_POINT: u32 = u32::MAX;

/// Offset scale for pixel keys in the k-d tree, in pixels.
const KEY_TIE_BREAK: f64 = 1e-4;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudOptions {
    /// Sample every `step`-th pixel in both directions.
    pub step: u32,
    /// Pixels at or beyond this depth are skipped.
    pub max_depth_mm: f32,
    /// Drop flying pixels at depth discontinuities.
    pub gradient_filter: bool,
    /// Sobel magnitude limit as a fraction of the largest observed depth.
    pub gradient_threshold: f32,
    /// Colour by depth (JET) instead of by the image.
    pub pseudo_color: bool,
}

impl Default for CloudOptions {
    fn default() -> Self {
        Self {
            step: 1,
            max_depth_mm: 10_000.0,
            gradient_filter: true,
            gradient_threshold: 0.05,
            pseudo_color: false,
        }
    }
}

/// Points in metres, Y up, translated so the bounding-box centre is the
/// origin. `offset` is the translation that was removed.
pub struct PointCloud {
    points: Vec<Point3<f32>>,
    colors: Vec<[u8; 3]>,
    pixels: Vec<[u32; 2]>,
    offset: Vector3<f64>,
    size: ImageSize,
    pixel_index: Vec<u32>,
    tree: KdTree<f64, 2>,
}

impl std::fmt::Debug for PointCloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointCloud")
            .field("len", &self.points.len())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl PointCloud {
    /// Back-project `depth` through `k`:
    /// `((u - cx) Z / fx, -(v - cy) Z / fy, Z) * 1e-3`.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(depth, color, k, opts), fields(w = depth.width(), h = depth.height()))
    )]
    pub fn build(
        depth: &DepthMap,
        color: Option<&RgbImage>,
        k: &Intrinsics,
        opts: &CloudOptions,
    ) -> Result<PointCloud, DepthError> {
        if !k.is_usable() {
            return Err(DepthError::BadIntrinsics);
        }
        if opts.step == 0 {
            return Err(DepthError::InvalidParams("step must be positive".into()));
        }
        let size = depth.size();
        if let Some(img) = color {
            if ImageSize::of(img) != size {
                return Err(DepthError::SizeMismatch {
                    expected: size,
                    got: ImageSize::of(img),
                });
            }
        }

        let keep = opts
            .gradient_filter
            .then(|| gradient_keep_mask(depth, opts.gradient_threshold));
        let range = depth.valid_range().map(|(lo, hi)| (lo, hi.min(opts.max_depth_mm)));

        let mut raw = Vec::new();
        let mut colors = Vec::new();
        let mut pixels = Vec::new();
        for v in (0..size.height).step_by(opts.step as usize) {
            for u in (0..size.width).step_by(opts.step as usize) {
                let z = depth.raw(u, v);
                if !is_valid_depth(z) || z >= opts.max_depth_mm {
                    continue;
                }
                if let Some(mask) = &keep {
                    if mask.get_pixel(u, v)[0] == 0 {
                        continue;
                    }
                }
                let p = flip_y(&k.back_project(u as f64, v as f64, z as f64)) * 1e-3;
                raw.push(p);
                pixels.push([u, v]);
                colors.push(match (color, opts.pseudo_color) {
                    (Some(img), false) => img.get_pixel(u, v).0,
                    _ => jet(normalise(z, range)),
                });
            }
        }

        let offset = aabb_centre(&raw).unwrap_or_else(Vector3::zeros);
        let points: Vec<Point3<f32>> = raw
            .iter()
            .map(|p| (p - offset).map(|c| c as f32))
            .collect();

        let mut pixel_index = vec![NO_POINT; size.area()];
        for (i, [u, v]) in pixels.iter().enumerate() {
            pixel_index[*v as usize * size.width as usize + *u as usize] = i as u32;
        }
        let keys: Vec<[f64; 2]> = pixels
            .iter()
            .enumerate()
            .map(|(i, [u, v])| {
                let (a, b) = tie_break(i);
                [*u as f64 + a, *v as f64 + b]
            })
            .collect();
        let tree: KdTree<f64, 2> = (&keys).into();

        log::info!(
            "point cloud: {} points from {} valid pixels (step {})",
            points.len(),
            depth.valid_count(),
            opts.step
        );
        Ok(PointCloud {
            points,
            colors,
            pixels,
            offset,
            size,
            pixel_index,
            tree,
        })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Centred points in metres.
    pub fn points(&self) -> &[Point3<f32>] {
        &self.points
    }

    pub fn colors(&self) -> &[[u8; 3]] {
        &self.colors
    }

    /// Source pixel `(u, v)` of every point.
    pub fn pixels(&self) -> &[[u32; 2]] {
        &self.pixels
    }

    /// Translation removed from every point, in metres.
    pub fn offset(&self) -> Vector3<f64> {
        self.offset
    }

    /// Size of the depth map the cloud was built from.
    pub fn image_size(&self) -> ImageSize {
        self.size
    }

    /// Point built from exactly pixel `(u, v)`.
    pub fn index_at_pixel(&self, u: u32, v: u32) -> Option<usize> {
        if u >= self.size.width || v >= self.size.height {
            return None;
        }
        let i = self.pixel_index[v as usize * self.size.width as usize + u as usize];
        (i != NO_POINT).then_some(i as usize)
    }

    /// Point whose source pixel is closest to `(u, v)`, if within
    /// `tolerance_px`.
    pub fn nearest_to_pixel(&self, u: f64, v: f64, tolerance_px: f64) -> Option<usize> {
        if self.is_empty() || !u.is_finite() || !v.is_finite() {
            return None;
        }
        let (ru, rv) = (u.round(), v.round());
        if ru >= 0.0 && rv >= 0.0 {
            if let Some(i) = self.index_at_pixel(ru as u32, rv as u32) {
                if (ru - u).hypot(rv - v) <= tolerance_px {
                    return Some(i);
                }
            }
        }
        let nn = self.tree.nearest_one::<SquaredEuclidean>(&[u, v]);
        let i = nn.item as usize;
        let [pu, pv] = *self.pixels.get(i)?;
        ((pu as f64 - u).hypot(pv as f64 - v) <= tolerance_px).then_some(i)
    }

    /// Point `i` in millimetres in the uncentred Y-up frame.
    pub fn point_mm(&self, i: usize) -> Option<Point3<f64>> {
        let p = self.points.get(i)?;
        Some(Point3::from((p.coords.map(f64::from) + self.offset) * 1e3))
    }

    /// Place a Y-up millimetre point into the centred cloud frame.
    pub fn to_cloud_frame(&self, p_mm: &Point3<f64>) -> Point3<f32> {
        Point3::from((p_mm.coords * 1e-3 - self.offset).map(|c| c as f32))
    }

    /// Axis-aligned bounds of the centred points.
    pub fn bounds(&self) -> Option<(Point3<f32>, Point3<f32>)> {
        let first = *self.points.first()?;
        Some(self.points.iter().fold((first, first), |(lo, hi), p| {
            (lo.inf(p), hi.sup(p))
        }))
    }

    /// Write the uncentred cloud as ASCII PLY.
    pub fn write_ply<W: Write>(&self, mut w: W) -> std::io::Result<()> {
        writeln!(w, "ply")?;
        writeln!(w, "format ascii 1.0")?;
        writeln!(w, "element vertex {}", self.points.len())?;
        for axis in ["x", "y", "z"] {
            writeln!(w, "property float {axis}")?;
        }
        for channel in ["red", "green", "blue"] {
            writeln!(w, "property uchar {channel}")?;
        }
        writeln!(w, "end_header")?;
        for (p, c) in self.points.iter().zip(&self.colors) {
            let q = p.coords.map(f64::from) + self.offset;
            writeln!(w, "{:.6} {:.6} {:.6} {} {} {}", q.x, q.y, q.z, c[0], c[1], c[2])?;
        }
        Ok(())
    }
}

fn tie_break(i: usize) -> (f64, f64) {
    const PHI: f64 = 0.618_033_988_749_894_8;
    const SQRT2_FRAC: f64 = 0.414_213_562_373_095_05;
    let a = (i as f64 * PHI).fract();
    let b = (i as f64 * SQRT2_FRAC).fract();
    ((a - 0.5) * KEY_TIE_BREAK, (b - 0.5) * KEY_TIE_BREAK)
}

fn aabb_centre(points: &[Point3<f64>]) -> Option<Vector3<f64>> {
    let first = *points.first()?;
    let (lo, hi) = points
        .iter()
        .fold((first, first), |(lo, hi), p| (lo.inf(p), hi.sup(p)));
    Some((lo.coords + hi.coords) * 0.5)
}

fn normalise(z: f32, range: Option<(f32, f32)>) -> f32 {
    match range {
        Some((lo, hi)) if hi > lo => ((z - lo) / (hi - lo)).clamp(0.0, 1.0),
        _ => 0.5,
    }
}

/// JET colour map, `t` in `[0, 1]`, blue to red.
pub fn jet(t: f32) -> [u8; 3] {
    let t = t.clamp(0.0, 1.0);
    let ch = |c: f32| ((1.5 - (4.0 * t - c).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    [ch(3.0), ch(2.0), ch(1.0)]
}

/// Mask of pixels with valid depth and a Sobel magnitude below
/// `factor * max_depth`, cleaned by a 3x3 opening.
fn gradient_keep_mask(depth: &DepthMap, factor: f32) -> GrayImage {
    let (w, h) = (depth.width() as i64, depth.height() as i64);
    let threshold = depth.valid_range().map_or(0.0, |(_, hi)| hi * factor);
    let at = |x: i64, y: i64| {
        let v = depth.raw(x.clamp(0, w - 1) as u32, y.clamp(0, h - 1) as u32);
        if is_valid_depth(v) {
            v
        } else {
            0.0
        }
    };
    let mask = GrayImage::from_fn(depth.width(), depth.height(), |x, y| {
        let (x, y) = (x as i64, y as i64);
        if !is_valid_depth(depth.raw(x as u32, y as u32)) {
            return Luma([0]);
        }
        let gx = at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1)
            - at(x - 1, y - 1)
            - 2.0 * at(x - 1, y)
            - at(x - 1, y + 1);
        let gy = at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1)
            - at(x - 1, y - 1)
            - 2.0 * at(x, y - 1)
            - at(x + 1, y - 1);
        if gx.hypot(gy) < threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    imageproc::morphology::open(&mask, Norm::LInf, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn k() -> Intrinsics {
        Intrinsics::new(100.0, 100.0, 32.0, 24.0)
    }

    fn plane(z: f32) -> DepthMap {
        DepthMap::filled(64, 48, z)
    }

    #[test]
    fn bounding_box_is_centred() {
        let depth = DepthMap::from_fn(64, 48, |x, y| 400.0 + x as f32 + 0.5 * y as f32);
        let cloud = PointCloud::build(&depth, None, &k(), &CloudOptions::default()).unwrap();
        let (lo, hi) = cloud.bounds().unwrap();
        let c = (lo.coords + hi.coords) * 0.5;
        assert!(c.norm() < 1e-6, "{c:?}");
        assert_eq!(cloud.len(), cloud.pixels().len());
    }

    #[test]
    fn point_mm_matches_back_projection_with_y_up() {
        let cloud = PointCloud::build(&plane(500.0), None, &k(), &CloudOptions::default()).unwrap();
        let i = cloud.index_at_pixel(42, 4).unwrap();
        let p = cloud.point_mm(i).unwrap();
        assert_relative_eq!(p.x, 50.0, epsilon = 1e-3);
        assert_relative_eq!(p.y, 100.0, epsilon = 1e-3);
        assert_relative_eq!(p.z, 500.0, epsilon = 1e-3);
        let back = cloud.to_cloud_frame(&p);
        assert_relative_eq!(back.x, cloud.points()[i].x, epsilon = 1e-6);
    }

    #[test]
    fn nearest_to_pixel_respects_tolerance() {
        let mut depth = plane(500.0);
        for y in 0..48 {
            for x in 20..40 {
                depth.set(x, y, f32::NAN);
            }
        }
        let opts = CloudOptions {
            gradient_filter: false,
            ..CloudOptions::default()
        };
        let cloud = PointCloud::build(&depth, None, &k(), &opts).unwrap();
        let exact = cloud.nearest_to_pixel(10.2, 10.4, 1.0).unwrap();
        assert_eq!(cloud.pixels()[exact], [10, 10]);

        let near_hole = cloud.nearest_to_pixel(22.0, 10.0, 3.0).unwrap();
        assert_eq!(cloud.pixels()[near_hole], [19, 10]);
        assert!(cloud.nearest_to_pixel(30.0, 10.0, 3.0).is_none());
    }

    #[test]
    fn step_and_max_depth_filter_points() {
        let depth = DepthMap::from_fn(64, 48, |x, _| if x < 32 { 500.0 } else { 20_000.0 });
        let opts = CloudOptions {
            step: 2,
            gradient_filter: false,
            ..CloudOptions::default()
        };
        let cloud = PointCloud::build(&depth, None, &k(), &opts).unwrap();
        assert_eq!(cloud.len(), 16 * 24);
        assert!(cloud.pixels().iter().all(|[u, v]| u % 2 == 0 && v % 2 == 0 && *u < 32));
    }

    #[test]
    fn gradient_filter_drops_edge_pixels() {
        let depth = DepthMap::from_fn(64, 48, |x, _| if x < 32 { 300.0 } else { 900.0 });
        let filtered = PointCloud::build(&depth, None, &k(), &CloudOptions::default()).unwrap();
        assert!(filtered.index_at_pixel(31, 20).is_none());
        assert!(filtered.index_at_pixel(32, 20).is_none());
        assert!(filtered.index_at_pixel(10, 20).is_some());
        assert!(filtered.index_at_pixel(50, 20).is_some());
    }

    #[test]
    fn colours_come_from_image_or_jet() {
        let img = RgbImage::from_pixel(64, 48, image::Rgb([10, 20, 30]));
        let cloud = PointCloud::build(&plane(500.0), Some(&img), &k(), &CloudOptions::default())
            .unwrap();
        assert_eq!(cloud.colors()[0], [10, 20, 30]);
        assert_eq!(jet(0.0), [0, 0, 128]);
        assert_eq!(jet(1.0), [128, 0, 0]);

        let bad = RgbImage::new(8, 8);
        assert!(PointCloud::build(&plane(500.0), Some(&bad), &k(), &CloudOptions::default())
            .is_err());
    }

    #[test]
    fn ply_header_counts_vertices() {
        let cloud = PointCloud::build(&DepthMap::filled(4, 2, 500.0), None, &k(), &CloudOptions::default())
            .unwrap();
        let mut out = Vec::new();
        cloud.write_ply(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("ply\nformat ascii 1.0\nelement vertex 8\n"));
        assert_eq!(text.lines().count(), 9 + 8);
    }
}
