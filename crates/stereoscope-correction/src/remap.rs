//! Undistort/rectify lookup tables and bilinear remapping.

use image::{GrayImage, Luma, Pixel, Rgb, RgbImage};
use nalgebra::{Matrix3, Matrix3x4, Vector2, Vector3};
use rayon::prelude::*;
use stereoscope_core::{BrownConrady5, ImageSize, Intrinsics};

/// Per-pixel source coordinates for one camera (`initUndistortRectifyMap`).
///
/// Destination pixel `(u, v)` samples the raw image at
/// `(map_x[i], map_y[i])`, `i = v * width + u`.
#[derive(Clone, Debug, PartialEq)]
pub struct RemapTable {
    size: ImageSize,
    map_x: Vec<f32>,
    map_y: Vec<f32>,
}

impl RemapTable {
    /// Build the table for camera `k`/`dist`, rectifying rotation `r` and
    /// new projection `p` (only its left 3x3 block is used).
    pub fn undistort_rectify(
        k: &Matrix3<f64>,
        dist: &BrownConrady5,
        r: &Matrix3<f64>,
        p: &Matrix3x4<f64>,
        size: ImageSize,
    ) -> Self {
        let src = Intrinsics::from_matrix(k);
        let dst = Intrinsics::from_projection(p);
        let r_inv = r.transpose();

        let w = size.width as usize;
        let mut map_x = vec![0.0f32; size.area()];
        let mut map_y = vec![0.0f32; size.area()];
        if w == 0 {
            return Self { size, map_x, map_y };
        }
        map_x
            .par_chunks_mut(w)
            .zip(map_y.par_chunks_mut(w))
            .enumerate()
            .for_each(|(v, (row_x, row_y))| {
                let y = (v as f64 - dst.cy) / dst.fy;
                for (u, (mx, my)) in row_x.iter_mut().zip(row_y.iter_mut()).enumerate() {
                    let x = (u as f64 - dst.cx) / dst.fx;
                    let ray = r_inv * Vector3::new(x, y, 1.0);
                    let n = Vector2::new(ray.x / ray.z, ray.y / ray.z);
                    let d = dist.distort(n);
                    *mx = (src.fx * d.x + src.cx) as f32;
                    *my = (src.fy * d.y + src.cy) as f32;
                }
            });
        Self { size, map_x, map_y }
    }

    /// Identity table, used when neither undistortion nor rectification runs.
    pub fn identity(size: ImageSize) -> Self {
        let w = size.width as usize;
        let mut map_x = Vec::with_capacity(size.area());
        let mut map_y = Vec::with_capacity(size.area());
        for i in 0..size.area() {
            map_x.push((i % w.max(1)) as f32);
            map_y.push((i / w.max(1)) as f32);
        }
        Self { size, map_x, map_y }
    }

    #[inline]
    pub fn size(&self) -> ImageSize {
        self.size
    }

    /// Source coordinate sampled for destination pixel `(u, v)`.
    pub fn source_of(&self, u: u32, v: u32) -> Option<(f32, f32)> {
        if u >= self.size.width || v >= self.size.height {
            return None;
        }
        let i = v as usize * self.size.width as usize + u as usize;
        Some((self.map_x[i], self.map_y[i]))
    }

    /// Remap a colour image; pixels whose source falls outside are black.
    pub fn remap_rgb(&self, src: &RgbImage, parallel: bool) -> RgbImage {
        self.remap(src, parallel)
    }

    /// Remap a grey image; pixels whose source falls outside are black.
    pub fn remap_gray(&self, src: &GrayImage, parallel: bool) -> GrayImage {
        self.remap(src, parallel)
    }

    fn remap<P>(&self, src: &image::ImageBuffer<P, Vec<u8>>, parallel: bool) -> image::ImageBuffer<P, Vec<u8>>
    where
        P: Pixel<Subpixel = u8> + Send + Sync,
    {
        let channels = P::CHANNEL_COUNT as usize;
        let w = self.size.width as usize;
        let mut out = vec![0u8; self.size.area() * channels];
        let row_len = w * channels;

        let fill_row = |v: usize, row: &mut [u8]| {
            for u in 0..w {
                let i = v * w + u;
                sample_bilinear(
                    src,
                    self.map_x[i],
                    self.map_y[i],
                    &mut row[u * channels..(u + 1) * channels],
                );
            }
        };
        if row_len > 0 {
            if parallel {
                out.par_chunks_mut(row_len)
                    .enumerate()
                    .for_each(|(v, row)| fill_row(v, row));
            } else {
                out.chunks_mut(row_len)
                    .enumerate()
                    .for_each(|(v, row)| fill_row(v, row));
            }
        }
        image::ImageBuffer::from_raw(self.size.width, self.size.height, out)
            .unwrap_or_else(|| image::ImageBuffer::new(self.size.width, self.size.height))
    }
}

/// Bilinear sample of all channels at `(x, y)` with a black constant border.
fn sample_bilinear<P>(src: &image::ImageBuffer<P, Vec<u8>>, x: f32, y: f32, out: &mut [u8])
where
    P: Pixel<Subpixel = u8>,
{
    let (w, h) = src.dimensions();
    if !(x.is_finite() && y.is_finite()) || x < -1.0 || y < -1.0 || x > w as f32 || y > h as f32 {
        out.fill(0);
        return;
    }
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let raw = src.as_raw();
    let ch = out.len();
    let tap = |xx: i64, yy: i64, c: usize| -> f32 {
        if xx < 0 || yy < 0 || xx >= w as i64 || yy >= h as i64 {
            0.0
        } else {
            raw[(yy as usize * w as usize + xx as usize) * ch + c] as f32
        }
    };
    for (c, o) in out.iter_mut().enumerate() {
        let top = tap(x0, y0, c) * (1.0 - fx) + tap(x0 + 1, y0, c) * fx;
        let bottom = tap(x0, y0 + 1, c) * (1.0 - fx) + tap(x0 + 1, y0 + 1, c) * fx;
        *o = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
}

/// Bilinear colour sample, black outside the image.
pub fn sample_rgb(src: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let mut px = [0u8; 3];
    sample_bilinear(src, x, y, &mut px);
    Rgb(px)
}

/// Bilinear grey sample, black outside the image.
pub fn sample_gray(src: &GrayImage, x: f32, y: f32) -> Luma<u8> {
    let mut px = [0u8; 1];
    sample_bilinear(src, x, y, &mut px);
    Luma(px)
}
