//! Display-side image transforms (rotation, mirroring, inversion, zoom).

use crate::remap::sample_rgb;
use image::{imageops, RgbImage};
use nalgebra::Point2;
use stereoscope_core::{ImageSize, Rotation, ViewTransform};

/// Render `img` through `view`.
///
/// Pure quarter turns and flips are exact pixel permutations; a zoom
/// resamples bilinearly through the inverse of [`ViewTransform::matrix`],
/// so drawn pixels and mapped clicks agree.
pub fn apply_view_transform(img: &RgbImage, view: &ViewTransform) -> RgbImage {
    let size = ImageSize::of(img);
    let mut out = if view.zoom > 1.0 {
        warp_inverse(img, view, size)
    } else {
        let mut rotated = match view.rotation {
            Rotation::None => img.clone(),
            Rotation::Cw90 => imageops::rotate90(img),
            Rotation::Cw180 => imageops::rotate180(img),
            Rotation::Cw270 => imageops::rotate270(img),
        };
        if view.flip_horizontal {
            imageops::flip_horizontal_in_place(&mut rotated);
        }
        if view.flip_vertical {
            imageops::flip_vertical_in_place(&mut rotated);
        }
        rotated
    };
    if view.invert_colors {
        imageops::invert(&mut out);
    }
    out
}

fn warp_inverse(img: &RgbImage, view: &ViewTransform, size: ImageSize) -> RgbImage {
    let out_size = view.output_size(size);
    let Some(inv) = view.matrix(size).inverse() else {
        log::warn!("view transform is singular, showing the image untransformed");
        return img.clone();
    };
    RgbImage::from_fn(out_size.width, out_size.height, |x, y| {
        let s = inv.apply(Point2::new(x as f64, y as f64));
        sample_rgb(img, s.x as f32, s.y as f32)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([x as u8, y as u8, 7]))
    }

    #[test]
    fn pixel_permutations_agree_with_the_matrix() {
        let img = gradient(5, 3);
        for rotation in [Rotation::None, Rotation::Cw90, Rotation::Cw180, Rotation::Cw270] {
            for (fh, fv) in [(false, false), (true, false), (false, true), (true, true)] {
                let view = ViewTransform {
                    rotation,
                    flip_horizontal: fh,
                    flip_vertical: fv,
                    ..Default::default()
                };
                let out = apply_view_transform(&img, &view);
                let m = view.matrix(ImageSize::of(&img));
                for (x, y) in [(0u32, 0u32), (4, 0), (2, 1), (4, 2)] {
                    let q = m.apply(Point2::new(x as f64, y as f64));
                    let px = out.get_pixel(q.x.round() as u32, q.y.round() as u32);
                    assert_eq!(px, img.get_pixel(x, y), "{rotation:?} h={fh} v={fv} ({x},{y})");
                }
            }
        }
    }

    #[test]
    fn zoom_samples_the_window_and_inversion_flips_values() {
        let img = gradient(40, 20);
        let mut view = ViewTransform {
            invert_colors: true,
            ..Default::default()
        };
        view.set_zoom(2.0);
        view.set_zoom_center(0.0, 0.0);
        let out = apply_view_transform(&img, &view);
        assert_eq!(out.dimensions(), (40, 20));
        // output (10, 4) samples source (5, 2)
        assert_eq!(out.get_pixel(10, 4).0, [255 - 5, 255 - 2, 255 - 7]);
    }
}
