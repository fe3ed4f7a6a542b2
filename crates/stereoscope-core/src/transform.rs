//! Planar pixel transforms: a general [`Homography`] and the user-facing
//! [`ViewTransform`] (rotation, mirroring, colour inversion, pinch zoom).

use crate::ImageSize;
use nalgebra::{Matrix3, Point2, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Homogeneous weights below this are rejected by [`Homography::try_apply`].
const W_EPS: f64 = 1e-12;

/// Upper bound accepted by [`ViewTransform::set_zoom`].
pub const MAX_ZOOM: f64 = 8.0;

/// 3x3 projective map between pixel frames, `q ~ H p`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Homography {
    pub h: Matrix3<f64>,
}

impl Default for Homography {
    fn default() -> Self {
        Self::identity()
    }
}

impl Homography {
    pub fn new(h: Matrix3<f64>) -> Self {
        Self { h }
    }

    pub fn identity() -> Self {
        Self::new(Matrix3::identity())
    }

    pub fn from_array(rows: [[f64; 3]; 3]) -> Self {
        Self::new(Matrix3::from_fn(|r, c| rows[r][c]))
    }

    pub fn to_array(&self) -> [[f64; 3]; 3] {
        let mut out = [[0.0; 3]; 3];
        for (r, row) in out.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = self.h[(r, c)];
            }
        }
        out
    }

    pub fn translation(tx: f64, ty: f64) -> Self {
        Self::new(Matrix3::new(1.0, 0.0, tx, 0.0, 1.0, ty, 0.0, 0.0, 1.0))
    }

    pub fn scale(sx: f64, sy: f64) -> Self {
        Self::new(Matrix3::new(sx, 0.0, 0.0, 0.0, sy, 0.0, 0.0, 0.0, 1.0))
    }

    /// Apply to a point; the result is non-finite when `p` maps to infinity.
    #[inline]
    pub fn apply(&self, p: Point2<f64>) -> Point2<f64> {
        let v = self.h * Vector3::new(p.x, p.y, 1.0);
        Point2::new(v[0] / v[2], v[1] / v[2])
    }

    /// Apply to a point, `None` when the homogeneous weight degenerates.
    pub fn try_apply(&self, p: Point2<f64>) -> Option<Point2<f64>> {
        let v = self.h * Vector3::new(p.x, p.y, 1.0);
        if !v[2].is_finite() || v[2].abs() < W_EPS {
            return None;
        }
        Some(Point2::new(v[0] / v[2], v[1] / v[2]))
    }

    pub fn inverse(&self) -> Option<Self> {
        self.h.try_inverse().map(Self::new)
    }

    /// `self` followed by `next`.
    pub fn then(&self, next: &Homography) -> Homography {
        Homography::new(next.h * self.h)
    }
}

/// Quarter-turn rotation applied clockwise, matching `image::imageops::rotate90`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub fn from_degrees(deg: u32) -> Option<Self> {
        match deg % 360 {
            0 => Some(Self::None),
            90 => Some(Self::Cw90),
            180 => Some(Self::Cw180),
            270 => Some(Self::Cw270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Cw90 => 90,
            Self::Cw180 => 180,
            Self::Cw270 => 270,
        }
    }

    /// Next quarter turn clockwise.
    pub fn step(self) -> Self {
        match self {
            Self::None => Self::Cw90,
            Self::Cw90 => Self::Cw180,
            Self::Cw180 => Self::Cw270,
            Self::Cw270 => Self::None,
        }
    }

    #[inline]
    pub fn swaps_axes(self) -> bool {
        matches!(self, Self::Cw90 | Self::Cw270)
    }

    /// Pixel map of the rotation on an image of `size`.
    pub fn matrix(self, size: ImageSize) -> Homography {
        let w1 = size.width as f64 - 1.0;
        let h1 = size.height as f64 - 1.0;
        let m = match self {
            Self::None => return Homography::identity(),
            Self::Cw90 => Matrix3::new(0.0, -1.0, h1, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0),
            Self::Cw180 => Matrix3::new(-1.0, 0.0, w1, 0.0, -1.0, h1, 0.0, 0.0, 1.0),
            Self::Cw270 => Matrix3::new(0.0, 1.0, 0.0, -1.0, 0.0, w1, 0.0, 0.0, 1.0),
        };
        Homography::new(m)
    }
}

/// Display-only transform applied after rectification.
///
/// Order of application: zoom, rotation, horizontal flip, vertical flip.
/// Colour inversion has no geometric effect. None of these change the
/// intrinsics used for back-projection; clicks are mapped back through
/// [`ViewTransform::display_to_source`] instead.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewTransform {
    pub rotation: Rotation,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
    pub invert_colors: bool,
    /// Magnification, `>= 1`.
    pub zoom: f64,
    /// Zoom centre in normalised source coordinates (`0..=1`).
    pub zoom_center: Point2<f64>,
}

impl Default for ViewTransform {
    fn default() -> Self {
        Self {
            rotation: Rotation::None,
            flip_horizontal: false,
            flip_vertical: false,
            invert_colors: false,
            zoom: 1.0,
            zoom_center: Point2::new(0.5, 0.5),
        }
    }
}

impl ViewTransform {
    /// `true` when the transform leaves pixel positions untouched.
    pub fn is_geometric_identity(&self) -> bool {
        self.rotation == Rotation::None
            && !self.flip_horizontal
            && !self.flip_vertical
            && self.effective_zoom() == 1.0
    }

    pub fn is_identity(&self) -> bool {
        self.is_geometric_identity() && !self.invert_colors
    }

    pub fn set_zoom(&mut self, zoom: f64) {
        self.zoom = if zoom.is_finite() {
            zoom.clamp(1.0, MAX_ZOOM)
        } else {
            1.0
        };
    }

    pub fn set_zoom_center(&mut self, x: f64, y: f64) {
        self.zoom_center = Point2::new(x.clamp(0.0, 1.0), y.clamp(0.0, 1.0));
    }

    #[inline]
    fn effective_zoom(&self) -> f64 {
        if self.zoom.is_finite() {
            self.zoom.clamp(1.0, MAX_ZOOM)
        } else {
            1.0
        }
    }

    /// Top-left corner and extent of the visible window in source pixels.
    pub fn zoom_window(&self, src: ImageSize) -> (Point2<f64>, Vector2<f64>) {
        let z = self.effective_zoom();
        let w = src.width as f64;
        let h = src.height as f64;
        let extent = Vector2::new(w / z, h / z);
        let cx = self.zoom_center.x.clamp(0.0, 1.0) * w;
        let cy = self.zoom_center.y.clamp(0.0, 1.0) * h;
        let tl = Point2::new(
            (cx - extent.x / 2.0).clamp(0.0, w - extent.x),
            (cy - extent.y / 2.0).clamp(0.0, h - extent.y),
        );
        (tl, extent)
    }

    /// Size of the transformed image.
    pub fn output_size(&self, src: ImageSize) -> ImageSize {
        if self.rotation.swaps_axes() {
            ImageSize::new(src.height, src.width)
        } else {
            src
        }
    }

    /// Map from source pixels to transformed pixels.
    pub fn matrix(&self, src: ImageSize) -> Homography {
        let z = self.effective_zoom();
        let mut m = if z == 1.0 {
            Homography::identity()
        } else {
            let (tl, _) = self.zoom_window(src);
            Homography::translation(-tl.x, -tl.y).then(&Homography::scale(z, z))
        };

        m = m.then(&self.rotation.matrix(src));
        let out = self.output_size(src);
        if self.flip_horizontal {
            let f = Homography::new(Matrix3::new(
                -1.0,
                0.0,
                out.width as f64 - 1.0,
                0.0,
                1.0,
                0.0,
                0.0,
                0.0,
                1.0,
            ));
            m = m.then(&f);
        }
        if self.flip_vertical {
            let f = Homography::new(Matrix3::new(
                1.0,
                0.0,
                0.0,
                0.0,
                -1.0,
                out.height as f64 - 1.0,
                0.0,
                0.0,
                1.0,
            ));
            m = m.then(&f);
        }
        m
    }

    /// Map from a widget of `display` pixels showing the transformed image
    /// back to source pixels. All scale factors are folded into one matrix.
    pub fn display_to_source(&self, src: ImageSize, display: ImageSize) -> Option<Homography> {
        let out = self.output_size(src);
        let to_display = out.scale_to(display);
        self.matrix(src)
            .then(&Homography::scale(to_display.x, to_display.y))
            .inverse()
    }
}
