//! Explicit pixel coordinate frames.
//!
//! Every pixel coordinate in the pipeline belongs to a frame: the full
//! rectified image that `P1` refers to, the ROI-clipped rectified image, the
//! centre crop handed to depth inference, the user-facing display. A
//! [`CoordinateFrame`] records how a frame sits inside its parent so that
//! conversions compose instead of being applied ad hoc.

use crate::{ImageSize, PixelRect};
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

/// A frame placed inside a parent frame.
///
/// A point `p` in this frame maps to `origin_offset + scale ⊙ p` in the parent.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordinateFrame {
    pub size: ImageSize,
    pub origin_offset: Vector2<f64>,
    pub scale: Vector2<f64>,
}

impl CoordinateFrame {
    /// The parent frame itself.
    pub fn identity(size: ImageSize) -> Self {
        Self {
            size,
            origin_offset: Vector2::zeros(),
            scale: Vector2::new(1.0, 1.0),
        }
    }

    /// Sub-rectangle of the parent at unit scale.
    pub fn crop(rect: PixelRect) -> Self {
        Self {
            size: rect.size(),
            origin_offset: rect.origin(),
            scale: Vector2::new(1.0, 1.0),
        }
    }

    /// The parent resampled from `from` pixels to `to` pixels.
    pub fn resize(from: ImageSize, to: ImageSize) -> Self {
        Self {
            size: to,
            origin_offset: Vector2::zeros(),
            scale: to.scale_to(from),
        }
    }

    /// Place `child` (expressed relative to `self`) directly in `self`'s parent.
    pub fn compose(&self, child: &CoordinateFrame) -> CoordinateFrame {
        CoordinateFrame {
            size: child.size,
            origin_offset: self.origin_offset + self.scale.component_mul(&child.origin_offset),
            scale: self.scale.component_mul(&child.scale),
        }
    }

    #[inline]
    pub fn to_parent(&self, p: Point2<f64>) -> Point2<f64> {
        Point2::from(self.origin_offset + self.scale.component_mul(&p.coords))
    }

    #[inline]
    pub fn from_parent(&self, p: Point2<f64>) -> Point2<f64> {
        Point2::from((p.coords - self.origin_offset).component_div(&self.scale))
    }
}

/// Bookkeeping of every geometric step between the raw capture and the
/// image the depth map is aligned with.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Raw sensor image size.
    pub original_size: ImageSize,
    /// Size of the rectified image as delivered (after ROI clipping).
    pub rectified_size: ImageSize,
    /// Size of the image the depth map is aligned with.
    pub final_size: ImageSize,
    /// Valid-pixel ROI the rectified image was clipped to, if any.
    #[serde(default)]
    pub rectify_roi: Option<PixelRect>,
    /// Centre crop applied for inference, relative to the rectified image.
    #[serde(default)]
    pub crop_roi: Option<PixelRect>,
}

impl FrameRecord {
    /// A record with no clipping and no crop.
    pub fn passthrough(size: ImageSize) -> Self {
        Self {
            original_size: size,
            rectified_size: size,
            final_size: size,
            rectify_roi: None,
            crop_roi: None,
        }
    }

    /// Frame of the final (depth-aligned) image inside the full rectified
    /// image that the projection matrix `P1` refers to.
    pub fn final_frame(&self) -> CoordinateFrame {
        let full = CoordinateFrame::identity(self.original_size);
        let clipped = match self.rectify_roi.filter(|r| !r.is_empty()) {
            Some(roi) => full.compose(&CoordinateFrame::crop(roi)),
            None => CoordinateFrame {
                size: self.rectified_size,
                ..full
            },
        };
        let cropped = match self.crop_roi.filter(|r| !r.is_empty()) {
            Some(crop) => clipped.compose(&CoordinateFrame::crop(crop)),
            None => clipped,
        };
        CoordinateFrame {
            size: self.final_size,
            ..cropped
        }
    }

    /// Frame of a depth map of `depth_size` pixels inside the full
    /// rectified image; differs from [`FrameRecord::final_frame`] only when
    /// the depth map was produced at another resolution.
    pub fn depth_frame(&self, depth_size: ImageSize) -> CoordinateFrame {
        let f = self.final_frame();
        if depth_size == self.final_size {
            f
        } else {
            f.compose(&CoordinateFrame::resize(self.final_size, depth_size))
        }
    }
}
