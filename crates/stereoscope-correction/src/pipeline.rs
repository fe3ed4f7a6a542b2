//! Raw stereo pair → rectified pair, plus the bookkeeping downstream
//! geometry needs to find its way back into calibrated pixels.

use crate::{
    apply_view_transform, stereo_rectify, CorrectionError, RectificationProducts, RemapTable,
    StereoCalibration,
};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use stereoscope_core::{
    crop_rgb, FrameRecord, ImageError, ImageSize, Intrinsics, PixelRect, ViewTransform,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Which stages [`CorrectionPipeline`] runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionOptions {
    /// Remove lens distortion.
    pub enable_distortion_correction: bool,
    /// Rectify the pair so epipolar lines are image rows.
    pub enable_stereo_rectification: bool,
    /// Fit the monocular depth scale against stereo; read by depth fusion.
    pub enable_depth_calibration: bool,
    /// Produce a view-transformed display image.
    pub enable_image_transform: bool,
    /// Build the remap tables in `configure` instead of on first use.
    pub precompute_maps: bool,
    /// Spread remapping over the rayon pool.
    pub use_hw_accel: bool,
    /// Clip rectified outputs to the valid-pixel ROI of the left camera.
    pub clip_to_roi: bool,
    /// Centre-crop the left image to this aspect (`[w, h]`) for inference.
    pub inference_aspect: Option<[u32; 2]>,
}

impl Default for CorrectionOptions {
    fn default() -> Self {
        Self {
            enable_distortion_correction: true,
            enable_stereo_rectification: true,
            enable_depth_calibration: true,
            enable_image_transform: false,
            precompute_maps: true,
            use_hw_accel: true,
            clip_to_roi: true,
            inference_aspect: None,
        }
    }
}

/// Per-call subset of the configured stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionMask {
    pub undistort: bool,
    pub rectify: bool,
    pub view_transform: bool,
}

impl CorrectionMask {
    pub const ALL: Self = Self {
        undistort: true,
        rectify: true,
        view_transform: true,
    };
    pub const NONE: Self = Self {
        undistort: false,
        rectify: false,
        view_transform: false,
    };
}

impl Default for CorrectionMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// Output of [`CorrectionPipeline::correct`].
#[derive(Clone, Debug)]
pub struct CorrectedFrames {
    pub rectified_left: RgbImage,
    pub rectified_right: RgbImage,
    /// Centre crop of `rectified_left`, present when an inference aspect is set.
    pub cropped_left: Option<RgbImage>,
    /// View-transformed final left image, present when the transform ran.
    pub display_left: Option<RgbImage>,
    /// Stages that actually ran.
    pub applied: CorrectionMask,
    pub record: FrameRecord,
}

impl CorrectedFrames {
    /// The left image the depth map is aligned with.
    pub fn final_left(&self) -> &RgbImage {
        self.cropped_left.as_ref().unwrap_or(&self.rectified_left)
    }
}

struct Maps {
    left: RemapTable,
    right: RemapTable,
}

/// Undistortion, rectification and display transforms for one rig.
pub struct CorrectionPipeline {
    calibration: Option<StereoCalibration>,
    options: CorrectionOptions,
    view: ViewTransform,
    size: Option<ImageSize>,
    rectification: Option<RectificationProducts>,
    maps: Option<Maps>,
}

impl Default for CorrectionPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrectionPipeline {
    pub fn new() -> Self {
        Self {
            calibration: None,
            options: CorrectionOptions::default(),
            view: ViewTransform::default(),
            size: None,
            rectification: None,
            maps: None,
        }
    }

    /// Pipeline with a validated calibration installed.
    pub fn with_calibration(calibration: StereoCalibration) -> Result<Self, CorrectionError> {
        let mut p = Self::new();
        p.set_calibration(calibration)?;
        Ok(p)
    }

    /// Install a calibration; rejects non-finite or degenerate data.
    pub fn set_calibration(&mut self, calibration: StereoCalibration) -> Result<(), CorrectionError> {
        calibration
            .validate()
            .map_err(|e| CorrectionError::BadCalibration(e.to_string()))?;
        self.calibration = Some(calibration);
        self.reset();
        Ok(())
    }

    #[inline]
    pub fn calibration(&self) -> Option<&StereoCalibration> {
        self.calibration.as_ref()
    }

    #[inline]
    pub fn options(&self) -> &CorrectionOptions {
        &self.options
    }

    #[inline]
    pub fn view_transform(&self) -> &ViewTransform {
        &self.view
    }

    pub fn set_view_transform(&mut self, view: ViewTransform) {
        self.view = view;
    }

    /// Configured input size, `None` before [`CorrectionPipeline::configure`].
    #[inline]
    pub fn image_size(&self) -> Option<ImageSize> {
        self.size
    }

    /// `true` when the remap tables match the configured size.
    pub fn remap_initialized(&self) -> bool {
        self.maps.as_ref().is_some_and(|m| Some(m.left.size()) == self.size)
    }

    /// Rectification products for the configured size.
    #[inline]
    pub fn rectification(&self) -> Option<&RectificationProducts> {
        self.rectification.as_ref()
    }

    fn reset(&mut self) {
        self.size = None;
        self.rectification = None;
        self.maps = None;
    }

    /// Prepare the pipeline for frames of `image_size`.
    ///
    /// Rectification products stored with the calibration are reused when
    /// they were computed for this size; otherwise they are recomputed.
    /// Any previously built remap tables are dropped.
    #[cfg_attr(feature = "tracing", instrument(level = "info", skip(self, options), fields(w = image_size.width, h = image_size.height)))]
    pub fn configure(
        &mut self,
        image_size: ImageSize,
        options: CorrectionOptions,
    ) -> Result<(), CorrectionError> {
        self.reset();
        let calib = self
            .calibration
            .as_ref()
            .ok_or(CorrectionError::CorrectionNotInitialized("no calibration loaded"))?;
        if image_size.is_empty() {
            return Err(ImageError::Empty {
                width: image_size.width,
                height: image_size.height,
            }
            .into());
        }
        if !calib.image_size.is_empty() && calib.image_size != image_size {
            return Err(CorrectionError::SizeMismatch {
                expected: calib.image_size,
                got: image_size,
            });
        }

        let rect = match &calib.rectification {
            Some(r) => r.clone(),
            None => stereo_rectify(calib, image_size),
        };
        if !rect.p1.iter().chain(rect.q.iter()).all(|v| v.is_finite()) {
            return Err(CorrectionError::BadCalibration(
                "rectification produced non-finite matrices".into(),
            ));
        }

        self.options = options;
        self.size = Some(image_size);
        self.rectification = Some(rect);
        if self.options.precompute_maps {
            self.maps = Some(self.build_maps(image_size)?);
        }
        log::info!(
            "correction configured for {}x{} (undistort={}, rectify={}, precomputed={})",
            image_size.width,
            image_size.height,
            self.options.enable_distortion_correction,
            self.options.enable_stereo_rectification,
            self.maps.is_some()
        );
        Ok(())
    }

    fn build_maps(&self, size: ImageSize) -> Result<Maps, CorrectionError> {
        let calib = self
            .calibration
            .as_ref()
            .ok_or(CorrectionError::CorrectionNotInitialized("no calibration loaded"))?;
        let rect = self
            .rectification
            .as_ref()
            .ok_or(CorrectionError::CorrectionNotInitialized("pipeline not configured"))?;
        let opts = &self.options;
        let table = |cam: &crate::CameraCalibration, r, p| {
            if opts.enable_stereo_rectification {
                RemapTable::undistort_rectify(&cam.camera_matrix, &effective_dist(cam, opts), r, p, size)
            } else if opts.enable_distortion_correction {
                let k = cam.camera_matrix;
                let p = nalgebra::Matrix3x4::from_fn(|r, c| if c < 3 { k[(r, c)] } else { 0.0 });
                RemapTable::undistort_rectify(&k, &cam.distortion, &nalgebra::Matrix3::identity(), &p, size)
            } else {
                RemapTable::identity(size)
            }
        };
        Ok(Maps {
            left: table(&calib.left, &rect.r1, &rect.p1),
            right: table(&calib.right, &rect.r2, &rect.p2),
        })
    }

    /// Geometry record for frames of the configured size.
    pub fn frame_record(&self) -> Result<FrameRecord, CorrectionError> {
        let size = self
            .size
            .ok_or(CorrectionError::CorrectionNotInitialized("pipeline not configured"))?;
        Ok(self.record_for(size, self.options.enable_stereo_rectification))
    }

    fn record_for(&self, size: ImageSize, rectified: bool) -> FrameRecord {
        let rectify_roi = if rectified && self.options.clip_to_roi {
            self.rectification
                .as_ref()
                .map(|r| r.roi1.clamp_to(size))
                .filter(|roi| !roi.is_empty() && *roi != PixelRect::full(size))
        } else {
            None
        };
        let rectified_size = rectify_roi.map(|r| r.size()).unwrap_or(size);
        let crop_roi = self
            .options
            .inference_aspect
            .map(|[w, h]| PixelRect::centered_aspect(rectified_size, w, h))
            .filter(|r| *r != PixelRect::full(rectified_size));
        FrameRecord {
            original_size: size,
            rectified_size,
            final_size: crop_roi.map(|r| r.size()).unwrap_or(rectified_size),
            rectify_roi,
            crop_roi,
        }
    }

    /// Undistort/rectify a raw pair and derive the crop and display images.
    #[cfg_attr(feature = "tracing", instrument(level = "info", skip(self, left_raw, right_raw)))]
    pub fn correct(
        &mut self,
        left_raw: &RgbImage,
        right_raw: &RgbImage,
        mask: CorrectionMask,
    ) -> Result<CorrectedFrames, CorrectionError> {
        let size = self
            .size
            .ok_or(CorrectionError::CorrectionNotInitialized("pipeline not configured"))?;
        for img in [left_raw, right_raw] {
            let got = ImageSize::of(img);
            if got != size {
                return Err(CorrectionError::SizeMismatch {
                    expected: size,
                    got,
                });
            }
        }

        let warp = (mask.undistort && self.options.enable_distortion_correction)
            || (mask.rectify && self.options.enable_stereo_rectification);
        let mut applied = CorrectionMask::NONE;
        let (mut left, mut right) = if warp {
            if !self.remap_initialized() {
                log::debug!("building remap tables on first use");
                self.maps = Some(self.build_maps(size)?);
            }
            let maps = self
                .maps
                .as_ref()
                .ok_or(CorrectionError::CorrectionNotInitialized("remap tables missing"))?;
            let par = self.options.use_hw_accel;
            applied.undistort = self.options.enable_distortion_correction;
            applied.rectify = self.options.enable_stereo_rectification;
            (maps.left.remap_rgb(left_raw, par), maps.right.remap_rgb(right_raw, par))
        } else {
            (left_raw.clone(), right_raw.clone())
        };

        let record = self.record_for(size, applied.rectify);
        if let Some(roi) = record.rectify_roi {
            left = crop_rgb(&left, roi)?;
            right = crop_rgb(&right, roi)?;
        }

        let cropped_left = match record.crop_roi {
            Some(crop) => Some(crop_rgb(&left, crop)?),
            None => None,
        };

        let display_left = if mask.view_transform && self.options.enable_image_transform {
            applied.view_transform = true;
            let base = cropped_left.as_ref().unwrap_or(&left);
            Some(apply_view_transform(base, &self.view))
        } else {
            None
        };

        Ok(CorrectedFrames {
            rectified_left: left,
            rectified_right: right,
            cropped_left,
            display_left,
            applied,
            record,
        })
    }

    /// Intrinsics valid in the frame of the depth map.
    ///
    /// Taken from `P1` when rectification is enabled, from the raw left
    /// camera matrix otherwise, then shifted by the ROI clip and the
    /// inference crop through one composed [`stereoscope_core::CoordinateFrame`].
    /// View transforms never enter here.
    pub fn effective_left_intrinsic(&self) -> Result<Intrinsics, CorrectionError> {
        let calib = self
            .calibration
            .as_ref()
            .ok_or(CorrectionError::CorrectionNotInitialized("no calibration loaded"))?;
        let record = self.frame_record()?;
        let base = match (&self.rectification, self.options.enable_stereo_rectification) {
            (Some(rect), true) => Intrinsics::from_projection(&rect.p1),
            _ => calib.left.intrinsics(),
        };
        let k = base.in_frame(&record.final_frame());
        if !k.is_usable() {
            return Err(CorrectionError::BadCalibration(format!(
                "effective intrinsics are not usable: {k:?}"
            )));
        }
        Ok(k)
    }

    /// Left projection matrix in the frame of the depth map, `K' [I | 0]`.
    pub fn effective_left_projection(&self) -> Result<nalgebra::Matrix3x4<f64>, CorrectionError> {
        Ok(self.effective_left_intrinsic()?.projection_matrix())
    }
}

/// Distortion to undo during rectification.
fn effective_dist(
    cam: &crate::CameraCalibration,
    opts: &CorrectionOptions,
) -> stereoscope_core::BrownConrady5 {
    if opts.enable_distortion_correction {
        cam.distortion
    } else {
        stereoscope_core::BrownConrady5::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CameraCalibration;
    use approx::assert_relative_eq;
    use image::Rgb;
    use nalgebra::{Matrix3, Vector3};
    use stereoscope_core::BrownConrady5;

    fn calib() -> StereoCalibration {
        let k = Matrix3::new(500.0, 0.0, 160.0, 0.0, 500.0, 120.0, 0.0, 0.0, 1.0);
        let cam = CameraCalibration::new(k, BrownConrady5::default());
        StereoCalibration {
            left: cam.clone(),
            right: cam,
            rotation: Matrix3::identity(),
            translation: Vector3::new(-4.0, 0.0, 0.0),
            image_size: ImageSize::new(320, 240),
            rectification: None,
        }
    }

    #[test]
    fn correct_before_configure_is_not_initialized() {
        let mut p = CorrectionPipeline::with_calibration(calib()).unwrap();
        let img = RgbImage::new(320, 240);
        let err = p.correct(&img, &img, CorrectionMask::ALL).unwrap_err();
        assert!(matches!(err, CorrectionError::CorrectionNotInitialized(_)));
        assert!(matches!(
            CorrectionPipeline::new().configure(ImageSize::new(320, 240), CorrectionOptions::default()),
            Err(CorrectionError::CorrectionNotInitialized(_))
        ));
    }

    #[test]
    fn non_finite_calibration_is_bad() {
        let mut c = calib();
        c.left.camera_matrix[(0, 2)] = f64::INFINITY;
        assert!(matches!(
            CorrectionPipeline::with_calibration(c),
            Err(CorrectionError::BadCalibration(_))
        ));
    }

    #[test]
    fn wrong_frame_size_is_rejected() {
        let mut p = CorrectionPipeline::with_calibration(calib()).unwrap();
        p.configure(ImageSize::new(320, 240), CorrectionOptions::default())
            .unwrap();
        let small = RgbImage::new(100, 100);
        let ok = RgbImage::new(320, 240);
        assert!(matches!(
            p.correct(&small, &ok, CorrectionMask::ALL),
            Err(CorrectionError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn reconfigure_resets_tables() {
        let mut p = CorrectionPipeline::with_calibration(calib()).unwrap();
        let opts = CorrectionOptions {
            precompute_maps: false,
            ..Default::default()
        };
        p.configure(ImageSize::new(320, 240), opts.clone()).unwrap();
        assert!(!p.remap_initialized());
        let img = RgbImage::from_pixel(320, 240, Rgb([90, 90, 90]));
        p.correct(&img, &img, CorrectionMask::ALL).unwrap();
        assert!(p.remap_initialized());
        p.configure(ImageSize::new(320, 240), opts).unwrap();
        assert!(!p.remap_initialized());
    }

    #[test]
    fn effective_intrinsic_tracks_roi_and_crop() {
        let mut c = calib();
        let mut rect = stereo_rectify(&c, c.image_size);
        rect.roi1 = PixelRect::new(10, 6, 300, 228);
        c.rectification = Some(rect.clone());
        let mut p = CorrectionPipeline::with_calibration(c).unwrap();
        let opts = CorrectionOptions {
            inference_aspect: Some([3, 4]),
            ..Default::default()
        };
        p.configure(ImageSize::new(320, 240), opts).unwrap();

        let record = p.frame_record().unwrap();
        let crop = record.crop_roi.unwrap();
        assert_eq!(crop, PixelRect::centered_aspect(ImageSize::new(300, 228), 3, 4));

        let k = p.effective_left_intrinsic().unwrap();
        assert_relative_eq!(k.cx, rect.p1[(0, 2)] - 10.0 - crop.x as f64, epsilon = 1e-12);
        assert_relative_eq!(k.cy, rect.p1[(1, 2)] - 6.0 - crop.y as f64, epsilon = 1e-12);
        assert_relative_eq!(k.fx, rect.p1[(0, 0)]);

        let img = RgbImage::from_pixel(320, 240, Rgb([10, 20, 30]));
        let out = p.correct(&img, &img, CorrectionMask::ALL).unwrap();
        assert_eq!(out.rectified_left.dimensions(), (300, 228));
        assert_eq!(
            out.final_left().dimensions(),
            (crop.width, crop.height)
        );
        assert!(out.display_left.is_none());
    }

    #[test]
    fn masked_out_stages_pass_frames_through() {
        let mut p = CorrectionPipeline::with_calibration(calib()).unwrap();
        p.configure(ImageSize::new(320, 240), CorrectionOptions::default())
            .unwrap();
        let img = RgbImage::from_fn(320, 240, |x, y| Rgb([x as u8, y as u8, 0]));
        let out = p.correct(&img, &img, CorrectionMask::NONE).unwrap();
        assert_eq!(out.applied, CorrectionMask::NONE);
        assert_eq!(out.rectified_left, img);
        assert_eq!(out.record, FrameRecord::passthrough(ImageSize::new(320, 240)));
    }
}
