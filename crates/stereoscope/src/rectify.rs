//! One-call rectification of a raw stereo pair.

use crate::StereoscopeError;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use stereoscope_core::{FrameRecord, ImageSize, Intrinsics};
use stereoscope_correction::{
    save_png, write_json, CorrectedFrames, CorrectionMask, CorrectionOptions, CorrectionPipeline,
    StereoCalibration,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Corrected pair plus the intrinsics of its final frame.
#[derive(Clone, Debug)]
pub struct RectifiedPair {
    pub frames: CorrectedFrames,
    /// `K'` of [`CorrectedFrames::final_left`].
    pub intrinsics: Intrinsics,
}

/// What `rectify` writes next to the images.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RectificationReport {
    pub intrinsics: Intrinsics,
    pub record: FrameRecord,
    /// `[[fx, 0, cx, 0], [0, fy, cy, 0], [0, 0, 1, 0]]`.
    pub projection: [[f64; 4]; 3],
}

/// Configure a pipeline for the pair's size and correct it.
#[cfg_attr(feature = "tracing", instrument(level = "info", skip_all))]
pub fn rectify_pair(
    calibration: StereoCalibration,
    options: CorrectionOptions,
    left: &RgbImage,
    right: &RgbImage,
) -> Result<RectifiedPair, StereoscopeError> {
    let mut pipeline = CorrectionPipeline::with_calibration(calibration)?;
    pipeline.configure(ImageSize::of(left), options)?;
    let frames = pipeline.correct(left, right, CorrectionMask::ALL)?;
    let intrinsics = pipeline.effective_left_intrinsic()?;
    log::info!(
        "rectified {}x{} pair to {}x{}",
        left.width(),
        left.height(),
        frames.record.final_size.width,
        frames.record.final_size.height
    );
    Ok(RectifiedPair { frames, intrinsics })
}

impl RectifiedPair {
    pub fn report(&self) -> RectificationReport {
        let p = self.intrinsics.projection_matrix();
        let projection = std::array::from_fn(|r| std::array::from_fn(|c| p[(r, c)]));
        RectificationReport {
            intrinsics: self.intrinsics,
            record: self.frames.record,
            projection,
        }
    }

    /// Write `left.png`, `right.png`, `final_left.png` when a crop was
    /// taken, `display_left.png` when a view transform ran, and
    /// `intrinsics.json`.
    pub fn write(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, StereoscopeError> {
        let dir = dir.as_ref();
        let mut written = Vec::new();
        let mut save = |name: &str, img: &RgbImage| -> Result<(), StereoscopeError> {
            let path = dir.join(name);
            save_png(&path, img)?;
            written.push(path);
            Ok(())
        };
        save("left.png", &self.frames.rectified_left)?;
        save("right.png", &self.frames.rectified_right)?;
        if let Some(img) = &self.frames.cropped_left {
            save("final_left.png", img)?;
        }
        if let Some(img) = &self.frames.display_left {
            save("display_left.png", img)?;
        }
        let json = dir.join("intrinsics.json");
        write_json(&self.report(), &json)?;
        written.push(json);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Vector3};
    use stereoscope_core::BrownConrady5;
    use stereoscope_correction::CameraCalibration;

    fn calib(size: ImageSize) -> StereoCalibration {
        let k = Matrix3::new(200.0, 0.0, 80.0, 0.0, 200.0, 60.0, 0.0, 0.0, 1.0);
        let cam = CameraCalibration::new(k, BrownConrady5::default());
        StereoCalibration {
            left: cam.clone(),
            right: cam,
            rotation: Matrix3::identity(),
            translation: Vector3::new(-4.0, 0.0, 0.0),
            image_size: size,
            rectification: None,
        }
    }

    #[test]
    fn inference_crop_shifts_principal_point() {
        let size = ImageSize::new(160, 120);
        let img = RgbImage::new(size.width, size.height);
        let options = CorrectionOptions {
            clip_to_roi: false,
            inference_aspect: Some([1, 1]),
            ..CorrectionOptions::default()
        };
        let pair = rectify_pair(calib(size), options, &img, &img).unwrap();
        assert_eq!(pair.frames.record.final_size, ImageSize::new(120, 120));
        let full = rectify_pair(
            calib(size),
            CorrectionOptions {
                clip_to_roi: false,
                ..CorrectionOptions::default()
            },
            &img,
            &img,
        )
        .unwrap();
        approx::assert_relative_eq!(pair.intrinsics.cx, full.intrinsics.cx - 20.0, epsilon = 1e-9);
        approx::assert_relative_eq!(pair.intrinsics.cy, full.intrinsics.cy, epsilon = 1e-9);
    }

    #[test]
    fn write_emits_images_and_report() {
        let size = ImageSize::new(160, 120);
        let img = RgbImage::new(size.width, size.height);
        let pair = rectify_pair(calib(size), CorrectionOptions::default(), &img, &img).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let written = pair.write(dir.path()).unwrap();
        assert!(written.iter().all(|p| p.exists()));
        let report: RectificationReport =
            stereoscope_correction::load_json(dir.path().join("intrinsics.json")).unwrap();
        assert_eq!(report.record, pair.frames.record);
        approx::assert_relative_eq!(report.projection[0][0], pair.intrinsics.fx, epsilon = 1e-9);
        approx::assert_relative_eq!(report.intrinsics.cy, pair.intrinsics.cy, epsilon = 1e-9);
    }
}
