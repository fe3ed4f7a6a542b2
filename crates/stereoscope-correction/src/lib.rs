//! Undistortion, stereo rectification and display transforms.
//!
//! [`CorrectionPipeline`] turns a raw stereo pair into a rectified pair
//! clipped to the valid ROI, optionally centre-cropped for depth
//! inference, and records every geometric step in a
//! [`stereoscope_core::FrameRecord`] so clicks and intrinsics can be mapped
//! into the frame of the depth map.
//!
//! ```no_run
//! use std::path::Path;
//! use stereoscope_core::ImageSize;
//! use stereoscope_correction::{
//!     CalibrationSource, CorrectionMask, CorrectionOptions, CorrectionPipeline,
//!     DirectoryCalibrationSource,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let size = ImageSize::new(1280, 720);
//! let calib = DirectoryCalibrationSource::new(size).load(Path::new("camera_parameters"))?;
//! let mut pipeline = CorrectionPipeline::with_calibration(calib)?;
//! pipeline.configure(size, CorrectionOptions::default())?;
//!
//! let left = image::open("left.jpg")?.to_rgb8();
//! let right = image::open("right.jpg")?.to_rgb8();
//! let frames = pipeline.correct(&left, &right, CorrectionMask::ALL)?;
//! let k = pipeline.effective_left_intrinsic()?;
//! println!("{:?} {:?}", frames.record, k);
//! # Ok(())
//! # }
//! ```

mod calibration;
mod error;
mod io;
mod pipeline;
mod rectify;
mod remap;
mod view;

pub use calibration::{
    load_dat_dir, parse_extrinsics, parse_intrinsics, CalibrationError, CalibrationSource,
    CameraCalibration, DirectoryCalibrationSource, RectificationProducts, StereoCalibration,
    CALIBRATION_JSON_FILE, EXTRINSICS_FILE, LEFT_INTRINSICS_FILE, RIGHT_INTRINSICS_FILE,
};
pub use error::CorrectionError;
pub use io::{frame_file_name, load_json, save_frame_pair, save_png, write_json, IoError};
pub use pipeline::{CorrectedFrames, CorrectionMask, CorrectionOptions, CorrectionPipeline};
pub use rectify::{stereo_rectify, valid_roi};
pub use remap::{sample_gray, sample_rgb, RemapTable};
pub use view::apply_view_transform;
