//! Facade crate for the `stereoscope-*` workspace.
//!
//! This crate provides:
//! - re-exports of the underlying crates under short module names
//! - end-to-end helpers: rectify a raw pair in one call, replay a scripted
//!   measurement session against synthetic depth
//! - (feature `cli`) the `stereoscope` binary
//!
//! ## Quickstart
//!
//! ```no_run
//! use stereoscope::correction::{CalibrationSource, CorrectionOptions, DirectoryCalibrationSource};
//! use stereoscope::core::ImageSize;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let left = image::open("left.png")?.to_rgb8();
//! let right = image::open("right.png")?.to_rgb8();
//! let calib = DirectoryCalibrationSource::new(ImageSize::of(&left)).load("calib".as_ref())?;
//! let pair = stereoscope::rectify_pair(calib, CorrectionOptions::default(), &left, &right)?;
//! println!("K' = {:?}", pair.intrinsics);
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `stereoscope::core`: image sizes, depth maps, intrinsics, frames, homographies, geometry.
//! - `stereoscope::correction`: calibration, rectification, remapping, the correction pipeline.
//! - `stereoscope::depth`: block matching, mono calibration, fusion, point clouds.
//! - `stereoscope::measure`: measurements, interaction, store, renderers, the event service.

pub use stereoscope_core as core;
pub use stereoscope_correction as correction;
pub use stereoscope_depth as depth;
pub use stereoscope_measure as measure;

pub use stereoscope_core::{DepthMap, FrameRecord, ImageSize, Intrinsics};
pub use stereoscope_measure::{Measurement, MeasurementKind, MeasurementService, ServiceConfig};

mod error;
mod rectify;
pub mod script;

pub use error::StereoscopeError;
pub use rectify::{rectify_pair, RectificationReport, RectifiedPair};
pub use script::{run_script, Script, ScriptReport, ScriptSession, ScriptStep, SyntheticDepth};
