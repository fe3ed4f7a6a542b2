//! Metric depth for stereo-endoscope measurement.
//!
//! Stereo disparity from a semi-global matcher becomes depth through the
//! rectification `Q` matrix; a monocular inverse-depth map from an external
//! inference engine is calibrated against the reliable stereo pixels and
//! fills the holes. The fused map feeds [`PointCloud::build`].
//!
//! ```no_run
//! use stereoscope_depth::{
//!     compute_stereo_depth, CloudOptions, DepthFusion, FusionParams, MonoInput, PointCloud,
//!     SgmMatcher,
//! };
//! # fn run(
//! #     left: &image::RgbImage,
//! #     right: &image::RgbImage,
//! #     q: &nalgebra::Matrix4<f64>,
//! #     k: &stereoscope_core::Intrinsics,
//! # ) -> Result<(), stereoscope_depth::DepthError> {
//! let stereo = compute_stereo_depth(&SgmMatcher::default(), left, right, q)?;
//! let mut fusion = DepthFusion::new(FusionParams::default());
//! let fused = fusion.fuse(&stereo.depth, Some(&stereo.disparity), MonoInput::NotRequested)?;
//! let cloud = PointCloud::build(&fused.depth, Some(left), k, &CloudOptions::default())?;
//! println!("{} points", cloud.len());
//! # Ok(())
//! # }
//! ```

mod cloud;
mod disparity;
mod error;
mod fusion;
mod inference;
mod mono;
mod postprocess;
mod sgm;
mod stereo;

pub use cloud::{jet, CloudOptions, PointCloud};
pub use disparity::{
    BlockMatcher, BlockMatcherParams, DisparityMap, Matcher, MatcherParams, StereoMatcher,
};
pub use error::DepthError;
pub use fusion::{
    DepthConfidence, DepthFusion, DepthRangeConfidence, DepthSource, FusionMode, FusionParams,
    FusionResult, FusionWarning, MonoInput,
};
pub use inference::{Completion, InferenceError, InferenceService, InferenceTracker};
pub use mono::{fit_inverse_depth, InverseDepthMap, MonoCalibration, MonoFitParams};
pub use postprocess::{validate_depth, DepthValidationParams};
pub use sgm::{SgmMatcher, SgmParams, SgmPaths};
pub use stereo::{compute_stereo_depth, disparity_to_depth, StereoDepth};
