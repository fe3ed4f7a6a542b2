use crate::CalibrationError;
use stereoscope_core::{ImageError, ImageSize};

/// Errors surfaced by the correction pipeline.
#[derive(thiserror::Error, Debug)]
pub enum CorrectionError {
    #[error("correction pipeline is not initialized: {0}")]
    CorrectionNotInitialized(&'static str),
    #[error("bad calibration: {0}")]
    BadCalibration(String),
    #[error("image size mismatch (expected {expected:?}, got {got:?})")]
    SizeMismatch { expected: ImageSize, got: ImageSize },
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Image(#[from] ImageError),
}
