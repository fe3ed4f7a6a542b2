use stereoscope_correction::{CalibrationError, CorrectionError, IoError};
use stereoscope_depth::DepthError;
use stereoscope_measure::MeasureError;

#[derive(thiserror::Error, Debug)]
pub enum StereoscopeError {
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Correction(#[from] CorrectionError),
    #[error(transparent)]
    Depth(#[from] DepthError),
    #[error(transparent)]
    Measure(#[from] MeasureError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("invalid script: {0}")]
    Script(String),
}
