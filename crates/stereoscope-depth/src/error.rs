use stereoscope_core::{ImageError, ImageSize};

/// Errors produced by depth estimation and point-cloud building.
#[derive(thiserror::Error, Debug)]
pub enum DepthError {
    #[error("size mismatch (expected {expected:?}, got {got:?})")]
    SizeMismatch { expected: ImageSize, got: ImageSize },
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("intrinsics are not usable for back-projection")]
    BadIntrinsics,
    #[error("mono calibration degenerate: {pairs} usable pairs, need {required}")]
    CalibrationDegenerate { pairs: usize, required: usize },
    #[error(transparent)]
    Image(#[from] ImageError),
}
