use crate::MeasurementKind;
use stereoscope_correction::CorrectionError;
use stereoscope_depth::DepthError;

/// Errors surfaced by the measurement layer.
///
/// `DepthUnavailable` and `DegenerateGeometry` are recoverable: they reset
/// local pick state only.
#[derive(thiserror::Error, Debug)]
pub enum MeasureError {
    #[error("no depth at this position ({x:.1}, {y:.1})")]
    DepthUnavailable { x: f64, y: f64 },
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(&'static str),
    #[error("{kind:?} needs {expected} points, got {got}")]
    PointCount {
        kind: MeasurementKind,
        expected: usize,
        got: usize,
    },
    #[error("segments do not meet: closest approach {gap_mm:.2} mm")]
    SegmentsApart { gap_mm: f64 },
    #[error("profile has {got} depth samples, need at least {required}")]
    InsufficientSamples { got: usize, required: usize },
    #[error("no measurement in progress")]
    NotMeasuring,
    #[error("depth for the current frame is not ready")]
    NotReady,
    #[error("measurement disabled: {0}")]
    Disabled(String),
    #[error("click outside the image")]
    OutsideImage,
    #[error(transparent)]
    Correction(#[from] CorrectionError),
    #[error(transparent)]
    Depth(#[from] DepthError),
}

impl MeasureError {
    /// Errors the operator recovers from by clicking again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MeasureError::DepthUnavailable { .. }
                | MeasureError::DegenerateGeometry(_)
                | MeasureError::SegmentsApart { .. }
                | MeasureError::OutsideImage
                | MeasureError::InsufficientSamples { .. }
        )
    }
}
