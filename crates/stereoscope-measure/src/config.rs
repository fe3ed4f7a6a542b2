//! Service configuration, persisted as JSON.

use crate::{
    CalculatorParams, InteractionParams, ProfileParams, RenderStyle, SceneParams, StateParams,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use stereoscope_correction::{load_json, write_json, CorrectionOptions, IoError};
use stereoscope_depth::{CloudOptions, FusionParams, MatcherParams};

/// Every tunable of [`crate::MeasurementService`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub correction: CorrectionOptions,
    /// Semi-global matching unless `"kind": "block"` is given.
    pub matcher: MatcherParams,
    pub fusion: FusionParams,
    /// Build a point cloud for every published frame.
    pub build_cloud: bool,
    pub cloud: CloudOptions,
    pub interaction: InteractionParams,
    pub state: StateParams,
    pub calculator: CalculatorParams,
    pub profile: ProfileParams,
    pub render: RenderStyle,
    pub scene: SceneParams,
    /// A frame waits this long for its mono depth before stereo is used.
    pub inference_timeout_ms: u64,
    pub toast_duration_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            correction: CorrectionOptions::default(),
            matcher: MatcherParams::default(),
            fusion: FusionParams::default(),
            build_cloud: true,
            cloud: CloudOptions::default(),
            interaction: InteractionParams::default(),
            state: StateParams::default(),
            calculator: CalculatorParams::default(),
            profile: ProfileParams::default(),
            render: RenderStyle::default(),
            scene: SceneParams::default(),
            inference_timeout_ms: 2_000,
            toast_duration_ms: 2_000,
        }
    }
}

impl ServiceConfig {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, IoError> {
        load_json(path)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), IoError> {
        write_json(self, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stereoscope_depth::FusionMode;

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: ServiceConfig =
            serde_json::from_str(r#"{"inference_timeout_ms": 500, "fusion": {"mode": "StereoOnly"}}"#)
                .unwrap();
        assert_eq!(cfg.inference_timeout_ms, 500);
        assert_eq!(cfg.fusion.mode, FusionMode::StereoOnly);
        assert_eq!(cfg.calculator, CalculatorParams::default());
        assert!(cfg.build_cloud);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.json");
        let mut cfg = ServiceConfig::default();
        cfg.state.close_tolerance_mm = 2.5;
        cfg.write_json(&path).unwrap();
        assert_eq!(ServiceConfig::load_json(&path).unwrap(), cfg);
    }
}
