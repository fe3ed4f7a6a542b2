//! Scripted measurement sessions against synthetic depth.
//!
//! A [`Script`] describes a depth map (a camera-space plane with optional
//! holes), the intrinsics it is seen through and a list of operator steps.
//! [`ScriptSession`] replays the steps through the same interaction manager
//! and store the live service uses, which makes scripts handy both for
//! regression tests and for checking a calibration by hand.
//!
//! ```json
//! {
//!   "image_size": { "width": 1280, "height": 720 },
//!   "intrinsics": { "fx": 1000, "fy": 1000, "cx": 640, "cy": 360 },
//!   "depth": { "z_mm": 500 },
//!   "steps": [ { "Begin": "Length" }, { "Click": [500, 360] }, { "Click": [780, 360] } ]
//! }
//! ```

use crate::StereoscopeError;
use image::RgbImage;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use stereoscope_core::{DepthMap, FrameRecord, Homography, ImageSize, Intrinsics, PixelRect};
use stereoscope_correction::load_json;
use stereoscope_depth::PointCloud;
use stereoscope_measure::{
    ClickOutcome, FrameContext, InteractionManager, LabelFont, Measurement, MeasurementId,
    MeasurementKind, MeasurementStore, OverlayRenderer, OverlayView, ServiceConfig,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// The plane `Z = z_mm + dz_dx * X + dz_dy * Y` (millimetres, Y up) as
/// seen by the camera, with invalid rectangles punched out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticDepth {
    pub z_mm: f64,
    pub dz_dx: f64,
    pub dz_dy: f64,
    pub holes: Vec<PixelRect>,
}

impl Default for SyntheticDepth {
    fn default() -> Self {
        Self {
            z_mm: 500.0,
            dz_dx: 0.0,
            dz_dy: 0.0,
            holes: Vec::new(),
        }
    }
}

impl SyntheticDepth {
    /// Depth per pixel by intersecting each pixel ray with the plane.
    pub fn render(&self, size: ImageSize, k: &Intrinsics) -> DepthMap {
        let mut depth = DepthMap::from_fn(size.width, size.height, |u, v| {
            let denom = 1.0 - self.dz_dx * (u as f64 - k.cx) / k.fx
                + self.dz_dy * (v as f64 - k.cy) / k.fy;
            let z = self.z_mm / denom;
            if z.is_finite() && z > 0.0 {
                z as f32
            } else {
                f32::NAN
            }
        });
        for hole in &self.holes {
            let r = hole.clamp_to(size);
            for y in r.y as u32..r.y as u32 + r.height {
                for x in r.x as u32..r.x as u32 + r.width {
                    depth.set(x, y, f32::NAN);
                }
            }
        }
        depth
    }
}

/// One operator action. Clicks are in depth-map pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ScriptStep {
    Begin(MeasurementKind),
    Click([f64; 2]),
    Finish,
    Cancel,
    Undo,
    Redo,
    Select(Option<u64>),
    DeleteSelected,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub image_size: ImageSize,
    pub intrinsics: Intrinsics,
    #[serde(default)]
    pub depth: SyntheticDepth,
    /// Resolve clicks through a point cloud built from the depth.
    #[serde(default)]
    pub use_cloud: bool,
    #[serde(default)]
    pub config: ServiceConfig,
    pub steps: Vec<ScriptStep>,
}

impl Script {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, StereoscopeError> {
        Ok(load_json(path)?)
    }
}

/// Outcome of a replayed script.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptReport {
    /// Measurements in the store after the last step.
    pub measurements: Vec<Measurement>,
    /// Messages an operator would have seen as toasts.
    pub messages: Vec<String>,
}

/// Interaction state over one synthetic frame.
#[derive(Debug)]
pub struct ScriptSession {
    ctx: FrameContext,
    interaction: InteractionManager,
    store: MeasurementStore,
    config: ServiceConfig,
}

impl ScriptSession {
    pub fn new(script: &Script) -> Result<Self, StereoscopeError> {
        if script.image_size.is_empty() {
            return Err(StereoscopeError::Script("image_size is empty".into()));
        }
        if !script.intrinsics.is_usable() {
            return Err(StereoscopeError::Script(format!(
                "intrinsics are not usable: {:?}",
                script.intrinsics
            )));
        }
        let size = script.image_size;
        let depth = script.depth.render(size, &script.intrinsics);
        let mut ctx = FrameContext::new(
            Arc::new(depth),
            Arc::new(RgbImage::new(size.width, size.height)),
            FrameRecord::passthrough(size),
            &script.intrinsics,
        );
        if script.use_cloud {
            let cloud = PointCloud::build(&ctx.depth, None, &ctx.intrinsics, &script.config.cloud)?;
            ctx = ctx.with_cloud(Arc::new(cloud));
        }
        let config = script.config.clone();
        Ok(Self {
            ctx,
            interaction: InteractionManager::new(
                config.interaction.clone(),
                config.state.clone(),
                config.calculator.clone(),
                config.profile.clone(),
            ),
            store: MeasurementStore::new(),
            config,
        })
    }

    pub fn context(&self) -> &FrameContext {
        &self.ctx
    }

    pub fn store(&self) -> &MeasurementStore {
        &self.store
    }

    /// Apply one step; recoverable problems come back as a message.
    pub fn step(&mut self, step: &ScriptStep) -> Option<String> {
        let result = match step {
            ScriptStep::Begin(kind) => {
                self.interaction.begin(*kind);
                return None;
            }
            ScriptStep::Click([x, y]) => {
                let p = Point2::new(*x, *y);
                self.interaction.click(&self.ctx, p, p)
            }
            ScriptStep::Finish => self.interaction.finish(&self.ctx),
            ScriptStep::Cancel => {
                self.interaction.cancel();
                return None;
            }
            ScriptStep::Undo => return (!self.store.undo()).then(|| "nothing to undo".into()),
            ScriptStep::Redo => return (!self.store.redo()).then(|| "nothing to redo".into()),
            ScriptStep::Select(id) => {
                self.store.select(id.map(MeasurementId));
                return None;
            }
            ScriptStep::DeleteSelected => {
                return self
                    .store
                    .delete_selected()
                    .is_none()
                    .then(|| "nothing selected".into());
            }
        };
        match result {
            Ok(ClickOutcome::Completed(m)) => {
                self.store.add(*m);
                None
            }
            Ok(ClickOutcome::SuggestClose) => Some("near the start point: finish to close".into()),
            Ok(ClickOutcome::Pending) => None,
            Err(e) => {
                log::info!("step {step:?} rejected: {e}");
                Some(e.to_string())
            }
        }
    }

    #[cfg_attr(feature = "tracing", instrument(level = "info", skip_all, fields(n = steps.len())))]
    pub fn run(&mut self, steps: &[ScriptStep]) -> ScriptReport {
        let messages = steps.iter().filter_map(|s| self.step(s)).collect();
        ScriptReport {
            measurements: self.store.items().to_vec(),
            messages,
        }
    }

    /// Draw the stored measurements over `base`, which may have any size;
    /// depth pixels are scaled onto it.
    pub fn render(&self, base: &RgbImage, font: LabelFont) -> RgbImage {
        let s = self.ctx.depth_size().scale_to(ImageSize::of(base));
        let view = OverlayView {
            to_image: Homography::scale(s.x, s.y),
            intrinsics: self.ctx.intrinsics,
        };
        OverlayRenderer::new(self.config.render.clone(), font).render(
            base,
            &view,
            self.store.items(),
            self.interaction.pending_picks(),
        )
    }
}

/// Load and replay a script file.
pub fn run_script(path: impl AsRef<Path>) -> Result<(ScriptSession, ScriptReport), StereoscopeError> {
    let script = Script::load_json(path)?;
    let mut session = ScriptSession::new(&script)?;
    let report = session.run(&script.steps);
    Ok((session, report))
}
