//! Point-and-click 3-D measurement on stereo-endoscope frames.
//!
//! A click on the displayed image is mapped back to a pixel of the fused
//! depth map, back-projected through the depth frame's intrinsics and
//! collected by a per-kind state machine. Completed pick sets are
//! evaluated by [`MeasurementCalculator`] into a [`Measurement`], kept in a
//! [`MeasurementStore`] with undo/redo, drawn over the image by
//! [`OverlayRenderer`] and turned into 3-D primitives by [`build_scene`].
//!
//! [`MeasurementService`] wires all of it to the correction and depth
//! crates behind a typed event queue.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stereoscope_core::{DepthMap, FrameRecord, ImageSize, Intrinsics};
//! use stereoscope_measure::{
//!     ClickOutcome, FrameContext, InteractionManager, MeasurementKind,
//! };
//! # fn run() -> Result<(), stereoscope_measure::MeasureError> {
//! let size = ImageSize::new(640, 480);
//! let ctx = FrameContext::new(
//!     Arc::new(DepthMap::filled(size.width, size.height, 500.0)),
//!     Arc::new(image::RgbImage::new(size.width, size.height)),
//!     FrameRecord::passthrough(size),
//!     &Intrinsics::new(800.0, 800.0, 320.0, 240.0),
//! );
//! let mut ui = InteractionManager::default();
//! ui.begin(MeasurementKind::Length);
//! let a = nalgebra::Point2::new(100.0, 200.0);
//! let b = nalgebra::Point2::new(300.0, 200.0);
//! ui.click(&ctx, a, a)?;
//! if let ClickOutcome::Completed(m) = ui.click(&ctx, b, b)? {
//!     println!("{}", m.result_text);
//! }
//! # Ok(())
//! # }
//! ```

pub mod calculator;
mod config;
mod error;
mod events;
mod font;
mod interaction;
mod model;
mod profile;
mod render2d;
mod scene;
mod service;
mod state;
mod store;

pub use calculator::{CalculatorParams, MeasurementCalculator, PlaneDistance, PointToLine};
pub use config::ServiceConfig;
pub use error::MeasureError;
pub use events::{Event, EventQueue, FrameBundle, FrameMailbox, Notification, StereoFrameSource};
pub use font::LabelFont;
pub use interaction::{ClickOutcome, FrameContext, InteractionManager, InteractionParams};
pub use model::{Evaluation, Measurement, MeasurementId, MeasurementKind, ProfileSample};
pub use profile::{clean_elevations, sample_profile, ProfileParams, ProfileResult};
pub use render2d::{clip_segment, OverlayRenderer, OverlayView, RenderStyle};
pub use scene::{build_scene, dashed_segments, Primitive, SceneGroup, SceneParams};
pub use service::MeasurementService;
pub use state::{
    MeasurementStateMachine, Mode, Pick, PickOutcome, StateManager, StateParams,
};
pub use store::{HistoryOp, HistoryRecord, MeasurementStore, MATCH_TOLERANCE_MM, MAX_HISTORY};
