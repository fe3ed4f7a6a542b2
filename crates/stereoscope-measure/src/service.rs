//! The measurement page as one event-driven object.
//!
//! A [`MeasurementService`] owns the correction pipeline, the depth stack,
//! the interaction state and the store. Everything reaches it as an
//! [`Event`]; everything it wants shown leaves as a [`Notification`].
//! Processing is single-threaded: capture and inference threads only post
//! events.
//!
//! Frame flow: correct the raw pair, compute stereo depth on the rectified
//! images, crop it to the final frame, then either fuse immediately or
//! wait for the monocular map of the same frame. The frame on screen is
//! replaced only when a newer frame has fully fused, so every click is
//! resolved against a consistent image, depth map and cloud.

use crate::{
    build_scene, ClickOutcome, Event, FrameContext, InteractionManager, LabelFont, MeasureError,
    Measurement, MeasurementId, MeasurementKind, MeasurementStore, Mode, Notification,
    OverlayRenderer, OverlayView, SceneGroup, ServiceConfig,
};
use image::RgbImage;
use nalgebra::Point2;
use std::sync::Arc;
use stereoscope_core::{DepthMap, FrameRecord, Homography, ImageSize, Intrinsics, ViewTransform};
use stereoscope_correction::{CorrectionMask, CorrectionPipeline, StereoCalibration};
use stereoscope_depth::{
    compute_stereo_depth, Completion, DepthFusion, DisparityMap, FusionMode,
    FusionWarning, InferenceService, InferenceTracker, Matcher, MonoInput, PointCloud,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// A corrected frame whose stereo depth is ready, waiting for fusion.
#[derive(Debug)]
struct PendingFrame {
    /// Inference request this frame waits for.
    seq: Option<u64>,
    depth: DepthMap,
    disparity: DisparityMap,
    image: Arc<RgbImage>,
    display: Option<Arc<RgbImage>>,
    record: FrameRecord,
    intrinsics: Intrinsics,
}

pub struct MeasurementService<I: InferenceService> {
    config: ServiceConfig,
    pipeline: CorrectionPipeline,
    matcher: Matcher,
    fusion: DepthFusion,
    tracker: InferenceTracker,
    inference: I,
    store: MeasurementStore,
    interaction: InteractionManager,
    renderer: OverlayRenderer,
    view: ViewTransform,
    display_size: Option<ImageSize>,
    pending: Option<PendingFrame>,
    current: Option<FrameContext>,
    /// View-transformed final image of `current`.
    display: Option<Arc<RgbImage>>,
    disabled: Option<String>,
    now_ms: u64,
    frames_published: u64,
}

impl<I: InferenceService> std::fmt::Debug for MeasurementService<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasurementService")
            .field("measurements", &self.store.len())
            .field("mode", &self.interaction.mode())
            .field("frames_published", &self.frames_published)
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}

impl<I: InferenceService> MeasurementService<I> {
    /// Set up correction for `calibration`'s image size.
    ///
    /// Setup failures do not abort: the service comes up disabled and
    /// answers measurement requests with a toast naming the cause.
    pub fn new(
        calibration: StereoCalibration,
        config: ServiceConfig,
        inference: I,
        font: LabelFont,
    ) -> Self {
        let mut disabled = None;
        let size = calibration.image_size;
        let pipeline = match CorrectionPipeline::with_calibration(calibration) {
            Ok(mut p) => {
                if let Err(e) = p.configure(size, config.correction.clone()) {
                    disabled = Some(e.to_string());
                } else if p.rectification().is_none() {
                    disabled = Some("stereo rectification is unavailable".to_string());
                }
                p
            }
            Err(e) => {
                disabled = Some(e.to_string());
                CorrectionPipeline::new()
            }
        };
        let matcher = Matcher::new(config.matcher.clone()).unwrap_or_else(|e| {
            disabled.get_or_insert_with(|| e.to_string());
            Matcher::default()
        });
        if let Some(reason) = &disabled {
            log::error!("measurement disabled: {reason}");
        }
        Self {
            pipeline,
            matcher,
            fusion: DepthFusion::new(config.fusion.clone()),
            tracker: InferenceTracker::new(config.inference_timeout_ms),
            inference,
            store: MeasurementStore::new(),
            interaction: InteractionManager::new(
                config.interaction.clone(),
                config.state.clone(),
                config.calculator.clone(),
                config.profile.clone(),
            ),
            renderer: OverlayRenderer::new(config.render.clone(), font),
            view: ViewTransform::default(),
            display_size: None,
            pending: None,
            current: None,
            display: None,
            disabled,
            now_ms: 0,
            frames_published: 0,
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Why measurement is off, when it is.
    pub fn disabled_reason(&self) -> Option<&str> {
        self.disabled.as_deref()
    }

    pub fn store(&self) -> &MeasurementStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MeasurementStore {
        &mut self.store
    }

    pub fn interaction(&self) -> &InteractionManager {
        &self.interaction
    }

    pub fn mode(&self) -> Mode {
        self.interaction.mode()
    }

    pub fn current_frame(&self) -> Option<&FrameContext> {
        self.current.as_ref()
    }

    pub fn frames_published(&self) -> u64 {
        self.frames_published
    }

    pub fn inference(&self) -> &I {
        &self.inference
    }

    pub fn inference_mut(&mut self) -> &mut I {
        &mut self.inference
    }

    /// Sequence number of the inference request a frame is waiting for.
    pub fn awaiting_inference(&self) -> Option<u64> {
        self.pending.as_ref().and_then(|p| p.seq)
    }

    pub fn set_fusion_mode(&mut self, mode: FusionMode) {
        self.fusion.set_mode(mode);
    }

    pub fn view_transform(&self) -> &ViewTransform {
        &self.view
    }

    pub fn correction(&self) -> &CorrectionPipeline {
        &self.pipeline
    }

    /// Install a frame directly, bypassing correction and fusion.
    pub fn publish_context(&mut self, ctx: FrameContext) {
        self.display = None;
        self.current = Some(ctx);
        self.frames_published += 1;
    }

    /// Size of the widget showing the display image.
    fn display_size(&self, ctx: &FrameContext) -> ImageSize {
        self.display_size
            .unwrap_or_else(|| self.view.output_size(ctx.record.final_size))
    }

    /// Process one event.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all))]
    pub fn handle(&mut self, event: Event) -> Vec<Notification> {
        let mut out = Vec::new();
        match event {
            Event::FrameArrived(bundle) => {
                if self.disabled.is_some() {
                    log::trace!("frame ignored: measurement disabled");
                } else if let Err(e) = self.ingest_frame(&bundle.left, &bundle.right, &mut out) {
                    log::warn!("frame dropped: {e}");
                    self.toast(&mut out, e.to_string());
                }
            }
            Event::InferenceCompleted { seq, map } => {
                if self.tracker.complete(seq) == Completion::Accepted {
                    match self.pending.take() {
                        Some(frame) if frame.seq == Some(seq) => {
                            self.publish(frame, MonoInput::Available(&map), &mut out);
                        }
                        other => self.pending = other,
                    }
                }
            }
            Event::Tick { now_ms } => {
                self.now_ms = now_ms;
                if let Some(seq) = self.tracker.poll_timeout(&mut self.inference, now_ms) {
                    match self.pending.take() {
                        Some(frame) if frame.seq == Some(seq) => {
                            self.publish(frame, MonoInput::TimedOut, &mut out);
                        }
                        other => self.pending = other,
                    }
                }
            }
            Event::BeginMeasurement(kind) => self.begin(kind, &mut out),
            Event::Click { x, y } => self.click(Point2::new(x, y), &mut out),
            Event::Finish => {
                let result = match &self.current {
                    Some(ctx) => self.interaction.finish(ctx),
                    None => Err(MeasureError::NotReady),
                };
                self.settle(result, &mut out);
            }
            Event::Cancel => {
                self.interaction.cancel();
                out.push(Notification::UpdateUi);
            }
            Event::Undo => {
                if self.store.undo() {
                    out.push(Notification::UpdateUi);
                }
            }
            Event::Redo => {
                if self.store.redo() {
                    out.push(Notification::UpdateUi);
                }
            }
            Event::DeleteSelected => {
                if self.store.delete_selected().is_some() {
                    out.push(Notification::UpdateUi);
                }
            }
            Event::Select(id) => {
                self.store.select(id);
                out.push(Notification::UpdateUi);
            }
            Event::SetViewTransform(view) => {
                self.view = view;
                self.pipeline.set_view_transform(view);
                out.push(Notification::UpdateUi);
            }
            Event::SetDisplaySize(size) => {
                self.display_size = (!size.is_empty()).then_some(size);
            }
        }
        out
    }

    fn toast(&self, out: &mut Vec<Notification>, message: String) {
        out.push(Notification::Toast {
            message,
            duration_ms: self.config.toast_duration_ms,
        });
    }

    fn begin(&mut self, kind: MeasurementKind, out: &mut Vec<Notification>) {
        if let Some(reason) = &self.disabled {
            let msg = MeasureError::Disabled(reason.clone()).to_string();
            self.toast(out, msg);
            return;
        }
        self.interaction.begin(kind);
        out.push(Notification::UpdateUi);
    }

    fn click(&mut self, display: Point2<f64>, out: &mut Vec<Notification>) {
        if let Some(reason) = &self.disabled {
            let msg = MeasureError::Disabled(reason.clone()).to_string();
            self.toast(out, msg);
            return;
        }
        let result = match &self.current {
            None => Err(MeasureError::NotReady),
            Some(ctx) => {
                let display_size = self.display_size(ctx);
                match ctx.display_to_depth(&self.view, display_size) {
                    Some(h) => self.interaction.click_mapped(ctx, display, &h),
                    None => Err(MeasureError::OutsideImage),
                }
            }
        };
        self.settle(result, out);
    }

    /// Turn an interaction result into notifications.
    fn settle(&mut self, result: Result<ClickOutcome, MeasureError>, out: &mut Vec<Notification>) {
        match result {
            Ok(ClickOutcome::Pending) => out.push(Notification::UpdateUi),
            Ok(ClickOutcome::SuggestClose) => {
                self.toast(out, "near the start point: finish to close the polyline".into());
                out.push(Notification::UpdateUi);
            }
            Ok(ClickOutcome::Completed(m)) => {
                let id = self.store.add(*m);
                log::info!("measurement {id} stored");
                if let Some(stored) = self.store.get(id) {
                    out.push(Notification::MeasurementCompleted(Box::new(stored.clone())));
                }
                out.push(Notification::UpdateUi);
            }
            Err(MeasureError::NotMeasuring) => {}
            Err(e) => {
                if !e.is_recoverable() {
                    log::warn!("measurement failed: {e}");
                }
                self.toast(out, e.to_string());
                out.push(Notification::UpdateUi);
            }
        }
    }

    /// Correct a raw pair and compute its stereo depth in the final frame.
    fn ingest_frame(
        &mut self,
        left: &RgbImage,
        right: &RgbImage,
        out: &mut Vec<Notification>,
    ) -> Result<(), MeasureError> {
        let frames = self.pipeline.correct(left, right, CorrectionMask::ALL)?;
        let q = self
            .pipeline
            .rectification()
            .map(|r| r.q)
            .ok_or_else(|| MeasureError::Disabled("stereo rectification is unavailable".into()))?;
        let stereo = compute_stereo_depth(
            &self.matcher,
            &frames.rectified_left,
            &frames.rectified_right,
            &q,
        )?;
        let (depth, disparity) = match frames.record.crop_roi {
            Some(roi) => (
                stereo
                    .depth
                    .crop(roi)
                    .map_err(stereoscope_depth::DepthError::from)?,
                stereo.disparity.crop(roi)?,
            ),
            None => (stereo.depth, stereo.disparity),
        };
        let intrinsics = self.pipeline.effective_left_intrinsic()?;
        let mut frame = PendingFrame {
            seq: None,
            depth,
            disparity,
            image: Arc::new(frames.final_left().clone()),
            display: frames.display_left.map(Arc::new),
            record: frames.record,
            intrinsics,
        };

        if !self.fusion.mode().uses_mono() {
            self.publish(frame, MonoInput::NotRequested, out);
            return Ok(());
        }
        match self
            .tracker
            .submit(&mut self.inference, &frame.image, self.now_ms)
        {
            Ok(seq) => {
                log::debug!("frame waits for inference #{seq}");
                frame.seq = Some(seq);
                self.pending = Some(frame);
            }
            Err(e) => {
                log::warn!("inference submit failed: {e}");
                self.pending = None;
                self.publish(frame, MonoInput::TimedOut, out);
            }
        }
        Ok(())
    }

    /// Fuse a pending frame and make it the frame on screen.
    fn publish(&mut self, frame: PendingFrame, mono: MonoInput<'_>, out: &mut Vec<Notification>) {
        let fused = match self.fusion.fuse(&frame.depth, Some(&frame.disparity), mono) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("fusion failed: {e}");
                self.toast(out, e.to_string());
                return;
            }
        };
        for w in &fused.warnings {
            if matches!(w, FusionWarning::InferenceTimeout | FusionWarning::MonoMissing) {
                self.toast(out, w.to_string());
            } else {
                log::info!("{w}");
            }
        }

        let depth = Arc::new(fused.depth);
        let mut ctx = FrameContext::new(depth, frame.image, frame.record, &frame.intrinsics);
        if self.config.build_cloud {
            match PointCloud::build(&ctx.depth, Some(&*ctx.image), &ctx.intrinsics, &self.config.cloud)
            {
                Ok(cloud) => ctx = ctx.with_cloud(Arc::new(cloud)),
                Err(e) => log::warn!("point cloud skipped: {e}"),
            }
        }
        self.current = Some(ctx);
        self.display = frame.display;
        self.frames_published += 1;
        log::debug!("frame {} published", self.frames_published);
        out.push(Notification::UpdateUi);
    }

    /// Final image of the current frame with every measurement drawn.
    pub fn render_overlay(&self) -> Option<RgbImage> {
        let ctx = self.current.as_ref()?;
        let view = OverlayView {
            to_image: depth_to_final(ctx),
            intrinsics: ctx.intrinsics,
        };
        Some(self.renderer.render(
            &ctx.image,
            &view,
            self.store.items(),
            self.interaction.pending_picks(),
        ))
    }

    /// View-transformed image of the current frame with every measurement
    /// drawn, when the pipeline produced one.
    pub fn render_display_overlay(&self) -> Option<RgbImage> {
        let ctx = self.current.as_ref()?;
        let base = self.display.as_deref()?;
        let view = OverlayView {
            to_image: depth_to_final(ctx).then(&self.view.matrix(ctx.record.final_size)),
            intrinsics: ctx.intrinsics,
        };
        Some(self.renderer.render(
            base,
            &view,
            self.store.items(),
            self.interaction.pending_picks(),
        ))
    }

    /// 3-D primitives for every visible measurement, placed in the current
    /// cloud's frame.
    pub fn scene(&self) -> Vec<SceneGroup> {
        let cloud = self.current.as_ref().and_then(|c| c.cloud.as_deref());
        build_scene(self.store.items(), cloud, &self.config.scene)
    }

    pub fn measurement(&self, id: MeasurementId) -> Option<&Measurement> {
        self.store.get(id)
    }
}

fn depth_to_final(ctx: &FrameContext) -> Homography {
    let s = ctx.depth_size().scale_to(ctx.record.final_size);
    Homography::scale(s.x, s.y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Vector3};
    use stereoscope_core::{BrownConrady5, DepthMap};
    use stereoscope_correction::CameraCalibration;
    use stereoscope_depth::{InferenceError, InverseDepthMap, MatcherParams, SgmParams};

    #[derive(Default)]
    struct Engine {
        submitted: Vec<u64>,
        cancelled: Vec<u64>,
    }

    impl InferenceService for Engine {
        fn input_size(&self) -> ImageSize {
            ImageSize::new(0, 0)
        }
        fn submit(&mut self, seq: u64, _image: &RgbImage) -> Result<(), InferenceError> {
            self.submitted.push(seq);
            Ok(())
        }
        fn cancel(&mut self, seq: u64) {
            self.cancelled.push(seq);
        }
    }

    fn rig(size: ImageSize) -> StereoCalibration {
        let k = Matrix3::new(100.0, 0.0, 32.0, 0.0, 100.0, 24.0, 0.0, 0.0, 1.0);
        let cam = CameraCalibration::new(k, BrownConrady5::default());
        StereoCalibration {
            left: cam.clone(),
            right: cam,
            rotation: Matrix3::identity(),
            translation: Vector3::new(-5.0, 0.0, 0.0),
            image_size: size,
            rectification: None,
        }
    }

    fn config(mode: FusionMode) -> ServiceConfig {
        let mut cfg = ServiceConfig::default();
        cfg.fusion.mode = mode;
        cfg.correction.clip_to_roi = false;
        cfg.correction.enable_distortion_correction = false;
        cfg.matcher = MatcherParams::Sgm(SgmParams {
            num_disparities: 16,
            parallel: false,
            ..SgmParams::default()
        });
        cfg
    }

    fn textured(size: ImageSize, shift: u32) -> RgbImage {
        RgbImage::from_fn(size.width, size.height, |x, y| {
            let v = ((x + shift) * 37 + y * 11) % 251;
            image::Rgb([v as u8, (v * 3 % 256) as u8, (255 - v) as u8])
        })
    }

    fn frame_event(size: ImageSize) -> Event {
        Event::FrameArrived(Box::new(crate::FrameBundle {
            left: textured(size, 0),
            right: textured(size, 4),
            timestamps_ms: [0, 0],
        }))
    }

    fn flat_context(size: ImageSize, z: f32) -> FrameContext {
        let record = FrameRecord::passthrough(size);
        FrameContext::new(
            Arc::new(DepthMap::filled(size.width, size.height, z)),
            Arc::new(RgbImage::new(size.width, size.height)),
            record,
            &Intrinsics::new(100.0, 100.0, 32.0, 24.0),
        )
    }

    #[test]
    fn clicks_before_first_frame_are_refused() {
        let size = ImageSize::new(64, 48);
        let mut svc = MeasurementService::new(
            rig(size),
            config(FusionMode::StereoOnly),
            Engine::default(),
            LabelFont::Stroke,
        );
        assert!(svc.disabled_reason().is_none());
        svc.handle(Event::BeginMeasurement(MeasurementKind::Length));
        let out = svc.handle(Event::Click { x: 10.0, y: 10.0 });
        let expected = MeasureError::NotReady.to_string();
        assert!(out
            .iter()
            .any(|n| matches!(n, Notification::Toast { message, .. } if *message == expected)));
    }

    #[test]
    fn length_through_events() {
        let size = ImageSize::new(64, 48);
        let mut svc = MeasurementService::new(
            rig(size),
            config(FusionMode::StereoOnly),
            Engine::default(),
            LabelFont::Stroke,
        );
        svc.publish_context(flat_context(size, 500.0));
        svc.handle(Event::BeginMeasurement(MeasurementKind::Length));
        svc.handle(Event::Click { x: 32.0, y: 24.0 });
        let out = svc.handle(Event::Click { x: 42.0, y: 24.0 });
        let m = out
            .iter()
            .find_map(|n| match n {
                Notification::MeasurementCompleted(m) => Some(m),
                _ => None,
            })
            .expect("completed");
        assert_eq!(m.result_text, "50.00 mm");
        assert_eq!(svc.store().len(), 1);
        assert!(svc.render_overlay().is_some());
        assert_eq!(svc.scene().len(), 1);

        svc.handle(Event::Undo);
        assert!(svc.store().is_empty());
        svc.handle(Event::Redo);
        assert_eq!(svc.store().len(), 1);
    }

    #[test]
    fn frame_waits_for_its_inference_then_times_out() {
        let size = ImageSize::new(64, 48);
        let mut svc = MeasurementService::new(
            rig(size),
            config(FusionMode::StereoPlusMono),
            Engine::default(),
            LabelFont::Stroke,
        );
        svc.handle(Event::Tick { now_ms: 100 });
        svc.handle(frame_event(size));
        assert_eq!(svc.awaiting_inference(), Some(1));
        assert!(svc.current_frame().is_none());

        svc.handle(Event::Tick { now_ms: 500 });
        assert!(svc.current_frame().is_none());
        let out = svc.handle(Event::Tick { now_ms: 2_200 });
        assert!(svc.current_frame().is_some());
        assert_eq!(svc.inference().cancelled, vec![1]);
        assert!(out.iter().any(|n| matches!(n, Notification::Toast { .. })));
    }

    #[test]
    fn stale_inference_is_ignored() {
        let size = ImageSize::new(64, 48);
        let mut svc = MeasurementService::new(
            rig(size),
            config(FusionMode::StereoPlusMono),
            Engine::default(),
            LabelFont::Stroke,
        );
        svc.handle(frame_event(size));
        svc.handle(frame_event(size));
        assert_eq!(svc.awaiting_inference(), Some(2));
        let map = InverseDepthMap::from_fn(size.width, size.height, |x, _| 1.0 + x as f32 * 0.01);
        svc.handle(Event::InferenceCompleted { seq: 1, map: map.clone() });
        assert!(svc.current_frame().is_none());
        svc.handle(Event::InferenceCompleted { seq: 2, map });
        assert!(svc.current_frame().is_some());
        assert_eq!(svc.awaiting_inference(), None);
    }

    #[test]
    fn bad_calibration_disables_measurement() {
        let size = ImageSize::new(64, 48);
        let mut calib = rig(size);
        calib.left.camera_matrix[(0, 0)] = 0.0;
        let mut svc = MeasurementService::new(
            calib,
            config(FusionMode::StereoOnly),
            Engine::default(),
            LabelFont::Stroke,
        );
        assert!(svc.disabled_reason().is_some());
        let out = svc.handle(Event::BeginMeasurement(MeasurementKind::Length));
        assert!(matches!(out.as_slice(), [Notification::Toast { .. }]));
        assert!(svc.handle(frame_event(size)).is_empty());
    }
}
