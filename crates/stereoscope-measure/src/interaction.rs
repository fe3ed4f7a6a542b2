//! Click to 3-D point resolution and measurement assembly.

use crate::{
    calculator::segments_intersection, sample_profile, CalculatorParams, MeasureError, Measurement,
    MeasurementCalculator, MeasurementKind, MeasurementStateMachine, Mode, Pick, PickOutcome,
    ProfileParams, StateManager, StateParams,
};
use image::RgbImage;
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stereoscope_core::{
    flip_y, line_intersection_2d, CoordinateFrame, DepthMap, FrameRecord, Homography, ImageSize,
    Intrinsics, ViewTransform,
};
use stereoscope_depth::PointCloud;

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionParams {
    /// Screen-space radius within which a cloud point answers a click.
    /// Zero disables the cloud lookup.
    pub cloud_tolerance_px: f64,
    /// Nearest-valid search radius when the clicked pixel has no depth.
    pub depth_search_radius: u32,
}

impl Default for InteractionParams {
    fn default() -> Self {
        Self {
            cloud_tolerance_px: 3.0,
            depth_search_radius: 5,
        }
    }
}

/// Everything a click is resolved against: the depth map on screen, its
/// colour image, and the intrinsics of the depth map's pixel frame.
#[derive(Clone, Debug)]
pub struct FrameContext {
    pub depth: Arc<DepthMap>,
    /// Colour image aligned with `depth`'s frame record.
    pub image: Arc<RgbImage>,
    pub record: FrameRecord,
    /// `K'` of the depth map's pixel frame.
    pub intrinsics: Intrinsics,
    pub cloud: Option<Arc<PointCloud>>,
}

impl FrameContext {
    /// `final_intrinsics` are those of the record's final image; they are
    /// rescaled when the depth map has another resolution.
    pub fn new(
        depth: Arc<DepthMap>,
        image: Arc<RgbImage>,
        record: FrameRecord,
        final_intrinsics: &Intrinsics,
    ) -> Self {
        let intrinsics = if depth.size() == record.final_size {
            *final_intrinsics
        } else {
            final_intrinsics.in_frame(&CoordinateFrame::resize(record.final_size, depth.size()))
        };
        Self {
            depth,
            image,
            record,
            intrinsics,
            cloud: None,
        }
    }

    pub fn with_cloud(mut self, cloud: Arc<PointCloud>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn depth_size(&self) -> ImageSize {
        self.depth.size()
    }

    /// Map from a widget of `display` pixels showing the final image under
    /// `view` to depth-map pixels.
    pub fn display_to_depth(&self, view: &ViewTransform, display: ImageSize) -> Option<Homography> {
        let final_size = self.record.final_size;
        let s = final_size.scale_to(self.depth.size());
        Some(
            view.display_to_source(final_size, display)?
                .then(&Homography::scale(s.x, s.y)),
        )
    }

    /// Resolve a depth-map pixel to a point in millimetres, Y-up.
    ///
    /// The cloud answers first when one of its points lies within
    /// `cloud_tolerance_px`; otherwise the depth map is read, falling back
    /// to the nearest valid pixel.
    pub fn resolve_pixel(
        &self,
        px: Point2<f64>,
        params: &InteractionParams,
    ) -> Result<(Point2<f64>, Point3<f64>), MeasureError> {
        let size = self.depth.size();
        if !size.contains(px) {
            return Err(MeasureError::OutsideImage);
        }
        if let Some(cloud) = self.cloud.as_deref().filter(|_| params.cloud_tolerance_px > 0.0) {
            if let Some(i) = cloud.nearest_to_pixel(px.x, px.y, params.cloud_tolerance_px) {
                if let (Some(p), Some([u, v])) = (cloud.point_mm(i), cloud.pixels().get(i)) {
                    return Ok((Point2::new(*u as f64, *v as f64), p));
                }
            }
        }
        let hit = self
            .depth
            .nearest_valid(px.x.round() as i64, px.y.round() as i64, params.depth_search_radius)
            .ok_or(MeasureError::DepthUnavailable { x: px.x, y: px.y })?;
        let pixel = Point2::new(hit.x as f64, hit.y as f64);
        let p = flip_y(&self.intrinsics.back_project(pixel.x, pixel.y, hit.depth_mm as f64));
        Ok((pixel, p))
    }

    /// Project a Y-up millimetre point into depth-map pixels.
    pub fn project_mm(&self, p: &Point3<f64>) -> Option<Point2<f64>> {
        self.intrinsics.project(&flip_y(p))
    }
}

/// What a click did.
#[derive(Clone, Debug, PartialEq)]
pub enum ClickOutcome {
    Pending,
    /// A polyline came back near its start.
    SuggestClose,
    Completed(Box<Measurement>),
}

/// Routes clicks into the active state machine and assembles completed
/// measurements.
#[derive(Clone, Debug, Default)]
pub struct InteractionManager {
    params: InteractionParams,
    profile: ProfileParams,
    state: StateManager,
    machine: MeasurementStateMachine,
    calculator: MeasurementCalculator,
    /// Depth-map pixels to display pixels for the latest click.
    to_display: Option<Homography>,
}

impl InteractionManager {
    pub fn new(
        params: InteractionParams,
        state: StateParams,
        calculator: CalculatorParams,
        profile: ProfileParams,
    ) -> Self {
        Self {
            params,
            profile,
            state: StateManager::default(),
            machine: MeasurementStateMachine::new(state),
            calculator: MeasurementCalculator::new(calculator),
            to_display: None,
        }
    }

    pub fn params(&self) -> &InteractionParams {
        &self.params
    }

    pub fn mode(&self) -> Mode {
        self.state.mode()
    }

    pub fn active_kind(&self) -> Option<MeasurementKind> {
        self.machine.active_kind()
    }

    pub fn pending_picks(&self) -> &[Pick] {
        self.machine.picks()
    }

    pub fn calculator(&self) -> &MeasurementCalculator {
        &self.calculator
    }

    pub fn begin(&mut self, kind: MeasurementKind) {
        self.state.begin_add(kind);
        self.machine.begin(kind);
    }

    pub fn cancel(&mut self) {
        self.machine.cancel();
        self.state.end_add();
    }

    /// Handle a click at display position `display`, already mapped to the
    /// depth-map pixel `px`. Points this manager synthesizes are placed on
    /// screen at their depth pixel.
    pub fn click(
        &mut self,
        ctx: &FrameContext,
        display: Point2<f64>,
        px: Point2<f64>,
    ) -> Result<ClickOutcome, MeasureError> {
        self.to_display = None;
        self.pick(ctx, display, px)
    }

    /// Handle a click at display position `display`; `to_depth` maps display
    /// pixels to depth-map pixels (see [`FrameContext::display_to_depth`]).
    pub fn click_mapped(
        &mut self,
        ctx: &FrameContext,
        display: Point2<f64>,
        to_depth: &Homography,
    ) -> Result<ClickOutcome, MeasureError> {
        let px = to_depth.try_apply(display).ok_or(MeasureError::OutsideImage)?;
        self.to_display = to_depth.inverse();
        self.pick(ctx, display, px)
    }

    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self, ctx)))]
    fn pick(
        &mut self,
        ctx: &FrameContext,
        display: Point2<f64>,
        px: Point2<f64>,
    ) -> Result<ClickOutcome, MeasureError> {
        if self.machine.is_idle() {
            return Err(MeasureError::NotMeasuring);
        }
        let (pixel, point_mm) = ctx.resolve_pixel(px, &self.params).inspect_err(|e| {
            log::info!("click at ({:.1}, {:.1}) rejected: {e}", px.x, px.y);
        })?;
        let pick = Pick {
            display,
            pixel,
            point_mm,
        };
        match self.machine.add_pick(pick)? {
            PickOutcome::Pending => Ok(ClickOutcome::Pending),
            PickOutcome::SuggestClose => Ok(ClickOutcome::SuggestClose),
            PickOutcome::SegmentsReady(segments) => {
                self.place_intersection(ctx, &segments)?;
                Ok(ClickOutcome::Pending)
            }
            PickOutcome::Ready(kind, picks) => self.complete(ctx, kind, picks),
        }
    }

    /// Explicit finish for open-ended kinds.
    pub fn finish(&mut self, ctx: &FrameContext) -> Result<ClickOutcome, MeasureError> {
        match self.machine.finish()? {
            PickOutcome::Ready(kind, picks) => self.complete(ctx, kind, picks),
            _ => Ok(ClickOutcome::Pending),
        }
    }

    fn place_intersection(
        &mut self,
        ctx: &FrameContext,
        s: &[Pick; 4],
    ) -> Result<(), MeasureError> {
        let closest = match segments_intersection(
            &s[0].point_mm,
            &s[1].point_mm,
            &s[2].point_mm,
            &s[3].point_mm,
        ) {
            Ok(c) => c,
            Err(e) => {
                log::info!("missing area rejected: {e}");
                self.machine.reset_picks();
                return Err(e);
            }
        };
        let max_gap = self.calculator.params().max_line_gap_mm;
        if closest.gap > max_gap {
            self.machine.pop_pick();
            return Err(MeasureError::SegmentsApart {
                gap_mm: closest.gap,
            });
        }

        let pixel = ctx
            .project_mm(&closest.midpoint)
            .or_else(|| line_intersection_2d(&s[0].pixel, &s[1].pixel, &s[2].pixel, &s[3].pixel))
            .unwrap_or_else(|| nalgebra::center(&s[0].pixel, &s[1].pixel));
        let display = self
            .to_display
            .and_then(|h| h.try_apply(pixel))
            .unwrap_or(pixel);
        self.machine.insert_intersection(Pick {
            display,
            pixel,
            point_mm: closest.midpoint,
        })
    }

    fn complete(
        &mut self,
        ctx: &FrameContext,
        kind: MeasurementKind,
        picks: Vec<Pick>,
    ) -> Result<ClickOutcome, MeasureError> {
        match self.assemble(ctx, kind, &picks) {
            Ok(m) => {
                log::info!("{kind} measurement completed: {}", m.result_text);
                self.state.end_add();
                Ok(ClickOutcome::Completed(Box::new(m)))
            }
            Err(e) => {
                log::info!("{kind} measurement discarded: {e}");
                self.machine.begin(kind);
                Err(e)
            }
        }
    }

    fn assemble(
        &self,
        ctx: &FrameContext,
        kind: MeasurementKind,
        picks: &[Pick],
    ) -> Result<Measurement, MeasureError> {
        let points: Vec<Point3<f64>> = picks.iter().map(|p| p.point_mm).collect();
        let clicks: Vec<Point2<f64>> = picks.iter().map(|p| p.pixel).collect();
        if kind == MeasurementKind::Profile {
            let profile = sample_profile(
                &ctx.depth,
                &ctx.intrinsics,
                clicks[0],
                clicks[1],
                &points[0],
                &points[1],
                &self.profile,
            )?;
            let eval = self.calculator.evaluate(kind, &points, Some(&profile))?;
            let mut m = Measurement::new(kind, points, clicks, eval);
            m.profile_3d_points = profile.points_3d;
            m.profile_samples = profile.samples;
            return Ok(m);
        }
        let eval = self.calculator.evaluate(kind, &points, None)?;
        Ok(Measurement::new(kind, points, clicks, eval))
    }
}
