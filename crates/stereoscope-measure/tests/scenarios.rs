//! End-to-end measurement scenarios on synthetic depth.

use approx::assert_relative_eq;
use image::RgbImage;
use nalgebra::{Point2, Point3};
use std::sync::Arc;
use stereoscope_core::{DepthMap, FrameRecord, ImageSize, Intrinsics};
use stereoscope_depth::{CloudOptions, PointCloud};
use stereoscope_measure::{
    CalculatorParams, ClickOutcome, FrameContext, InteractionManager, InteractionParams,
    MeasureError, Measurement, MeasurementCalculator, MeasurementKind, MeasurementStore,
    ProfileParams, StateParams,
};

const W: u32 = 1280;
const H: u32 = 720;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn context(depth: DepthMap, k: Intrinsics) -> FrameContext {
    let size = depth.size();
    FrameContext::new(
        Arc::new(depth),
        Arc::new(RgbImage::new(size.width, size.height)),
        FrameRecord::passthrough(size),
        &k,
    )
}

/// `Z = 500 mm` everywhere, `fx = fy = 1000`, principal point at the centre.
fn plane_500() -> FrameContext {
    context(
        DepthMap::filled(W, H, 500.0),
        Intrinsics::new(1000.0, 1000.0, 640.0, 360.0),
    )
}

/// Pixel of the Y-up point `(x, y, 500)` on [`plane_500`].
fn px(x: f64, y: f64) -> (f64, f64) {
    (640.0 + 2.0 * x, 360.0 - 2.0 * y)
}

fn click(im: &mut InteractionManager, ctx: &FrameContext, (x, y): (f64, f64)) -> ClickOutcome {
    let p = Point2::new(x, y);
    im.click(ctx, p, p).unwrap()
}

fn completed(outcome: ClickOutcome) -> Measurement {
    match outcome {
        ClickOutcome::Completed(m) => *m,
        other => panic!("expected a completed measurement, got {other:?}"),
    }
}

fn p(x: f64, y: f64, z: f64) -> Point3<f64> {
    Point3::new(x, y, z)
}

#[test]
fn length_on_synthetic_plane() {
    init_logs();
    let ctx = plane_500();
    let mut im = InteractionManager::default();
    im.begin(MeasurementKind::Length);
    assert!(matches!(click(&mut im, &ctx, (500.0, 360.0)), ClickOutcome::Pending));
    let m = completed(click(&mut im, &ctx, (780.0, 360.0)));
    assert_relative_eq!(m.points_mm[0], p(-70.0, 0.0, 500.0), epsilon = 1e-9);
    assert_relative_eq!(m.points_mm[1], p(70.0, 0.0, 500.0), epsilon = 1e-9);
    assert_eq!(m.result_text, "140.00 mm");
    assert!(im.active_kind().is_none());
}

#[test]
fn depth_on_tilted_plane() {
    let calc = MeasurementCalculator::default();
    let points = [
        p(0.0, 0.0, 500.0),
        p(100.0, 0.0, 500.0),
        p(0.0, 100.0, 480.0),
        p(50.0, 50.0, 470.0),
    ];
    let eval = calc.evaluate(MeasurementKind::Depth, &points, None).unwrap();
    // n = (0, 2000, 10000), (P4 - P1) . n = -200000
    assert_relative_eq!(eval.value, 200_000.0 / 104_000_000f64.sqrt(), epsilon = 1e-9);
    assert_eq!(eval.text, "Depth: 19.61 mm");
}

#[test]
fn point_to_line_inside_and_past_endpoint() {
    let ctx = plane_500();
    let mut im = InteractionManager::default();

    im.begin(MeasurementKind::PointToLine);
    click(&mut im, &ctx, px(50.0, 30.0));
    click(&mut im, &ctx, px(0.0, 0.0));
    let m = completed(click(&mut im, &ctx, px(100.0, 0.0)));
    assert_eq!(m.result_text, "30.00 mm");

    im.begin(MeasurementKind::PointToLine);
    click(&mut im, &ctx, px(120.0, 0.0));
    click(&mut im, &ctx, px(0.0, 0.0));
    let m = completed(click(&mut im, &ctx, px(100.0, 0.0)));
    assert_eq!(m.result_text, "20.00 mm");
}

#[test]
fn area_of_square_closes_on_start() {
    let ctx = plane_500();
    let mut im = InteractionManager::default();
    im.begin(MeasurementKind::Area);
    for v in [(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0)] {
        assert!(matches!(click(&mut im, &ctx, px(v.0, v.1)), ClickOutcome::Pending));
    }
    let m = completed(click(&mut im, &ctx, px(1.0, 1.0)));
    assert_eq!(m.points_mm.len(), 4);
    assert_eq!(m.result_text, "10000.00 mm²");
}

#[test]
fn area_closing_tolerance_is_strict() {
    let params = StateParams {
        close_tolerance_mm: 5.0,
    };
    let ctx = plane_500();
    let mut im = InteractionManager::new(
        InteractionParams::default(),
        params,
        CalculatorParams::default(),
        ProfileParams::default(),
    );
    im.begin(MeasurementKind::Area);
    for v in [(0.0, 0.0), (100.0, 0.0), (100.0, 100.0)] {
        click(&mut im, &ctx, px(v.0, v.1));
    }
    // exactly 5 mm from the first pick
    assert!(matches!(click(&mut im, &ctx, px(3.0, 4.0)), ClickOutcome::Pending));
    assert_eq!(im.pending_picks().len(), 4);
    // 4.5 mm closes
    let m = completed(click(&mut im, &ctx, px(4.5, 0.0)));
    assert_eq!(m.points_mm.len(), 4);
}

#[test]
fn profile_on_linear_tilt_is_flat() {
    // plane Z = 500 - 0.1 X seen through fx = fy = 960
    let depth = DepthMap::from_fn(W, H, |u, _| {
        (500.0 / (1.0 + 0.1 * (u as f64 - 640.0) / 960.0)) as f32
    });
    let ctx = context(depth, Intrinsics::new(960.0, 960.0, 640.0, 360.0));
    let mut im = InteractionManager::default();
    im.begin(MeasurementKind::Profile);
    click(&mut im, &ctx, (640.0, 360.0));
    let m = completed(click(&mut im, &ctx, (1040.0, 360.0)));
    assert_relative_eq!(m.points_mm[0], p(0.0, 0.0, 500.0), epsilon = 1e-3);
    assert_relative_eq!(m.points_mm[1], p(200.0, 0.0, 480.0), epsilon = 1e-3);
    assert_eq!(m.result_text, "surface flat");
    assert_eq!(m.profile_samples.len(), ProfileParams::default().samples);
    assert!(m.profile_samples.iter().all(|s| s.elevation_mm.abs() < 0.01));
    let last = m.profile_samples.last().unwrap();
    assert_relative_eq!(last.distance_mm, 40_400f64.sqrt(), epsilon = 1e-2);
}

#[test]
fn missing_area_from_two_segments() {
    init_logs();
    let ctx = plane_500();
    let mut im = InteractionManager::default();
    im.begin(MeasurementKind::MissingArea);
    for v in [(0.0, 0.0), (100.0, 0.0), (50.0, -50.0)] {
        click(&mut im, &ctx, px(v.0, v.1));
    }
    assert!(matches!(click(&mut im, &ctx, px(50.0, 50.0)), ClickOutcome::Pending));
    let picks = im.pending_picks();
    assert_eq!(picks.len(), 5);
    assert_relative_eq!(picks[4].point_mm, p(50.0, 0.0, 500.0), epsilon = 1e-9);
    assert_relative_eq!(picks[4].pixel, Point2::new(740.0, 360.0), epsilon = 1e-9);

    click(&mut im, &ctx, px(100.0, 100.0));
    assert!(matches!(
        im.finish(&ctx),
        Err(MeasureError::PointCount { expected: 7, got: 6, .. })
    ));
    click(&mut im, &ctx, px(0.0, 100.0));
    let m = completed(im.finish(&ctx).unwrap());
    assert_eq!(m.result_text, "5000.00 mm²");
    assert_eq!(m.polygon().len(), 3);
}

#[test]
fn zero_search_radius_reads_only_the_pixel() {
    let mut depth = DepthMap::filled(W, H, 500.0);
    depth.set(700, 360, f32::NAN);
    let ctx = context(depth, Intrinsics::new(1000.0, 1000.0, 640.0, 360.0));
    let strict = InteractionParams {
        cloud_tolerance_px: 0.0,
        depth_search_radius: 0,
    };
    assert!(matches!(
        ctx.resolve_pixel(Point2::new(700.0, 360.0), &strict),
        Err(MeasureError::DepthUnavailable { .. })
    ));
    let (pixel, _) = ctx.resolve_pixel(Point2::new(701.0, 360.0), &strict).unwrap();
    assert_eq!(pixel, Point2::new(701.0, 360.0));
}

#[test]
fn cloud_and_depth_agree_on_clicked_point() {
    let depth = DepthMap::filled(64, 48, 500.0);
    let k = Intrinsics::new(100.0, 100.0, 32.0, 24.0);
    let cloud = PointCloud::build(&depth, None, &k, &CloudOptions::default()).unwrap();
    let bare = context(depth, k);
    let with_cloud = bare.clone().with_cloud(Arc::new(cloud));
    let params = InteractionParams::default();
    for (x, y) in [(10.0, 10.0), (32.0, 24.0), (50.2, 40.7)] {
        let click = Point2::new(x, y);
        let (pa, a) = bare.resolve_pixel(click, &params).unwrap();
        let (pb, b) = with_cloud.resolve_pixel(click, &params).unwrap();
        assert_eq!(pa, pb);
        assert_relative_eq!(a, b, epsilon = 1e-2);
    }
    assert_eq!(bare.depth_size(), ImageSize::new(64, 48));
}

#[test]
fn undo_redo_restores_identical_store() {
    let ctx = plane_500();
    let mut im = InteractionManager::default();
    let mut store = MeasurementStore::new();
    for x in [10.0, 20.0, 30.0] {
        im.begin(MeasurementKind::Length);
        click(&mut im, &ctx, px(0.0, 0.0));
        store.add(completed(click(&mut im, &ctx, px(x, 0.0))));
    }
    let snapshot = store.items().to_vec();
    let second = snapshot[1].id;
    store.remove(second);
    store.clear();
    while store.undo() {}
    assert!(store.is_empty());
    while store.redo() {}
    assert!(store.is_empty());
    // the two clear removals, then the explicit removal
    for _ in 0..3 {
        store.undo();
    }
    assert_eq!(store.items(), &snapshot[..]);
}
