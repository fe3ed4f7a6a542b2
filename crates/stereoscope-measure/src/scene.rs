//! 3-D scene primitives for measurements, in the point-cloud frame.

use crate::{calculator, Measurement, MeasurementId, MeasurementKind};
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use stereoscope_core::centroid;
use stereoscope_depth::PointCloud;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneParams {
    /// Viewer point size; sphere radii scale with it.
    pub point_size: f32,
    /// Sphere radius at point size 1, metres.
    pub base_radius_m: f32,
    /// Target length of one dash period, metres.
    pub dash_period_m: f32,
    pub min_dashes: usize,
    pub max_dashes: usize,
    /// Dashed lines shorter than this are drawn solid.
    pub solid_below_m: f32,
    /// Fraction of each dash period that is drawn.
    pub dash_fill: f32,
    pub line_width: f32,
    pub aux_color: [u8; 3],
    pub perpendicular_color: [u8; 3],
}

impl Default for SceneParams {
    fn default() -> Self {
        Self {
            point_size: 1.0,
            base_radius_m: 0.0005,
            dash_period_m: 0.003,
            min_dashes: 8,
            max_dashes: 50,
            solid_below_m: 0.001,
            dash_fill: 0.7,
            line_width: 2.0,
            aux_color: [255, 255, 0],
            perpendicular_color: [255, 0, 255],
        }
    }
}

impl SceneParams {
    pub fn sphere_radius(&self) -> f32 {
        self.base_radius_m * 1.5 * self.point_size
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Primitive {
    Sphere {
        center: Point3<f32>,
        radius: f32,
        color: [u8; 3],
    },
    Line {
        from: Point3<f32>,
        to: Point3<f32>,
        color: [u8; 3],
        width: f32,
    },
    /// Billboard text; the viewer projects `anchor` at draw time.
    Text {
        anchor: Point3<f32>,
        text: String,
        color: [u8; 3],
    },
}

/// Primitives of one measurement, keyed by `(kind, index)`.
#[derive(Clone, Debug, PartialEq)]
pub struct SceneGroup {
    pub kind: MeasurementKind,
    /// Position of the measurement in the list the scene was built from.
    pub index: usize,
    pub id: MeasurementId,
    pub primitives: Vec<Primitive>,
}

/// Visible pieces of a dashed line from `a` to `b`.
///
/// The period count is `len / dash_period`, clamped to
/// `[min_dashes, max_dashes]` and rounded up to even; every even period is
/// drawn for `dash_fill` of its length.
pub fn dashed_segments(
    a: Point3<f32>,
    b: Point3<f32>,
    params: &SceneParams,
) -> Vec<(Point3<f32>, Point3<f32>)> {
    let d = b - a;
    let len = d.norm();
    if !len.is_finite() {
        return Vec::new();
    }
    if len < params.solid_below_m {
        return vec![(a, b)];
    }
    let lo = params.min_dashes.max(2);
    let hi = params.max_dashes.max(lo);
    let mut n = ((len / params.dash_period_m).floor() as usize).clamp(lo, hi);
    if n % 2 == 1 {
        n += 1;
    }
    let step = d / n as f32;
    (0..n)
        .step_by(2)
        .map(|i| {
            let s = a + step * i as f32;
            (s, s + step * params.dash_fill)
        })
        .collect()
}

struct GroupBuilder<'a> {
    params: &'a SceneParams,
    color: [u8; 3],
    primitives: Vec<Primitive>,
}

impl GroupBuilder<'_> {
    fn sphere(&mut self, center: Point3<f32>, scale: f32) {
        self.primitives.push(Primitive::Sphere {
            center,
            radius: self.params.sphere_radius() * scale,
            color: self.color,
        });
    }

    fn line_colored(&mut self, from: Point3<f32>, to: Point3<f32>, color: [u8; 3]) {
        self.primitives.push(Primitive::Line {
            from,
            to,
            color,
            width: self.params.line_width,
        });
    }

    fn line(&mut self, from: Point3<f32>, to: Point3<f32>) {
        self.line_colored(from, to, self.color);
    }

    fn dashed_colored(&mut self, from: Point3<f32>, to: Point3<f32>, color: [u8; 3]) {
        for (a, b) in dashed_segments(from, to, self.params) {
            self.line_colored(a, b, color);
        }
    }

    fn dashed(&mut self, from: Point3<f32>, to: Point3<f32>) {
        self.dashed_colored(from, to, self.color);
    }

    fn text(&mut self, anchor: Point3<f32>, text: &str) {
        self.primitives.push(Primitive::Text {
            anchor,
            text: text.to_string(),
            color: self.color,
        });
    }
}

fn mid(a: Point3<f32>, b: Point3<f32>) -> Point3<f32> {
    nalgebra::center(&a, &b)
}

/// Scene groups for every visible measurement.
///
/// Millimetre points are placed with [`PointCloud::to_cloud_frame`] when a
/// cloud is given, otherwise converted to metres unshifted.
pub fn build_scene(
    items: &[Measurement],
    cloud: Option<&PointCloud>,
    params: &SceneParams,
) -> Vec<SceneGroup> {
    let place = |p: &Point3<f64>| -> Point3<f32> {
        match cloud {
            Some(c) => c.to_cloud_frame(p),
            None => (p * 1e-3).cast::<f32>(),
        }
    };

    items
        .iter()
        .enumerate()
        .filter(|(_, m)| m.visible)
        .map(|(index, m)| {
            let mut g = GroupBuilder {
                params,
                color: m.color,
                primitives: Vec::new(),
            };
            build_group(&mut g, m, &place);
            SceneGroup {
                kind: m.kind,
                index,
                id: m.id,
                primitives: g.primitives,
            }
        })
        .collect()
}

fn build_group(g: &mut GroupBuilder<'_>, m: &Measurement, place: &dyn Fn(&Point3<f64>) -> Point3<f32>) {
    let pts: Vec<Point3<f32>> = m.points_mm.iter().map(place).collect();
    let text = m.result_text.as_str();
    match m.kind {
        MeasurementKind::Length if pts.len() >= 2 => {
            g.sphere(pts[0], 1.0);
            g.sphere(pts[1], 1.0);
            g.line(pts[0], pts[1]);
            g.text(mid(pts[0], pts[1]), text);
        }
        MeasurementKind::PointToLine if pts.len() >= 3 => {
            for p in &pts {
                g.sphere(*p, 1.0);
            }
            g.line(pts[1], pts[2]);
            let Ok(r) = calculator::point_to_line(&m.points_mm[0], &m.points_mm[1], &m.points_mm[2])
            else {
                g.text(pts[0], text);
                return;
            };
            let foot = place(&r.line_foot);
            if r.t < 0.0 {
                g.dashed(foot, pts[1]);
            } else if r.t > 1.0 {
                g.dashed(foot, pts[2]);
            }
            g.line_colored(pts[0], foot, g.params.perpendicular_color);
            g.text(mid(pts[0], foot), text);
        }
        MeasurementKind::Depth if pts.len() >= 4 => {
            for p in &pts[..3] {
                g.sphere(*p, 0.8);
            }
            g.sphere(pts[3], 1.0);
            for (i, j) in [(0, 1), (1, 2), (2, 0)] {
                g.dashed(pts[i], pts[j]);
            }
            let Ok(r) = calculator::point_to_plane(
                &m.points_mm[0],
                &m.points_mm[1],
                &m.points_mm[2],
                &m.points_mm[3],
            ) else {
                g.text(pts[3], text);
                return;
            };
            let foot = place(&r.foot);
            g.line(pts[3], foot);
            let aux = g.params.aux_color;
            for p in &pts[..3] {
                g.dashed_colored(foot, *p, aux);
            }
            g.text(mid(pts[3], foot), text);
        }
        MeasurementKind::Area if pts.len() >= 3 => {
            for p in &pts {
                g.sphere(*p, 1.0);
            }
            for i in 0..pts.len() {
                g.line(pts[i], pts[(i + 1) % pts.len()]);
            }
            if let Some(c) = centroid(&m.points_mm) {
                g.text(place(&c), text);
            }
        }
        MeasurementKind::Polyline if pts.len() >= 2 => {
            for p in &pts {
                g.sphere(*p, 1.0);
            }
            for w in pts.windows(2) {
                g.line(w[0], w[1]);
            }
            let lift = Vector3::y() * 2.0 * g.params.sphere_radius();
            let (first, last) = (pts[0], pts[pts.len() - 1]);
            g.text(mid(first, last) + lift, text);
        }
        MeasurementKind::Profile if pts.len() >= 2 => {
            g.sphere(pts[0], 1.0);
            g.sphere(pts[1], 1.0);
            if m.profile_3d_points.len() >= 2 {
                let path: Vec<Point3<f32>> = m.profile_3d_points.iter().map(place).collect();
                for w in path.windows(2) {
                    g.line(w[0], w[1]);
                }
            } else {
                g.line(pts[0], pts[1]);
            }
            g.text(mid(pts[0], pts[1]), text);
        }
        MeasurementKind::MissingArea if pts.len() >= 7 => {
            for p in &pts[..4] {
                g.sphere(*p, 1.0);
            }
            g.line(pts[0], pts[1]);
            g.line(pts[2], pts[3]);
            g.sphere(pts[4], 1.2);
            let poly = &pts[4..];
            for p in &poly[1..] {
                g.sphere(*p, 1.0);
            }
            for i in 0..poly.len() {
                g.line(poly[i], poly[(i + 1) % poly.len()]);
            }
            if let Some(c) = centroid(m.polygon()) {
                g.text(place(&c), text);
            }
        }
        _ => {
            for p in &pts {
                g.sphere(*p, 1.0);
            }
        }
    }
}
