//! Measurement overlays drawn onto an image.

use crate::{calculator, LabelFont, Measurement, MeasurementKind, Pick};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_antialiased_line_segment_mut, draw_filled_circle_mut};
use imageproc::pixelops::interpolate;
use nalgebra::{Point2, Point3, Vector2};
use serde::{Deserialize, Serialize};
use stereoscope_core::{flip_y, Homography, ImageSize, Intrinsics};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderStyle {
    pub marker_radius: i32,
    /// Black ring drawn under each marker.
    pub ring_radius: i32,
    pub line_width: u32,
    pub selected_line_width: u32,
    pub dash_px: f64,
    pub gap_px: f64,
    pub font_px: f32,
    pub label_padding: i32,
    /// Opacity of the label background.
    pub label_alpha: f32,
    /// Offset of Depth and Area labels from their anchor point.
    pub label_offset: [i32; 2],
    pub chart_size: [u32; 2],
    pub pending_color: [u8; 3],
    /// Colour of the PointToLine perpendicular.
    pub perpendicular_color: [u8; 3],
}

impl Default for RenderStyle {
    fn default() -> Self {
        Self {
            marker_radius: 10,
            ring_radius: 12,
            line_width: 2,
            selected_line_width: 4,
            dash_px: 10.0,
            gap_px: 6.0,
            font_px: 24.0,
            label_padding: 10,
            label_alpha: 0.6,
            label_offset: [15, 30],
            chart_size: [200, 80],
            pending_color: [0, 255, 255],
            perpendicular_color: [255, 0, 255],
        }
    }
}

/// How depth-map pixels land on the target image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OverlayView {
    /// Depth-map pixels to target-image pixels.
    pub to_image: Homography,
    /// `K'` of the depth-map frame, used to place projected feet.
    pub intrinsics: Intrinsics,
}

impl OverlayView {
    /// Target image in the depth map's own frame.
    pub fn native(intrinsics: Intrinsics) -> Self {
        Self {
            to_image: Homography::identity(),
            intrinsics,
        }
    }

    fn map(&self, p: Point2<f64>) -> Option<Point2<f64>> {
        self.to_image.try_apply(p)
    }

    fn project(&self, p_mm: &Point3<f64>) -> Option<Point2<f64>> {
        self.map(self.intrinsics.project(&flip_y(p_mm))?)
    }
}

const INSIDE: u8 = 0;
const LEFT: u8 = 1;
const RIGHT: u8 = 2;
const BOTTOM: u8 = 4;
const TOP: u8 = 8;

fn outcode(p: Point2<f64>, w: f64, h: f64) -> u8 {
    let mut code = INSIDE;
    if p.x < 0.0 {
        code |= LEFT;
    } else if p.x > w {
        code |= RIGHT;
    }
    if p.y < 0.0 {
        code |= TOP;
    } else if p.y > h {
        code |= BOTTOM;
    }
    code
}

/// Cohen-Sutherland clip of segment `a..b` against `[0, w] x [0, h]`.
pub fn clip_segment(
    mut a: Point2<f64>,
    mut b: Point2<f64>,
    w: f64,
    h: f64,
) -> Option<(Point2<f64>, Point2<f64>)> {
    if !(a.x.is_finite() && a.y.is_finite() && b.x.is_finite() && b.y.is_finite()) {
        return None;
    }
    let mut ca = outcode(a, w, h);
    let mut cb = outcode(b, w, h);
    loop {
        if ca | cb == INSIDE {
            return Some((a, b));
        }
        if ca & cb != INSIDE {
            return None;
        }
        let out = if ca != INSIDE { ca } else { cb };
        let d = b - a;
        let p = if out & TOP != 0 {
            Point2::new(a.x + d.x * (0.0 - a.y) / d.y, 0.0)
        } else if out & BOTTOM != 0 {
            Point2::new(a.x + d.x * (h - a.y) / d.y, h)
        } else if out & RIGHT != 0 {
            Point2::new(w, a.y + d.y * (w - a.x) / d.x)
        } else {
            Point2::new(0.0, a.y + d.y * (0.0 - a.x) / d.x)
        };
        if out == ca {
            a = p;
            ca = outcode(a, w, h);
        } else {
            b = p;
            cb = outcode(b, w, h);
        }
    }
}

/// Draws measurement overlays.
#[derive(Clone, Debug, Default)]
pub struct OverlayRenderer {
    style: RenderStyle,
    font: LabelFont,
}

struct Canvas<'a> {
    img: &'a mut RgbImage,
    size: ImageSize,
}

impl Canvas<'_> {
    fn line(&mut self, a: Point2<f64>, b: Point2<f64>, color: Rgb<u8>, width: u32) {
        let (w, h) = (self.size.width as f64 - 1.0, self.size.height as f64 - 1.0);
        let Some((a, b)) = clip_segment(a, b, w, h) else {
            return;
        };
        let d = b - a;
        let len = d.norm();
        let n = if len > 0.0 {
            Vector2::new(-d.y, d.x) / len
        } else {
            Vector2::zeros()
        };
        let width = width.max(1);
        for k in 0..width {
            let off = n * (k as f64 - (width - 1) as f64 / 2.0);
            let (p, q) = (a + off, b + off);
            draw_antialiased_line_segment_mut(
                &mut *self.img,
                (p.x.round() as i32, p.y.round() as i32),
                (q.x.round() as i32, q.y.round() as i32),
                color,
                interpolate,
            );
        }
    }

    fn dashed(&mut self, a: Point2<f64>, b: Point2<f64>, color: Rgb<u8>, width: u32, dash: f64, gap: f64) {
        let (w, h) = (self.size.width as f64 - 1.0, self.size.height as f64 - 1.0);
        let Some((a, b)) = clip_segment(a, b, w, h) else {
            return;
        };
        let len = (b - a).norm();
        if len <= 0.0 || dash <= 0.0 {
            return;
        }
        let dir = (b - a) / len;
        let mut s = 0.0;
        while s < len {
            let e = (s + dash).min(len);
            self.line(a + dir * s, a + dir * e, color, width);
            s += dash + gap.max(0.0);
        }
    }

    fn marker(&mut self, p: Point2<f64>, color: Rgb<u8>, style: &RenderStyle) {
        if !p.x.is_finite() || !p.y.is_finite() {
            return;
        }
        let c = (p.x.round() as i32, p.y.round() as i32);
        draw_filled_circle_mut(&mut *self.img, c, style.ring_radius, Rgb([0, 0, 0]));
        draw_filled_circle_mut(&mut *self.img, c, style.marker_radius, color);
    }

    /// Semi-transparent box with white text, above `anchor` and clamped to
    /// the image.
    fn label(&mut self, anchor: Point2<f64>, text: &str, font: &LabelFont, style: &RenderStyle) {
        if !anchor.x.is_finite() || !anchor.y.is_finite() || text.is_empty() {
            return;
        }
        let (tw, th) = font.text_size(style.font_px, text);
        let pad = style.label_padding;
        let bw = tw as i32 + 2 * pad;
        let bh = th as i32 + 2 * pad;
        let max_x = (self.size.width as i32 - bw).max(0);
        let max_y = (self.size.height as i32 - bh).max(0);
        let x0 = (anchor.x.round() as i32 - bw / 2).clamp(0, max_x);
        let y0 = (anchor.y.round() as i32 - bh - pad).clamp(0, max_y);

        let a = style.label_alpha.clamp(0.0, 1.0);
        let x1 = (x0 + bw).min(self.size.width as i32);
        let y1 = (y0 + bh).min(self.size.height as i32);
        for y in y0..y1 {
            for x in x0..x1 {
                let p = self.img.get_pixel_mut(x as u32, y as u32);
                for c in p.0.iter_mut() {
                    *c = (*c as f32 * (1.0 - a)).round() as u8;
                }
            }
        }
        font.draw(self.img, Rgb([255, 255, 255]), x0 + pad, y0 + pad, style.font_px, text);
    }
}

impl OverlayRenderer {
    pub fn new(style: RenderStyle, font: LabelFont) -> Self {
        Self { style, font }
    }

    pub fn style(&self) -> &RenderStyle {
        &self.style
    }

    /// `base` with every visible measurement and the pending picks drawn.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all, fields(n = items.len())))]
    pub fn render(
        &self,
        base: &RgbImage,
        view: &OverlayView,
        items: &[Measurement],
        pending: &[Pick],
    ) -> RgbImage {
        let mut out = base.clone();
        let mut canvas = Canvas {
            size: ImageSize::of(base),
            img: &mut out,
        };
        for m in items.iter().filter(|m| m.visible) {
            self.draw_measurement(&mut canvas, view, m);
        }
        self.draw_pending(&mut canvas, view, pending);
        out
    }

    fn draw_pending(&self, c: &mut Canvas<'_>, view: &OverlayView, pending: &[Pick]) {
        let color = Rgb(self.style.pending_color);
        let pts: Vec<Point2<f64>> = pending.iter().filter_map(|p| view.map(p.pixel)).collect();
        for w in pts.windows(2) {
            c.line(w[0], w[1], color, self.style.line_width);
        }
        for p in &pts {
            c.marker(*p, color, &self.style);
        }
    }

    fn draw_measurement(&self, c: &mut Canvas<'_>, view: &OverlayView, m: &Measurement) {
        let s = &self.style;
        let color = Rgb(m.color);
        let width = if m.selected {
            s.selected_line_width
        } else {
            s.line_width
        };
        let px: Vec<Point2<f64>> = m
            .click_points_px
            .iter()
            .map(|p| view.map(*p).unwrap_or(Point2::new(f64::NAN, f64::NAN)))
            .collect();
        if px.len() < m.kind.min_picks().min(2) {
            return;
        }
        let reach = 2.0 * c.size.diagonal();
        let offset = Vector2::new(s.label_offset[0] as f64, s.label_offset[1] as f64);

        match m.kind {
            MeasurementKind::Length | MeasurementKind::Profile if px.len() >= 2 => {
                c.line(px[0], px[1], color, width);
                if m.kind == MeasurementKind::Profile {
                    self.draw_chart(c, m, nalgebra::center(&px[0], &px[1]));
                }
                c.label(nalgebra::center(&px[0], &px[1]), &m.result_text, &self.font, s);
            }
            MeasurementKind::PointToLine if px.len() >= 3 && m.points_mm.len() >= 3 => {
                c.line(px[1], px[2], color, width);
                let foot = calculator::point_to_line(&m.points_mm[0], &m.points_mm[1], &m.points_mm[2])
                    .ok()
                    .and_then(|r| {
                        let foot_px = view.project(&r.line_foot)?;
                        Some((r.t, foot_px))
                    });
                if let Some((t, foot_px)) = foot {
                    if !(0.0..=1.0).contains(&t) {
                        let (from, toward) = if t < 0.0 { (px[1], px[2]) } else { (px[2], px[1]) };
                        let dir = from - toward;
                        if dir.norm() > 0.0 {
                            let far = from + dir.normalize() * reach;
                            c.dashed(from, far, color, s.line_width, s.dash_px, s.gap_px);
                        }
                    }
                    c.line(px[0], foot_px, Rgb(s.perpendicular_color), width);
                    c.label(nalgebra::center(&px[0], &foot_px), &m.result_text, &self.font, s);
                } else {
                    c.label(px[0], &m.result_text, &self.font, s);
                }
            }
            MeasurementKind::Depth if px.len() >= 4 && m.points_mm.len() >= 4 => {
                for (i, j) in [(0, 1), (1, 2), (2, 0)] {
                    c.dashed(px[i], px[j], color, s.line_width, s.dash_px, s.gap_px);
                }
                let plane = calculator::point_to_plane(
                    &m.points_mm[0],
                    &m.points_mm[1],
                    &m.points_mm[2],
                    &m.points_mm[3],
                );
                if let Some(foot_px) = plane.ok().and_then(|r| view.project(&r.foot)) {
                    c.line(px[3], foot_px, color, width);
                }
                c.label(px[3] + offset, &m.result_text, &self.font, s);
            }
            MeasurementKind::Area if px.len() >= 3 => {
                for i in 0..px.len() {
                    c.line(px[i], px[(i + 1) % px.len()], color, width);
                }
                c.label(px[0] + offset, &m.result_text, &self.font, s);
            }
            MeasurementKind::Polyline => {
                for w in px.windows(2) {
                    c.line(w[0], w[1], color, width);
                }
                if let Some(last) = px.last() {
                    c.label(*last, &m.result_text, &self.font, s);
                }
            }
            MeasurementKind::MissingArea if px.len() >= 7 => {
                for (a, b) in [(0, 1), (2, 3)] {
                    c.line(px[a], px[b], color, width);
                    let d = px[b] - px[a];
                    if d.norm() > 0.0 {
                        let d = d.normalize() * reach;
                        c.dashed(px[a] - d, px[b] + d, color, 1, s.dash_px, s.gap_px);
                    }
                }
                let poly = &px[4..];
                for i in 0..poly.len() {
                    c.line(poly[i], poly[(i + 1) % poly.len()], color, width);
                }
                let n = poly.len() as f64;
                let centre = poly
                    .iter()
                    .fold(Vector2::zeros(), |acc, p| acc + p.coords)
                    / n;
                c.label(Point2::from(centre), &m.result_text, &self.font, s);
            }
            _ => {}
        }
        for p in &px {
            c.marker(*p, color, s);
        }
    }

    /// Elevation chart below the chord centre.
    fn draw_chart(&self, c: &mut Canvas<'_>, m: &Measurement, anchor: Point2<f64>) {
        let samples = &m.profile_samples;
        if samples.len() < 2 {
            return;
        }
        let [cw, ch] = self.style.chart_size;
        let (cw, ch) = (cw as f64, ch as f64);
        let x0 = (anchor.x - cw / 2.0).clamp(0.0, (c.size.width as f64 - cw).max(0.0));
        let y0 = (anchor.y + self.style.ring_radius as f64 * 2.0)
            .clamp(0.0, (c.size.height as f64 - ch).max(0.0));

        let (d_lo, d_hi) = min_max(samples.iter().map(|s| s.distance_mm));
        let (e_lo, e_hi) = min_max(samples.iter().map(|s| s.elevation_mm));
        let d_span = (d_hi - d_lo).max(1e-9);
        let e_span = (e_hi - e_lo).max(1e-9);
        let to_chart = |d: f64, e: f64| {
            Point2::new(
                x0 + (d - d_lo) / d_span * cw,
                y0 + ch - (e - e_lo) / e_span * ch,
            )
        };

        let frame = Rgb([255, 255, 255]);
        let corners = [
            Point2::new(x0, y0),
            Point2::new(x0 + cw, y0),
            Point2::new(x0 + cw, y0 + ch),
            Point2::new(x0, y0 + ch),
        ];
        for i in 0..4 {
            c.line(corners[i], corners[(i + 1) % 4], frame, 1);
        }
        let color = Rgb(m.color);
        for w in samples.windows(2) {
            c.line(
                to_chart(w[0].distance_mm, w[0].elevation_mm),
                to_chart(w[1].distance_mm, w[1].elevation_mm),
                color,
                1,
            );
        }
    }
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}
