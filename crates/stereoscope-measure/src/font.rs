//! Label text: a TrueType face when one is available, a built-in stroke
//! font otherwise.

use ab_glyph::{FontArc, InvalidFont, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_line_segment_mut, draw_text_mut, text_size};
use std::path::Path;

/// Stroke glyphs on a 4 x 10 grid: rows 0..8 above the baseline, 8..10
/// for descenders.
type Stroke = (u8, u8, u8, u8);

const GRID_H: f32 = 10.0;
const ADVANCE: f32 = 6.0;

const BOX: &[Stroke] = &[(0, 0, 4, 0), (4, 0, 4, 8), (4, 8, 0, 8), (0, 8, 0, 0)];

fn glyph(c: char) -> Option<&'static [Stroke]> {
    let g: &'static [Stroke] = match c {
        ' ' => &[],
        '0' => &[(0, 0, 4, 0), (4, 0, 4, 8), (4, 8, 0, 8), (0, 8, 0, 0), (0, 8, 4, 0)],
        '1' => &[(2, 0, 2, 8), (1, 1, 2, 0), (1, 8, 3, 8)],
        '2' => &[(0, 0, 4, 0), (4, 0, 4, 4), (4, 4, 0, 4), (0, 4, 0, 8), (0, 8, 4, 8)],
        '3' => &[(0, 0, 4, 0), (4, 0, 4, 8), (0, 4, 4, 4), (0, 8, 4, 8)],
        '4' => &[(0, 0, 0, 4), (0, 4, 4, 4), (4, 0, 4, 8)],
        '5' => &[(4, 0, 0, 0), (0, 0, 0, 4), (0, 4, 4, 4), (4, 4, 4, 8), (4, 8, 0, 8)],
        '6' => &[(4, 0, 0, 0), (0, 0, 0, 8), (0, 8, 4, 8), (4, 8, 4, 4), (4, 4, 0, 4)],
        '7' => &[(0, 0, 4, 0), (4, 0, 1, 8)],
        '8' => &[(0, 0, 4, 0), (4, 0, 4, 8), (4, 8, 0, 8), (0, 8, 0, 0), (0, 4, 4, 4)],
        '9' => &[(4, 4, 0, 4), (0, 4, 0, 0), (0, 0, 4, 0), (4, 0, 4, 8), (4, 8, 0, 8)],
        '.' => &[(2, 7, 2, 8)],
        ',' => &[(2, 7, 1, 9)],
        '-' => &[(1, 4, 3, 4)],
        ':' => &[(2, 2, 2, 3), (2, 6, 2, 7)],
        '(' => &[(3, 0, 2, 2), (2, 2, 2, 6), (2, 6, 3, 8)],
        ')' => &[(1, 0, 2, 2), (2, 2, 2, 6), (2, 6, 1, 8)],
        '#' => &[(1, 1, 1, 7), (3, 1, 3, 7), (0, 3, 4, 3), (0, 5, 4, 5)],
        '²' => &[(1, 0, 3, 0), (3, 0, 3, 1), (3, 1, 1, 3), (1, 3, 3, 3)],
        'D' => &[(0, 0, 0, 8), (0, 0, 3, 0), (3, 0, 4, 2), (4, 2, 4, 6), (4, 6, 3, 8), (3, 8, 0, 8)],
        'a' => &[(0, 3, 4, 3), (4, 3, 4, 8), (4, 8, 0, 8), (0, 8, 0, 5), (0, 5, 4, 5)],
        'b' => &[(0, 0, 0, 8), (0, 8, 4, 8), (4, 8, 4, 3), (4, 3, 0, 3)],
        'c' => &[(4, 3, 0, 3), (0, 3, 0, 8), (0, 8, 4, 8)],
        'd' => &[(4, 0, 4, 8), (4, 8, 0, 8), (0, 8, 0, 3), (0, 3, 4, 3)],
        'e' => &[(0, 5, 4, 5), (4, 5, 4, 3), (4, 3, 0, 3), (0, 3, 0, 8), (0, 8, 4, 8)],
        'f' => &[(4, 0, 2, 0), (2, 0, 2, 8), (0, 3, 4, 3)],
        'g' => &[(4, 3, 0, 3), (0, 3, 0, 7), (0, 7, 4, 7), (4, 3, 4, 10), (4, 10, 0, 10)],
        'h' => &[(0, 0, 0, 8), (0, 3, 4, 3), (4, 3, 4, 8)],
        'i' => &[(2, 3, 2, 8), (2, 1, 2, 2)],
        'j' => &[(3, 3, 3, 10), (3, 10, 1, 10), (3, 1, 3, 2)],
        'k' => &[(0, 0, 0, 8), (0, 6, 4, 3), (1, 5, 4, 8)],
        'l' => &[(2, 0, 2, 8)],
        'm' => &[(0, 3, 0, 8), (0, 3, 4, 3), (2, 3, 2, 8), (4, 3, 4, 8)],
        'n' => &[(0, 3, 0, 8), (0, 3, 4, 3), (4, 3, 4, 8)],
        'o' => &[(0, 3, 4, 3), (4, 3, 4, 8), (4, 8, 0, 8), (0, 8, 0, 3)],
        'p' => &[(0, 3, 0, 10), (0, 3, 4, 3), (4, 3, 4, 8), (4, 8, 0, 8)],
        'q' => &[(4, 3, 4, 10), (4, 3, 0, 3), (0, 3, 0, 8), (0, 8, 4, 8)],
        'r' => &[(0, 3, 0, 8), (0, 4, 1, 3), (1, 3, 4, 3)],
        's' => &[(4, 3, 0, 3), (0, 3, 0, 5), (0, 5, 4, 5), (4, 5, 4, 8), (4, 8, 0, 8)],
        't' => &[(2, 0, 2, 8), (2, 8, 4, 8), (0, 3, 4, 3)],
        'u' => &[(0, 3, 0, 8), (0, 8, 4, 8), (4, 8, 4, 3)],
        'v' => &[(0, 3, 2, 8), (2, 8, 4, 3)],
        'w' => &[(0, 3, 1, 8), (1, 8, 2, 5), (2, 5, 3, 8), (3, 8, 4, 3)],
        'x' => &[(0, 3, 4, 8), (4, 3, 0, 8)],
        'y' => &[(0, 3, 2, 8), (4, 3, 1, 10)],
        'z' => &[(0, 3, 4, 3), (4, 3, 0, 8), (0, 8, 4, 8)],
        _ => return None,
    };
    Some(g)
}

/// Font used for overlay labels.
#[derive(Clone, Debug, Default)]
pub enum LabelFont {
    TrueType(FontArc),
    /// Line-segment glyphs; characters without a glyph draw as a box.
    #[default]
    Stroke,
}

impl LabelFont {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, InvalidFont> {
        Ok(LabelFont::TrueType(FontArc::try_from_vec(data)?))
    }

    /// Load a TrueType file, falling back to the stroke font when the file
    /// is missing or unreadable.
    pub fn load_or_stroke(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read(path).map(Self::from_bytes) {
            Ok(Ok(font)) => font,
            Ok(Err(e)) => {
                log::warn!("invalid font {}: {e}; using stroke font", path.display());
                LabelFont::Stroke
            }
            Err(e) => {
                log::warn!("cannot read font {}: {e}; using stroke font", path.display());
                LabelFont::Stroke
            }
        }
    }

    pub fn is_true_type(&self) -> bool {
        matches!(self, LabelFont::TrueType(_))
    }

    /// Rendered `(width, height)` of `text` at `px` pixels.
    pub fn text_size(&self, px: f32, text: &str) -> (u32, u32) {
        match self {
            LabelFont::TrueType(font) => text_size(PxScale::from(px), font, text),
            LabelFont::Stroke => {
                let n = text.chars().count() as f32;
                if n == 0.0 {
                    return (0, 0);
                }
                let unit = px / GRID_H;
                (((n * ADVANCE - 2.0) * unit).ceil() as u32, px.ceil() as u32)
            }
        }
    }

    /// Draw `text` with its top-left corner at `(x, y)`.
    pub fn draw(&self, img: &mut RgbImage, color: Rgb<u8>, x: i32, y: i32, px: f32, text: &str) {
        match self {
            LabelFont::TrueType(font) => {
                draw_text_mut(img, color, x, y, PxScale::from(px), font, text);
            }
            LabelFont::Stroke => draw_stroke_text(img, color, x as f32, y as f32, px, text),
        }
    }
}

fn draw_stroke_text(img: &mut RgbImage, color: Rgb<u8>, x: f32, y: f32, px: f32, text: &str) {
    let unit = px / GRID_H;
    let weight = (px / 12.0).round().max(1.0) as i32;
    for (i, c) in text.chars().enumerate() {
        let ox = x + i as f32 * ADVANCE * unit;
        for &(x0, y0, x1, y1) in glyph(c).unwrap_or(BOX) {
            let a = (ox + x0 as f32 * unit, y + y0 as f32 * unit);
            let b = (ox + x1 as f32 * unit, y + y1 as f32 * unit);
            for d in 0..weight {
                let d = d as f32;
                draw_line_segment_mut(img, (a.0 + d, a.1), (b.0 + d, b.1), color);
                draw_line_segment_mut(img, (a.0, a.1 + d), (b.0, b.1 + d), color);
            }
        }
    }
}
