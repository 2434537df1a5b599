//! Text layout and glyph rasterization.
//!
//! Layout works on anything implementing [`TextMeasure`], so line breaking
//! and auto-sizing are independent of a concrete font file. Rendering draws
//! rusttype glyphs as hard 1-bit pixels.

use std::collections::HashMap;
use std::path::Path;

use image::{GrayImage, Luma};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use rusttype::{point, Font, Scale};

use crate::error::{Error, Result};
use crate::model::{Alignment, FontStyle};

/// Coverage above which a glyph pixel is printed black.
const COVERAGE_THRESHOLD: f32 = 0.3;
/// Horizontal shear applied for italic text.
const ITALIC_SHEAR: f32 = 0.2;

/// Named font faces available to the rasterizer.
///
/// The first face registered becomes the default; text asking for a face
/// that isn't registered falls back to it.
#[derive(Clone, Default)]
pub struct FontBook {
    faces: HashMap<String, Font<'static>>,
    default: Option<String>,
}

impl FontBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a TrueType/OpenType face from raw bytes.
    pub fn register(&mut self, name: impl Into<String>, bytes: Vec<u8>) -> Result<()> {
        let name = name.into();
        let font = Font::try_from_vec(bytes)
            .ok_or_else(|| Error::InvalidFont(format!("cannot parse face {name:?}")))?;
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.faces.insert(name, font);
        Ok(())
    }

    pub fn load_file(&mut self, name: impl Into<String>, path: impl AsRef<Path>) -> Result<()> {
        let bytes = std::fs::read(path)?;
        self.register(name, bytes)
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.faces.contains_key(name) {
            return Err(Error::InvalidFont(format!("face {name:?} is not registered")));
        }
        self.default = Some(name.to_string());
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Look up a face by name, falling back to the default face.
    pub fn resolve(&self, name: &str) -> Result<&Font<'static>> {
        if let Some(font) = self.faces.get(name) {
            return Ok(font);
        }
        self.default
            .as_deref()
            .and_then(|d| self.faces.get(d))
            .ok_or(Error::FontUnavailable)
    }
}

impl std::fmt::Debug for FontBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.faces.keys().collect();
        names.sort();
        f.debug_struct("FontBook")
            .field("faces", &names)
            .field("default", &self.default)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineMetrics {
    pub ascent: f32,
    /// Negative: distance below the baseline.
    pub descent: f32,
    pub line_gap: f32,
}

impl LineMetrics {
    pub fn line_height(&self) -> f32 {
        self.ascent - self.descent + self.line_gap
    }
}

/// Glyph measurements needed for layout.
pub trait TextMeasure {
    fn advance(&self, ch: char, scale: Scale) -> f32;
    fn line_metrics(&self, scale: Scale) -> LineMetrics;
}

impl TextMeasure for Font<'_> {
    fn advance(&self, ch: char, scale: Scale) -> f32 {
        self.glyph(ch).scaled(scale).h_metrics().advance_width
    }

    fn line_metrics(&self, scale: Scale) -> LineMetrics {
        let v = self.v_metrics(scale);
        LineMetrics {
            ascent: v.ascent,
            descent: v.descent,
            line_gap: v.line_gap,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutOptions {
    /// Extra dots between glyphs.
    pub char_spacing: f32,
    /// Extra dots between lines.
    pub line_spacing: f32,
    pub alignment: Alignment,
    pub wrap: bool,
    /// Vertical scale relative to the nominal size (1.0 = square glyphs).
    pub height_ratio: f32,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            char_spacing: 0.0,
            line_spacing: 0.0,
            alignment: Alignment::Left,
            wrap: true,
            height_ratio: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaidOutLine {
    pub text: String,
    /// Left edge after alignment.
    pub x: f32,
    pub baseline: f32,
    pub width: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextLayout {
    pub scale: Scale,
    pub metrics: LineMetrics,
    pub lines: Vec<LaidOutLine>,
    /// Widest line.
    pub width: f32,
    /// Total block height.
    pub height: f32,
}

impl TextLayout {
    pub fn fits(&self, box_width: f32, box_height: f32) -> bool {
        self.width <= box_width + 0.01 && self.height <= box_height + 0.01
    }
}

fn scale_for(size: f32, opts: &LayoutOptions) -> Scale {
    let ratio = if opts.height_ratio > 0.0 { opts.height_ratio } else { 1.0 };
    Scale {
        x: size,
        y: size * ratio,
    }
}

fn measure(m: &impl TextMeasure, s: &str, scale: Scale, spacing: f32) -> f32 {
    let mut width = 0.0;
    let mut count = 0;
    for ch in s.chars() {
        width += m.advance(ch, scale);
        count += 1;
    }
    if count > 1 {
        width += spacing * (count - 1) as f32;
    }
    width
}

/// Break one paragraph into lines no wider than `max_width`.
///
/// Words that don't fit on a line of their own are split between
/// characters, so unspaced scripts wrap too.
fn wrap_paragraph(
    m: &impl TextMeasure,
    paragraph: &str,
    scale: Scale,
    spacing: f32,
    max_width: f32,
) -> Vec<String> {
    let fits = |s: &str| measure(m, s, scale, spacing) <= max_width;
    let mut lines = Vec::new();
    let mut cur = String::new();

    for word in paragraph.split_whitespace() {
        if !cur.is_empty() {
            let trial = format!("{cur} {word}");
            if fits(&trial) {
                cur = trial;
                continue;
            }
            lines.push(std::mem::take(&mut cur));
        }
        if fits(word) {
            cur = word.to_string();
            continue;
        }
        for ch in word.chars() {
            cur.push(ch);
            if !fits(&cur) && cur.chars().count() > 1 {
                cur.pop();
                lines.push(std::mem::take(&mut cur));
                cur.push(ch);
            }
        }
    }
    lines.push(cur);
    lines
}

/// Lay out `text` at `size` inside a box `box_width` dots wide.
pub fn layout_text(
    m: &impl TextMeasure,
    text: &str,
    size: f32,
    opts: &LayoutOptions,
    box_width: f32,
) -> TextLayout {
    let scale = scale_for(size, opts);
    let metrics = m.line_metrics(scale);

    let mut raw_lines = Vec::new();
    for paragraph in text.split('\n') {
        let paragraph = paragraph.trim_end_matches('\r');
        if opts.wrap {
            raw_lines.extend(wrap_paragraph(m, paragraph, scale, opts.char_spacing, box_width));
        } else {
            raw_lines.push(paragraph.to_string());
        }
    }

    let step = metrics.line_height() + opts.line_spacing;
    let mut lines = Vec::with_capacity(raw_lines.len());
    let mut widest = 0.0f32;
    for (i, text) in raw_lines.into_iter().enumerate() {
        let width = measure(m, &text, scale, opts.char_spacing);
        widest = widest.max(width);
        let x = match opts.alignment {
            Alignment::Left => 0.0,
            Alignment::Center => ((box_width - width) / 2.0).max(0.0),
            Alignment::Right => (box_width - width).max(0.0),
        };
        lines.push(LaidOutLine {
            text,
            x,
            baseline: i as f32 * step + metrics.ascent,
            width,
        });
    }

    let n = lines.len() as f32;
    let height = n * metrics.line_height() + (n - 1.0).max(0.0) * opts.line_spacing;
    TextLayout {
        scale,
        metrics,
        lines,
        width: widest,
        height,
    }
}

/// Find the largest size at which `text` fits the box, and lay it out.
///
/// If nothing fits even at one dot the one-dot layout is returned and the
/// renderer clips it.
pub fn fit_text(
    m: &impl TextMeasure,
    text: &str,
    opts: &LayoutOptions,
    box_width: f32,
    box_height: f32,
) -> TextLayout {
    let mut lo = 1.0f32;
    // squashed glyphs can be nominally taller than the box
    let ratio = opts.height_ratio;
    let tallest = if ratio > 0.0 && ratio < 1.0 { box_height / ratio } else { box_height };
    let mut hi = tallest.max(lo);
    let mut best = layout_text(m, text, lo, opts, box_width);
    if !best.fits(box_width, box_height) {
        return best;
    }
    let top = layout_text(m, text, hi, opts, box_width);
    if top.fits(box_width, box_height) {
        return top;
    }
    for _ in 0..24 {
        let mid = (lo + hi) / 2.0;
        let candidate = layout_text(m, text, mid, opts, box_width);
        if candidate.fits(box_width, box_height) {
            lo = mid;
            best = candidate;
        } else {
            hi = mid;
        }
        if hi - lo < 0.05 {
            break;
        }
    }
    best
}

/// Draw a finished layout into a white `width` x `height` bitmap.
pub fn render_layout(
    font: &Font<'_>,
    layout: &TextLayout,
    style: FontStyle,
    char_spacing: f32,
    width: u32,
    height: u32,
) -> GrayImage {
    let mut img = GrayImage::from_pixel(width.max(1), height.max(1), Luma([255]));
    let strikes: &[i32] = if style.contains(FontStyle::BOLD) { &[0, 1] } else { &[0] };
    let shear = if style.contains(FontStyle::ITALIC) { ITALIC_SHEAR } else { 0.0 };

    for line in &layout.lines {
        let mut x = line.x;
        for ch in line.text.chars() {
            let glyph = font
                .glyph(ch)
                .scaled(layout.scale)
                .positioned(point(x, line.baseline));
            if let Some(bb) = glyph.pixel_bounding_box() {
                glyph.draw(|gx, gy, v| {
                    if v <= COVERAGE_THRESHOLD {
                        return;
                    }
                    let py = bb.min.y + gy as i32;
                    let lean = ((line.baseline - py as f32) * shear).round() as i32;
                    for &dx in strikes {
                        put_black(&mut img, bb.min.x + gx as i32 + lean + dx, py);
                    }
                });
            }
            x += font.advance(ch, layout.scale) + char_spacing;
        }

        let thickness = ((layout.scale.y / 16.0).round() as u32).max(1);
        if style.contains(FontStyle::UNDERLINE) {
            let y = line.baseline - layout.metrics.descent * 0.4;
            draw_rule(&mut img, line.x, y, line.width, thickness);
        }
        if style.contains(FontStyle::STRIKETHROUGH) {
            let y = line.baseline - layout.metrics.ascent * 0.3;
            draw_rule(&mut img, line.x, y, line.width, thickness);
        }
    }
    img
}

fn put_black(img: &mut GrayImage, x: i32, y: i32) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, Luma([0]));
    }
}

fn draw_rule(img: &mut GrayImage, x: f32, y: f32, width: f32, thickness: u32) {
    let width = width.round() as u32;
    if width == 0 {
        return;
    }
    let rect = Rect::at(x.round() as i32, y.round() as i32).of_size(width, thickness);
    draw_filled_rect_mut(img, rect, Luma([0]));
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// DejaVu Sans Mono, shipped with the crate for the demos.
    pub(crate) const TEST_FONT: &[u8] = include_bytes!("../fonts/DejaVuSansMono.ttf");

    pub(crate) fn test_book() -> FontBook {
        let mut book = FontBook::new();
        book.register("mono", TEST_FONT.to_vec()).unwrap();
        book
    }

    fn face() -> Font<'static> {
        Font::try_from_bytes(TEST_FONT).unwrap()
    }

    fn black(img: &GrayImage) -> usize {
        img.pixels().filter(|p| p[0] < 128).count()
    }

    fn row_black(img: &GrayImage, y: u32) -> usize {
        (0..img.width()).filter(|&x| img.get_pixel(x, y)[0] < 128).count()
    }

    fn draw(text: &str, style: FontStyle) -> (TextLayout, GrayImage) {
        let face = face();
        let layout = layout_text(&face, text, 32.0, &LayoutOptions::default(), 120.0);
        let img = render_layout(&face, &layout, style, 0.0, 120, 48);
        (layout, img)
    }

    /// Monospace measurer: every glyph is half an em wide.
    pub(crate) struct Mono;

    impl TextMeasure for Mono {
        fn advance(&self, _ch: char, scale: Scale) -> f32 {
            scale.x * 0.5
        }

        fn line_metrics(&self, scale: Scale) -> LineMetrics {
            LineMetrics {
                ascent: scale.y * 0.8,
                descent: -scale.y * 0.2,
                line_gap: 0.0,
            }
        }
    }

    fn texts(layout: &TextLayout) -> Vec<&str> {
        layout.lines.iter().map(|l| l.text.as_str()).collect()
    }

    #[test]
    fn test_wraps_at_word_boundaries() {
        let layout = layout_text(&Mono, "aa bb cc", 10.0, &LayoutOptions::default(), 25.0);
        assert_eq!(texts(&layout), ["aa bb", "cc"]);
        assert_eq!(layout.width, 25.0);
        assert_eq!(layout.height, 20.0);
        assert_eq!(layout.lines[1].baseline, 18.0);
    }

    #[test]
    fn test_long_words_split_between_chars() {
        let layout = layout_text(&Mono, "abcdefghij", 10.0, &LayoutOptions::default(), 25.0);
        assert_eq!(texts(&layout), ["abcde", "fghij"]);

        let layout = layout_text(&Mono, "标签打印机测试", 10.0, &LayoutOptions::default(), 15.0);
        assert_eq!(texts(&layout), ["标签打", "印机测", "试"]);
    }

    #[test]
    fn test_newlines_and_no_wrap() {
        let opts = LayoutOptions {
            wrap: false,
            ..LayoutOptions::default()
        };
        let layout = layout_text(&Mono, "one two three\nfour", 10.0, &opts, 10.0);
        assert_eq!(texts(&layout), ["one two three", "four"]);
        assert!(!layout.fits(10.0, 100.0));
    }

    #[test]
    fn test_alignment_offsets() {
        let mut opts = LayoutOptions {
            alignment: Alignment::Center,
            ..LayoutOptions::default()
        };
        let layout = layout_text(&Mono, "aa bb cc", 10.0, &opts, 25.0);
        assert_eq!(layout.lines[0].x, 0.0);
        assert_eq!(layout.lines[1].x, 7.5);

        opts.alignment = Alignment::Right;
        let layout = layout_text(&Mono, "aa bb cc", 10.0, &opts, 25.0);
        assert_eq!(layout.lines[1].x, 15.0);
    }

    #[test]
    fn test_spacing_is_counted() {
        let opts = LayoutOptions {
            char_spacing: 2.0,
            line_spacing: 3.0,
            ..LayoutOptions::default()
        };
        let layout = layout_text(&Mono, "abc\nd", 10.0, &opts, 100.0);
        assert_eq!(layout.lines[0].width, 19.0);
        assert_eq!(layout.height, 23.0);
        assert_eq!(layout.lines[1].baseline, 21.0);
    }

    #[test]
    fn test_fit_fills_without_overflow() {
        let opts = LayoutOptions::default();
        let layout = fit_text(&Mono, "hello", &opts, 50.0, 20.0);
        assert!(layout.fits(50.0, 20.0));
        assert_eq!(layout.scale.x, 20.0);

        let text = "the quick brown fox jumps over the lazy dog";
        let layout = fit_text(&Mono, text, &opts, 60.0, 30.0);
        assert!(layout.fits(60.0, 30.0));
        assert!(layout.scale.x > 4.0);
        let bigger = layout_text(&Mono, text, layout.scale.x + 0.5, &opts, 60.0);
        assert!(!bigger.fits(60.0, 30.0));
    }

    #[test]
    fn test_height_ratio_scales_vertically() {
        let opts = LayoutOptions {
            height_ratio: 0.5,
            ..LayoutOptions::default()
        };
        let layout = layout_text(&Mono, "ab", 20.0, &opts, 100.0);
        assert_eq!(layout.scale, Scale { x: 20.0, y: 10.0 });
        assert_eq!(layout.height, 10.0);
    }

    #[test]
    fn test_fit_grows_past_box_height_when_squashed() {
        let opts = LayoutOptions {
            height_ratio: 0.5,
            ..LayoutOptions::default()
        };
        // one short word in a wide box: only the height limits the size
        let layout = fit_text(&Mono, "ab", &opts, 1000.0, 20.0);
        assert!(layout.fits(1000.0, 20.0));
        assert!(layout.scale.x > 39.0, "{:?}", layout.scale);
        assert!(layout.scale.y > 19.0);
    }

    #[test]
    fn test_real_face_draws_glyphs() {
        let (layout, img) = draw("Hg", FontStyle::empty());
        assert_eq!(layout.lines.len(), 1);
        assert!(layout.width > 30.0 && layout.width < 45.0, "{}", layout.width);
        assert!(black(&img) > 50);
        assert_eq!(row_black(&img, 47), 0);
    }

    #[test]
    fn test_bold_thickens_strokes() {
        let (_, plain) = draw("ll", FontStyle::empty());
        let (_, bold) = draw("ll", FontStyle::BOLD);
        assert!(black(&bold) > black(&plain) + 10);
    }

    #[test]
    fn test_italic_leans_the_top_right() {
        let (_, plain) = draw("l", FontStyle::empty());
        let (_, italic) = draw("l", FontStyle::ITALIC);
        let top_left = |img: &GrayImage| {
            let y = (0..img.height()).find(|&y| row_black(img, y) > 0).unwrap();
            (0..img.width()).find(|&x| img.get_pixel(x, y)[0] < 128).unwrap()
        };
        assert!(top_left(&italic) >= top_left(&plain) + 3);
    }

    #[test]
    fn test_underline_runs_below_the_baseline() {
        let (layout, plain) = draw("ll", FontStyle::empty());
        let (_, underlined) = draw("ll", FontStyle::UNDERLINE);
        let below = layout.lines[0].baseline.round() as u32 + 1;
        let full = (layout.lines[0].width * 0.9) as usize;
        assert!((below..48).all(|y| row_black(&plain, y) == 0));
        assert!((below..48).any(|y| row_black(&underlined, y) >= full));
    }

    #[test]
    fn test_strikethrough_crosses_the_middle() {
        let (layout, plain) = draw("ll", FontStyle::empty());
        let (_, struck) = draw("ll", FontStyle::STRIKETHROUGH);
        let line = &layout.lines[0];
        let y = (line.baseline - layout.metrics.ascent * 0.3).round() as u32;
        let full = (line.width * 0.9) as usize;
        assert!(row_black(&plain, y) < full);
        assert!(row_black(&struck, y) >= full);
    }

    #[test]
    fn test_auto_size_keeps_ink_inside_the_box() {
        let face = face();
        let opts = LayoutOptions::default();
        let text = "hello label world";
        let layout = fit_text(&face, text, &opts, 120.0, 40.0);
        assert!(layout.fits(120.0, 40.0));
        assert!(!layout_text(&face, text, layout.scale.x + 1.0, &opts, 120.0).fits(120.0, 40.0));

        // nothing is clipped: a larger canvas holds exactly the same ink
        let boxed = render_layout(&face, &layout, FontStyle::empty(), 0.0, 120, 40);
        let roomy = render_layout(&face, &layout, FontStyle::empty(), 0.0, 200, 100);
        assert!(black(&boxed) > 0);
        assert_eq!(black(&boxed), black(&roomy));
    }

    #[test]
    fn test_book_resolves_registered_face() {
        let book = test_book();
        assert!(!book.is_empty());
        assert!(book.resolve("mono").is_ok());
        // unknown names fall back to the first face
        assert!(book.resolve("serif").is_ok());
    }

    #[test]
    fn test_empty_book_has_no_font() {
        let book = FontBook::new();
        assert!(book.is_empty());
        assert!(matches!(book.resolve("any"), Err(Error::FontUnavailable)));
        let mut book = FontBook::new();
        assert!(matches!(book.register("bad", vec![1, 2, 3]), Err(Error::InvalidFont(_))));
    }
}
