//! Compose a [`PrintJobConfig`] into the 1-bit bitmap the printer prints.
//!
//! Elements are drawn onto a design canvas the size of the effective
//! (rotation-adjusted) label. The physical bitmap is that canvas turned
//! clockwise by the media rotation and shifted by the print offsets, so it is
//! always `width_mm x length_mm` in dots.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use tracing::debug;

use crate::dithering::ImageDithering;
use crate::error::{Error, Result};
use crate::font::{self, FontBook, LayoutOptions};
use crate::model::{mm_to_dots, points_to_dots, ElementContent, MediaRotation, PrintElement, PrintJobConfig};

/// Default resolution: 8 dots/mm (203 dpi).
pub const DEFAULT_DOTS_PER_MM: f32 = 8.0;

/// Longest label side the job header can describe.
pub const MAX_LABEL_DOTS: u32 = u16::MAX as u32;
/// Largest label bitmap in pixels.
const MAX_LABEL_PIXELS: u64 = 1 << 26;
/// Element boxes, positions and font sizes stay within this multiple of
/// the label's longer side.
const MAX_ELEMENT_SPAN: f32 = 4.0;
/// Largest element bitmap in pixels, rotation padding included.
const MAX_ELEMENT_PIXELS: f64 = (1u64 << 27) as f64;

/// Physical-orientation label bitmap; pixels are 0 (black) or 255 (white).
#[derive(Debug, Clone, PartialEq)]
pub struct LabelBitmap {
    image: GrayImage,
}

impl LabelBitmap {
    pub fn new(image: GrayImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Row-major pixel buffer.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn into_image(self) -> GrayImage {
        self.image
    }

    pub fn is_black(&self, x: u32, y: u32) -> bool {
        x < self.width() && y < self.height() && self.image.get_pixel(x, y)[0] < 128
    }

    pub fn black_pixels(&self) -> usize {
        self.image.pixels().filter(|p| p[0] < 128).count()
    }
}

/// Turns jobs into bitmaps at a fixed resolution.
#[derive(Debug, Clone, Copy)]
pub struct Rasterizer<'a> {
    fonts: &'a FontBook,
    dots_per_mm: f32,
}

impl<'a> Rasterizer<'a> {
    pub fn new(fonts: &'a FontBook, dots_per_mm: f32) -> Self {
        Self { fonts, dots_per_mm }
    }

    pub fn dots_per_mm(&self) -> f32 {
        self.dots_per_mm
    }

    /// Design canvas size in dots (after media rotation swaps axes).
    pub fn canvas_size(&self, job: &PrintJobConfig) -> (u32, u32) {
        let (w, h) = job.effective_size_mm();
        (self.mm(w as i64).max(1) as u32, self.mm(h as i64).max(1) as u32)
    }

    /// Physical bitmap size in dots: across the head x feed direction.
    pub fn physical_size(&self, job: &PrintJobConfig) -> (u32, u32) {
        (
            self.mm(job.width_mm as i64).max(1) as u32,
            self.mm(job.length_mm as i64).max(1) as u32,
        )
    }

    /// Where a design-canvas dot ends up on the physical bitmap.
    pub fn physical_point(&self, job: &PrintJobConfig, x: i64, y: i64) -> (i64, i64) {
        let (cw, ch) = self.canvas_size(job);
        let (cw, ch) = (cw as i64, ch as i64);
        let (px, py) = match job.rotation {
            MediaRotation::Deg0 => (x, y),
            MediaRotation::Deg90 => (ch - 1 - y, x),
            MediaRotation::Deg180 => (cw - 1 - x, ch - 1 - y),
            MediaRotation::Deg270 => (y, cw - 1 - x),
        };
        let (dx, dy) = self.offset_dots(job);
        (px + dx, py + dy)
    }

    fn mm(&self, mm: i64) -> i64 {
        mm_to_dots(mm, self.dots_per_mm)
    }

    fn pt(&self, points: f32) -> f32 {
        points_to_dots(points, self.dots_per_mm)
    }

    fn offset_dots(&self, job: &PrintJobConfig) -> (i64, i64) {
        (self.mm(job.left_offset_mm as i64), self.mm(job.top_offset_mm as i64))
    }

    /// Check that the label and every element can be rasterized at this
    /// resolution without oversized allocations.
    pub fn check(&self, job: &PrintJobConfig) -> Result<()> {
        let w = self.mm(job.width_mm as i64).max(1);
        let h = self.mm(job.length_mm as i64).max(1);
        if w > MAX_LABEL_DOTS as i64 || h > MAX_LABEL_DOTS as i64 {
            return Err(Error::InvalidJob(format!(
                "label is {w}x{h} dots, sides are limited to {MAX_LABEL_DOTS}"
            )));
        }
        if (w * h) as u64 > MAX_LABEL_PIXELS {
            return Err(Error::InvalidJob(format!("label of {w}x{h} dots is too large to render")));
        }
        let span = MAX_ELEMENT_SPAN * w.max(h) as f32;
        for (i, element) in job.elements.iter().enumerate() {
            self.element_size(element, span)
                .map_err(|reason| Error::InvalidJob(format!("element {i}: {reason}")))?;
        }
        Ok(())
    }

    /// Tile size in dots for `element`, if it stays within `span` dots.
    fn element_size(&self, element: &PrintElement, span: f32) -> std::result::Result<(u32, u32), String> {
        let w = self.pt(element.width).round().max(1.0);
        let h = self.pt(element.height).round().max(1.0);
        if !(w <= span && h <= span) {
            return Err(format!("box of {w}x{h} dots is larger than the label allows"));
        }
        if !(self.pt(element.x) <= span && self.pt(element.y) <= span) {
            return Err("position is too far outside the label".into());
        }
        if !element.auto_size && !(self.pt(element.font.size) <= span) {
            return Err("font size is larger than the label allows".into());
        }
        let pixels = if element.rotation.rem_euclid(90.0) == 0.0 {
            w as f64 * h as f64
        } else {
            // free rotation pads the tile to its diagonal
            let side = (w as f64).hypot(h as f64).ceil();
            side * side
        };
        if pixels > MAX_ELEMENT_PIXELS {
            return Err(format!("box of {w}x{h} dots is too large to render"));
        }
        Ok((w as u32, h as u32))
    }

    /// The label as designed, before media rotation and offsets.
    pub fn render_preview(&self, job: &PrintJobConfig) -> Result<GrayImage> {
        self.check(job)?;
        let (w, h) = self.canvas_size(job);
        let mut canvas = GrayImage::from_pixel(w, h, Luma([255]));
        for (i, element) in job.elements.iter().enumerate() {
            let tile = self.render_element(element, job.dithering)?;
            debug!(index = i, w = tile.width(), h = tile.height(), "element rasterized");
            self.place(&mut canvas, element, &tile);
        }
        Ok(canvas)
    }

    /// The bitmap to send to the printer.
    pub fn render(&self, job: &PrintJobConfig) -> Result<LabelBitmap> {
        let canvas = self.render_preview(job)?;
        let turned = match job.rotation {
            MediaRotation::Deg0 => canvas,
            MediaRotation::Deg90 => imageops::rotate90(&canvas),
            MediaRotation::Deg180 => imageops::rotate180(&canvas),
            MediaRotation::Deg270 => imageops::rotate270(&canvas),
        };

        let (dx, dy) = self.offset_dots(job);
        if dx == 0 && dy == 0 {
            return Ok(LabelBitmap::new(turned));
        }
        let (w, h) = self.physical_size(job);
        let mut shifted = GrayImage::from_pixel(w, h, Luma([255]));
        imageops::overlay(&mut shifted, &turned, dx, dy);
        Ok(LabelBitmap::new(shifted))
    }

    /// Rasterize one element into a bitmap the size of its unrotated box.
    pub fn render_element(&self, element: &PrintElement, dithering: ImageDithering) -> Result<GrayImage> {
        let (w, h) = self
            .element_size(element, MAX_ELEMENT_SPAN * MAX_LABEL_DOTS as f32)
            .map_err(Error::InvalidJob)?;

        let mut tile = match &element.content {
            ElementContent::Text { text } => self.render_text(element, text, w, h)?,
            ElementContent::LocalImage { bytes } => {
                let decoded = image::load_from_memory(bytes)?;
                let gray = flatten_to_gray(&decoded);
                let resized = imageops::resize(&gray, w, h, FilterType::Lanczos3);
                dithering.apply(resized)
            }
            ElementContent::RemoteImage { url } => return Err(Error::UnresolvedImage(url.clone())),
        };

        if element.inverted {
            imageops::invert(&mut tile);
        }
        Ok(tile)
    }

    fn render_text(&self, element: &PrintElement, text: &str, w: u32, h: u32) -> Result<GrayImage> {
        let face = self.fonts.resolve(&element.font.name)?;
        let opts = LayoutOptions {
            char_spacing: element.char_spacing as f32,
            line_spacing: element.line_spacing as f32,
            alignment: element.alignment,
            wrap: element.wrap,
            height_ratio: element.font.height_ratio,
        };
        let layout = if element.auto_size {
            font::fit_text(face, text, &opts, w as f32, h as f32)
        } else {
            let size = self.pt(element.font.size).max(1.0);
            font::layout_text(face, text, size, &opts, w as f32)
        };
        Ok(font::render_layout(
            face,
            &layout,
            element.font.style,
            opts.char_spacing,
            w,
            h,
        ))
    }

    /// Draw `tile` onto the canvas, rotated clockwise about the element centre.
    fn place(&self, canvas: &mut GrayImage, element: &PrintElement, tile: &GrayImage) {
        let x0 = self.pt(element.x).round() as i64;
        let y0 = self.pt(element.y).round() as i64;
        let (w, h) = (tile.width() as i64, tile.height() as i64);
        // doubled centre keeps odd sizes exact
        let (cx2, cy2) = (2 * x0 + w, 2 * y0 + h);

        let degrees = element.rotation.rem_euclid(360.0);
        let turned = if degrees == 0.0 {
            None
        } else if degrees == 90.0 {
            Some(imageops::rotate90(tile))
        } else if degrees == 180.0 {
            Some(imageops::rotate180(tile))
        } else if degrees == 270.0 {
            Some(imageops::rotate270(tile))
        } else {
            let side = ((w * w + h * h) as f64).sqrt().ceil() as u32;
            let mut pad = GrayImage::from_pixel(side, side, Luma([255]));
            imageops::overlay(&mut pad, tile, (side as i64 - w) / 2, (side as i64 - h) / 2);
            Some(rotate_about_center(
                &pad,
                degrees.to_radians(),
                Interpolation::Nearest,
                Luma([255]),
            ))
        };

        match turned {
            None => overlay_black(canvas, tile, x0, y0),
            Some(img) => {
                let (rw, rh) = (img.width() as i64, img.height() as i64);
                overlay_black(canvas, &img, (cx2 - rw) / 2, (cy2 - rh) / 2);
            }
        }
    }
}

/// Composite black pixels only; white areas of `top` leave the canvas alone.
fn overlay_black(canvas: &mut GrayImage, top: &GrayImage, x: i64, y: i64) {
    let (cw, ch) = (canvas.width() as i64, canvas.height() as i64);
    for (tx, ty, pixel) in top.enumerate_pixels() {
        if pixel[0] >= 128 {
            continue;
        }
        let (px, py) = (x + tx as i64, y + ty as i64);
        if px >= 0 && py >= 0 && px < cw && py < ch {
            canvas.put_pixel(px as u32, py as u32, Luma([0]));
        }
    }
}

/// Grayscale with transparency composited over white paper.
fn flatten_to_gray(img: &DynamicImage) -> GrayImage {
    let la = img.to_luma_alpha8();
    GrayImage::from_fn(la.width(), la.height(), |x, y| {
        let [l, a] = la.get_pixel(x, y).0;
        let (l, a) = (l as u32, a as u32);
        Luma([((l * a + 255 * (255 - a)) / 255) as u8])
    })
}
