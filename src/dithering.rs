//! Reduce grayscale images to pure black and white for the print head.

use image::{GrayImage, Luma};
use imageproc::drawing::draw_filled_circle_mut;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageDithering {
    Threshold,
    #[default]
    FloydSteinberg,
    Atkinson,
    Halftone,
    Bayer,
}

impl ImageDithering {
    /// Dither `img` into a 1-bit image (every pixel 0 or 255) of the same size.
    pub fn apply(self, mut img: GrayImage) -> GrayImage {
        match self {
            Self::Threshold => threshold(&mut img),
            Self::FloydSteinberg => image::imageops::dither(&mut img, &image::imageops::BiLevel),
            Self::Atkinson => atkinson_dither(&mut img),
            Self::Bayer => bayer_dither(&mut img),
            Self::Halftone => {
                let (w, h) = img.dimensions();
                img = image::imageops::crop_imm(&halftone_dither(&img), 0, 0, w, h).to_image();
            }
        }
        img
    }
}

/// Hard cut at mid-gray.
pub fn threshold(img: &mut GrayImage) {
    for pixel in img.pixels_mut() {
        pixel[0] = if pixel[0] > 127 { 255 } else { 0 };
    }
}

/// Atkinson error diffusion: spreads 6/8 of the quantization error to six
/// neighbours, which keeps highlights and shadows crisp on thermal paper.
pub fn atkinson_dither(img: &mut GrayImage) {
    let (width, height) = img.dimensions();
    let (w, h) = (width as i32, height as i32);
    let mut work: Vec<i16> = img.as_raw().iter().map(|&v| v as i16).collect();

    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) as usize;
            let old = work[idx].clamp(0, 255);
            let new = if old > 127 { 255 } else { 0 };
            work[idx] = new;
            let share = (old - new) / 8;
            if share == 0 {
                continue;
            }
            for (dx, dy) in [(1, 0), (2, 0), (-1, 1), (0, 1), (1, 1), (0, 2)] {
                let (nx, ny) = (x + dx, y + dy);
                if nx >= 0 && nx < w && ny < h {
                    work[(ny * w + nx) as usize] += share;
                }
            }
        }
    }

    for (dst, src) in img.iter_mut().zip(work) {
        *dst = src.clamp(0, 255) as u8;
    }
}

/// Ordered dithering with a 4x4 Bayer matrix.
pub fn bayer_dither(img: &mut GrayImage) {
    const BAYER: [[u16; 4]; 4] = [[0, 8, 2, 10], [12, 4, 14, 6], [3, 11, 1, 9], [15, 7, 13, 5]];

    for (x, y, pixel) in img.enumerate_pixels_mut() {
        // threshold in the middle of each of the 16 intensity bands
        let t = (BAYER[(y % 4) as usize][(x % 4) as usize] * 16 + 8) as u8;
        pixel[0] = if pixel[0] > t { 255 } else { 0 };
    }
}

/// Halftone: each 4x4 cell becomes a dot whose radius follows the cell's
/// mean darkness. The output is rounded up to whole cells.
pub fn halftone_dither(img: &GrayImage) -> GrayImage {
    const CELL: u32 = 4;
    const GAIN: f32 = 3.0;

    let (width, height) = img.dimensions();
    let out_w = CELL * width.div_ceil(CELL);
    let out_h = CELL * height.div_ceil(CELL);
    let mut canvas = GrayImage::from_pixel(out_w, out_h, Luma([255]));

    for cy in (0..height).step_by(CELL as usize) {
        for cx in (0..width).step_by(CELL as usize) {
            let mut sum = 0u32;
            let mut n = 0u32;
            for y in cy..(cy + CELL).min(height) {
                for x in cx..(cx + CELL).min(width) {
                    sum += img.get_pixel(x, y)[0] as u32;
                    n += 1;
                }
            }
            let darkness = 1.0 - sum as f32 / (n as f32 * 255.0);
            let radius = (GAIN * darkness * CELL as f32 / 2.0) as i32;
            if radius > 0 {
                let centre = ((cx + CELL / 2) as i32, (cy + CELL / 2) as i32);
                draw_filled_circle_mut(&mut canvas, centre, radius, Luma([0]));
            }
        }
    }
    canvas
}
