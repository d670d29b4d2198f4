//! Overlay drawing on the output video frame.
//!
//! Rectangles and mask blending always work; label and info text additionally
//! need a font, which is loaded at runtime from a user-supplied path (the
//! camera firmware ships one). Without a font the overlay degrades to boxes
//! and bars.

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};

use deeplens_utils::rect::Rect;

use crate::error::{PipelineError, Result};

const TEXT_SIZE: f32 = 16.0;
const LINE_HEIGHT: i32 = 18;
/// Rough per-character advance used to size label bars without a font pass.
const CHAR_WIDTH: f32 = 8.0;

/// Load an overlay font from disk.
pub fn load_font<P: AsRef<Path>>(path: P) -> Result<FontVec> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|e| PipelineError::Param(format!("cannot read font {}: {e}", path.display())))?;
    FontVec::try_from_vec(bytes)
        .map_err(|_| PipelineError::Param(format!("{} is not a usable font", path.display())))
}

/// Alpha-blend `color` over one pixel.
fn blend(px: &mut Rgb<u8>, color: [u8; 4]) {
    let a = u16::from(color[3]);
    for c in 0..3 {
        let src = u16::from(color[c]);
        let dst = u16::from(px[c]);
        px[c] = ((src * a + dst * (255 - a)) / 255) as u8;
    }
}

/// Fill `rect` with an alpha-blended color, clamped to the image.
pub fn fill_rect(img: &mut RgbImage, rect: Rect, color: [u8; 4]) {
    let r = rect.clamp(img.width(), img.height());
    for y in r.y..r.y + r.height {
        for x in r.x..r.x + r.width {
            blend(img.get_pixel_mut(x as u32, y as u32), color);
        }
    }
}

/// Draw a detection: translucent fill, solid outline, label bar above.
pub fn draw_detection(
    img: &mut RgbImage,
    rect: Rect,
    color: [u8; 4],
    label: &str,
    font: Option<&FontVec>,
) {
    let r = rect.clamp(img.width(), img.height());
    if r.is_empty() {
        return;
    }

    fill_rect(img, r, color);
    draw_hollow_rect_mut(
        img,
        imageproc::rect::Rect::at(r.x, r.y).of_size(r.width as u32, r.height as u32),
        Rgb([color[0], color[1], color[2]]),
    );

    if label.is_empty() {
        return;
    }
    let bar_w = ((label.len() as f32 * CHAR_WIDTH) as i32).min(img.width() as i32 - r.x);
    let bar = Rect::new(r.x, (r.y - LINE_HEIGHT).max(0), bar_w, LINE_HEIGHT);
    fill_rect(img, bar, [color[0], color[1], color[2], 255]);
    if let Some(font) = font {
        draw_text_mut(
            img,
            Rgb([255, 255, 255]),
            bar.x + 1,
            bar.y + 1,
            PxScale::from(TEXT_SIZE),
            font,
            label,
        );
    }
}

/// Blend an RGBA class mask over the frame, upsampling nearest-neighbor.
pub fn draw_mask(img: &mut RgbImage, mask: &[u8], mask_w: u32, mask_h: u32) {
    if mask_w == 0 || mask_h == 0 || mask.len() < (mask_w * mask_h * 4) as usize {
        return;
    }
    let (w, h) = img.dimensions();
    for y in 0..h {
        let my = (y * mask_h / h).min(mask_h - 1);
        for x in 0..w {
            let mx = (x * mask_w / w).min(mask_w - 1);
            let at = ((my * mask_w + mx) * 4) as usize;
            let color = [mask[at], mask[at + 1], mask[at + 2], mask[at + 3]];
            if color[3] > 0 {
                blend(img.get_pixel_mut(x, y), color);
            }
        }
    }
}

/// Draw the info panel (pipeline name, stage timings, network info) in the
/// top-left corner. Requires a font; silently skipped without one.
pub fn draw_info(img: &mut RgbImage, lines: &[String], font: Option<&FontVec>) {
    draw_info_at(img, lines, font, 2, 2);
}

/// Draw info lines anchored to the bottom-left corner.
pub fn draw_info_bottom(img: &mut RgbImage, lines: &[String], font: Option<&FontVec>) {
    let y = img.height() as i32 - lines.len() as i32 * LINE_HEIGHT - 2;
    draw_info_at(img, lines, font, 2, y.max(2));
}

fn draw_info_at(img: &mut RgbImage, lines: &[String], font: Option<&FontVec>, x: i32, y0: i32) {
    let Some(font) = font else { return };
    let mut y = y0;
    for line in lines {
        draw_text_mut(
            img,
            Rgb([255, 255, 255]),
            x,
            y,
            PxScale::from(TEXT_SIZE),
            font,
            line,
        );
        y += LINE_HEIGHT;
    }
}

/// Red error banner across the top of the frame.
pub fn draw_error(img: &mut RgbImage, message: &str, font: Option<&FontVec>) {
    let w = img.width();
    fill_rect(img, Rect::new(0, 0, w as i32, LINE_HEIGHT + 4), [200, 0, 0, 200]);
    if let Some(font) = font {
        draw_text_mut(
            img,
            Rgb([255, 255, 255]),
            2,
            2,
            PxScale::from(TEXT_SIZE),
            font,
            message,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_rect_blends_and_clamps() {
        let mut img = RgbImage::from_pixel(10, 10, Rgb([0, 0, 0]));
        fill_rect(&mut img, Rect::new(-5, -5, 10, 10), [255, 0, 0, 255]);
        assert_eq!(img.get_pixel(0, 0), &Rgb([255, 0, 0]));
        assert_eq!(img.get_pixel(5, 5), &Rgb([0, 0, 0]));
    }

    #[test]
    fn half_alpha_blends_halfway() {
        let mut img = RgbImage::from_pixel(2, 2, Rgb([0, 0, 0]));
        fill_rect(&mut img, Rect::new(0, 0, 2, 2), [255, 255, 255, 128]);
        let px = img.get_pixel(0, 0);
        assert!((125..=130).contains(&px[0]));
    }

    #[test]
    fn mask_is_upsampled_nearest() {
        let mut img = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        // 2x2 mask: top-left opaque green, rest transparent
        let mut mask = vec![0u8; 2 * 2 * 4];
        mask[0..4].copy_from_slice(&[0, 255, 0, 255]);
        draw_mask(&mut img, &mask, 2, 2);
        assert_eq!(img.get_pixel(0, 0), &Rgb([0, 255, 0]));
        assert_eq!(img.get_pixel(1, 1), &Rgb([0, 255, 0]));
        assert_eq!(img.get_pixel(3, 3), &Rgb([0, 0, 0]));
    }

    #[test]
    fn detection_draws_even_without_font() {
        let mut img = RgbImage::from_pixel(20, 20, Rgb([0, 0, 0]));
        draw_detection(&mut img, Rect::new(4, 4, 8, 8), [0, 0, 255, 128], "obj", None);
        // outline pixel is solid color
        assert_eq!(img.get_pixel(4, 4), &Rgb([0, 0, 255]));
    }
}
