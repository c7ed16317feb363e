//! Software rasterizer and PNG codec.

use super::layout::CELL;
use super::paint::PaintCommand;
use crate::Result;
use image::{ImageFormat, RgbaImage};
use std::collections::HashMap;
use std::sync::Arc;

/// A decoded RGBA8 bitmap.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl Bitmap {
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Bitmap {
            width,
            height,
            rgba: rgba.iter().copied().cycle().take((width * height * 4) as usize).collect(),
        }
    }

    pub fn from_rgba(img: RgbaImage) -> Self {
        Bitmap {
            width: img.width(),
            height: img.height(),
            rgba: img.into_raw(),
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = ((y * self.width + x) * 4) as usize;
        let px = self.rgba.get(i..i + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }
}

/// Output surface, in device pixels.
#[derive(Debug, Clone)]
pub struct Canvas {
    scale: f32,
    bitmap: Bitmap,
}

impl Canvas {
    /// A canvas covering `width` x `height` CSS pixels at `scale` device
    /// pixels per CSS pixel, cleared to transparent.
    pub fn new(width: u32, height: u32, scale: f32) -> Self {
        let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
        let w = ((width as f32 * scale).round() as u32).max(1);
        let h = ((height as f32 * scale).round() as u32).max(1);
        Canvas {
            scale,
            bitmap: Bitmap::solid(w, h, [0, 0, 0, 0]),
        }
    }

    pub fn width(&self) -> u32 {
        self.bitmap.width
    }

    pub fn height(&self) -> u32 {
        self.bitmap.height
    }

    pub fn into_bitmap(self) -> Bitmap {
        self.bitmap
    }

    fn device_rect(&self, x: i32, y: i32, width: u32, height: u32) -> (i64, i64, i64, i64) {
        let s = self.scale as f64;
        let x0 = (x as f64 * s).round() as i64;
        let y0 = (y as f64 * s).round() as i64;
        let x1 = ((x as f64 + width as f64) * s).round() as i64;
        let y1 = ((y as f64 + height as f64) * s).round() as i64;
        (
            x0.clamp(0, self.bitmap.width as i64),
            y0.clamp(0, self.bitmap.height as i64),
            x1.clamp(0, self.bitmap.width as i64),
            y1.clamp(0, self.bitmap.height as i64),
        )
    }

    fn blend(&mut self, x: i64, y: i64, src: [u8; 4]) {
        let i = ((y as u32 * self.bitmap.width + x as u32) * 4) as usize;
        let Some(dst) = self.bitmap.rgba.get_mut(i..i + 4) else {
            return;
        };
        match src[3] {
            0 => {}
            255 => dst.copy_from_slice(&src),
            a => {
                let a = a as u32;
                for c in 0..3 {
                    dst[c] = ((src[c] as u32 * a + dst[c] as u32 * (255 - a)) / 255) as u8;
                }
                dst[3] = (a + dst[3] as u32 * (255 - a) / 255).min(255) as u8;
            }
        }
    }

    pub fn fill_rect(&mut self, x: i32, y: i32, width: u32, height: u32, rgba: [u8; 4]) {
        let (x0, y0, x1, y1) = self.device_rect(x, y, width, height);
        for py in y0..y1 {
            for px in x0..x1 {
                self.blend(px, py, rgba);
            }
        }
    }

    fn stroke_rect(&mut self, x: i32, y: i32, width: u32, height: u32, rgba: [u8; 4]) {
        let (x0, y0, x1, y1) = self.device_rect(x, y, width, height);
        let t = (self.scale.round() as i64).max(1);
        for py in y0..y1 {
            for px in x0..x1 {
                if px < x0 + t || px >= x1 - t || py < y0 + t || py >= y1 - t {
                    self.blend(px, py, rgba);
                }
            }
        }
    }

    /// Draw `image` into the rect, stretched, or cropped to fill when `cover`.
    pub fn draw_image(&mut self, image: &Bitmap, x: i32, y: i32, width: u32, height: u32, cover: bool) {
        if image.width == 0 || image.height == 0 {
            return;
        }
        let (x0, y0, x1, y1) = self.device_rect(x, y, width, height);
        let (dw, dh) = ((x1 - x0).max(1) as f64, (y1 - y0).max(1) as f64);
        let (iw, ih) = (image.width as f64, image.height as f64);
        let (sx, sy, sw, sh) = if cover {
            let scale = (dw / iw).max(dh / ih);
            let (cw, ch) = (dw / scale, dh / scale);
            ((iw - cw) / 2.0, (ih - ch) / 2.0, cw, ch)
        } else {
            (0.0, 0.0, iw, ih)
        };
        for py in y0..y1 {
            let v = (sy + (py - y0) as f64 / dh * sh) as u32;
            for px in x0..x1 {
                let u = (sx + (px - x0) as f64 / dw * sw) as u32;
                if let Some(src) = image.pixel(u.min(image.width - 1), v.min(image.height - 1)) {
                    self.blend(px, py, src);
                }
            }
        }
    }

    /// One block glyph per non-space character, solid or outlined.
    pub fn draw_text(&mut self, x: i32, y: i32, text: &str, rgba: [u8; 4], solid: bool) {
        for (i, ch) in text.chars().enumerate() {
            if ch.is_whitespace() {
                continue;
            }
            let gx = x + (i as u32 * CELL) as i32 + 1;
            let gy = y + 1;
            if solid {
                self.fill_rect(gx, gy, CELL - 2, CELL - 1, rgba);
            } else {
                self.stroke_rect(gx, gy, CELL - 2, CELL - 1, rgba);
            }
        }
    }
}

/// Execute `commands` onto a fresh canvas. Images missing from `images`
/// are drawn with `placeholder`.
pub fn rasterize(
    commands: &[PaintCommand],
    width: u32,
    height: u32,
    scale: f32,
    images: &HashMap<String, Arc<Bitmap>>,
    placeholder: &Bitmap,
) -> Canvas {
    let mut canvas = Canvas::new(width, height, scale);
    for cmd in commands {
        match cmd {
            PaintCommand::SolidRect { x, y, width, height, rgba } => {
                canvas.fill_rect(*x, *y, *width, *height, *rgba)
            }
            PaintCommand::Image { x, y, width, height, src, cover } => {
                let image = images.get(src).map(|b| b.as_ref()).unwrap_or(placeholder);
                canvas.draw_image(image, *x, *y, *width, *height, *cover);
            }
            PaintCommand::Text { x, y, text, rgba, solid } => canvas.draw_text(*x, *y, text, *rgba, *solid),
        }
    }
    canvas
}

pub fn encode_png(width: u32, height: u32, rgba: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut output, width, height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(rgba)?;
    }
    Ok(output)
}

/// Decode a PNG into RGBA8.
pub fn decode_png(bytes: &[u8]) -> Result<Bitmap> {
    let img = image::load_from_memory_with_format(bytes, ImageFormat::Png)?;
    Ok(Bitmap::from_rgba(img.to_rgba8()))
}

/// Decode any supported raster format (PNG, JPEG, GIF, WebP), sniffed from
/// the bytes, into RGBA8.
pub fn decode_image(bytes: &[u8]) -> Result<Bitmap> {
    let img = image::load_from_memory(bytes)?;
    Ok(Bitmap::from_rgba(img.to_rgba8()))
}
