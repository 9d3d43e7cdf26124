//! Pixel transforms that run locally, without the media service.

use std::io::Cursor;

use anyhow::{bail, Context, Result};
use image::{DynamicImage, ImageFormat, Rgba};
use studio_contracts::artifact::UploadedImage;
use studio_contracts::prompt::VisualFilter;

/// Crop rectangle in the image's natural pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl CropRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Integer pixel bounds clipped to a `width` x `height` image.
    fn clip(self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let values = [self.x, self.y, self.width, self.height];
        if values.iter().any(|value| !value.is_finite()) {
            return None;
        }
        let left = self.x.round().clamp(0.0, width as f64);
        let top = self.y.round().clamp(0.0, height as f64);
        let right = (self.x + self.width).round().clamp(0.0, width as f64);
        let bottom = (self.y + self.height).round().clamp(0.0, height as f64);
        if right <= left || bottom <= top {
            return None;
        }
        Some((
            left as u32,
            top as u32,
            (right - left) as u32,
            (bottom - top) as u32,
        ))
    }
}

pub fn apply_filter(source: &UploadedImage, filter: VisualFilter) -> Result<UploadedImage> {
    let mut pixels = decode(source)?.to_rgba8();
    for pixel in pixels.pixels_mut() {
        *pixel = filter_pixel(*pixel, filter);
    }
    encode_png(DynamicImage::ImageRgba8(pixels))
}

pub fn crop(source: &UploadedImage, rect: CropRect) -> Result<UploadedImage> {
    let decoded = decode(source)?;
    let Some((x, y, width, height)) = rect.clip(decoded.width(), decoded.height()) else {
        bail!("crop area is empty or outside the image");
    };
    encode_png(decoded.crop_imm(x, y, width, height))
}

fn filter_pixel(pixel: Rgba<u8>, filter: VisualFilter) -> Rgba<u8> {
    let [r, g, b, a] = pixel.0;
    let (r, g, b) = (r as f64, g as f64, b as f64);
    let out = match filter {
        VisualFilter::Grayscale => {
            let luma = 0.2126 * r + 0.7152 * g + 0.0722 * b;
            [luma, luma, luma]
        }
        VisualFilter::Sepia => [
            0.393 * r + 0.769 * g + 0.189 * b,
            0.349 * r + 0.686 * g + 0.168 * b,
            0.272 * r + 0.534 * g + 0.131 * b,
        ],
        VisualFilter::Invert => [255.0 - r, 255.0 - g, 255.0 - b],
    };
    Rgba([channel(out[0]), channel(out[1]), channel(out[2]), a])
}

fn channel(value: f64) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

fn decode(source: &UploadedImage) -> Result<DynamicImage> {
    image::load_from_memory(&source.bytes).context("image could not be decoded")
}

fn encode_png(image: DynamicImage) -> Result<UploadedImage> {
    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .context("png encode failed")?;
    Ok(UploadedImage::from_bytes(out, "image/png"))
}

#[cfg(test)]
pub(crate) fn test_png(width: u32, height: u32, color: [u8; 4]) -> UploadedImage {
    let image = image::RgbaImage::from_pixel(width, height, Rgba(color));
    match encode_png(DynamicImage::ImageRgba8(image)) {
        Ok(encoded) => encoded,
        Err(err) => panic!("test png encode failed: {err}"),
    }
}
