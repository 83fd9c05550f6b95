//! Mask rasters: effect-specific post-processing and alpha bounding boxes.

use std::io::Cursor;

use image::{DynamicImage, GrayAlphaImage, ImageFormat, LumaA, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::AnalyzeError;

use super::classify::EffectType;
use super::document::MM_PER_INCH;

/// Pixels with alpha at or below this count as transparent.
pub const ALPHA_CUTOFF: u8 = 10;

const CONTRAST: f32 = 40.0;
const THRESHOLD: u8 = 128;
const PLACEHOLDER_SIZE: u32 = 64;

/// Axis-aligned box in millimeters from the top-left corner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// The centered half of a `width` x `height` page.
    pub fn centered_half(width: f64, height: f64) -> Self {
        Self {
            x: round2(width / 4.0),
            y: round2(height / 4.0),
            width: round2(width / 2.0),
            height: round2(height / 2.0),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub fn px_to_mm(px: u32, dpi: u32) -> f64 {
    if dpi == 0 {
        return 0.0;
    }
    round2(f64::from(px) * MM_PER_INCH / f64::from(dpi))
}

fn decode(png: &[u8]) -> Result<DynamicImage, AnalyzeError> {
    image::load_from_memory(png).map_err(|e| AnalyzeError::Image(e.to_string()))
}

fn encode(img: &DynamicImage) -> Result<Vec<u8>, AnalyzeError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| AnalyzeError::Image(e.to_string()))?;
    Ok(buf)
}

/// Bounding box of pixels whose alpha exceeds [`ALPHA_CUTOFF`], or `None`
/// when every pixel is transparent.
pub fn alpha_bounds(png: &[u8], dpi: u32) -> Result<Option<BoundingBox>, AnalyzeError> {
    let img = decode(png)?.to_rgba8();

    let mut min = (u32::MAX, u32::MAX);
    let mut max = (0u32, 0u32);
    let mut any = false;
    for (x, y, Rgba([_, _, _, a])) in img.enumerate_pixels() {
        if *a > ALPHA_CUTOFF {
            any = true;
            min = (min.0.min(x), min.1.min(y));
            max = (max.0.max(x), max.1.max(y));
        }
    }
    if !any {
        return Ok(None);
    }

    Ok(Some(BoundingBox {
        x: px_to_mm(min.0, dpi),
        y: px_to_mm(min.1, dpi),
        width: px_to_mm(max.0 - min.0 + 1, dpi),
        height: px_to_mm(max.1 - min.1 + 1, dpi),
    }))
}

/// Derives a substitute mask for `effect` from a full-page render.
pub fn post_process(png: &[u8], effect: EffectType) -> Result<Vec<u8>, AnalyzeError> {
    let page = decode(png)?;
    let processed = match effect {
        EffectType::Foil => page.grayscale().adjust_contrast(CONTRAST),
        EffectType::Emboss => page.grayscale(),
        EffectType::Edge => page.adjust_contrast(CONTRAST),
        EffectType::SpotUv | EffectType::Diecut => DynamicImage::ImageLumaA8(threshold(&page)),
    };
    encode(&processed)
}

/// Dark, visible pixels become opaque black; everything else transparent.
fn threshold(img: &DynamicImage) -> GrayAlphaImage {
    let luma = img.to_luma_alpha8();
    GrayAlphaImage::from_fn(luma.width(), luma.height(), |x, y| {
        let LumaA([l, a]) = *luma.get_pixel(x, y);
        if a > ALPHA_CUTOFF && l < THRESHOLD {
            LumaA([0, 255])
        } else {
            LumaA([0, 0])
        }
    })
}

/// Small opaque square used where no real mask exists.
pub fn placeholder() -> Result<Vec<u8>, AnalyzeError> {
    let img = RgbaImage::from_pixel(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE, Rgba([255, 255, 255, 255]));
    encode(&DynamicImage::ImageRgba8(img))
}
