use std::io::Cursor;

use async_trait::async_trait;
use base64::Engine;
use image::{ImageFormat, Rgb, RgbImage};
use tracing::info;

use crate::gemini::{GenerationError, ImageGenerator};
use crate::intake::preview;
use crate::models::{AspectRatio, GeneratedImage, GenerationRequest};

const LONG_SIDE: u32 = 512;

const PALETTE: [[u8; 3]; 5] = [
    [0x3B, 0x82, 0xF6], // blue
    [0xEF, 0x44, 0x44], // red
    [0x10, 0xB9, 0x81], // green
    [0xF5, 0x9E, 0x0B], // amber
    [0x8B, 0x5C, 0xF6], // purple
];

/// Demo-mode generator used when no API key is configured.
pub struct PlaceholderGenerator;

pub fn dimensions(aspect: &AspectRatio) -> (u32, u32) {
    let (w, h) = aspect.terms();
    let (w, h) = (u64::from(w.max(1)), u64::from(h.max(1)));
    let long = u64::from(LONG_SIDE);
    if w >= h {
        (LONG_SIDE, (long * h / w).max(1) as u32)
    } else {
        ((long * w / h).max(1) as u32, LONG_SIDE)
    }
}

pub fn render(aspect: &AspectRatio, prompt: &str) -> Result<Vec<u8>, GenerationError> {
    let (width, height) = dimensions(aspect);
    let index = prompt.bytes().fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    let color = PALETTE[index % PALETTE.len()];
    let tile = RgbImage::from_pixel(width, height, Rgb(color));

    let mut buf = Vec::new();
    tile.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| GenerationError::Parse(e.to_string()))?;
    Ok(buf)
}

#[async_trait]
impl ImageGenerator for PlaceholderGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, GenerationError> {
        info!("Using demo mode - no real images generated");
        let png = render(&request.aspect_ratio, &request.prompt)?;
        let data = base64::engine::general_purpose::STANDARD.encode(png);
        info!("📦 Generated placeholder image: {}", preview(&data));
        Ok(GeneratedImage { data, mime_type: "image/png".to_string() })
    }
}
