use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::ImageFormat;
use thiserror::Error;

use crate::models::{GeneratedImage, ImageMime, ImagePayload};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntakeError {
    #[error("not a data URL")] NotDataUrl,
    #[error("unsupported image type: {0}")] UnsupportedType(String),
    #[error("data URL is not base64 encoded")] NotBase64,
    #[error("invalid base64 payload: {0}")] InvalidPayload(String),
    #[error("file is empty")] Empty,
}

impl ImageMime {
    pub fn from_mime(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/webp" => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
        }
    }

    fn sniff(bytes: &[u8]) -> Option<Self> {
        match image::guess_format(bytes).ok()? {
            ImageFormat::Jpeg => Some(Self::Jpeg),
            ImageFormat::Png => Some(Self::Png),
            ImageFormat::WebP => Some(Self::Webp),
            _ => None,
        }
    }
}

impl ImagePayload {
    /// Parses `data:{mime};base64,{payload}`.
    pub fn from_data_url(url: &str) -> Result<Self, IntakeError> {
        let rest = url.trim().strip_prefix("data:").ok_or(IntakeError::NotDataUrl)?;
        let (header, payload) = rest.split_once(',').ok_or(IntakeError::NotDataUrl)?;
        let (mime, encoding) = header.split_once(';').ok_or(IntakeError::NotBase64)?;
        if !encoding.eq_ignore_ascii_case("base64") {
            return Err(IntakeError::NotBase64);
        }
        let mime_type = ImageMime::from_mime(mime)
            .ok_or_else(|| IntakeError::UnsupportedType(mime.to_string()))?;
        STANDARD.decode(payload).map_err(|e| IntakeError::InvalidPayload(e.to_string()))?;
        Ok(Self { base64: payload.to_string(), mime_type })
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type.as_str(), self.base64)
    }
}

impl GeneratedImage {
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// Encodes an uploaded file as a data-URL. A supported declared content type
/// wins, anything else falls back to the file's magic bytes.
pub fn encode_file(bytes: &[u8], declared: Option<&str>) -> Result<String, IntakeError> {
    if bytes.is_empty() {
        return Err(IntakeError::Empty);
    }
    let mime = declared
        .and_then(ImageMime::from_mime)
        .or_else(|| ImageMime::sniff(bytes))
        .ok_or_else(|| IntakeError::UnsupportedType(declared.unwrap_or("unknown").to_string()))?;
    Ok(format!("data:{};base64,{}", mime.as_str(), STANDARD.encode(bytes)))
}

/// Splits any base64 data-URL, including generator output whose MIME type is
/// not one we accept for uploads, into its MIME type and raw bytes.
pub fn decode_data_url(url: &str) -> Result<(String, Vec<u8>), IntakeError> {
    let rest = url.strip_prefix("data:").ok_or(IntakeError::NotDataUrl)?;
    let (header, payload) = rest.split_once(',').ok_or(IntakeError::NotDataUrl)?;
    let mime = header.strip_suffix(";base64").ok_or(IntakeError::NotBase64)?;
    let bytes = STANDARD.decode(payload).map_err(|e| IntakeError::InvalidPayload(e.to_string()))?;
    Ok((mime.to_string(), bytes))
}

pub fn download_filename(n: usize) -> String {
    format!("generated-image-{}.png", n)
}

/// Shortens long base64 strings for log lines.
pub fn preview(data: &str) -> String {
    let total = data.chars().count();
    if total > 50 {
        format!("{}...[{} chars total]", data.chars().take(50).collect::<String>(), total)
    } else {
        data.to_string()
    }
}
