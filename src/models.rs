use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use uuid::Uuid;
use std::collections::BTreeMap;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Put the product in the hands of a person.
    #[default]
    Character,
    /// Stage the product alone in a scene.
    Product,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImageSlot {
    Character,
    Product,
    Outfit,
    Background,
}

impl ImageSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Product => "product",
            Self::Outfit => "outfit",
            Self::Background => "background",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "character" => Some(Self::Character),
            "product" => Some(Self::Product),
            "outfit" => Some(Self::Outfit),
            "background" => Some(Self::Background),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImageSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AspectRatio {
    #[default]
    Square,
    Portrait,
    Landscape,
    Custom { width: u32, height: u32 },
}

impl AspectRatio {
    /// Width and height terms of the ratio, e.g. `(3, 4)` for portrait.
    pub fn terms(&self) -> (u32, u32) {
        match *self {
            AspectRatio::Square => (1, 1),
            AspectRatio::Portrait => (3, 4),
            AspectRatio::Landscape => (4, 3),
            AspectRatio::Custom { width, height } => (width, height),
        }
    }

    pub fn is_valid(&self) -> bool {
        let (w, h) = self.terms();
        w > 0 && h > 0
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ImageMime {
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/webp")]
    Webp,
}

/// Decoded form of an uploaded data-URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub base64: String,
    pub mime_type: ImageMime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Image(ImagePayload),
    Text(String),
}

/// One call's worth of input for the generation API. Images come first, the
/// instruction text last.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub mode: Mode,
    pub parts: Vec<ContentPart>,
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
}

impl GenerationRequest {
    pub fn image_count(&self) -> usize {
        self.parts.iter().filter(|p| matches!(p, ContentPart::Image(_))).count()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub data: String,
    pub mime_type: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HistoryItem {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub mode: Mode,
    pub images: BTreeMap<ImageSlot, String>,
    pub instruction: String,
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
    pub results: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SetModeRequest {
    pub mode: Mode,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SetImageRequest {
    pub data_url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct OptionsRequest {
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub aspect_ratio: Option<AspectRatio>,
    #[serde(default)]
    pub count: Option<u8>,
}
