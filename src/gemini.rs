use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use serde::Deserialize;
use reqwest::Client;
use tracing::{info, error, warn};

use crate::config::Config;
use crate::intake::preview;
use crate::models::{ContentPart, GeneratedImage, GenerationRequest};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("HTTP error: {0}")] Http(String),
    #[error("could not read the response: {0}")] Parse(String),
    #[error("the request was blocked: {0}")] Blocked(String),
    #[error("no image was returned{}", explanation(.0))] NoImage(Option<String>),
}

fn explanation(text: &Option<String>) -> String {
    match text {
        Some(t) => format!(": {t}"),
        None => String::new(),
    }
}

/// Anything that can turn one request into one image.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, GenerationError>;
}

// Helper function to truncate base64 data in JSON for cleaner logging
fn truncate_base64_in_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if key == "data" {
                    if let serde_json::Value::String(s) = val {
                        let total = s.chars().count();
                        if total > 100 {
                            let head: String = s.chars().take(50).collect();
                            *val = serde_json::Value::String(format!("{}...[truncated {} chars]", head, total - 50));
                        }
                    }
                } else {
                    truncate_base64_in_json(val);
                }
            }
        }
        serde_json::Value::Array(arr) => {
            for val in arr.iter_mut() {
                truncate_base64_in_json(val);
            }
        }
        _ => {}
    }
}

fn loggable(value: &serde_json::Value) -> String {
    let mut copy = value.clone();
    truncate_base64_in_json(&mut copy);
    serde_json::to_string(&copy).unwrap_or_default()
}

pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: String, config: &Config) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: config.api_base.clone(),
            model: config.model.clone(),
        }
    }

    fn url(&self) -> String {
        format!("{}/models/{}:generateContent?key={}", self.base_url, self.model, self.api_key)
    }
}

/// JSON body for `generateContent`, parts in request order.
pub fn request_body(request: &GenerationRequest) -> serde_json::Value {
    let parts: Vec<serde_json::Value> = request.parts.iter().map(|part| match part {
        ContentPart::Image(img) => json!({
            "inlineData": { "mimeType": img.mime_type.as_str(), "data": img.base64 }
        }),
        ContentPart::Text(text) => json!({ "text": text }),
    }).collect();

    json!({
        "contents": [{ "parts": parts }],
        "generationConfig": {
            "responseModalities": ["IMAGE", "TEXT"],
            "candidateCount": 1
        }
    })
}

#[async_trait]
impl ImageGenerator for GeminiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, GenerationError> {
        let url = self.url();
        info!("🔗 Making request to: {}", url.replace(&self.api_key, "***"));

        let body = request_body(request);
        info!("📤 Request body: {}", loggable(&body));

        let response = self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Http(e.to_string()))?;

        let status = response.status();
        info!("📥 Response status: {}", status);

        let response_text = response.text().await
            .map_err(|e| GenerationError::Http(e.to_string()))?;

        if !status.is_success() {
            error!("❌ API Error response: {}", response_text);
            return Err(GenerationError::Http(format!("status={} body={}", status, response_text)));
        }

        let result = parse_image_response(&response_text);
        match &result {
            Ok(img) => info!("🖼️ Extracted {} image from API response: {}", img.mime_type, preview(&img.data)),
            Err(e) => warn!("⚠️ Generation returned no usable image: {}", e),
        }
        result
    }
}

// --- Response Parsing Helpers ---

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(default, rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Content { #[serde(default)] parts: Vec<Part> }

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Part {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData
    },
    Text { text: String },
    #[allow(dead_code)]
    Other(serde_json::Value)
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
}

/// Takes the first inline image from a `generateContent` response. Text-only
/// answers become [`GenerationError::NoImage`] carrying the model's words.
pub fn parse_image_response(body: &str) -> Result<GeneratedImage, GenerationError> {
    let parsed: GeminiResponse = serde_json::from_str(body)
        .map_err(|e| GenerationError::Parse(e.to_string()))?;

    if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(GenerationError::Blocked(reason));
    }

    let mut texts = Vec::new();
    let mut finish = None;
    for c in parsed.candidates {
        for p in c.content.parts {
            match p {
                Part::Inline { inline_data } => {
                    return Ok(GeneratedImage { data: inline_data.data, mime_type: inline_data.mime_type });
                }
                Part::Text { text } if !text.trim().is_empty() => texts.push(text.trim().to_string()),
                _ => {}
            }
        }
        if finish.is_none() {
            finish = c.finish_reason;
        }
    }

    let explanation = if texts.is_empty() {
        finish.filter(|r| r != "STOP").map(|r| format!("finish reason {r}"))
    } else {
        Some(texts.join(" "))
    };
    Err(GenerationError::NoImage(explanation))
}
