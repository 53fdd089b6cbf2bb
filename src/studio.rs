use std::collections::BTreeMap;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::gemini::{GenerationError, ImageGenerator};
use crate::intake::IntakeError;
use crate::models::{
    AspectRatio, GeneratedImage, GenerationRequest, HistoryItem, ImagePayload, ImageSlot, Mode, OptionsRequest,
};
use crate::prompt::{build_request, PromptInputs};

pub const MAX_HISTORY: usize = 10;
pub const MAX_COUNT: u8 = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StudioError {
    #[error("a generation is already running")] Busy,
    #[error("image count must be between 1 and 6, got {0}")] InvalidCount(u8),
    #[error("custom aspect ratio needs a width and height above zero")] InvalidAspectRatio,
    #[error("no history entry at index {0}")] NoSuchHistory(usize),
    #[error("there is no result to regenerate")] NothingToRegenerate,
    #[error("invalid {slot} image: {source}")] Intake { slot: ImageSlot, source: IntakeError },
    /// Inputs are incomplete; the message is also shown on the idle screen.
    #[error("{0}")] Validation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Phase {
    Idle { error: Option<String> },
    Loading { batch: u64 },
    Result { images: Vec<String> },
}

impl Default for Phase {
    fn default() -> Self { Phase::Idle { error: None } }
}

/// Past generations, newest first.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct History { items: Vec<HistoryItem> }

impl History {
    pub fn push(&mut self, item: HistoryItem) {
        self.items.insert(0, item);
        self.items.truncate(MAX_HISTORY);
    }

    pub fn get(&self, index: usize) -> Option<&HistoryItem> { self.items.get(index) }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &HistoryItem> { self.items.iter() }
}

/// N copies of one request, dispatched together by [`run_batch`].
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: u64,
    pub count: u8,
    pub request: GenerationRequest,
}

#[derive(Debug, Clone, Serialize)]
pub struct Studio {
    pub mode: Mode,
    pub images: BTreeMap<ImageSlot, String>,
    pub instruction: String,
    pub aspect_ratio: AspectRatio,
    pub count: u8,
    pub phase: Phase,
    pub history: History,
    #[serde(skip)]
    next_batch: u64,
}

impl Default for Studio {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            images: BTreeMap::new(),
            instruction: String::new(),
            aspect_ratio: AspectRatio::default(),
            count: 1,
            phase: Phase::default(),
            history: History::default(),
            next_batch: 0,
        }
    }
}

impl Studio {
    pub fn new() -> Self { Self::default() }

    pub fn is_loading(&self) -> bool { matches!(self.phase, Phase::Loading { .. }) }

    pub fn error(&self) -> Option<&str> {
        match &self.phase {
            Phase::Idle { error } => error.as_deref(),
            _ => None,
        }
    }

    /// Displayed result `n`, counting from 1 like the download names.
    pub fn result(&self, n: usize) -> Option<&str> {
        match &self.phase {
            Phase::Result { images } if n > 0 => images.get(n - 1).map(String::as_str),
            _ => None,
        }
    }

    // Edits are refused mid-batch; otherwise they drop any shown result or error.
    fn begin_edit(&mut self) -> Result<(), StudioError> {
        if self.is_loading() {
            return Err(StudioError::Busy);
        }
        self.phase = Phase::default();
        Ok(())
    }

    pub fn set_mode(&mut self, mode: Mode) -> Result<(), StudioError> {
        self.begin_edit()?;
        self.mode = mode;
        Ok(())
    }

    pub fn set_image(&mut self, slot: ImageSlot, data_url: String) -> Result<(), StudioError> {
        if self.is_loading() {
            return Err(StudioError::Busy);
        }
        ImagePayload::from_data_url(&data_url).map_err(|source| StudioError::Intake { slot, source })?;
        self.begin_edit()?;
        self.images.insert(slot, data_url.trim().to_string());
        Ok(())
    }

    pub fn clear_image(&mut self, slot: ImageSlot) -> Result<(), StudioError> {
        self.begin_edit()?;
        self.images.remove(&slot);
        Ok(())
    }

    pub fn set_options(&mut self, options: OptionsRequest) -> Result<(), StudioError> {
        if self.is_loading() {
            return Err(StudioError::Busy);
        }
        if let Some(count) = options.count {
            if !(1..=MAX_COUNT).contains(&count) {
                return Err(StudioError::InvalidCount(count));
            }
        }
        if let Some(aspect) = &options.aspect_ratio {
            if !aspect.is_valid() {
                return Err(StudioError::InvalidAspectRatio);
            }
        }
        self.begin_edit()?;
        if let Some(instruction) = options.instruction { self.instruction = instruction; }
        if let Some(aspect) = options.aspect_ratio { self.aspect_ratio = aspect; }
        if let Some(count) = options.count { self.count = count; }
        Ok(())
    }

    fn payload(&self, slot: ImageSlot) -> Result<Option<ImagePayload>, String> {
        self.images
            .get(&slot)
            .map(|url| ImagePayload::from_data_url(url).map_err(|e| format!("The {slot} image could not be read: {e}")))
            .transpose()
    }

    fn validated_inputs(&self) -> Result<PromptInputs, String> {
        let has = |slot| self.images.contains_key(&slot);
        match self.mode {
            Mode::Character => {
                if !has(ImageSlot::Character) || !has(ImageSlot::Product) {
                    return Err("Please upload both a character image and a product image.".to_string());
                }
            }
            Mode::Product => {
                if !has(ImageSlot::Product) {
                    return Err("Please upload a product image.".to_string());
                }
                if self.instruction.trim().is_empty() && !has(ImageSlot::Background) {
                    return Err("Please describe the scene or upload a background image.".to_string());
                }
            }
        }
        let (outfit, background) = match self.mode {
            Mode::Character => (self.payload(ImageSlot::Outfit)?, None),
            Mode::Product => (None, self.payload(ImageSlot::Background)?),
        };
        Ok(PromptInputs {
            mode: self.mode,
            character: match self.mode {
                Mode::Character => self.payload(ImageSlot::Character)?,
                Mode::Product => None,
            },
            product: self.payload(ImageSlot::Product)?,
            outfit,
            background,
            instruction: self.instruction.clone(),
            aspect_ratio: self.aspect_ratio,
        })
    }

    /// Validates the inputs and moves to `Loading`. On a validation failure the
    /// studio stays idle with the message set and nothing is dispatched.
    pub fn prepare_batch(&mut self) -> Result<Batch, StudioError> {
        if self.is_loading() {
            return Err(StudioError::Busy);
        }
        let request = self
            .validated_inputs()
            .and_then(|inputs| build_request(inputs).map_err(|e| e.to_string()));
        let request = match request {
            Ok(request) => request,
            Err(message) => {
                warn!("⚠️ Validation failed: {}", message);
                self.phase = Phase::Idle { error: Some(message.clone()) };
                return Err(StudioError::Validation(message));
            }
        };
        self.next_batch += 1;
        let batch = Batch { id: self.next_batch, count: self.count, request };
        self.phase = Phase::Loading { batch: batch.id };
        info!("🚀 Batch {} ready: {:?} mode, {} images x{}", batch.id, self.mode, batch.request.image_count(), batch.count);
        Ok(batch)
    }

    /// Same inputs again, only from a shown result.
    pub fn regenerate(&mut self) -> Result<Batch, StudioError> {
        match self.phase {
            Phase::Result { .. } => self.prepare_batch(),
            Phase::Loading { .. } => Err(StudioError::Busy),
            Phase::Idle { .. } => Err(StudioError::NothingToRegenerate),
        }
    }

    /// Applies a finished batch. Returns false when the batch is stale because
    /// the studio was reset while it ran.
    pub fn complete_batch(&mut self, batch: &Batch, outcome: Result<Vec<GeneratedImage>, GenerationError>) -> bool {
        if self.phase != (Phase::Loading { batch: batch.id }) {
            info!("Discarding outcome of stale batch {}", batch.id);
            return false;
        }
        match outcome {
            Ok(images) => {
                let results: Vec<String> = images.iter().map(GeneratedImage::to_data_url).collect();
                self.history.push(HistoryItem {
                    id: Uuid::new_v4(),
                    created_at: Utc::now(),
                    mode: self.mode,
                    images: self.images.clone(),
                    instruction: self.instruction.clone(),
                    prompt: batch.request.prompt.clone(),
                    aspect_ratio: self.aspect_ratio,
                    results: results.clone(),
                });
                info!("✅ Batch {} produced {} images", batch.id, results.len());
                self.phase = Phase::Result { images: results };
            }
            Err(e) => {
                warn!("❌ Batch {} failed: {}", batch.id, e);
                self.phase = Phase::Idle { error: Some(format!("Generation failed: {e}")) };
            }
        }
        true
    }

    /// Back to editing with the same inputs.
    pub fn continue_editing(&mut self) -> Result<(), StudioError> {
        self.begin_edit()
    }

    /// Clears every input. Allowed mid-batch, the running batch is then ignored.
    pub fn start_over(&mut self) {
        let history = std::mem::take(&mut self.history);
        let next_batch = self.next_batch;
        *self = Self { history, next_batch, ..Self::default() };
    }

    pub fn restore(&mut self, index: usize) -> Result<(), StudioError> {
        if self.is_loading() {
            return Err(StudioError::Busy);
        }
        let item = self.history.get(index).cloned().ok_or(StudioError::NoSuchHistory(index))?;
        self.mode = item.mode;
        self.images = item.images;
        self.instruction = item.instruction;
        self.aspect_ratio = item.aspect_ratio;
        self.count = u8::try_from(item.results.len()).unwrap_or(MAX_COUNT).clamp(1, MAX_COUNT);
        self.phase = Phase::Result { images: item.results };
        Ok(())
    }
}

/// Fires every request of the batch at once and lets all of them settle. One
/// failure fails the batch; successes are then dropped.
pub async fn run_batch(generator: &dyn ImageGenerator, batch: &Batch) -> Result<Vec<GeneratedImage>, GenerationError> {
    let calls = (0..batch.count).map(|i| async move {
        let result = generator.generate(&batch.request).await;
        if let Err(e) = &result {
            warn!("Request {} of batch {} failed: {}", i + 1, batch.id, e);
        }
        result
    });
    join_all(calls).await.into_iter().collect()
}
