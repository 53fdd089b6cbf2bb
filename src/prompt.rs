use thiserror::Error;

use crate::models::{AspectRatio, ContentPart, GenerationRequest, ImagePayload, ImageSlot, Mode};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("add a {0} image")] MissingImage(ImageSlot),
    #[error("describe the scene or add a background image")] MissingScene,
}

#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub mode: Mode,
    pub character: Option<ImagePayload>,
    pub product: Option<ImagePayload>,
    pub outfit: Option<ImagePayload>,
    pub background: Option<ImagePayload>,
    pub instruction: String,
    pub aspect_ratio: AspectRatio,
}

impl AspectRatio {
    pub fn describe(&self) -> String {
        match self {
            AspectRatio::Square => "a square (1:1)".to_string(),
            AspectRatio::Portrait => "a portrait (3:4)".to_string(),
            AspectRatio::Landscape => "a landscape (4:3)".to_string(),
            AspectRatio::Custom { width, height } => format!("a ({width}:{height})"),
        }
    }
}

fn additional(instruction: &str) -> String {
    let text = instruction.trim();
    if text.is_empty() { String::new() } else { format!(" Additional instructions: {text}") }
}

pub fn character_prompt(aspect: &AspectRatio, with_outfit: bool, instruction: &str) -> String {
    let aspect = aspect.describe();
    let extra = additional(instruction);
    if with_outfit {
        format!("Create a photorealistic image with {aspect} aspect ratio. The person from the first image is naturally holding and presenting the product from the second image, and is wearing the outfit shown in the third image. Keep the person's face, hair and body identical to the first image, reproduce the product exactly as it appears in the second image including its labels, colours and proportions, and fit the outfit from the third image to the person's pose. Use soft studio lighting with consistent shadows so the result looks like a single professional photograph.{extra}")
    } else {
        format!("Create a photorealistic image with {aspect} aspect ratio. The person from the first image is naturally holding and presenting the product from the second image. Keep the person's face, hair, clothing and body identical to the first image, and reproduce the product exactly as it appears in the second image including its labels, colours and proportions. Use soft studio lighting with consistent shadows so the result looks like a single professional photograph.{extra}")
    }
}

pub fn product_prompt(aspect: &AspectRatio, with_background: bool, instruction: &str) -> String {
    let aspect = aspect.describe();
    if with_background {
        let extra = additional(instruction);
        format!("Create a photorealistic product photograph with {aspect} aspect ratio. Place the product from the first image into the background scene from the second image. Reproduce the product exactly as it appears in the first image including its labels, colours and proportions, scale it realistically for the scene, and match the scene's lighting, perspective and shadows.{extra}")
    } else {
        let scene = instruction.trim();
        format!("Create a photorealistic product photograph with {aspect} aspect ratio. Place the product from the first image into the scene described below. Reproduce the product exactly as it appears in the first image including its labels, colours and proportions, scale it realistically for the scene, and light it to match its surroundings.\n\nUSER SCENE DESCRIPTION: {scene}")
    }
}

/// Assembles the instruction and content parts for one generation call.
pub fn build_request(inputs: PromptInputs) -> Result<GenerationRequest, PromptError> {
    let PromptInputs { mode, character, product, outfit, background, instruction, aspect_ratio } = inputs;
    let mut parts = Vec::with_capacity(4);
    let prompt = match mode {
        Mode::Character => {
            let character = character.ok_or(PromptError::MissingImage(ImageSlot::Character))?;
            let product = product.ok_or(PromptError::MissingImage(ImageSlot::Product))?;
            parts.push(ContentPart::Image(character));
            parts.push(ContentPart::Image(product));
            let with_outfit = outfit.is_some();
            if let Some(outfit) = outfit {
                parts.push(ContentPart::Image(outfit));
            }
            character_prompt(&aspect_ratio, with_outfit, &instruction)
        }
        Mode::Product => {
            let product = product.ok_or(PromptError::MissingImage(ImageSlot::Product))?;
            parts.push(ContentPart::Image(product));
            match background {
                Some(background) => {
                    parts.push(ContentPart::Image(background));
                    product_prompt(&aspect_ratio, true, &instruction)
                }
                None if instruction.trim().is_empty() => return Err(PromptError::MissingScene),
                None => product_prompt(&aspect_ratio, false, &instruction),
            }
        }
    };
    parts.push(ContentPart::Text(prompt.clone()));
    Ok(GenerationRequest { mode, parts, prompt, aspect_ratio })
}
