//! Generation request payload and the request builder.
//!
//! The serialized field names follow the txt2img / img2img JSON body that
//! local HTTP backends accept.

use serde::{Deserialize, Serialize};

use crate::capability::LoraModifier;

/// High-resolution second pass parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiresPass {
    #[serde(rename = "enable_hr")]
    pub enabled: bool,
    #[serde(rename = "hr_upscaler")]
    pub upscaler: String,
    #[serde(rename = "hr_scale")]
    pub scale: f64,
    /// Shared with image-to-image, where it controls how far the result
    /// may drift from the init image.
    pub denoising_strength: f64,
    #[serde(rename = "hr_second_pass_steps")]
    pub extra_steps: u32,
}

/// A canonical generation request.
///
/// Numeric fields are carried verbatim from configuration; range checks
/// are left to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    /// `-1` asks the backend for a random seed.
    pub seed: i64,
    pub width: u32,
    pub height: u32,
    pub sampler_name: String,
    pub steps: u32,
    pub cfg_scale: f64,
    /// Batch count.
    pub n_iter: u32,
    pub restore_faces: bool,
    #[serde(flatten)]
    pub hires: HiresPass,
    /// Base64 source images; present only for image-to-image.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub init_images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub styles: Vec<String>,
}

impl GenerationRequest {
    pub fn is_img2img(&self) -> bool {
        self.init_images.is_some()
    }
}

/// Concatenated `<lora:{alias}:{strength}>` tags for every active LoRA,
/// in list order.
pub fn lora_prompt_fragment(loras: &[LoraModifier]) -> String {
    loras
        .iter()
        .filter(|lora| lora.active)
        .map(|lora| format!("<lora:{}:{}>", lora.prompt_key(), lora.strength))
        .collect()
}

/// Builds fresh requests from a cached template.
///
/// The template is never mutated; every call clones it.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    template: GenerationRequest,
    lora_fragment: String,
}

impl RequestBuilder {
    /// `template.prompt` is treated as the prompt prefix.
    pub fn new(template: GenerationRequest, loras: &[LoraModifier]) -> Self {
        Self {
            template,
            lora_fragment: lora_prompt_fragment(loras),
        }
    }

    pub fn template(&self) -> &GenerationRequest {
        &self.template
    }

    /// `prefix + user_prompt + ", " + lora fragment`.
    pub fn compose_prompt(&self, user_prompt: &str) -> String {
        format!(
            "{}{}, {}",
            self.template.prompt, user_prompt, self.lora_fragment
        )
    }

    /// Text-to-image request for `user_prompt`.
    pub fn build(&self, user_prompt: &str) -> GenerationRequest {
        let mut request = self.template.clone();
        request.prompt = self.compose_prompt(user_prompt);
        request
    }

    /// Image-to-image request: the text-to-image request plus the source
    /// image.
    pub fn build_img2img(&self, user_prompt: &str, init_image: String) -> GenerationRequest {
        let mut request = self.build(user_prompt);
        request.init_images = Some(vec![init_image]);
        request
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
