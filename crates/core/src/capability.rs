//! Backend capability metadata and the LoRA preference merge.
//!
//! A [`CapabilitySnapshot`] holds everything a backend advertises for
//! request construction (models, samplers, upscalers, styles, LoRA
//! modules, server options). Each category is decoded from the raw JSON
//! payload the backend returns; see [`CapabilitySnapshot::apply`].

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Capability categories
// ---------------------------------------------------------------------------

/// One category of backend-advertised metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Loras,
    Models,
    Samplers,
    Upscalers,
    Styles,
    Options,
}

impl CapabilityKind {
    /// Every category, in the order a sync fetches them.
    pub const ALL: [CapabilityKind; 6] = [
        CapabilityKind::Loras,
        CapabilityKind::Models,
        CapabilityKind::Samplers,
        CapabilityKind::Upscalers,
        CapabilityKind::Styles,
        CapabilityKind::Options,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityKind::Loras => "loras",
            CapabilityKind::Models => "models",
            CapabilityKind::Samplers => "samplers",
            CapabilityKind::Upscalers => "upscalers",
            CapabilityKind::Styles => "styles",
            CapabilityKind::Options => "options",
        }
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A checkpoint model the backend can load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Display title; also the value posted to switch models.
    pub title: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerInfo {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpscalerInfo {
    pub name: String,
    #[serde(default)]
    pub scale: Option<f64>,
}

/// A saved prompt style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleInfo {
    pub name: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
}

/// A strength-weighted fine-tuning modifier.
///
/// `name` is the backend-authoritative key. `active` and `strength` are
/// owned locally and survive a capability refresh (see [`merge_loras`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraModifier {
    pub name: String,
    /// Key used inside the prompt tag. Falls back to `name` when the
    /// backend does not send one.
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub strength: f64,
    #[serde(default)]
    pub active: bool,
}

impl LoraModifier {
    pub fn new(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: alias.into(),
            path: None,
            strength: 0.0,
            active: false,
        }
    }

    /// Builder-style activation, mostly for tests and embedding callers.
    pub fn activated(mut self, strength: f64) -> Self {
        self.active = true;
        self.strength = strength;
        self
    }

    /// The alias used in prompt tags.
    pub fn prompt_key(&self) -> &str {
        if self.alias.is_empty() {
            &self.name
        } else {
            &self.alias
        }
    }
}

/// Merge a freshly fetched LoRA list into the locally known one.
///
/// - A local entry still offered by the backend keeps its `active` and
///   `strength`; every other field comes from the fresh record.
/// - A local entry the backend no longer offers is dropped.
/// - A fresh entry unknown locally is appended with `active = false` and
///   `strength = 0`.
///
/// Local ordering is preserved; new entries follow in backend order.
pub fn merge_loras(local: &[LoraModifier], fresh: Vec<LoraModifier>) -> Vec<LoraModifier> {
    let mut merged: Vec<LoraModifier> = local
        .iter()
        .filter_map(|current| {
            fresh
                .iter()
                .find(|candidate| candidate.name == current.name)
                .map(|candidate| LoraModifier {
                    active: current.active,
                    strength: current.strength,
                    ..candidate.clone()
                })
        })
        .collect();

    for candidate in fresh {
        if !local.iter().any(|current| current.name == candidate.name) {
            merged.push(LoraModifier {
                active: false,
                strength: 0.0,
                ..candidate
            });
        }
    }

    merged
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Everything the backend advertises for request construction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    pub models: Vec<ModelInfo>,
    pub samplers: Vec<SamplerInfo>,
    pub upscalers: Vec<UpscalerInfo>,
    pub styles: Vec<StyleInfo>,
    pub loras: Vec<LoraModifier>,
    /// Raw server options object (active checkpoint, sampler, ...).
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl CapabilitySnapshot {
    /// Replace one category from its raw backend payload.
    ///
    /// LoRAs are merged against the current list instead of replaced. On a
    /// decode error the snapshot is left untouched.
    pub fn apply(
        &mut self,
        kind: CapabilityKind,
        payload: serde_json::Value,
    ) -> Result<(), serde_json::Error> {
        match kind {
            CapabilityKind::Loras => {
                let fresh: Vec<LoraModifier> = serde_json::from_value(payload)?;
                self.loras = merge_loras(&self.loras, fresh);
            }
            CapabilityKind::Models => self.models = serde_json::from_value(payload)?,
            CapabilityKind::Samplers => self.samplers = serde_json::from_value(payload)?,
            CapabilityKind::Upscalers => self.upscalers = serde_json::from_value(payload)?,
            CapabilityKind::Styles => self.styles = serde_json::from_value(payload)?,
            CapabilityKind::Options => self.options = serde_json::from_value(payload)?,
        }
        Ok(())
    }

    /// LoRAs the user has switched on, in list order.
    pub fn active_loras(&self) -> impl Iterator<Item = &LoraModifier> {
        self.loras.iter().filter(|lora| lora.active)
    }

    /// The checkpoint the backend reports as loaded, if any.
    pub fn active_model(&self) -> Option<&str> {
        self.options
            .get("sd_model_checkpoint")
            .and_then(|value| value.as_str())
    }

    pub fn has_sampler(&self, name: &str) -> bool {
        self.samplers
            .iter()
            .any(|s| s.name == name || s.aliases.iter().any(|a| a == name))
    }

    /// Update the local preference fields of one LoRA. Returns `false` when
    /// no LoRA with that name is known.
    pub fn set_lora(&mut self, name: &str, active: bool, strength: f64) -> bool {
        match self.loras.iter_mut().find(|lora| lora.name == name) {
            Some(lora) => {
                lora.active = active;
                lora.strength = strength;
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
