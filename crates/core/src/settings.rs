//! Configuration store contract and typed generation settings.
//!
//! The host application owns a generic key-value store addressed by
//! `(namespace, key)`. [`GenerationSettings::load`] reads every value the
//! request pipeline needs from namespace [`NAMESPACE`], falling back to a
//! default for each missing key and coercing form-style strings
//! (`"512"`, `"true"`) into their target types.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use serde_json::Value;

use crate::capability::LoraModifier;
use crate::error::CoreError;
use crate::progress::PollConfig;
use crate::request::{GenerationRequest, HiresPass};

/// Namespace holding every setting read by this crate.
pub const NAMESPACE: &str = "artifex";

/// Setting keys inside [`NAMESPACE`].
pub mod keys {
    pub const SOURCE: &str = "source";
    pub const BASE_URL: &str = "baseUrl";
    pub const PROMPT_PREFIX: &str = "promptPrefix";
    pub const NEGATIVE_PROMPT: &str = "negativePrompt";
    pub const SEED: &str = "seed";
    pub const WIDTH: &str = "width";
    pub const HEIGHT: &str = "height";
    pub const NUM_IMAGES: &str = "numImages";
    pub const RESTORE_FACES: &str = "restoreFaces";
    pub const SAMPLER_STEPS: &str = "samplerSteps";
    pub const SAMPLER: &str = "sampler";
    pub const ENABLE_HR: &str = "enableHr";
    pub const UPSCALER: &str = "upscaler";
    pub const HR_SCALE: &str = "hrScale";
    pub const DENOISING_STRENGTH: &str = "denoisingStrength";
    pub const HR_SECOND_PASS_STEPS: &str = "hrSecondPassSteps";
    pub const CFG_SCALE: &str = "cfgScale";
    pub const STYLES: &str = "styles";
    pub const POLL_INTERVAL_MS: &str = "pollIntervalMs";
    pub const MAX_ATTEMPTS: &str = "maxAttempts";
    pub const HORDE_API_KEY: &str = "hordeApiKey";
    pub const HORDE_MODEL: &str = "hordeModel";
    pub const LORAS: &str = "loras";
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Generic key-value settings store provided by the host.
pub trait SettingsStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Option<Value>;

    fn set(&self, namespace: &str, key: &str, value: Value) -> Result<(), CoreError>;
}

/// In-process store. Values live only as long as the store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<(String, String), Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value in [`NAMESPACE`], builder style.
    pub fn with(self, key: &str, value: impl Into<Value>) -> Self {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((NAMESPACE.to_string(), key.to_string()), value.into());
        self
    }
}

impl SettingsStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }

    fn set(&self, namespace: &str, key: &str, value: Value) -> Result<(), CoreError> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }
}

/// Store persisted as a single JSON document of the shape
/// `{"<namespace>": {"<key>": <value>}}`. Every `set` writes the whole
/// document back to disk.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    document: RwLock<serde_json::Map<String, Value>>,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing file starts an empty document.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref().to_path_buf();
        let document = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| CoreError::Store(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_json::Map::new(),
            Err(e) => return Err(CoreError::Store(format!("{}: {e}", path.display()))),
        };
        Ok(Self {
            path,
            document: RwLock::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileStore {
    fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        self.document
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned()
    }

    fn set(&self, namespace: &str, key: &str, value: Value) -> Result<(), CoreError> {
        let mut document = self.document.write().unwrap_or_else(PoisonError::into_inner);
        let section = document
            .entry(namespace.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        match section {
            Value::Object(map) => {
                map.insert(key.to_string(), value);
            }
            other => {
                return Err(CoreError::Store(format!(
                    "namespace {namespace} is not an object: {other}"
                )))
            }
        }

        let bytes = serde_json::to_vec_pretty(&*document)
            .map_err(|e| CoreError::Store(e.to_string()))?;
        std::fs::write(&self.path, bytes)
            .map_err(|e| CoreError::Store(format!("{}: {e}", self.path.display())))
    }
}

// ---------------------------------------------------------------------------
// Backend source selector
// ---------------------------------------------------------------------------

/// Which backend variant serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendSource {
    /// Local HTTP API using the neutral route layout.
    Local,
    /// Local HTTP API using the Automatic1111 `/sdapi/v1` layout.
    Automatic1111,
    /// Distributed worker pool (AI Horde).
    Horde,
}

impl BackendSource {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendSource::Local => "local",
            BackendSource::Automatic1111 => "automatic1111",
            BackendSource::Horde => "horde",
        }
    }

    /// Base URL used when the store does not configure one.
    pub fn default_base_url(self) -> &'static str {
        match self {
            BackendSource::Local | BackendSource::Automatic1111 => "http://127.0.0.1:7860",
            BackendSource::Horde => "https://aihorde.net/api",
        }
    }
}

impl FromStr for BackendSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(BackendSource::Local),
            "automatic1111" | "a1111" => Ok(BackendSource::Automatic1111),
            "horde" | "stableHorde" => Ok(BackendSource::Horde),
            other => Err(CoreError::Validation(format!(
                "Unknown backend source '{other}'. Must be one of: local, automatic1111, horde"
            ))),
        }
    }
}

/// Resolve the configured source. Called once per operation so a switch
/// made mid-session applies to the next request.
pub fn selected_source(store: &dyn SettingsStore) -> Result<BackendSource, CoreError> {
    read_string(store, keys::SOURCE, BackendSource::Local.as_str())?.parse()
}

// ---------------------------------------------------------------------------
// Typed settings
// ---------------------------------------------------------------------------

/// Snapshot of every generation-related setting.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub source: BackendSource,
    pub base_url: String,
    pub prompt_prefix: String,
    pub negative_prompt: String,
    pub seed: i64,
    pub width: u32,
    pub height: u32,
    pub n_iter: u32,
    pub restore_faces: bool,
    pub steps: u32,
    pub sampler: String,
    pub enable_hr: bool,
    pub upscaler: String,
    pub hr_scale: f64,
    pub denoising_strength: f64,
    pub hr_second_pass_steps: u32,
    pub cfg_scale: f64,
    pub styles: Vec<String>,
    pub poll: PollConfig,
    pub horde_api_key: String,
    pub horde_model: Option<String>,
}

impl GenerationSettings {
    /// Read all settings from `store`, applying defaults for missing keys.
    pub fn load(store: &dyn SettingsStore) -> Result<Self, CoreError> {
        let source = selected_source(store)?;
        let base_url = read_string(store, keys::BASE_URL, source.default_base_url())?
            .trim_end_matches('/')
            .to_string();
        let horde_model = read_string(store, keys::HORDE_MODEL, "")?;
        let poll_defaults = PollConfig::default();

        Ok(Self {
            source,
            base_url,
            prompt_prefix: read_string(store, keys::PROMPT_PREFIX, "")?,
            negative_prompt: read_string(store, keys::NEGATIVE_PROMPT, "")?,
            seed: read_i64(store, keys::SEED, -1)?,
            width: read_u32(store, keys::WIDTH, 512)?,
            height: read_u32(store, keys::HEIGHT, 512)?,
            n_iter: read_u32(store, keys::NUM_IMAGES, 1)?,
            restore_faces: read_bool(store, keys::RESTORE_FACES, false)?,
            steps: read_u32(store, keys::SAMPLER_STEPS, 20)?,
            sampler: read_string(store, keys::SAMPLER, "Euler a")?,
            enable_hr: read_bool(store, keys::ENABLE_HR, false)?,
            upscaler: read_string(store, keys::UPSCALER, "Latent")?,
            hr_scale: read_f64(store, keys::HR_SCALE, 2.0)?,
            denoising_strength: read_f64(store, keys::DENOISING_STRENGTH, 0.7)?,
            hr_second_pass_steps: read_u32(store, keys::HR_SECOND_PASS_STEPS, 0)?,
            cfg_scale: read_f64(store, keys::CFG_SCALE, 7.0)?,
            styles: read_string_list(store, keys::STYLES)?,
            poll: PollConfig {
                interval: std::time::Duration::from_millis(read_u64(
                    store,
                    keys::POLL_INTERVAL_MS,
                    poll_defaults.interval.as_millis() as u64,
                )?),
                max_attempts: read_u32(store, keys::MAX_ATTEMPTS, poll_defaults.max_attempts)?,
            },
            horde_api_key: read_string(store, keys::HORDE_API_KEY, "0000000000")?,
            horde_model: (!horde_model.is_empty()).then_some(horde_model),
        })
    }

    /// The request template every build starts from. The prompt holds only
    /// the configured prefix.
    pub fn template(&self) -> GenerationRequest {
        GenerationRequest {
            prompt: self.prompt_prefix.clone(),
            negative_prompt: self.negative_prompt.clone(),
            seed: self.seed,
            width: self.width,
            height: self.height,
            sampler_name: self.sampler.clone(),
            steps: self.steps,
            cfg_scale: self.cfg_scale,
            n_iter: self.n_iter,
            restore_faces: self.restore_faces,
            hires: HiresPass {
                enabled: self.enable_hr,
                upscaler: self.upscaler.clone(),
                scale: self.hr_scale,
                denoising_strength: self.denoising_strength,
                extra_steps: self.hr_second_pass_steps,
            },
            init_images: None,
            styles: self.styles.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoRA persistence
// ---------------------------------------------------------------------------

/// Load the persisted LoRA preferences. A malformed entry is logged and
/// treated as an empty list.
pub fn load_loras(store: &dyn SettingsStore) -> Vec<LoraModifier> {
    match store.get(NAMESPACE, keys::LORAS) {
        None | Some(Value::Null) => Vec::new(),
        Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring malformed persisted LoRA list");
            Vec::new()
        }),
    }
}

pub fn store_loras(store: &dyn SettingsStore, loras: &[LoraModifier]) -> Result<(), CoreError> {
    let value = serde_json::to_value(loras).map_err(|e| CoreError::Store(e.to_string()))?;
    store.set(NAMESPACE, keys::LORAS, value)
}

// ---- coercing readers ----

fn shape_error(key: &str, reason: impl Into<String>) -> CoreError {
    CoreError::Setting {
        namespace: NAMESPACE.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn read_string(store: &dyn SettingsStore, key: &str, default: &str) -> Result<String, CoreError> {
    match store.get(NAMESPACE, key) {
        None | Some(Value::Null) => Ok(default.to_string()),
        Some(Value::String(s)) => Ok(s),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        Some(other) => Err(shape_error(key, format!("expected a string, got {other}"))),
    }
}

fn read_f64(store: &dyn SettingsStore, key: &str, default: f64) -> Result<f64, CoreError> {
    match store.get(NAMESPACE, key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| shape_error(key, format!("{n} is not representable as f64"))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(default),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| shape_error(key, format!("'{s}' is not a number"))),
        Some(other) => Err(shape_error(key, format!("expected a number, got {other}"))),
    }
}

fn read_i64(store: &dyn SettingsStore, key: &str, default: i64) -> Result<i64, CoreError> {
    let value = read_f64(store, key, default as f64)?;
    if value.fract() != 0.0 {
        return Err(shape_error(key, format!("{value} is not an integer")));
    }
    // 2^63 is exact in f64; anything at or past it would saturate.
    let bound = 2f64.powi(63);
    if value < -bound || value >= bound {
        return Err(shape_error(key, format!("{value} is out of range")));
    }
    Ok(value as i64)
}

fn read_u64(store: &dyn SettingsStore, key: &str, default: u64) -> Result<u64, CoreError> {
    let value = read_i64(store, key, default as i64)?;
    u64::try_from(value).map_err(|_| shape_error(key, format!("{value} is negative")))
}

fn read_u32(store: &dyn SettingsStore, key: &str, default: u32) -> Result<u32, CoreError> {
    let value = read_u64(store, key, u64::from(default))?;
    u32::try_from(value).map_err(|_| shape_error(key, format!("{value} is out of range")))
}

fn read_bool(store: &dyn SettingsStore, key: &str, default: bool) -> Result<bool, CoreError> {
    match store.get(NAMESPACE, key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(b),
        Some(Value::String(s)) => match s.trim() {
            "true" | "on" | "1" => Ok(true),
            "false" | "off" | "0" | "" => Ok(false),
            other => Err(shape_error(key, format!("'{other}' is not a boolean"))),
        },
        Some(Value::Number(n)) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        Some(other) => Err(shape_error(key, format!("expected a boolean, got {other}"))),
    }
}

fn read_string_list(store: &dyn SettingsStore, key: &str) -> Result<Vec<String>, CoreError> {
    match store.get(NAMESPACE, key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(s
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect()),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(shape_error(key, format!("expected strings, got {other}"))),
            })
            .collect(),
        Some(other) => Err(shape_error(key, format!("expected a list, got {other}"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
