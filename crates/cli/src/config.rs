use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

/// Process configuration, from flags or their environment variables.
///
/// Generation parameters live in the settings store; these options only
/// pick the store and seed its connection keys.
///
/// | Flag              | Env Var                 | Default          |
/// |-------------------|-------------------------|------------------|
/// | `--source`        | `ARTIFEX_SOURCE`        | stored value     |
/// | `--url`           | `ARTIFEX_URL`           | stored value     |
/// | `--settings-file` | `ARTIFEX_SETTINGS_FILE` | in-memory store  |
/// | `--output-dir`    | `ARTIFEX_OUTPUT_DIR`    | `.`              |
/// | `--init-image`    | `ARTIFEX_INIT_IMAGE`    | none (txt2img)   |
/// | `--model`         | `ARTIFEX_MODEL`         | keep current     |
/// | `--horde-api-key` | `ARTIFEX_HORDE_API_KEY` | anonymous        |
/// | `--log-json`      | `ARTIFEX_LOG_JSON`      | `false`          |
#[derive(Debug, Clone, Args)]
pub struct CliConfig {
    /// Backend source: local, automatic1111 or horde.
    #[arg(long, env = "ARTIFEX_SOURCE")]
    pub source: Option<String>,
    /// Backend base URL.
    #[arg(long = "url", env = "ARTIFEX_URL")]
    pub base_url: Option<String>,
    /// JSON settings document; an in-memory store is used when unset.
    #[arg(long, env = "ARTIFEX_SETTINGS_FILE")]
    pub settings_file: Option<PathBuf>,
    /// Directory receiving generated images.
    #[arg(long, env = "ARTIFEX_OUTPUT_DIR", default_value = ".")]
    pub output_dir: PathBuf,
    /// Source image for image-to-image runs.
    #[arg(long, env = "ARTIFEX_INIT_IMAGE")]
    pub init_image: Option<PathBuf>,
    /// Checkpoint to load before generating.
    #[arg(long, env = "ARTIFEX_MODEL")]
    pub model: Option<String>,
    #[arg(long, env = "ARTIFEX_HORDE_API_KEY", hide_env_values = true)]
    pub horde_api_key: Option<String>,
    /// Emit logs as JSON lines.
    #[arg(long, env = "ARTIFEX_LOG_JSON")]
    pub log_json: bool,
}

impl CliConfig {
    /// Drop blank values and make sure the output directory exists.
    pub fn prepare(mut self) -> anyhow::Result<Self> {
        for value in [
            &mut self.source,
            &mut self.base_url,
            &mut self.model,
            &mut self.horde_api_key,
        ] {
            *value = value
                .take()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty());
        }
        for path in [&mut self.settings_file, &mut self.init_image] {
            if path.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
                *path = None;
            }
        }

        if !self.output_dir.is_dir() {
            std::fs::create_dir_all(&self.output_dir).with_context(|| {
                format!("output dir {} cannot be created", self.output_dir.display())
            })?;
        }
        Ok(self)
    }
}
