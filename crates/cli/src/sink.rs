//! Writes generated images to disk.

use std::path::{Path, PathBuf};

use artifex_backend::events::{JobContext, ResultSink};
use artifex_core::{JobState, ProgressSample};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn write(&self, path: &Path, encoded: &str) -> anyhow::Result<()> {
        let bytes = STANDARD.decode(strip_data_url(encoded))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

impl ResultSink for FileSink {
    fn on_artifact(&self, images: &[String], prompt: &str, ctx: &JobContext) {
        let stem = ctx.reference.clone().unwrap_or_else(|| ctx.id.to_string());
        for (index, image) in images.iter().enumerate() {
            let path = self.dir.join(format!("{stem}-{index}.png"));
            match self.write(&path, image) {
                Ok(()) => tracing::info!(path = %path.display(), prompt, "Image written"),
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Failed to write image")
                }
            }
        }
    }

    fn on_progress(&self, ctx: &JobContext, state: JobState, sample: &ProgressSample) {
        tracing::debug!(
            job_id = %ctx.id,
            state = state.as_str(),
            preview = sample.preview_image.is_some(),
            "Progress",
        );
    }
}

/// Drop a `data:image/...;base64,` prefix if present.
fn strip_data_url(encoded: &str) -> &str {
    match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    }
}
