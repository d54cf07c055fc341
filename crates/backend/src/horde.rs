//! AI Horde client: a distributed pool of volunteer workers behind an
//! asynchronous queue.
//!
//! Submission returns a job id immediately. Progress and the final images
//! are read from the same broker by that id.

use artifex_core::settings::BackendSource;
use artifex_core::{CapabilityKind, GenerationRequest, ProgressSample};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::gateway::{
    check_status, parse_response, BackendGateway, GatewayError, GenerationOutput, JobHandle,
};

/// Identifies this client to the Horde (`name:version:contact`).
const CLIENT_AGENT: &str = concat!("artifex:", env!("CARGO_PKG_VERSION"), ":unknown");

/// Samplers the Horde accepts, paired with the local server name each
/// one corresponds to.
const SAMPLERS: &[(&str, &str)] = &[
    ("k_euler_a", "Euler a"),
    ("k_euler", "Euler"),
    ("k_lms", "LMS"),
    ("k_heun", "Heun"),
    ("k_dpm_2", "DPM2"),
    ("k_dpm_2_a", "DPM2 a"),
    ("k_dpm_fast", "DPM fast"),
    ("k_dpm_adaptive", "DPM adaptive"),
    ("k_dpmpp_2s_a", "DPM++ 2S a"),
    ("k_dpmpp_2m", "DPM++ 2M"),
    ("k_dpmpp_sde", "DPM++ SDE"),
    ("DDIM", "DDIM"),
    ("lcm", "LCM"),
];

/// Map a sampler name to the Horde's naming. Returns the name and
/// whether the Karras noise schedule was requested.
///
/// Unknown names pass through unchanged for the Horde to judge.
pub fn horde_sampler(name: &str) -> (String, bool) {
    let (base, karras) = match name.strip_suffix(" Karras") {
        Some(base) => (base, true),
        None => (name, false),
    };
    let mapped = SAMPLERS
        .iter()
        .find(|(horde, local)| *local == base || *horde == base)
        .map(|(horde, _)| (*horde).to_string())
        .unwrap_or_else(|| base.to_string());
    (mapped, karras)
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HordeParams {
    pub sampler_name: String,
    pub cfg_scale: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    pub height: u32,
    pub width: u32,
    pub steps: u32,
    /// Images per request.
    pub n: u32,
    pub karras: bool,
    pub hires_fix: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denoising_strength: Option<f64>,
}

/// `POST /v2/generate/async` body.
#[derive(Debug, Serialize)]
pub struct HordeGenerateRequest {
    pub prompt: String,
    pub params: HordeParams,
    pub nsfw: bool,
    pub censor_nsfw: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    /// `false` returns images inline as base64 instead of download links.
    pub r2: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_processing: Option<&'static str>,
}

impl HordeGenerateRequest {
    /// Translate a canonical request. The negative prompt travels inside
    /// the prompt after the `###` separator.
    pub fn from_request(request: &GenerationRequest, model: Option<&str>) -> Self {
        let prompt = if request.negative_prompt.is_empty() {
            request.prompt.clone()
        } else {
            format!("{} ### {}", request.prompt, request.negative_prompt)
        };
        let (sampler_name, karras) = horde_sampler(&request.sampler_name);
        let source_image = request
            .init_images
            .as_ref()
            .and_then(|images| images.first().cloned());
        let img2img = source_image.is_some();

        Self {
            prompt,
            params: HordeParams {
                sampler_name,
                cfg_scale: request.cfg_scale,
                seed: (request.seed >= 0).then(|| request.seed.to_string()),
                height: request.height,
                width: request.width,
                steps: request.steps,
                n: request.n_iter,
                karras,
                hires_fix: request.hires.enabled,
                denoising_strength: (img2img || request.hires.enabled)
                    .then_some(request.hires.denoising_strength),
            },
            nsfw: false,
            censor_nsfw: true,
            models: model.map(|m| vec![m.to_string()]).unwrap_or_default(),
            r2: false,
            source_image,
            source_processing: img2img.then_some("img2img"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AsyncResponse {
    id: String,
    #[serde(default)]
    kudos: Option<f64>,
}

/// `GET /v2/generate/check/{id}` body.
#[derive(Debug, Deserialize)]
pub struct HordeCheck {
    #[serde(default)]
    pub finished: u32,
    #[serde(default)]
    pub processing: u32,
    #[serde(default)]
    pub restarted: u32,
    #[serde(default)]
    pub waiting: u32,
    pub done: bool,
    #[serde(default)]
    pub faulted: bool,
    #[serde(default)]
    pub wait_time: u32,
    #[serde(default)]
    pub queue_position: u32,
    #[serde(default = "default_true")]
    pub is_possible: bool,
}

fn default_true() -> bool {
    true
}

impl HordeCheck {
    /// Fraction of the request's images that are finished, counting an
    /// image in progress as half done.
    pub fn fraction(&self) -> f64 {
        if self.done {
            return 1.0;
        }
        let total = self.finished + self.processing + self.waiting + self.restarted;
        if total == 0 {
            return 0.0;
        }
        (f64::from(self.finished) + 0.5 * f64::from(self.processing)) / f64::from(total)
    }
}

#[derive(Debug, Deserialize)]
struct HordeGeneration {
    img: String,
    #[serde(default)]
    seed: Option<String>,
    #[serde(default)]
    worker_name: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

/// `GET /v2/generate/status/{id}` body.
#[derive(Debug, Deserialize)]
struct HordeStatus {
    #[serde(default)]
    generations: Vec<HordeGeneration>,
    #[serde(default)]
    faulted: bool,
}

#[derive(Debug, Deserialize)]
struct HordeModel {
    name: String,
    #[serde(default)]
    count: u32,
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Gateway to an AI Horde broker.
pub struct HordeBackend {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: Option<String>,
}

impl HordeBackend {
    /// * `api_url` - Base URL including the `/api` prefix, e.g.
    ///   `https://aihorde.net/api`.
    /// * `api_key` - `0000000000` submits anonymously.
    pub fn new(
        client: reqwest::Client,
        api_url: String,
        api_key: String,
        model: Option<String>,
    ) -> Self {
        Self {
            client,
            api_url,
            api_key,
            model,
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.api_url, path))
            .header("Client-Agent", CLIENT_AGENT)
    }
}

#[async_trait]
impl BackendGateway for HordeBackend {
    fn source(&self) -> BackendSource {
        BackendSource::Horde
    }

    async fn probe(&self) -> Result<(), GatewayError> {
        let response = self.get("/v2/status/heartbeat").send().await?;
        check_status(response).await
    }

    async fn list_capability(
        &self,
        kind: CapabilityKind,
    ) -> Result<serde_json::Value, GatewayError> {
        match kind {
            CapabilityKind::Models => {
                let response = self
                    .get("/v2/status/models")
                    .query(&[("type", "image")])
                    .send()
                    .await?;
                let models: Vec<HordeModel> = parse_response(response).await?;
                Ok(serde_json::Value::Array(
                    models
                        .into_iter()
                        .filter(|m| m.count > 0)
                        .map(|m| serde_json::json!({"title": m.name, "model_name": m.name}))
                        .collect(),
                ))
            }
            CapabilityKind::Samplers => Ok(serde_json::Value::Array(
                SAMPLERS
                    .iter()
                    .map(|(horde, local)| serde_json::json!({"name": horde, "aliases": [local]}))
                    .collect(),
            )),
            CapabilityKind::Options => Ok(match &self.model {
                Some(model) => serde_json::json!({ "sd_model_checkpoint": model }),
                None => serde_json::json!({}),
            }),
            // No listing for these; the syncer keeps whatever it had cached.
            CapabilityKind::Loras | CapabilityKind::Upscalers | CapabilityKind::Styles => {
                Err(GatewayError::unsupported(kind.as_str(), self.source()))
            }
        }
    }

    async fn submit_generation(
        &self,
        request: &GenerationRequest,
    ) -> Result<JobHandle, GatewayError> {
        let body = HordeGenerateRequest::from_request(request, self.model.as_deref());
        let response = self
            .client
            .post(format!("{}/v2/generate/async", self.api_url))
            .header("apikey", &self.api_key)
            .header("Client-Agent", CLIENT_AGENT)
            .json(&body)
            .send()
            .await?;
        let accepted: AsyncResponse = parse_response(response).await?;

        tracing::info!(
            job_id = %accepted.id,
            kudos = accepted.kudos,
            "Horde accepted generation request",
        );
        Ok(JobHandle::new(accepted.id))
    }

    async fn query_progress(&self, handle: &JobHandle) -> Result<ProgressSample, GatewayError> {
        let response = self
            .get(&format!("/v2/generate/check/{}", handle.id()))
            .send()
            .await?;
        let check: HordeCheck = parse_response(response).await?;

        if check.faulted {
            return Err(GatewayError::JobFailed(format!(
                "horde job {} faulted",
                handle.id()
            )));
        }
        if !check.is_possible {
            tracing::warn!(
                job_id = %handle.id(),
                "No Horde worker can currently serve this request",
            );
        }
        tracing::debug!(
            job_id = %handle.id(),
            queue_position = check.queue_position,
            waiting = check.waiting,
            processing = check.processing,
            finished = check.finished,
            "Horde check",
        );

        Ok(ProgressSample::new(check.fraction()).with_eta(Some(f64::from(check.wait_time))))
    }

    async fn fetch_result(&self, handle: JobHandle) -> Result<GenerationOutput, GatewayError> {
        let response = self
            .get(&format!("/v2/generate/status/{}", handle.id()))
            .send()
            .await?;
        let status: HordeStatus = parse_response(response).await?;

        if status.faulted {
            return Err(GatewayError::JobFailed(format!(
                "horde job {} faulted",
                handle.id()
            )));
        }

        let info = serde_json::Value::Array(
            status
                .generations
                .iter()
                .map(|g| {
                    serde_json::json!({
                        "seed": g.seed,
                        "worker_name": g.worker_name,
                        "model": g.model,
                    })
                })
                .collect(),
        );
        Ok(GenerationOutput {
            images: status.generations.into_iter().map(|g| g.img).collect(),
            info: Some(info),
        })
    }

    async fn cancel(&self, job_id: &str) -> Result<(), GatewayError> {
        if job_id.is_empty() {
            tracing::debug!("No Horde job to cancel");
            return Ok(());
        }
        let response = self
            .client
            .delete(format!("{}/v2/generate/status/{}", self.api_url, job_id))
            .header("Client-Agent", CLIENT_AGENT)
            .send()
            .await?;
        check_status(response).await
    }
}
