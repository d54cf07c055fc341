//! HTTP client for local image-generation servers.
//!
//! The generation call of these servers blocks until every image is
//! rendered, while progress is served by a separate endpoint. Submission
//! therefore spawns the generation call in the background and returns a
//! [`JobHandle`] that owns it; progress is polled alongside.

use artifex_core::settings::BackendSource;
use artifex_core::{CapabilityKind, GenerationRequest, ProgressSample};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::task::AbortOnDropHandle;

use crate::gateway::{
    check_status, parse_response, BackendGateway, GatewayError, GenerationOutput, JobHandle,
    PendingSubmission, SubmissionStatus,
};

/// Endpoint paths, relative to the base URL, for one route layout.
#[derive(Debug)]
pub struct RouteTable {
    pub txt2img: &'static str,
    pub img2img: &'static str,
    pub progress: &'static str,
    pub skip: &'static str,
    pub interrupt: &'static str,
    /// `POST` target for option changes.
    pub set_options: &'static str,
    pub loras: &'static str,
    pub models: &'static str,
    pub samplers: &'static str,
    pub upscalers: &'static str,
    pub styles: &'static str,
    pub options: &'static str,
}

impl RouteTable {
    /// Neutral layout.
    pub const STANDARD: RouteTable = RouteTable {
        txt2img: "/generate/txt2img",
        img2img: "/generate/img2img",
        progress: "/progress",
        skip: "/control/skip",
        interrupt: "/control/interrupt",
        set_options: "/options",
        loras: "/capabilities/loras",
        models: "/capabilities/models",
        samplers: "/capabilities/samplers",
        upscalers: "/capabilities/upscalers",
        styles: "/capabilities/styles",
        options: "/capabilities/options",
    };

    /// Automatic1111 web UI layout.
    pub const SDAPI: RouteTable = RouteTable {
        txt2img: "/sdapi/v1/txt2img",
        img2img: "/sdapi/v1/img2img",
        progress: "/sdapi/v1/progress",
        skip: "/sdapi/v1/skip",
        interrupt: "/sdapi/v1/interrupt",
        set_options: "/sdapi/v1/options",
        loras: "/sdapi/v1/loras",
        models: "/sdapi/v1/sd-models",
        samplers: "/sdapi/v1/samplers",
        upscalers: "/sdapi/v1/upscalers",
        styles: "/sdapi/v1/prompt-styles",
        options: "/sdapi/v1/options",
    };

    pub fn capability(&self, kind: CapabilityKind) -> &'static str {
        match kind {
            CapabilityKind::Loras => self.loras,
            CapabilityKind::Models => self.models,
            CapabilityKind::Samplers => self.samplers,
            CapabilityKind::Upscalers => self.upscalers,
            CapabilityKind::Styles => self.styles,
            CapabilityKind::Options => self.options,
        }
    }
}

/// Body of a successful txt2img / img2img response.
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    images: Vec<String>,
    /// Some servers send this as a JSON-encoded string.
    #[serde(default)]
    info: Option<serde_json::Value>,
}

/// Body of the progress endpoint.
#[derive(Debug, Deserialize)]
struct ProgressResponse {
    progress: f64,
    #[serde(default)]
    eta_relative: Option<f64>,
    #[serde(default)]
    current_image: Option<String>,
}

/// HTTP backend for a single server.
pub struct HttpBackend {
    client: reqwest::Client,
    api_url: String,
    source: BackendSource,
    routes: &'static RouteTable,
}

impl HttpBackend {
    /// * `api_url` - Base HTTP URL, e.g. `http://host:7860`.
    pub fn new(
        client: reqwest::Client,
        api_url: String,
        source: BackendSource,
        routes: &'static RouteTable,
    ) -> Self {
        Self {
            client,
            api_url,
            source,
            routes,
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }
}

#[async_trait]
impl BackendGateway for HttpBackend {
    fn source(&self) -> BackendSource {
        self.source
    }

    /// `HEAD {base}`; any 2xx means reachable.
    async fn probe(&self) -> Result<(), GatewayError> {
        let response = self.client.head(&self.api_url).send().await?;
        check_status(response).await
    }

    async fn list_capability(
        &self,
        kind: CapabilityKind,
    ) -> Result<serde_json::Value, GatewayError> {
        let response = self
            .client
            .get(self.url(self.routes.capability(kind)))
            .send()
            .await?;
        parse_response(response).await
    }

    async fn submit_generation(
        &self,
        request: &GenerationRequest,
    ) -> Result<JobHandle, GatewayError> {
        let path = if request.is_img2img() {
            self.routes.img2img
        } else {
            self.routes.txt2img
        };
        let url = self.url(path);
        let body =
            serde_json::to_value(request).map_err(|e| GatewayError::Decode(e.to_string()))?;
        let client = self.client.clone();
        let job_id = uuid::Uuid::new_v4().to_string();
        let (status_tx, status_rx) = watch::channel(SubmissionStatus::InFlight);

        let task_job_id = job_id.clone();
        let task = tokio::spawn(async move {
            let result = async {
                let response = client.post(&url).json(&body).send().await?;
                let parsed: GenerateResponse = parse_response(response).await?;
                Ok::<_, GatewayError>(GenerationOutput {
                    images: parsed.images,
                    info: parsed.info,
                })
            }
            .await;

            match &result {
                Ok(output) => {
                    tracing::info!(
                        job_id = %task_job_id,
                        images = output.images.len(),
                        "Generation call returned",
                    );
                    status_tx.send_replace(SubmissionStatus::Completed);
                }
                Err(e) => {
                    tracing::error!(job_id = %task_job_id, error = %e, "Generation call failed");
                    status_tx.send_replace(SubmissionStatus::Failed(e.to_string()));
                }
            }
            result
        });

        tracing::info!(job_id = %job_id, path, "Generation submitted");

        Ok(JobHandle::with_pending(
            job_id,
            PendingSubmission {
                status: status_rx,
                task: AbortOnDropHandle::new(task),
            },
        ))
    }

    /// Once the generation call has returned, the job is over and the
    /// sample reads `1.0` without touching the network.
    async fn query_progress(&self, handle: &JobHandle) -> Result<ProgressSample, GatewayError> {
        match handle.submission_status() {
            Some(SubmissionStatus::Completed) => return Ok(ProgressSample::new(1.0)),
            Some(SubmissionStatus::Failed(reason)) => return Err(GatewayError::JobFailed(reason)),
            Some(SubmissionStatus::InFlight) | None => {}
        }

        let response = self
            .client
            .get(self.url(self.routes.progress))
            .send()
            .await?;
        let progress: ProgressResponse = parse_response(response).await?;

        Ok(ProgressSample::new(progress.progress)
            .with_eta(progress.eta_relative)
            .with_preview(progress.current_image))
    }

    async fn fetch_result(&self, handle: JobHandle) -> Result<GenerationOutput, GatewayError> {
        let job_id = handle.id().to_string();
        let pending = handle.into_pending().ok_or_else(|| {
            GatewayError::JobFailed(format!("job {job_id} has no generation call in flight"))
        })?;

        match pending.task.await {
            Ok(result) => result,
            Err(e) => Err(GatewayError::JobFailed(format!(
                "generation call for job {job_id} ended abnormally: {e}"
            ))),
        }
    }

    /// Interrupts whatever is executing right now; the server has no
    /// per-job cancellation.
    async fn cancel(&self, _job_id: &str) -> Result<(), GatewayError> {
        let response = self
            .client
            .post(self.url(self.routes.interrupt))
            .send()
            .await?;
        check_status(response).await
    }

    async fn skip(&self) -> Result<(), GatewayError> {
        let response = self.client.post(self.url(self.routes.skip)).send().await?;
        check_status(response).await
    }

    async fn set_options(
        &self,
        options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), GatewayError> {
        let response = self
            .client
            .post(self.url(self.routes.set_options))
            .json(options)
            .send()
            .await?;
        check_status(response).await
    }
}
