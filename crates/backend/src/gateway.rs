//! Uniform contract over heterogeneous image-generation backends.
//!
//! [`BackendGateway`] is implemented once per backend protocol. Callers
//! obtain an implementation through [`gateway_for`], which resolves the
//! configured [`BackendSource`] on every call so that a source switch
//! takes effect on the next request.

use std::sync::Arc;

use artifex_core::settings::{BackendSource, GenerationSettings};
use artifex_core::{CapabilityKind, CoreError, GenerationRequest, ProgressSample};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::task::AbortOnDropHandle;

use crate::api::{HttpBackend, RouteTable};
use crate::horde::HordeBackend;

/// Images and metadata returned by a finished job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// Base64-encoded images.
    pub images: Vec<String>,
    /// Backend-specific generation info (seeds, worker, parameters).
    #[serde(default)]
    pub info: Option<serde_json::Value>,
}

/// Errors from the gateway layer.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Transport failure (connection refused, DNS, TLS, timeout).
    #[error("Backend unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),

    /// The backend answered with a non-2xx status code.
    #[error("Backend rejected the request ({status}): {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The backend answered 2xx with a body of unexpected shape.
    #[error("Unexpected backend payload: {0}")]
    Decode(String),

    /// The backend reports that the job itself failed.
    #[error("Job failed on the backend: {0}")]
    JobFailed(String),

    /// The operation is not offered by this backend variant.
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },
}

impl GatewayError {
    pub(crate) fn unsupported(operation: &'static str, backend: BackendSource) -> Self {
        GatewayError::Unsupported {
            operation,
            backend: backend.as_str(),
        }
    }
}

// ---------------------------------------------------------------------------
// Job handle
// ---------------------------------------------------------------------------

/// Where a blocking submission call currently stands.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SubmissionStatus {
    InFlight,
    Completed,
    Failed(String),
}

/// A submission request still running in the background.
pub(crate) struct PendingSubmission {
    pub(crate) status: watch::Receiver<SubmissionStatus>,
    pub(crate) task: AbortOnDropHandle<Result<GenerationOutput, GatewayError>>,
}

/// Reference to one submitted job.
///
/// For backends whose submission call blocks until the images are ready,
/// the handle owns that call; dropping the handle aborts it.
pub struct JobHandle {
    id: String,
    pending: Option<PendingSubmission>,
}

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pending: None,
        }
    }

    pub(crate) fn with_pending(id: impl Into<String>, pending: PendingSubmission) -> Self {
        Self {
            id: id.into(),
            pending: Some(pending),
        }
    }

    /// Backend-side job identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn submission_status(&self) -> Option<SubmissionStatus> {
        self.pending
            .as_ref()
            .map(|pending| pending.status.borrow().clone())
    }

    pub(crate) fn into_pending(self) -> Option<PendingSubmission> {
        self.pending
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Gateway contract
// ---------------------------------------------------------------------------

/// Send/receive contract shared by every backend variant.
#[async_trait]
pub trait BackendGateway: Send + Sync {
    fn source(&self) -> BackendSource;

    /// Liveness probe.
    async fn probe(&self) -> Result<(), GatewayError>;

    /// Raw payload for one capability category.
    async fn list_capability(&self, kind: CapabilityKind)
        -> Result<serde_json::Value, GatewayError>;

    /// Hand a request to the backend. The request is serialized into an
    /// owned body; the caller's value is never aliased.
    async fn submit_generation(
        &self,
        request: &GenerationRequest,
    ) -> Result<JobHandle, GatewayError>;

    async fn query_progress(&self, handle: &JobHandle) -> Result<ProgressSample, GatewayError>;

    /// Collect the images of a finished job.
    async fn fetch_result(&self, handle: JobHandle) -> Result<GenerationOutput, GatewayError>;

    /// Ask the backend to stop the job. Fire-and-forget from the caller's
    /// point of view: it does not end any poll loop by itself.
    async fn cancel(&self, job_id: &str) -> Result<(), GatewayError>;

    /// Skip the image currently being generated in a batch.
    async fn skip(&self) -> Result<(), GatewayError> {
        Err(GatewayError::unsupported("skip", self.source()))
    }

    /// Change server-side options (e.g. the loaded checkpoint).
    async fn set_options(
        &self,
        _options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), GatewayError> {
        Err(GatewayError::unsupported("set_options", self.source()))
    }

    /// Fetch every capability category, one request at a time.
    async fn list_capabilities(
        &self,
    ) -> Vec<(CapabilityKind, Result<serde_json::Value, GatewayError>)> {
        let mut payloads = Vec::with_capacity(CapabilityKind::ALL.len());
        for kind in CapabilityKind::ALL {
            payloads.push((kind, self.list_capability(kind).await));
        }
        payloads
    }
}

/// Build the gateway for the configured source.
pub fn gateway_for(
    settings: &GenerationSettings,
    client: reqwest::Client,
) -> Arc<dyn BackendGateway> {
    match settings.source {
        BackendSource::Local => Arc::new(HttpBackend::new(
            client,
            settings.base_url.clone(),
            BackendSource::Local,
            &RouteTable::STANDARD,
        )),
        BackendSource::Automatic1111 => Arc::new(HttpBackend::new(
            client,
            settings.base_url.clone(),
            BackendSource::Automatic1111,
            &RouteTable::SDAPI,
        )),
        BackendSource::Horde => Arc::new(HordeBackend::new(
            client,
            settings.base_url.clone(),
            settings.horde_api_key.clone(),
            settings.horde_model.clone(),
        )),
    }
}

/// Resolve the source from `store` and build its gateway.
pub fn gateway_from_store(
    store: &dyn artifex_core::SettingsStore,
    client: reqwest::Client,
) -> Result<(GenerationSettings, Arc<dyn BackendGateway>), CoreError> {
    let settings = GenerationSettings::load(store)?;
    let gateway = gateway_for(&settings, client);
    Ok((settings, gateway))
}

// ---- shared response helpers ----

/// Ensure the response has a success status code. Returns the response
/// unchanged on success, or [`GatewayError::Rejected`] containing the
/// status and body text on failure.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(GatewayError::Rejected {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Parse a successful JSON response body into the expected type.
pub(crate) async fn parse_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, GatewayError> {
    let response = ensure_success(response).await?;
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| GatewayError::Decode(e.to_string()))
}

/// Assert the response has a success status code, discarding the body.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<(), GatewayError> {
    ensure_success(response).await?;
    Ok(())
}
