//! Generation orchestrator.
//!
//! [`Orchestrator`] wires one client's session through the whole pipeline:
//! admission, request building from the cached capability snapshot,
//! submission to the configured backend, progress polling and delivery to
//! the [`ResultSink`]. It also exposes the backend control operations
//! (skip, interrupt, option changes) and capability sync.
//!
//! Lifecycle events are broadcast via a [`tokio::sync::broadcast`]
//! channel. Call [`Orchestrator::subscribe`] to receive them.

use std::sync::{Arc, Mutex, PoisonError};

use artifex_core::{
    CapabilitySnapshot, CoreError, GenerationSettings, JobState, RequestBuilder, Session,
    SettingsStore,
};
use tokio::sync::broadcast;

use crate::events::{EventKind, GenerationEvent, JobContext, ResultSink};
use crate::gateway::{gateway_for, BackendGateway, GatewayError, GenerationOutput};
use crate::poller::{Delay, ProgressPoller, TokioDelay};
use crate::sync::{CapabilitySyncer, SyncError, SyncOutcome, SyncStatus};

/// Broadcast channel capacity for generation events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Option key naming the loaded checkpoint.
pub const MODEL_OPTION: &str = "sd_model_checkpoint";

/// How an admitted job ended, when it did not fail.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Images were produced and handed to the sink.
    Completed {
        job: JobContext,
        prompt: String,
        output: GenerationOutput,
    },
    /// Polling stopped before the job finished (attempt limit or
    /// interrupt). No artifact is delivered.
    Abandoned { job: JobContext, attempts: u32 },
}

/// Single-client generation orchestrator.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Orchestrator {
    store: Arc<dyn SettingsStore>,
    http: reqwest::Client,
    session: Arc<Session>,
    syncer: CapabilitySyncer,
    sink: Arc<dyn ResultSink>,
    delay: Arc<dyn Delay>,
    event_tx: broadcast::Sender<GenerationEvent>,
    /// Backend id of the job being polled, for `interrupt`.
    current_job: Mutex<Option<String>>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn SettingsStore>, sink: Arc<dyn ResultSink>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            syncer: CapabilitySyncer::new(Arc::clone(&store)),
            store,
            http: reqwest::Client::new(),
            session: Arc::new(Session::new()),
            sink,
            delay: Arc::new(TokioDelay),
            event_tx,
            current_job: Mutex::new(None),
        }
    }

    /// Replace the sleep used between progress queries.
    pub fn with_delay(mut self, delay: Arc<dyn Delay>) -> Self {
        self.delay = delay;
        self
    }

    /// Use a preconfigured HTTP client (timeouts, proxies).
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Subscribe to generation events.
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.event_tx.subscribe()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn snapshot(&self) -> CapabilitySnapshot {
        self.syncer.snapshot().await
    }

    // ---- capability sync ----

    /// Probe the backend, record the result in the session's connection
    /// flag and, when reachable, refresh the capability snapshot.
    pub async fn check_status(&self) -> Result<SyncOutcome, OrchestratorError> {
        let gateway = self.gateway()?;
        self.sync_with(gateway.as_ref()).await.inspect_err(|e| {
            tracing::error!(error = %e, "Backend status check failed");
        })
    }

    /// Refresh the capability snapshot from the configured backend.
    pub async fn sync_capabilities(&self) -> Result<SyncOutcome, OrchestratorError> {
        let gateway = self.gateway()?;
        self.sync_with(gateway.as_ref()).await
    }

    /// Switch one LoRA on or off. Returns `false` for an unknown name.
    pub async fn set_lora(&self, name: &str, active: bool, strength: f64) -> bool {
        self.syncer.set_lora(name, active, strength).await
    }

    // ---- generation ----

    /// Run a text-to-image job to its end.
    ///
    /// `reference` is echoed to the sink in the [`JobContext`].
    pub async fn text_to_image(
        &self,
        prompt: &str,
        reference: Option<String>,
    ) -> Result<JobOutcome, OrchestratorError> {
        self.run_job(prompt, None, reference).await
    }

    /// Run an image-to-image job from a base64 source image.
    pub async fn image_to_image(
        &self,
        prompt: &str,
        init_image: String,
        reference: Option<String>,
    ) -> Result<JobOutcome, OrchestratorError> {
        self.run_job(prompt, Some(init_image), reference).await
    }

    // ---- control ----

    /// Skip the image currently being generated. Failures are logged only.
    pub async fn skip(&self) {
        let gateway = match self.gateway() {
            Ok(gateway) => gateway,
            Err(e) => {
                tracing::warn!(error = %e, "Skip ignored");
                return;
            }
        };
        if let Err(e) = gateway.skip().await {
            tracing::warn!(error = %e, "Skip request failed");
        }
    }

    /// Stop the running job: asks the backend to interrupt and ends the
    /// local poll loop in `Abandoned`. Backend failures are logged only.
    pub async fn interrupt(&self) {
        let job_id = self.lock_current_job().clone();
        match self.gateway() {
            Ok(gateway) => {
                if let Err(e) = gateway.cancel(job_id.as_deref().unwrap_or_default()).await {
                    tracing::warn!(error = %e, "Interrupt request failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Interrupt not sent to backend"),
        }
        self.session.cancel_job();
        tracing::info!(job_id = job_id.as_deref(), "Interrupt requested");
    }

    /// Post server options, then re-sync capabilities before returning.
    pub async fn post_option(
        &self,
        options: serde_json::Map<String, serde_json::Value>,
    ) -> Result<SyncOutcome, OrchestratorError> {
        let gateway = self.gateway()?;
        gateway.set_options(&options).await.map_err(|e| {
            tracing::error!(error = %e, "Posting options failed");
            if matches!(e, GatewayError::Unreachable(_)) {
                self.set_connected(false);
            }
            OrchestratorError::from(e)
        })?;
        tracing::info!(keys = ?options.keys().collect::<Vec<_>>(), "Options posted");
        self.sync_with(gateway.as_ref()).await
    }

    /// Load a different checkpoint by its title.
    pub async fn change_model(&self, title: &str) -> Result<SyncOutcome, OrchestratorError> {
        let mut options = serde_json::Map::new();
        options.insert(MODEL_OPTION.to_string(), serde_json::Value::from(title));
        self.post_option(options).await
    }

    // ---- private helpers ----

    /// Resolve the gateway from the current settings. Never cached, so a
    /// source switch applies to the next call.
    fn gateway(&self) -> Result<Arc<dyn BackendGateway>, OrchestratorError> {
        let settings = GenerationSettings::load(self.store.as_ref())?;
        Ok(gateway_for(&settings, self.http.clone()))
    }

    /// Every sync records the probe result in the connection flag.
    async fn sync_with(
        &self,
        gateway: &dyn BackendGateway,
    ) -> Result<SyncOutcome, OrchestratorError> {
        match self.syncer.sync(gateway).await {
            Ok(outcome) => {
                self.set_connected(true);
                self.emit_synced(&outcome);
                Ok(outcome)
            }
            Err(e) => {
                self.set_connected(false);
                Err(e.into())
            }
        }
    }

    async fn run_job(
        &self,
        prompt: &str,
        init_image: Option<String>,
        reference: Option<String>,
    ) -> Result<JobOutcome, OrchestratorError> {
        if !self.session.try_admit() {
            tracing::warn!(state = %self.session.state(), "Previous job still running");
            return Err(OrchestratorError::AdmissionDenied);
        }
        let guard = AdmissionGuard {
            session: &self.session,
            released: false,
        };

        let ctx = JobContext::new(reference);
        tracing::info!(job_id = %ctx.id, img2img = init_image.is_some(), "Job admitted");
        self.emit(
            Some(&ctx),
            EventKind::JobAdmitted {
                img2img: init_image.is_some(),
            },
        );

        let result = self.drive(&ctx, prompt, init_image).await;
        *self.lock_current_job() = None;

        let terminal = match &result {
            Ok(JobOutcome::Completed { output, .. }) => {
                self.emit(
                    Some(&ctx),
                    EventKind::JobCompleted {
                        images: output.images.len(),
                    },
                );
                JobState::Done
            }
            Ok(JobOutcome::Abandoned { attempts, .. }) => {
                self.emit(
                    Some(&ctx),
                    EventKind::JobAbandoned {
                        attempts: *attempts,
                    },
                );
                JobState::Abandoned
            }
            Err(e) => {
                self.emit(
                    Some(&ctx),
                    EventKind::JobFailed {
                        error: e.to_string(),
                    },
                );
                JobState::Failed
            }
        };
        guard.release(terminal);
        result
    }

    /// Everything between admission and release.
    async fn drive(
        &self,
        ctx: &JobContext,
        prompt: &str,
        init_image: Option<String>,
    ) -> Result<JobOutcome, OrchestratorError> {
        let settings = GenerationSettings::load(self.store.as_ref())?;
        let gateway = gateway_for(&settings, self.http.clone());
        let cancel = self.session.cancellation_token();

        let snapshot = self.syncer.snapshot().await;
        if !snapshot.samplers.is_empty() && !snapshot.has_sampler(&settings.sampler) {
            tracing::warn!(
                sampler = %settings.sampler,
                "Configured sampler not advertised by the backend",
            );
        }

        let builder = RequestBuilder::new(settings.template(), &snapshot.loras);
        let request = match init_image {
            Some(image) => builder.build_img2img(prompt, image),
            None => builder.build(prompt),
        };
        let full_prompt = request.prompt.clone();

        let handle = gateway.submit_generation(&request).await.map_err(|e| {
            tracing::error!(job_id = %ctx.id, error = %e, "Submission failed");
            OrchestratorError::from(e)
        })?;
        *self.lock_current_job() = Some(handle.id().to_string());
        self.session.advance(JobState::Submitted);
        self.emit(
            Some(ctx),
            EventKind::JobSubmitted {
                backend_job_id: handle.id().to_string(),
            },
        );
        tracing::info!(
            job_id = %ctx.id,
            backend_job_id = %handle.id(),
            source = gateway.source().as_str(),
            "Job submitted",
        );

        let poller = ProgressPoller::new(gateway.as_ref(), settings.poll, self.delay.as_ref());
        let report = poller
            .run(&handle, &cancel, |state, sample| {
                self.session.advance(state);
                self.sink.on_progress(ctx, state, sample);
                self.emit(
                    Some(ctx),
                    EventKind::Progress {
                        state,
                        fraction: sample.fraction,
                        eta_seconds: sample.eta_seconds,
                    },
                );
            })
            .await;

        match report.state {
            JobState::Done => {
                let output = gateway.fetch_result(handle).await.map_err(|e| {
                    tracing::error!(job_id = %ctx.id, error = %e, "Fetching result failed");
                    OrchestratorError::from(e)
                })?;
                tracing::info!(job_id = %ctx.id, images = output.images.len(), "Job completed");
                self.sink.on_artifact(&output.images, &full_prompt, ctx);
                Ok(JobOutcome::Completed {
                    job: ctx.clone(),
                    prompt: full_prompt,
                    output,
                })
            }
            JobState::Failed => {
                let reason = report
                    .failure
                    .unwrap_or_else(|| "unknown failure".to_string());
                // The handle carries the submission's own error, e.g. a
                // rejected request body.
                Err(match gateway.fetch_result(handle).await {
                    Err(e) => OrchestratorError::from(e),
                    Ok(_) => OrchestratorError::JobFailed(reason),
                })
            }
            _ => Ok(JobOutcome::Abandoned {
                job: ctx.clone(),
                attempts: report.attempts,
            }),
        }
    }

    fn set_connected(&self, connected: bool) {
        if self.session.is_connected() != connected {
            self.session.set_connected(connected);
            self.emit(None, EventKind::ConnectionChanged { connected });
        }
    }

    fn emit_synced(&self, outcome: &SyncOutcome) {
        let failed = match &outcome.status {
            SyncStatus::Complete => Vec::new(),
            SyncStatus::Partial { failed } => failed.clone(),
        };
        self.emit(None, EventKind::CapabilitiesSynced { failed });
    }

    fn emit(&self, ctx: Option<&JobContext>, kind: EventKind) {
        let mut event = GenerationEvent::new(kind);
        if let Some(ctx) = ctx {
            event = event.for_job(ctx.id);
        }
        // Only fails when nobody is subscribed.
        let _ = self.event_tx.send(event);
    }

    fn lock_current_job(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.current_job.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the session if a job future is dropped before it finishes.
struct AdmissionGuard<'a> {
    session: &'a Session,
    released: bool,
}

impl AdmissionGuard<'_> {
    fn release(mut self, terminal: JobState) {
        self.released = true;
        self.session.finish(terminal);
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.session.finish(JobState::Abandoned);
        }
    }
}

/// Errors surfaced to callers of the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// A previous job still holds the session.
    #[error("A previous generation job is still running")]
    AdmissionDenied,

    /// The liveness probe failed during a status check or sync.
    #[error("Backend unreachable: {0}")]
    UnreachableBackend(#[source] GatewayError),

    /// The backend answered with an error status or an unusable body.
    #[error("Backend rejected the request: {0}")]
    BackendRejected(#[source] GatewayError),

    /// Transport failure while talking to the backend.
    #[error("Backend connection failed: {0}")]
    BackendUnreachable(#[source] GatewayError),

    /// The backend reported that the job failed.
    #[error("Generation failed: {0}")]
    JobFailed(String),

    #[error(transparent)]
    Settings(#[from] CoreError),
}

impl From<GatewayError> for OrchestratorError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Unreachable(_) => OrchestratorError::BackendUnreachable(e),
            GatewayError::JobFailed(reason) => OrchestratorError::JobFailed(reason),
            other => OrchestratorError::BackendRejected(other),
        }
    }
}

impl From<SyncError> for OrchestratorError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::UnreachableBackend(inner) => OrchestratorError::UnreachableBackend(inner),
        }
    }
}
