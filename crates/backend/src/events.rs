//! Generation events and the result sink.
//!
//! Events are fanned out on a [`tokio::sync::broadcast`] channel owned by
//! the [`Orchestrator`](crate::orchestrator::Orchestrator); subscribe with
//! [`Orchestrator::subscribe`](crate::orchestrator::Orchestrator::subscribe).
//! Finished images are delivered separately through a [`ResultSink`].

use artifex_core::{CapabilityKind, JobState, ProgressSample};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// GenerationEvent
// ---------------------------------------------------------------------------

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A job was admitted into the session.
    JobAdmitted { img2img: bool },

    /// The backend accepted the request.
    JobSubmitted { backend_job_id: String },

    /// A progress sample moved the job through the transition table.
    Progress {
        state: JobState,
        /// Completion in `[0, 1]`.
        fraction: f64,
        eta_seconds: Option<f64>,
    },

    JobCompleted { images: usize },

    JobFailed { error: String },

    /// Polling stopped without a result (attempt limit or interrupt).
    JobAbandoned { attempts: u32 },

    CapabilitiesSynced { failed: Vec<CapabilityKind> },

    /// The liveness probe flipped the connection flag.
    ConnectionChanged { connected: bool },
}

/// A timestamped event, optionally tied to a job.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationEvent {
    pub job_id: Option<Uuid>,
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl GenerationEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            job_id: None,
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Attach the job the event belongs to.
    pub fn for_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

// ---------------------------------------------------------------------------
// Result sink
// ---------------------------------------------------------------------------

/// Identifies one generation job to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    /// Local job id, also carried by the job's events.
    pub id: Uuid,
    /// Caller-supplied reference (a message id, a file name) echoed back.
    pub reference: Option<String>,
}

impl JobContext {
    pub fn new(reference: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            reference,
        }
    }
}

/// Receiver of generated artifacts.
pub trait ResultSink: Send + Sync {
    /// Called once per successful job with the base64 images and the full
    /// prompt that produced them.
    fn on_artifact(&self, images: &[String], prompt: &str, ctx: &JobContext);

    /// Called for every progress sample. Preview images arrive here.
    fn on_progress(&self, _ctx: &JobContext, _state: JobState, _sample: &ProgressSample) {}
}

/// Sink that discards everything. Useful when only events matter.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ResultSink for NullSink {
    fn on_artifact(&self, _images: &[String], _prompt: &str, _ctx: &JobContext) {}
}
