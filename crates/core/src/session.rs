//! Per-client session context: job lifecycle state, single-flight
//! admission, the backend connection flag, and the current job's
//! cancellation token.
//!
//! One [`Session`] exists per client. It replaces process-wide "working"
//! and "connected" flags; every orchestrator operation receives it.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Lifecycle of the one generation job a session may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Admitted,
    Submitted,
    Waiting,
    Processing,
    Done,
    Failed,
    Abandoned,
}

impl JobState {
    /// States in which a new job may be admitted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Idle | JobState::Done | JobState::Failed | JobState::Abandoned
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Admitted => "admitted",
            JobState::Submitted => "submitted",
            JobState::Waiting => "waiting",
            JobState::Processing => "processing",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct SessionInner {
    state: JobState,
    connected: bool,
    cancel: CancellationToken,
}

/// Session context shared by every operation of one client.
///
/// The lock is never held across an `.await`; each method is a short
/// critical section.
#[derive(Debug)]
pub struct Session {
    inner: Mutex<SessionInner>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                state: JobState::Idle,
                connected: false,
                cancel: CancellationToken::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a new job if none is running.
    ///
    /// On success the state becomes [`JobState::Admitted`] and a fresh
    /// cancellation token is issued for the job. Returns `false` (and
    /// changes nothing) while a previous job is still running.
    pub fn try_admit(&self) -> bool {
        let mut inner = self.lock();
        if !inner.state.is_terminal() {
            return false;
        }
        inner.state = JobState::Admitted;
        inner.cancel = CancellationToken::new();
        true
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    /// Whether a job currently holds the session.
    pub fn is_working(&self) -> bool {
        !self.lock().state.is_terminal()
    }

    /// Move a running job to a non-terminal phase. Ignored once the job
    /// has finished, so a late update can never resurrect it.
    pub fn advance(&self, next: JobState) {
        let mut inner = self.lock();
        if !inner.state.is_terminal() && !next.is_terminal() {
            inner.state = next;
        }
    }

    /// Finish the running job in a terminal state.
    ///
    /// Returns `true` only for the call that actually released the
    /// session; later calls for the same job are no-ops.
    pub fn finish(&self, terminal: JobState) -> bool {
        debug_assert!(terminal != JobState::Idle && terminal.is_terminal());
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = terminal;
        true
    }

    /// Token cancelled when the running job is interrupted.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.lock().cancel.clone()
    }

    /// Cancel the running job's poll loop. A no-op when idle.
    pub fn cancel_job(&self) {
        let inner = self.lock();
        if !inner.state.is_terminal() {
            inner.cancel.cancel();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
