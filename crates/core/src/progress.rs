//! Progress samples and the poller's transition table.
//!
//! A reported fraction alone cannot tell "not started" from "finished and
//! reset": both read `0`. Completion is therefore decided by the state the
//! poller is in. Only [`JobState::Processing`] accepts `0` as done; in
//! [`JobState::Waiting`] a `0` means the job has not started yet.
//!
//! | current    | sample             | next       |
//! |------------|--------------------|------------|
//! | Idle       | any                | Waiting    |
//! | Waiting    | `0`                | Waiting    |
//! | Waiting    | `> 0`              | Processing |
//! | Processing | `0 < f < 1`        | Processing |
//! | Processing | `0` or `1`         | Done       |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::JobState;

/// Default delay between two progress queries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1500);

/// Default number of progress queries before a job is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

/// Poll loop tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// One progress observation reported by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    /// Completion in `[0, 1]`.
    pub fraction: f64,
    /// Estimated seconds remaining.
    pub eta_seconds: Option<f64>,
    /// Base64 preview of the image in progress.
    pub preview_image: Option<String>,
}

impl ProgressSample {
    /// A sample with only a fraction. Out-of-range and NaN values are
    /// clamped into `[0, 1]`.
    pub fn new(fraction: f64) -> Self {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        Self {
            fraction,
            eta_seconds: None,
            preview_image: None,
        }
    }

    pub fn with_eta(mut self, eta_seconds: Option<f64>) -> Self {
        self.eta_seconds = eta_seconds;
        self
    }

    pub fn with_preview(mut self, preview_image: Option<String>) -> Self {
        self.preview_image = preview_image;
        self
    }
}

/// Apply one sample to the poller state.
///
/// States outside the poll phases (`Admitted`, `Submitted`) behave like
/// `Idle`. Terminal states are returned unchanged.
pub fn next_state(current: JobState, fraction: f64) -> JobState {
    match current {
        JobState::Idle | JobState::Admitted | JobState::Submitted => JobState::Waiting,
        JobState::Waiting if fraction > 0.0 => JobState::Processing,
        JobState::Waiting => JobState::Waiting,
        JobState::Processing if fraction <= 0.0 || fraction >= 1.0 => JobState::Done,
        JobState::Processing => JobState::Processing,
        terminal @ (JobState::Done | JobState::Failed | JobState::Abandoned) => terminal,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
