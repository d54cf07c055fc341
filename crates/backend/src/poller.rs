//! Bounded progress polling for one submitted job.
//!
//! [`ProgressPoller::run`] queries the backend at a fixed interval and
//! feeds each sample through [`next_state`] until the job reaches a
//! terminal state. The loop ends in:
//!
//! - `Done` once the transition table says so,
//! - `Failed` when the backend reports the job itself failed,
//! - `Abandoned` after `max_attempts` queries or when cancelled.
//!
//! Transport errors are logged and consume an attempt; they never end the
//! loop early.

use std::time::Duration;

use artifex_core::progress::next_state;
use artifex_core::{JobState, PollConfig, ProgressSample};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::gateway::{BackendGateway, GatewayError, JobHandle};

/// Sleep between two attempts. Injected so tests run without real time.
#[async_trait]
pub trait Delay: Send + Sync {
    async fn wait(&self, duration: Duration);
}

/// [`Delay`] backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioDelay;

#[async_trait]
impl Delay for TokioDelay {
    async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// How a poll loop ended.
#[derive(Debug, Clone, PartialEq)]
pub struct PollReport {
    /// `Done`, `Failed` or `Abandoned`.
    pub state: JobState,
    /// Progress queries issued, successful or not.
    pub attempts: u32,
    /// Backend reason, when the job failed.
    pub failure: Option<String>,
}

pub struct ProgressPoller<'a> {
    gateway: &'a dyn BackendGateway,
    config: PollConfig,
    delay: &'a dyn Delay,
}

impl<'a> ProgressPoller<'a> {
    pub fn new(gateway: &'a dyn BackendGateway, config: PollConfig, delay: &'a dyn Delay) -> Self {
        Self {
            gateway,
            config,
            delay,
        }
    }

    /// Poll until the job is terminal.
    ///
    /// `on_sample` sees every successful sample together with the state it
    /// produced, including the final `Done` transition.
    pub async fn run<F>(
        &self,
        handle: &JobHandle,
        cancel: &CancellationToken,
        mut on_sample: F,
    ) -> PollReport
    where
        F: FnMut(JobState, &ProgressSample) + Send,
    {
        let mut state = JobState::Submitted;
        let mut attempts = 0u32;

        while attempts < self.config.max_attempts {
            attempts += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.abandoned(handle, attempts - 1, "cancelled"),
                result = self.gateway.query_progress(handle) => result,
            };

            match result {
                Ok(sample) => {
                    state = next_state(state, sample.fraction);
                    tracing::debug!(
                        job_id = %handle.id(),
                        attempt = attempts,
                        fraction = sample.fraction,
                        state = state.as_str(),
                        "Progress sample",
                    );
                    on_sample(state, &sample);
                    if state == JobState::Done {
                        tracing::info!(job_id = %handle.id(), attempts, "Job finished");
                        return PollReport {
                            state,
                            attempts,
                            failure: None,
                        };
                    }
                }
                Err(GatewayError::JobFailed(reason)) => {
                    tracing::error!(job_id = %handle.id(), attempts, error = %reason, "Job failed");
                    return PollReport {
                        state: JobState::Failed,
                        attempts,
                        failure: Some(reason),
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %handle.id(),
                        attempt = attempts,
                        error = %e,
                        "Progress query failed",
                    );
                }
            }

            if attempts < self.config.max_attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return self.abandoned(handle, attempts, "cancelled"),
                    _ = self.delay.wait(self.config.interval) => {}
                }
            }
        }

        self.abandoned(handle, attempts, "attempt limit reached")
    }

    fn abandoned(&self, handle: &JobHandle, attempts: u32, reason: &str) -> PollReport {
        tracing::warn!(job_id = %handle.id(), attempts, reason, "Polling abandoned");
        PollReport {
            state: JobState::Abandoned,
            attempts,
            failure: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use artifex_core::settings::BackendSource;
    use artifex_core::{CapabilityKind, GenerationRequest};

    use super::*;
    use crate::gateway::GenerationOutput;

    /// Replays a script of progress results; repeats the last one forever.
    struct ScriptedGateway {
        script: Mutex<VecDeque<Result<f64, &'static str>>>,
        last: Mutex<Result<f64, &'static str>>,
        queries: AtomicU32,
    }

    impl ScriptedGateway {
        fn new(script: Vec<Result<f64, &'static str>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(Ok(0.0)),
                queries: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl BackendGateway for ScriptedGateway {
        fn source(&self) -> BackendSource {
            BackendSource::Local
        }

        async fn probe(&self) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn list_capability(
            &self,
            _kind: CapabilityKind,
        ) -> Result<serde_json::Value, GatewayError> {
            Ok(serde_json::json!([]))
        }

        async fn submit_generation(
            &self,
            _request: &GenerationRequest,
        ) -> Result<JobHandle, GatewayError> {
            Ok(JobHandle::new("scripted"))
        }

        async fn query_progress(
            &self,
            _handle: &JobHandle,
        ) -> Result<ProgressSample, GatewayError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock().unwrap();
                let mut last = self.last.lock().unwrap();
                if let Some(step) = script.pop_front() {
                    *last = step;
                }
                *last
            };
            match next {
                Ok(fraction) => Ok(ProgressSample::new(fraction)),
                Err("failed") => Err(GatewayError::JobFailed("out of memory".into())),
                Err(body) => Err(GatewayError::Rejected {
                    status: 502,
                    body: body.into(),
                }),
            }
        }

        async fn fetch_result(&self, _handle: JobHandle) -> Result<GenerationOutput, GatewayError> {
            Ok(GenerationOutput::default())
        }

        async fn cancel(&self, _job_id: &str) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    /// Returns immediately and counts the waits.
    #[derive(Default)]
    struct InstantDelay {
        waits: AtomicU32,
    }

    #[async_trait]
    impl Delay for InstantDelay {
        async fn wait(&self, _duration: Duration) {
            self.waits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(max_attempts: u32) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(1500),
            max_attempts,
        }
    }

    async fn poll(
        gateway: &ScriptedGateway,
        delay: &InstantDelay,
        max_attempts: u32,
    ) -> (PollReport, Vec<JobState>) {
        let poller = ProgressPoller::new(gateway, config(max_attempts), delay);
        let mut seen = Vec::new();
        let report = poller
            .run(&JobHandle::new("job"), &CancellationToken::new(), |state, _| {
                seen.push(state)
            })
            .await;
        (report, seen)
    }

    #[tokio::test]
    async fn typical_sequence_completes() {
        let gateway = ScriptedGateway::new(vec![Ok(0.0), Ok(0.0), Ok(0.1), Ok(0.5), Ok(1.0)]);
        let delay = InstantDelay::default();

        let (report, seen) = poll(&gateway, &delay, 100).await;

        assert_eq!(report.state, JobState::Done);
        assert_eq!(report.attempts, 5);
        assert_eq!(
            seen,
            [
                JobState::Waiting,
                JobState::Waiting,
                JobState::Processing,
                JobState::Processing,
                JobState::Done,
            ]
        );
        assert_eq!(delay.waits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn stuck_job_is_abandoned_after_exactly_max_attempts() {
        let gateway = ScriptedGateway::new(vec![Ok(0.0)]);
        let delay = InstantDelay::default();

        let (report, seen) = poll(&gateway, &delay, 7).await;

        assert_eq!(report.state, JobState::Abandoned);
        assert_eq!(report.attempts, 7);
        assert_eq!(gateway.queries.load(Ordering::SeqCst), 7);
        assert_eq!(delay.waits.load(Ordering::SeqCst), 6);
        assert!(seen.iter().all(|s| *s == JobState::Waiting));
    }

    #[tokio::test]
    async fn transport_errors_consume_attempts_without_ending_the_loop() {
        let gateway = ScriptedGateway::new(vec![
            Ok(0.0),
            Err("bad gateway"),
            Ok(0.3),
            Err("bad gateway"),
            Ok(0.0),
        ]);
        let delay = InstantDelay::default();

        let (report, seen) = poll(&gateway, &delay, 100).await;

        assert_eq!(report.state, JobState::Done);
        assert_eq!(report.attempts, 5);
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn backend_failure_ends_in_failed() {
        let gateway = ScriptedGateway::new(vec![Ok(0.0), Ok(0.2), Err("failed")]);
        let delay = InstantDelay::default();

        let (report, _) = poll(&gateway, &delay, 100).await;

        assert_eq!(report.state, JobState::Failed);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.failure.as_deref(), Some("out of memory"));
    }

    #[tokio::test]
    async fn cancelled_token_abandons_before_querying() {
        let gateway = ScriptedGateway::new(vec![Ok(0.5)]);
        let delay = InstantDelay::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let poller = ProgressPoller::new(&gateway, config(100), &delay);
        let report = poller.run(&JobHandle::new("job"), &cancel, |_, _| {}).await;

        assert_eq!(report.state, JobState::Abandoned);
        assert_eq!(report.attempts, 0);
        assert_eq!(gateway.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let gateway = ScriptedGateway::new(vec![Ok(0.0)]);
        let cancel = CancellationToken::new();
        let poller = ProgressPoller::new(&gateway, config(100), &TokioDelay);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(4000)).await;
            trigger.cancel();
        });

        let report = poller.run(&JobHandle::new("job"), &cancel, |_, _| {}).await;

        assert_eq!(report.state, JobState::Abandoned);
        assert_eq!(report.attempts, 3);
    }
}
