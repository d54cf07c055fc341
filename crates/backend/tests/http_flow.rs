mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use artifex_backend::events::{EventKind, NullSink};
use artifex_backend::gateway::GatewayError;
use artifex_backend::orchestrator::{JobOutcome, Orchestrator, OrchestratorError};
use artifex_core::settings::keys;
use artifex_core::JobState;
use assert_matches::assert_matches;

use common::{local_store, orchestrator, wait_until, MockServer, IMAGE};

#[tokio::test]
async fn text_to_image_runs_to_completion() {
    let mock = MockServer::new();
    let url = mock.start().await;
    mock.hold_generation.store(true, Ordering::SeqCst);
    mock.script(&[0.0, 0.1, 0.5]);

    let (orch, sink) = orchestrator(
        local_store(&url)
            .with(keys::PROMPT_PREFIX, "masterpiece, ")
            .with(keys::NEGATIVE_PROMPT, "blurry"),
    );
    orch.check_status().await.unwrap();
    assert!(orch.set_lora("a", true, 0.8).await);
    assert!(orch.set_lora("b", true, 0.4).await);
    let mut events = orch.subscribe();

    let outcome = orch
        .text_to_image("a castle", Some("msg-1".into()))
        .await
        .unwrap();

    let (job, prompt, output) = assert_matches!(
        outcome,
        JobOutcome::Completed { job, prompt, output } => (job, prompt, output)
    );
    assert_eq!(prompt, "masterpiece, a castle, <lora:a:0.8><lora:b:0.4>");
    assert_eq!(output.images, [IMAGE]);

    let (mode, body) = mock.last_generation.lock().unwrap().clone().unwrap();
    assert_eq!(mode, "txt2img");
    assert_eq!(body["prompt"], prompt);
    assert_eq!(body["negative_prompt"], "blurry");
    assert_eq!(body["sampler_name"], "Euler a");
    assert!(body.get("init_images").is_none());

    let artifacts = sink.artifacts.lock().unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].2.reference.as_deref(), Some("msg-1"));
    assert_eq!(artifacts[0].2.id, job.id);

    let progress = sink.progress.lock().unwrap();
    assert_eq!(progress[0].0, JobState::Waiting);
    assert!(progress.iter().any(|(state, _)| *state == JobState::Processing));
    assert_eq!(progress.last().map(|(state, _)| *state), Some(JobState::Done));

    assert_eq!(orch.session().state(), JobState::Done);
    assert!(!orch.session().is_working());

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.job_id, Some(job.id));
        kinds.push(event.kind);
    }
    assert_matches!(kinds.first(), Some(EventKind::JobAdmitted { img2img: false }));
    assert_matches!(kinds.get(1), Some(EventKind::JobSubmitted { .. }));
    assert_matches!(kinds.last(), Some(EventKind::JobCompleted { images: 1 }));
}

#[tokio::test]
async fn image_to_image_posts_the_source_image() {
    let mock = MockServer::new();
    let url = mock.start().await;
    let (orch, _sink) = orchestrator(local_store(&url).with(keys::DENOISING_STRENGTH, "0.45"));

    let outcome = orch
        .image_to_image("a castle at dusk", "QUJD".into(), None)
        .await
        .unwrap();
    assert_matches!(outcome, JobOutcome::Completed { .. });

    let (mode, body) = mock.last_generation.lock().unwrap().clone().unwrap();
    assert_eq!(mode, "img2img");
    assert_eq!(body["init_images"][0], "QUJD");
    assert_eq!(body["denoising_strength"], 0.45);
}

#[tokio::test]
async fn rejected_submission_reopens_admission() {
    let mock = MockServer::new();
    let url = mock.start().await;
    mock.reject_generation.store(true, Ordering::SeqCst);
    let (orch, sink) = orchestrator(local_store(&url));

    let err = orch.text_to_image("a castle", None).await.unwrap_err();
    assert_matches!(
        err,
        OrchestratorError::BackendRejected(GatewayError::Rejected { status: 422, .. })
    );
    assert_eq!(orch.session().state(), JobState::Failed);
    assert!(sink.artifacts.lock().unwrap().is_empty());

    mock.reject_generation.store(false, Ordering::SeqCst);
    let outcome = orch.text_to_image("a castle", None).await.unwrap();
    assert_matches!(outcome, JobOutcome::Completed { .. });
    assert_eq!(MockServer::count(&mock.generations), 2);
}

#[tokio::test]
async fn unreachable_backend_fails_submission() {
    // Nothing listens on the discard port.
    let (orch, _sink) = orchestrator(local_store("http://127.0.0.1:9"));

    let err = orch.text_to_image("a castle", None).await.unwrap_err();
    assert_matches!(
        err,
        OrchestratorError::BackendUnreachable(_) | OrchestratorError::BackendRejected(_)
    );
    assert!(!orch.session().is_working());
}

/// Orchestrator with a real timer, for tests that hold the backend.
fn timed_orchestrator(url: &str) -> Arc<Orchestrator> {
    let store = local_store(url)
        .with(keys::POLL_INTERVAL_MS, 10)
        .with(keys::MAX_ATTEMPTS, 1000);
    Arc::new(Orchestrator::new(Arc::new(store), Arc::new(NullSink)))
}

#[tokio::test]
async fn second_job_is_denied_while_the_first_runs() {
    let mock = MockServer::new();
    let url = mock.start().await;
    mock.hold_generation.store(true, Ordering::SeqCst);
    mock.auto_release.store(false, Ordering::SeqCst);
    let orch = timed_orchestrator(&url);

    let first = tokio::spawn({
        let orch = Arc::clone(&orch);
        async move { orch.text_to_image("first", None).await }
    });
    wait_until(|| MockServer::count(&mock.progress_queries) >= 2).await;

    assert_matches!(
        orch.text_to_image("second", None).await,
        Err(OrchestratorError::AdmissionDenied)
    );
    assert_eq!(orch.session().state(), JobState::Waiting);
    assert_eq!(MockServer::count(&mock.generations), 1);

    mock.release();
    assert_matches!(first.await.unwrap(), Ok(JobOutcome::Completed { .. }));

    mock.hold_generation.store(false, Ordering::SeqCst);
    assert_matches!(
        orch.text_to_image("second", None).await,
        Ok(JobOutcome::Completed { .. })
    );
}

#[tokio::test]
async fn interrupt_abandons_the_running_job() {
    let mock = MockServer::new();
    let url = mock.start().await;
    mock.hold_generation.store(true, Ordering::SeqCst);
    mock.auto_release.store(false, Ordering::SeqCst);
    let orch = timed_orchestrator(&url);

    let job = tokio::spawn({
        let orch = Arc::clone(&orch);
        async move { orch.text_to_image("a castle", None).await }
    });
    wait_until(|| MockServer::count(&mock.progress_queries) >= 1).await;

    orch.interrupt().await;

    assert_matches!(job.await.unwrap(), Ok(JobOutcome::Abandoned { .. }));
    assert_eq!(MockServer::count(&mock.interrupts), 1);
    assert_eq!(orch.session().state(), JobState::Abandoned);
    assert!(!orch.session().is_working());
}

#[tokio::test]
async fn skip_is_forwarded() {
    let mock = MockServer::new();
    let url = mock.start().await;
    let (orch, _sink) = orchestrator(local_store(&url));

    orch.skip().await;
    assert_eq!(MockServer::count(&mock.skips), 1);
}
