#![allow(dead_code)]

//! In-process mock backends for integration tests.
//!
//! Each mock is an axum router bound to `127.0.0.1:0`, with counters and
//! knobs shared through an `Arc` so tests can steer and inspect it.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use artifex_backend::events::{JobContext, ResultSink};
use artifex_backend::orchestrator::Orchestrator;
use artifex_backend::poller::Delay;
use artifex_core::settings::{keys, MemoryStore};
use artifex_core::{JobState, ProgressSample};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, head, post, MethodRouter};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use tokio::sync::Notify;

pub const IMAGE: &str = "aW1hZ2U=";

/// Bind `router` to an ephemeral port and return its base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock backend");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock backend");
    });
    format!("http://{addr}")
}

/// Poll `condition` every few milliseconds until it holds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Local HTTP backend
// ---------------------------------------------------------------------------

pub struct MockServer {
    pub probes: AtomicUsize,
    pub capability_fetches: AtomicUsize,
    pub generations: AtomicUsize,
    pub progress_queries: AtomicUsize,
    pub skips: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub option_posts: AtomicUsize,
    /// Probe answers 503.
    pub down: AtomicBool,
    /// Generation answers 422.
    pub reject_generation: AtomicBool,
    /// Generation blocks until [`MockServer::release`].
    pub hold_generation: AtomicBool,
    /// Release a held generation once the progress script is drained.
    pub auto_release: AtomicBool,
    /// Capability kinds answering 500.
    pub failing: Mutex<HashSet<String>>,
    pub loras: Mutex<Value>,
    pub options: Mutex<Map<String, Value>>,
    pub progress: Mutex<VecDeque<f64>>,
    /// `(mode, body)` of the last generation call.
    pub last_generation: Mutex<Option<(String, Value)>>,
    release: Notify,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        let mut options = Map::new();
        options.insert("sd_model_checkpoint".into(), json!("base"));
        Arc::new(Self {
            probes: AtomicUsize::new(0),
            capability_fetches: AtomicUsize::new(0),
            generations: AtomicUsize::new(0),
            progress_queries: AtomicUsize::new(0),
            skips: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
            option_posts: AtomicUsize::new(0),
            down: AtomicBool::new(false),
            reject_generation: AtomicBool::new(false),
            hold_generation: AtomicBool::new(false),
            auto_release: AtomicBool::new(true),
            failing: Mutex::new(HashSet::new()),
            loras: Mutex::new(json!([
                {"name": "a", "alias": "a", "path": "/loras/a.safetensors"},
                {"name": "b", "alias": "b", "path": "/loras/b.safetensors"},
            ])),
            options: Mutex::new(options),
            progress: Mutex::new(VecDeque::new()),
            last_generation: Mutex::new(None),
            release: Notify::new(),
        })
    }

    pub fn script(&self, fractions: &[f64]) {
        *self.progress.lock().unwrap() = fractions.iter().copied().collect();
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Serve the neutral route layout and return the base URL.
    pub async fn start(self: &Arc<Self>) -> String {
        let router = Router::new()
            .route("/", head(probe))
            .route("/capabilities/{kind}", get(capability))
            .route("/generate/{mode}", post(generate))
            .route("/progress", get(progress))
            .route("/control/skip", post(skip))
            .route("/control/interrupt", post(interrupt))
            .route("/options", post(set_options))
            .with_state(Arc::clone(self));
        serve(router).await
    }

    /// Serve the Automatic1111 `/sdapi/v1` layout and return the base URL.
    pub async fn start_sdapi(self: &Arc<Self>) -> String {
        let router = Router::new()
            .route("/", head(probe))
            .route("/sdapi/v1/loras", listing("loras"))
            .route("/sdapi/v1/sd-models", listing("models"))
            .route("/sdapi/v1/samplers", listing("samplers"))
            .route("/sdapi/v1/upscalers", listing("upscalers"))
            .route("/sdapi/v1/prompt-styles", listing("styles"))
            .route("/sdapi/v1/options", listing("options").post(set_options))
            .route("/sdapi/v1/txt2img", generation("txt2img"))
            .route("/sdapi/v1/img2img", generation("img2img"))
            .route("/sdapi/v1/progress", get(progress))
            .route("/sdapi/v1/skip", post(skip))
            .route("/sdapi/v1/interrupt", post(interrupt))
            .with_state(Arc::clone(self));
        serve(router).await
    }
}

fn listing(kind: &'static str) -> MethodRouter<Arc<MockServer>> {
    get(move |state: State<Arc<MockServer>>| capability(state, Path(kind.to_string())))
}

fn generation(mode: &'static str) -> MethodRouter<Arc<MockServer>> {
    post(move |state: State<Arc<MockServer>>, body: Json<Value>| {
        generate(state, Path(mode.to_string()), body)
    })
}

async fn probe(State(mock): State<Arc<MockServer>>) -> StatusCode {
    mock.probes.fetch_add(1, Ordering::SeqCst);
    if mock.down.load(Ordering::SeqCst) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn capability(
    State(mock): State<Arc<MockServer>>,
    Path(kind): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    mock.capability_fetches.fetch_add(1, Ordering::SeqCst);
    if mock.failing.lock().unwrap().contains(&kind) {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    let body = match kind.as_str() {
        "loras" => mock.loras.lock().unwrap().clone(),
        "models" => json!([
            {"title": "base", "model_name": "base", "hash": "abc123"},
            {"title": "modelX", "model_name": "modelX"},
        ]),
        "samplers" => json!([{"name": "Euler a", "aliases": ["k_euler_a"]}, {"name": "DDIM"}]),
        "upscalers" => json!([{"name": "Latent", "scale": 2.0}]),
        "styles" => json!([{"name": "cinematic", "prompt": "film grain"}]),
        "options" => Value::Object(mock.options.lock().unwrap().clone()),
        _ => return Err(StatusCode::NOT_FOUND),
    };
    Ok(Json(body))
}

async fn generate(
    State(mock): State<Arc<MockServer>>,
    Path(mode): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    mock.generations.fetch_add(1, Ordering::SeqCst);
    *mock.last_generation.lock().unwrap() = Some((mode, body));
    if mock.reject_generation.load(Ordering::SeqCst) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"detail": "unknown sampler"})),
        );
    }
    if mock.hold_generation.load(Ordering::SeqCst) {
        mock.release.notified().await;
    }
    (
        StatusCode::OK,
        Json(json!({"images": [IMAGE], "parameters": {}, "info": "{\"seed\": 42}"})),
    )
}

async fn progress(State(mock): State<Arc<MockServer>>) -> Json<Value> {
    mock.progress_queries.fetch_add(1, Ordering::SeqCst);
    let (fraction, drained) = {
        let mut script = mock.progress.lock().unwrap();
        let fraction = script.pop_front().unwrap_or(0.0);
        (fraction, script.is_empty())
    };
    if drained && mock.auto_release.load(Ordering::SeqCst) {
        mock.release.notify_one();
    }
    Json(json!({"progress": fraction, "eta_relative": 3.5, "current_image": null}))
}

async fn skip(State(mock): State<Arc<MockServer>>) -> StatusCode {
    mock.skips.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn interrupt(State(mock): State<Arc<MockServer>>) -> StatusCode {
    mock.interrupts.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn set_options(
    State(mock): State<Arc<MockServer>>,
    Json(options): Json<Map<String, Value>>,
) -> StatusCode {
    mock.option_posts.fetch_add(1, Ordering::SeqCst);
    mock.options.lock().unwrap().extend(options);
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// AI Horde broker
// ---------------------------------------------------------------------------

pub struct MockHorde {
    pub submissions: AtomicUsize,
    pub checks: AtomicUsize,
    pub cancels: AtomicUsize,
    pub faulted: AtomicBool,
    /// `(waiting, processing, finished, done)` per check.
    pub checks_script: Mutex<VecDeque<(u32, u32, u32, bool)>>,
    pub last_submission: Mutex<Option<(HeaderMap, Value)>>,
}

impl MockHorde {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            submissions: AtomicUsize::new(0),
            checks: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            faulted: AtomicBool::new(false),
            checks_script: Mutex::new(VecDeque::new()),
            last_submission: Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) -> String {
        let router = Router::new()
            .route("/v2/status/heartbeat", get(|| async { Json(json!({"message": "OK"})) }))
            .route("/v2/status/models", get(horde_models))
            .route("/v2/generate/async", post(horde_submit))
            .route("/v2/generate/check/{id}", get(horde_check))
            .route(
                "/v2/generate/status/{id}",
                get(horde_status).delete(horde_cancel),
            )
            .with_state(Arc::clone(self));
        serve(router).await
    }
}

async fn horde_models() -> Json<Value> {
    Json(json!([
        {"name": "Deliberate", "count": 3, "queued": 0.0},
        {"name": "Retired", "count": 0},
    ]))
}

async fn horde_submit(
    State(mock): State<Arc<MockHorde>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    mock.submissions.fetch_add(1, Ordering::SeqCst);
    *mock.last_submission.lock().unwrap() = Some((headers, body));
    (StatusCode::ACCEPTED, Json(json!({"id": "horde-1", "kudos": 12.0})))
}

async fn horde_check(
    State(mock): State<Arc<MockHorde>>,
    Path(_id): Path<String>,
) -> Json<Value> {
    mock.checks.fetch_add(1, Ordering::SeqCst);
    let (waiting, processing, finished, done) = mock
        .checks_script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or((0, 0, 1, true));
    Json(json!({
        "finished": finished,
        "processing": processing,
        "restarted": 0,
        "waiting": waiting,
        "done": done,
        "faulted": mock.faulted.load(Ordering::SeqCst),
        "wait_time": 4,
        "queue_position": 0,
        "kudos": 12.0,
        "is_possible": true,
    }))
}

async fn horde_status(
    State(mock): State<Arc<MockHorde>>,
    Path(_id): Path<String>,
) -> Json<Value> {
    let faulted = mock.faulted.load(Ordering::SeqCst);
    let generations = if faulted {
        json!([])
    } else {
        json!([{"img": IMAGE, "seed": "7", "worker_name": "gpu-1", "model": "Deliberate"}])
    };
    Json(json!({"generations": generations, "faulted": faulted, "done": !faulted}))
}

async fn horde_cancel(
    State(mock): State<Arc<MockHorde>>,
    Path(_id): Path<String>,
) -> StatusCode {
    mock.cancels.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Orchestrator fixtures
// ---------------------------------------------------------------------------

/// Delay that returns at once.
pub struct NoDelay;

#[async_trait::async_trait]
impl Delay for NoDelay {
    async fn wait(&self, _duration: Duration) {
        tokio::task::yield_now().await;
    }
}

/// Sink that records everything it is handed.
#[derive(Default)]
pub struct RecordingSink {
    pub artifacts: Mutex<Vec<(Vec<String>, String, JobContext)>>,
    pub progress: Mutex<Vec<(JobState, f64)>>,
}

impl ResultSink for RecordingSink {
    fn on_artifact(&self, images: &[String], prompt: &str, ctx: &JobContext) {
        self.artifacts
            .lock()
            .unwrap()
            .push((images.to_vec(), prompt.to_string(), ctx.clone()));
    }

    fn on_progress(&self, _ctx: &JobContext, state: JobState, sample: &ProgressSample) {
        self.progress.lock().unwrap().push((state, sample.fraction));
    }
}

pub fn local_store(base_url: &str) -> MemoryStore {
    MemoryStore::new()
        .with(keys::SOURCE, "local")
        .with(keys::BASE_URL, base_url)
        .with(keys::MAX_ATTEMPTS, 500)
}

/// Orchestrator over `store` with an instant delay and a recording sink.
pub fn orchestrator(store: MemoryStore) -> (Arc<Orchestrator>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let orch = Orchestrator::new(Arc::new(store), sink.clone()).with_delay(Arc::new(NoDelay));
    (Arc::new(orch), sink)
}
