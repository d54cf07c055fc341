//! `artifex` -- run one image generation from the command line.
//!
//! ```text
//! artifex <prompt...>     generate and write the images to --output-dir
//! artifex status          probe the backend and print its capabilities
//! ```
//!
//! Every option can also come from the environment (see
//! [`config::CliConfig`]) and, when `ARTIFEX_SETTINGS_FILE` is set, a JSON
//! settings document. Ctrl-C interrupts the running job.

mod config;
mod sink;

use std::sync::Arc;

use anyhow::{bail, Context};
use artifex_backend::events::EventKind;
use artifex_backend::orchestrator::{JobOutcome, Orchestrator};
use artifex_backend::sync::SyncStatus;
use artifex_core::settings::{keys, JsonFileStore, MemoryStore, NAMESPACE};
use artifex_core::SettingsStore;
use base64::Engine;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::CliConfig;
use sink::FileSink;

#[derive(Debug, Parser)]
#[command(
    name = "artifex",
    version,
    about = "Image generation against a local server or the AI Horde",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Prompt for the generation.
    #[arg(trailing_var_arg = true)]
    prompt: Vec<String>,

    #[command(flatten)]
    config: CliConfig,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Probe the backend and print its capabilities as JSON.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.config.log_json);

    let config = cli.config.prepare()?;
    let store = open_store(&config)?;
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        Arc::new(FileSink::new(config.output_dir.clone())),
    ));

    if let Some(Command::Status) = cli.command {
        return print_status(&orchestrator).await;
    }
    if cli.prompt.is_empty() {
        bail!("a prompt is required (see `artifex --help`)");
    }

    if let Err(e) = orchestrator.check_status().await {
        tracing::warn!(error = %e, "Continuing without a capability snapshot");
    }
    if let Some(model) = &config.model {
        orchestrator
            .change_model(model)
            .await
            .with_context(|| format!("switching to model {model}"))?;
    }

    spawn_event_logger(&orchestrator);
    spawn_interrupt_on_ctrl_c(&orchestrator);

    let prompt = cli.prompt.join(" ");
    let outcome = match &config.init_image {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("reading init image {}", path.display()))?;
            let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
            orchestrator.image_to_image(&prompt, encoded, None).await?
        }
        None => orchestrator.text_to_image(&prompt, None).await?,
    };

    match outcome {
        JobOutcome::Completed { output, .. } => {
            tracing::info!(
                images = output.images.len(),
                dir = %config.output_dir.display(),
                "Generation finished",
            );
            Ok(())
        }
        JobOutcome::Abandoned { attempts, .. } => {
            bail!("generation abandoned after {attempts} progress queries")
        }
    }
}

fn init_tracing(json: bool) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "artifex_backend=info,artifex_cli=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Open the configured store and apply environment overrides.
fn open_store(config: &CliConfig) -> anyhow::Result<Arc<dyn SettingsStore>> {
    let store: Arc<dyn SettingsStore> = match &config.settings_file {
        Some(path) => Arc::new(JsonFileStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };

    let overrides = [
        (keys::SOURCE, &config.source),
        (keys::BASE_URL, &config.base_url),
        (keys::HORDE_API_KEY, &config.horde_api_key),
    ];
    for (key, value) in overrides {
        if let Some(value) = value {
            store.set(NAMESPACE, key, serde_json::Value::from(value.as_str()))?;
        }
    }
    Ok(store)
}

async fn print_status(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    let outcome = orchestrator.check_status().await?;
    if let SyncStatus::Partial { failed } = &outcome.status {
        tracing::warn!(?failed, "Some capability categories could not be fetched");
    }
    println!("{}", serde_json::to_string_pretty(&outcome.snapshot)?);
    Ok(())
}

fn spawn_event_logger(orchestrator: &Orchestrator) {
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let EventKind::Progress {
                        state,
                        fraction,
                        eta_seconds,
                    } = event.kind
                    {
                        tracing::info!(
                            state = state.as_str(),
                            percent = (fraction * 100.0).round() as u32,
                            eta_seconds,
                            "Progress",
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_interrupt_on_ctrl_c(orchestrator: &Arc<Orchestrator>) {
    let orchestrator = Arc::clone(orchestrator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping the running job");
            orchestrator.interrupt().await;
        }
    });
}
