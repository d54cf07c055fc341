//! Capability synchronization.
//!
//! [`CapabilitySyncer`] owns the process-wide [`CapabilitySnapshot`]. A
//! sync probes the backend, fetches every category, and swaps in a new
//! snapshot built from the previous one. Categories that fail to fetch
//! keep their cached values.

use std::sync::Arc;

use artifex_core::settings::{load_loras, store_loras};
use artifex_core::{CapabilityKind, CapabilitySnapshot, SettingsStore};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::gateway::{BackendGateway, GatewayError};

/// Whether every category made it into the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncStatus {
    Complete,
    /// Some categories failed and kept their previous values. Categories
    /// the backend does not list at all are not counted here.
    Partial { failed: Vec<CapabilityKind> },
}

/// Result of a sync that reached the backend.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub snapshot: CapabilitySnapshot,
    pub status: SyncStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The liveness probe failed; nothing was fetched.
    #[error("Backend unreachable: {0}")]
    UnreachableBackend(#[source] GatewayError),
}

/// Holder of the capability snapshot.
pub struct CapabilitySyncer {
    snapshot: RwLock<CapabilitySnapshot>,
    store: Arc<dyn SettingsStore>,
}

impl CapabilitySyncer {
    /// Start with an empty snapshot whose LoRA list is seeded from the
    /// persisted preferences, so the first sync merges against them.
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        let snapshot = CapabilitySnapshot {
            loras: load_loras(store.as_ref()),
            ..Default::default()
        };
        Self {
            snapshot: RwLock::new(snapshot),
            store,
        }
    }

    /// A copy of the current snapshot.
    pub async fn snapshot(&self) -> CapabilitySnapshot {
        self.snapshot.read().await.clone()
    }

    pub async fn sync(&self, gateway: &dyn BackendGateway) -> Result<SyncOutcome, SyncError> {
        gateway.probe().await.map_err(|e| {
            tracing::warn!(
                source = gateway.source().as_str(),
                error = %e,
                "Capability sync aborted, backend probe failed",
            );
            SyncError::UnreachableBackend(e)
        })?;

        let payloads = gateway.list_capabilities().await;

        // Build the next snapshot off the lock, then swap it in whole.
        let mut next = self.snapshot.read().await.clone();
        let mut failed = Vec::new();
        for (kind, payload) in payloads {
            let applied = match payload {
                Ok(value) => next.apply(kind, value).map_err(|e| e.to_string()),
                Err(GatewayError::Unsupported { .. }) => {
                    tracing::debug!(category = kind.as_str(), "Category not listed by backend");
                    continue;
                }
                Err(e) => Err(e.to_string()),
            };
            if let Err(reason) = applied {
                tracing::warn!(
                    category = kind.as_str(),
                    error = %reason,
                    "Capability category not refreshed",
                );
                failed.push(kind);
            }
        }

        {
            let mut current = self.snapshot.write().await;
            // Preferences toggled while the fetch was in flight win.
            for lora in &current.loras {
                next.set_lora(&lora.name, lora.active, lora.strength);
            }
            *current = next.clone();
        }

        if let Err(e) = store_loras(self.store.as_ref(), &next.loras) {
            tracing::error!(error = %e, "Failed to persist LoRA preferences");
        }

        tracing::info!(
            source = gateway.source().as_str(),
            models = next.models.len(),
            samplers = next.samplers.len(),
            loras = next.loras.len(),
            failed = failed.len(),
            "Capabilities synced",
        );

        let status = if failed.is_empty() {
            SyncStatus::Complete
        } else {
            SyncStatus::Partial { failed }
        };
        Ok(SyncOutcome {
            snapshot: next,
            status,
        })
    }

    /// Toggle one LoRA and persist the list. Returns `false` when the LoRA
    /// is unknown.
    pub async fn set_lora(&self, name: &str, active: bool, strength: f64) -> bool {
        let loras = {
            let mut snapshot = self.snapshot.write().await;
            if !snapshot.set_lora(name, active, strength) {
                return false;
            }
            snapshot.loras.clone()
        };
        if let Err(e) = store_loras(self.store.as_ref(), &loras) {
            tracing::error!(error = %e, "Failed to persist LoRA preferences");
        }
        true
    }
}
