// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod analyze;
pub mod api;
pub mod batch;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod metrics;

// ---- Re-exports for stable public API ----
pub use crate::analyze::{RiskLevel, ScoreResult, ScoringMode};
pub use crate::api::{create_router, AppState};
pub use crate::batch::{BatchItem, BatchResult, BatchSummary};
pub use crate::config::EngineConfig;
pub use crate::engine::{DetectionEngine, ScanInput};
pub use crate::error::ScanError;
pub use crate::lifecycle::{ModelState, ModelStatus};

use std::sync::Arc;

use axum::Router;
use once_cell::sync::OnceCell;
use tracing::{info, warn};

use crate::gate::{AccessGate, AllowAll, StaticKeyGate};
use crate::metrics::Metrics;

static METRICS: OnceCell<Metrics> = OnceCell::new();

/// Access gate from the environment: `SCAM_API_KEYS` (comma separated) turns
/// on key checks, `SCAM_API_DAILY_LIMIT` adds a per-key daily quota.
pub fn gate_from_env() -> Arc<dyn AccessGate> {
    let keys = std::env::var("SCAM_API_KEYS").unwrap_or_default();
    let daily_limit = std::env::var("SCAM_API_DAILY_LIMIT")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok());
    let gate = StaticKeyGate::from_list(&keys, daily_limit);
    if gate.is_empty() {
        return Arc::new(AllowAll);
    }
    info!(target: "engine", keys = gate.len(), "API key gate enabled");
    Arc::new(gate)
}

/// Build the full in-process app: engine from config, gate from env, and
/// `/metrics` unless `SCAM_METRICS=0`. Starts the classifier load in the
/// background when `lifecycle.eager_load` is set.
pub async fn app() -> anyhow::Result<Router> {
    let cfg = EngineConfig::load()?;
    let engine = DetectionEngine::from_config(&cfg);

    if cfg.lifecycle.eager_load {
        let warm = engine.clone();
        let wait = cfg.lifecycle_policy().load_timeout;
        tokio::spawn(async move {
            warm.warm_up(wait).await;
        });
    }

    let state = AppState::new(engine).with_gate(gate_from_env());
    let mut router = create_router(state);

    let metrics_on = std::env::var("SCAM_METRICS")
        .map(|v| v.trim() != "0")
        .unwrap_or(true);
    if metrics_on {
        match METRICS.get_or_try_init(Metrics::init) {
            Ok(m) => router = router.merge(m.router()),
            Err(e) => warn!(target: "engine", error = %e, "metrics disabled"),
        }
    }
    Ok(router)
}
