use axum::{routing::get, Router};
use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static DESCRIBED: OnceCell<()> = OnceCell::new();

/// Register help text for every engine metric. Idempotent.
pub fn ensure_metrics_described() {
    DESCRIBED.get_or_init(|| {
        describe_counter!("scan_requests_total", "Messages scored, labelled by scoring mode.");
        describe_counter!("scan_too_short_total", "Messages short-circuited as too short.");
        describe_counter!("batch_rejected_total", "Batches rejected for exceeding the size cap.");
        describe_counter!("batch_item_errors_total", "Batch items that ended in an error slot.");
        describe_counter!("model_load_attempts_total", "Classifier load attempts started.");
        describe_counter!("model_load_failures_total", "Classifier loads that failed or timed out.");
        describe_counter!(
            "classifier_predict_errors_total",
            "Classifier predictions that failed or timed out."
        );
        describe_histogram!(
            "scan_duration_ms",
            Unit::Milliseconds,
            "Time spent scoring one message."
        );
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Fails if another recorder is
    /// already installed (e.g. a second call in the same process).
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("prometheus: install recorder: {e}"))?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Router exposing `/metrics` in the Prometheus text format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
