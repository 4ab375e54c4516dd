use std::sync::Arc;
use std::time::Instant;

use shuttle_axum::axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::analyze::scoring::ScoreResult;
use crate::batch::{BatchItem, BatchResult};
use crate::engine::{DetectionEngine, ScanInput};
use crate::error::ScanError;
use crate::gate::{AccessGate, AllowAll, GateDecision, TracingUsageSink, UsageRecord, UsageSink};
use crate::lifecycle::{ModelState, ModelStatus};

#[derive(Clone)]
pub struct AppState {
    pub engine: DetectionEngine,
    pub gate: Arc<dyn AccessGate>,
    pub usage: Arc<dyn UsageSink>,
}

impl AppState {
    /// Open gate, tracing usage log.
    pub fn new(engine: DetectionEngine) -> Self {
        Self {
            engine,
            gate: Arc::new(AllowAll),
            usage: Arc::new(TracingUsageSink),
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn AccessGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_usage(mut self, usage: Arc<dyn UsageSink>) -> Self {
        self.usage = usage;
        self
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/scan", post(scan))
        .route("/scan/batch", post(scan_batch))
        .route("/model/status", get(model_status))
        .route("/model/reinitialize", post(model_reinitialize))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Denied(GateDecision),
    Scan(ScanError),
    /// Body was not the expected JSON. Checked after the gate.
    BadBody(JsonRejection),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Denied(GateDecision::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Denied(_) => StatusCode::UNAUTHORIZED,
            ApiError::Scan(ScanError::BatchTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Scan(ScanError::TextTooLong { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::BadBody(r) => r.status(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Denied(GateDecision::RateLimited) => ErrorBody {
                error: "rate_limited",
                message: "request quota exhausted".to_string(),
            },
            ApiError::Denied(_) => ErrorBody {
                error: "unauthorized",
                message: "missing or invalid API key".to_string(),
            },
            ApiError::Scan(e) => ErrorBody {
                error: e.code(),
                message: e.to_string(),
            },
            ApiError::BadBody(r) => ErrorBody {
                error: "invalid_body",
                message: r.body_text(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// `X-API-Key: <key>` or `Authorization: Bearer <key>`.
fn credential(headers: &HeaderMap) -> Option<&str> {
    if let Some(k) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(k);
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
}

fn admit(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    match state.gate.check(credential(headers)) {
        GateDecision::Allowed { client } => Ok(client),
        denied => Err(ApiError::Denied(denied)),
    }
}

fn report(
    state: &AppState,
    client: String,
    endpoint: &'static str,
    items: usize,
    status: StatusCode,
    started: Instant,
) {
    state.usage.record(&UsageRecord {
        client,
        endpoint,
        items,
        status: status.as_u16(),
        elapsed_ms: started.elapsed().as_secs_f64() * 1_000.0,
    });
}

fn rejected(
    state: &AppState,
    client: String,
    endpoint: &'static str,
    rejection: JsonRejection,
    started: Instant,
) -> ApiError {
    let err = ApiError::BadBody(rejection);
    report(state, client, endpoint, 0, err.status(), started);
    err
}

async fn scan(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ScanInput>, JsonRejection>,
) -> Result<Json<ScoreResult>, ApiError> {
    let started = Instant::now();
    let client = admit(&state, &headers)?;
    let body = match body {
        Ok(Json(b)) => b,
        Err(r) => return Err(rejected(&state, client, "/scan", r, started)),
    };
    let res = state.engine.score_one(body).await.map_err(ApiError::Scan);
    let status = match &res {
        Ok(_) => StatusCode::OK,
        Err(e) => e.status(),
    };
    report(&state, client, "/scan", 1, status, started);
    res.map(Json)
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub messages: Vec<BatchItem>,
}

async fn scan_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Json<BatchResult>, ApiError> {
    let started = Instant::now();
    let client = admit(&state, &headers)?;
    let body = match body {
        Ok(Json(b)) => b,
        Err(r) => return Err(rejected(&state, client, "/scan/batch", r, started)),
    };
    let items = body.messages.len();
    let res = state
        .engine
        .score_batch(body.messages)
        .await
        .map_err(ApiError::Scan);
    let status = match &res {
        Ok(_) => StatusCode::OK,
        Err(e) => e.status(),
    };
    report(&state, client, "/scan/batch", items, status, started);
    res.map(Json)
}

async fn model_status(State(state): State<AppState>) -> Json<ModelStatus> {
    Json(state.engine.model_status())
}

#[derive(Debug, Serialize)]
struct ReinitResp {
    state: ModelState,
}

async fn model_reinitialize(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ReinitResp>, ApiError> {
    let started = Instant::now();
    let client = admit(&state, &headers)?;
    let new_state = state.engine.force_reinitialize();
    report(&state, client, "/model/reinitialize", 0, StatusCode::OK, started);
    Ok(Json(ReinitResp { state: new_state }))
}
