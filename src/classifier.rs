//! Classifier port: provider abstraction over the black-box ML model.
//!
//! The engine only ever sees `predict(text) -> (probability, confidence)`.
//! Getting a usable handle is a separate, possibly slow step (`ClassifierLoader`)
//! owned by the lifecycle manager.
//!
//! Providers:
//! * `http`: hosted inference endpoint (Hugging Face style). Loading does a
//!   warm-up prediction and waits out "model is loading" replies.
//! * `mock`: fixed output, for local runs and tests.
//! * `disabled`: loading always fails; the engine stays in rule fallback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

/// Probability that the text is a scam plus the model's own confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifierOutput {
    pub probability: f32,
    pub confidence: f32,
}

/// A loaded, ready-to-use classifier.
#[async_trait]
pub trait ClassifierPort: Send + Sync {
    async fn predict(&self, text: &str) -> anyhow::Result<ClassifierOutput>;
    /// Provider name for diagnostics.
    fn name(&self) -> &'static str;
}

pub type ClassifierHandle = Arc<dyn ClassifierPort>;

/// Produces a classifier handle. May be slow; always run under a timeout.
#[async_trait]
pub trait ClassifierLoader: Send + Sync {
    async fn load(&self) -> anyhow::Result<ClassifierHandle>;
    fn name(&self) -> &'static str;
}

pub type DynLoader = Arc<dyn ClassifierLoader>;

/// `[classifier]` section of the engine config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    /// "http" | "mock" | "disabled" (case-insensitive)
    pub provider: String,
    pub endpoint: Option<String>,
    /// Env var holding the bearer token for the endpoint.
    pub token_env: String,
    /// Output label that means "scam".
    pub scam_label: String,
    pub request_timeout_secs: u64,
    pub mock_probability: f32,
    pub mock_confidence: f32,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            endpoint: None,
            token_env: "HF_TOKEN".to_string(),
            scam_label: "LABEL_1".to_string(),
            request_timeout_secs: 10,
            mock_probability: 0.5,
            mock_confidence: 0.5,
        }
    }
}

/// Factory: build the loader named by `settings.provider`. Unknown providers
/// are treated as disabled.
pub fn build_loader(settings: &ClassifierSettings) -> DynLoader {
    match settings.provider.trim().to_ascii_lowercase().as_str() {
        "http" | "hf" | "huggingface" => Arc::new(HttpClassifierLoader::new(settings.clone())),
        "mock" => Arc::new(StaticLoader::new(Arc::new(MockClassifier::new(
            settings.mock_probability,
            settings.mock_confidence,
        )))),
        _ => Arc::new(DisabledLoader),
    }
}

// ------------------------------------------------------------
// Disabled + static/mock providers
// ------------------------------------------------------------

/// Loading always fails; used when no classifier is configured.
pub struct DisabledLoader;

#[async_trait]
impl ClassifierLoader for DisabledLoader {
    async fn load(&self) -> anyhow::Result<ClassifierHandle> {
        bail!("classifier disabled by configuration")
    }
    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Hands out an already-built classifier. Counts how often it was asked.
pub struct StaticLoader {
    handle: ClassifierHandle,
    loads: AtomicUsize,
}

impl StaticLoader {
    pub fn new(handle: ClassifierHandle) -> Self {
        Self {
            handle,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassifierLoader for StaticLoader {
    async fn load(&self) -> anyhow::Result<ClassifierHandle> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.handle.clone())
    }
    fn name(&self) -> &'static str {
        self.handle.name()
    }
}

/// Deterministic classifier returning a fixed output.
pub struct MockClassifier {
    fixed: ClassifierOutput,
    calls: AtomicUsize,
}

impl MockClassifier {
    pub fn new(probability: f32, confidence: f32) -> Self {
        Self {
            fixed: ClassifierOutput {
                probability: probability.clamp(0.0, 1.0),
                confidence: confidence.clamp(0.0, 1.0),
            },
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassifierPort for MockClassifier {
    async fn predict(&self, _text: &str) -> anyhow::Result<ClassifierOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.fixed)
    }
    fn name(&self) -> &'static str {
        "mock"
    }
}

// ------------------------------------------------------------
// Hosted inference endpoint
// ------------------------------------------------------------

const WARMUP_TEXT: &str = "Your parcel is waiting. Confirm delivery details at the link.";
/// Upper bound on a single "model is loading" back-off sleep.
const MAX_WARMUP_SLEEP: Duration = Duration::from_secs(10);

/// Outcome of one raw inference call.
enum RawReply {
    Output(ClassifierOutput),
    /// 503 while the remote model is still being loaded; carries the hint.
    Loading(Duration),
}

pub struct HttpClassifier {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    scam_label: String,
}

impl HttpClassifier {
    async fn call(&self, text: &str) -> anyhow::Result<RawReply> {
        #[derive(Serialize)]
        struct Req<'a> {
            inputs: &'a str,
        }

        let mut req = self.http.post(&self.endpoint).json(&Req { inputs: text });
        if let Some(t) = &self.token {
            req = req.bearer_auth(t);
        }
        let resp = req.send().await.context("classifier request failed")?;
        let status = resp.status();

        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            let body: Json = resp.json().await.unwrap_or(Json::Null);
            let secs = body
                .get("estimated_time")
                .and_then(Json::as_f64)
                .unwrap_or(2.0)
                .clamp(0.5, MAX_WARMUP_SLEEP.as_secs_f64());
            return Ok(RawReply::Loading(Duration::from_secs_f64(secs)));
        }
        if !status.is_success() {
            bail!("classifier endpoint returned HTTP {status}");
        }
        let body: Json = resp.json().await.context("classifier reply is not JSON")?;
        parse_label_scores(&body, &self.scam_label).map(RawReply::Output)
    }
}

#[async_trait]
impl ClassifierPort for HttpClassifier {
    async fn predict(&self, text: &str) -> anyhow::Result<ClassifierOutput> {
        match self.call(text).await? {
            RawReply::Output(o) => Ok(o),
            RawReply::Loading(_) => Err(anyhow!("remote model is reloading")),
        }
    }
    fn name(&self) -> &'static str {
        "http"
    }
}

pub struct HttpClassifierLoader {
    settings: ClassifierSettings,
}

impl HttpClassifierLoader {
    pub fn new(settings: ClassifierSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ClassifierLoader for HttpClassifierLoader {
    /// Builds the client and blocks until the endpoint returns a valid
    /// prediction. The caller's timeout bounds the whole warm-up.
    async fn load(&self) -> anyhow::Result<ClassifierHandle> {
        let endpoint = self
            .settings
            .endpoint
            .clone()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| anyhow!("classifier endpoint not configured"))?;
        let token = std::env::var(&self.settings.token_env)
            .ok()
            .filter(|t| !t.is_empty());
        let http = reqwest::Client::builder()
            .user_agent("scam-risk-engine/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(self.settings.request_timeout_secs.max(1)))
            .build()
            .context("building HTTP client")?;

        let clf = HttpClassifier {
            http,
            endpoint,
            token,
            scam_label: self.settings.scam_label.clone(),
        };

        loop {
            match clf.call(WARMUP_TEXT).await? {
                RawReply::Output(o) => {
                    info!(target: "model", probability = o.probability, "classifier warm-up ok");
                    break;
                }
                RawReply::Loading(wait) => {
                    debug!(target: "model", wait_ms = wait.as_millis() as u64, "remote model still loading");
                    tokio::time::sleep(wait).await;
                }
            }
        }
        Ok(Arc::new(clf))
    }
    fn name(&self) -> &'static str {
        "http"
    }
}

/// Accepts `[{label, score}, ..]` or `[[{label, score}, ..]]`.
/// Probability is the score of `scam_label`; confidence is the top score.
pub fn parse_label_scores(body: &Json, scam_label: &str) -> anyhow::Result<ClassifierOutput> {
    let arr = body
        .as_array()
        .ok_or_else(|| anyhow!("unexpected classifier reply shape"))?;
    let rows = match arr.first() {
        Some(Json::Array(inner)) => inner.as_slice(),
        _ => arr.as_slice(),
    };

    let mut probability = None;
    let mut confidence: f32 = 0.0;
    for row in rows {
        let label = row.get("label").and_then(Json::as_str).unwrap_or_default();
        let Some(score) = row.get("score").and_then(Json::as_f64) else {
            continue;
        };
        let score = (score as f32).clamp(0.0, 1.0);
        confidence = confidence.max(score);
        if label.eq_ignore_ascii_case(scam_label) {
            probability = Some(score);
        }
    }
    let probability =
        probability.ok_or_else(|| anyhow!("label `{scam_label}` missing from classifier reply"))?;
    Ok(ClassifierOutput {
        probability,
        confidence,
    })
}
