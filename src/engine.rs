//! Detection engine façade.
//!
//! Ties extractor, scorer, classifier lifecycle and batch coordinator together
//! behind four operations: `score_one`, `score_batch`, `model_status`,
//! `force_reinitialize`. Cheap to clone; clones share all state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::analyze::features::{FeatureExtractor, MessageMetadata};
use crate::analyze::scoring::{EnsembleScorer, ScoreResult, ScoringMode};
use crate::batch::{BatchCoordinator, BatchItem, BatchResult};
use crate::classifier::{build_loader, ClassifierHandle, ClassifierOutput, DynLoader};
use crate::config::EngineConfig;
use crate::error::ScanError;
use crate::lifecycle::{ModelLifecycleManager, ModelState, ModelStatus};

/// Text limits and the per-call classifier deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Trimmed texts shorter than this (in chars) are not scored.
    pub min_length: usize,
    /// Texts longer than this (in chars) are rejected.
    pub max_length: usize,
    pub predict_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            min_length: 3,
            max_length: 5_000,
            predict_timeout: Duration::from_secs(2),
        }
    }
}

/// One message to score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanInput {
    pub text: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default, deserialize_with = "lenient_metadata")]
    pub metadata: MessageMetadata,
}

impl ScanInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Accept any JSON for `metadata`; unusable parts become neutral defaults.
pub(crate) fn lenient_metadata<'de, D>(d: D) -> Result<MessageMetadata, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Json>::deserialize(d)?;
    Ok(raw
        .map(|v| MessageMetadata::from_json(&v))
        .unwrap_or_default())
}

/// Short, non-reversible id for log lines. Raw text never hits the logs.
pub(crate) fn anon_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// The stateless half of the engine, shared with batch tasks.
pub struct ScoringCore {
    extractor: FeatureExtractor,
    scorer: EnsembleScorer,
    settings: EngineSettings,
    items_scored: AtomicU64,
    scan_seq: AtomicU64,
}

impl ScoringCore {
    pub fn new(extractor: FeatureExtractor, scorer: EnsembleScorer, settings: EngineSettings) -> Self {
        Self {
            extractor,
            scorer,
            settings,
            items_scored: AtomicU64::new(0),
            scan_seq: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn scorer(&self) -> &EnsembleScorer {
        &self.scorer
    }

    /// `Ok(Some(_))` is the too-short short circuit; `Ok(None)` means score it.
    pub fn check_length(&self, text: &str) -> Result<Option<ScoreResult>, ScanError> {
        let len = text.chars().count();
        if len > self.settings.max_length {
            return Err(ScanError::TextTooLong {
                len,
                max: self.settings.max_length,
            });
        }
        if text.trim().chars().count() < self.settings.min_length {
            counter!("scan_too_short_total").increment(1);
            let short = ScoreResult::too_short(self.settings.min_length);
            return Ok(Some(self.stamp(short, text, Instant::now())));
        }
        Ok(None)
    }

    /// `<anon_hash>-<seq>`: unique per core, never contains raw text.
    fn stamp(&self, mut result: ScoreResult, text: &str, started: Instant) -> ScoreResult {
        let seq = self.scan_seq.fetch_add(1, Ordering::Relaxed) + 1;
        result.scan_id = Some(format!("{}-{seq}", anon_hash(text)));
        result.processing_time_ms = started.elapsed().as_secs_f64() * 1_000.0;
        result
    }

    pub async fn score_item(
        &self,
        text: &str,
        sender: &str,
        metadata: &MessageMetadata,
        handle: Option<&ClassifierHandle>,
    ) -> Result<ScoreResult, ScanError> {
        if let Some(short) = self.check_length(text)? {
            return Ok(short);
        }
        Ok(self.score_checked(text, sender, metadata, handle).await)
    }

    async fn score_checked(
        &self,
        text: &str,
        sender: &str,
        metadata: &MessageMetadata,
        handle: Option<&ClassifierHandle>,
    ) -> ScoreResult {
        let started = Instant::now();
        let features = self.extractor.extract(text, sender, metadata);
        let ml = match handle {
            Some(h) => self.predict(h, text).await,
            None => None,
        };
        let result = self.stamp(self.scorer.score(&features, ml), text, started);

        self.items_scored.fetch_add(1, Ordering::Relaxed);
        let mode = match result.mode {
            ScoringMode::MlEnsemble => "ml_ensemble",
            ScoringMode::RuleFallback => "rule_fallback",
        };
        let elapsed_ms = result.processing_time_ms;
        counter!("scan_requests_total", "mode" => mode).increment(1);
        histogram!("scan_duration_ms").record(elapsed_ms);
        debug!(
            target: "engine",
            scan_id = result.scan_id.as_deref().unwrap_or_default(),
            mode,
            risk_score = result.risk_score,
            level = ?result.risk_level,
            elapsed_ms,
            "message scored"
        );
        result
    }

    /// Classifier call bounded by `predict_timeout`. Any failure means "no ML
    /// signal" for this call only.
    async fn predict(&self, handle: &ClassifierHandle, text: &str) -> Option<ClassifierOutput> {
        match tokio::time::timeout(self.settings.predict_timeout, handle.predict(text)).await {
            Ok(Ok(out)) => Some(out),
            Ok(Err(e)) => {
                counter!("classifier_predict_errors_total").increment(1);
                warn!(target: "engine", msg = %anon_hash(text), error = %e, "classifier predict failed");
                None
            }
            Err(_) => {
                counter!("classifier_predict_errors_total").increment(1);
                warn!(
                    target: "engine",
                    msg = %anon_hash(text),
                    timeout_ms = self.settings.predict_timeout.as_millis() as u64,
                    "classifier predict timed out"
                );
                None
            }
        }
    }
}

#[derive(Clone)]
pub struct DetectionEngine {
    core: Arc<ScoringCore>,
    lifecycle: Arc<ModelLifecycleManager>,
    batch: BatchCoordinator,
}

impl DetectionEngine {
    pub fn new(
        core: ScoringCore,
        lifecycle: Arc<ModelLifecycleManager>,
        batch: BatchCoordinator,
    ) -> Self {
        Self {
            core: Arc::new(core),
            lifecycle,
            batch,
        }
    }

    /// Engine with the classifier provider named in `cfg.classifier`.
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::with_loader(cfg, build_loader(&cfg.classifier))
    }

    /// Engine with an explicit loader; config still drives everything else.
    pub fn with_loader(cfg: &EngineConfig, loader: DynLoader) -> Self {
        let core = ScoringCore::new(cfg.extractor(), cfg.scorer(), cfg.engine_settings());
        let lifecycle = ModelLifecycleManager::new(loader, cfg.lifecycle_policy());
        Self::new(core, lifecycle, BatchCoordinator::new(cfg.batch))
    }

    pub fn core(&self) -> &ScoringCore {
        &self.core
    }

    pub fn lifecycle(&self) -> &Arc<ModelLifecycleManager> {
        &self.lifecycle
    }

    pub fn batch_cap(&self) -> usize {
        self.batch.policy().max_items
    }

    /// Messages that went through feature extraction and scoring.
    pub fn items_scored(&self) -> u64 {
        self.core.items_scored.load(Ordering::Relaxed)
    }

    pub async fn score_one(&self, input: ScanInput) -> Result<ScoreResult, ScanError> {
        if let Some(short) = self.core.check_length(&input.text)? {
            debug!(target: "engine", msg = %anon_hash(&input.text), "too short, not scored");
            return Ok(short);
        }
        let acquired = self.lifecycle.acquire().await;
        Ok(self
            .core
            .score_checked(
                &input.text,
                &input.sender,
                &input.metadata,
                acquired.handle.as_ref(),
            )
            .await)
    }

    /// Oversized batches are rejected before the classifier is even asked for.
    pub async fn score_batch(&self, items: Vec<BatchItem>) -> Result<BatchResult, ScanError> {
        self.batch.check_size(items.len())?;
        let acquired = self.lifecycle.acquire().await;
        self.batch
            .run(self.core.clone(), acquired.handle, items)
            .await
    }

    pub fn model_status(&self) -> ModelStatus {
        self.lifecycle.status()
    }

    pub fn force_reinitialize(&self) -> ModelState {
        self.lifecycle.force_reset()
    }

    /// Starts the classifier load eagerly and waits up to `wait` for it.
    pub async fn warm_up(&self, wait: Duration) -> ModelState {
        self.lifecycle.acquire().await;
        let state = self.lifecycle.wait_settled(wait).await;
        info!(target: "model", %state, "warm-up finished");
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_hash_is_short_and_stable() {
        let a = anon_hash("Your account is locked");
        assert_eq!(a.len(), 12);
        assert_eq!(a, anon_hash("Your account is locked"));
        assert_ne!(a, anon_hash("Your account is unlocked"));
    }

    #[test]
    fn scan_input_accepts_loose_metadata() {
        let input: ScanInput =
            serde_json::from_str(r#"{"text":"hello there","metadata":"not an object"}"#).unwrap();
        assert_eq!(input.metadata, MessageMetadata::default());
        assert_eq!(input.sender, "");

        let input: ScanInput =
            serde_json::from_str(r#"{"text":"x","metadata":{"hour":3,"type":"sms"}}"#).unwrap();
        assert_eq!(input.metadata.hour, Some(3));
        assert_eq!(input.metadata.channel.as_deref(), Some("sms"));
    }

    #[tokio::test]
    async fn results_carry_scan_id_and_timing() {
        let core = ScoringCore::new(
            FeatureExtractor::default(),
            EnsembleScorer::default(),
            EngineSettings::default(),
        );
        let md = MessageMetadata::default();
        let text = "Verify your password at bit.ly/reset";
        let a = core.score_item(text, "", &md, None).await.unwrap();
        let b = core.score_item(text, "", &md, None).await.unwrap();
        let short = core.score_item("ok", "", &md, None).await.unwrap();

        let id_a = a.scan_id.clone().expect("scan id");
        assert!(id_a.starts_with(&anon_hash(text)));
        assert!(!id_a.contains("password"));
        assert_ne!(a.scan_id, b.scan_id, "same text, distinct calls");
        assert!(short.scan_id.is_some());
        assert!(a.processing_time_ms >= 0.0 && a.processing_time_ms.is_finite());

        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["scan_id"], id_a.as_str());
        assert!(json["processing_time_ms"].is_number());
    }

    #[test]
    fn length_gate() {
        let core = ScoringCore::new(
            FeatureExtractor::default(),
            EnsembleScorer::default(),
            EngineSettings {
                max_length: 10,
                ..Default::default()
            },
        );
        assert!(core.check_length("  ok  ").unwrap().unwrap().is_too_short());
        assert!(core.check_length("hey").unwrap().is_none());
        assert_eq!(
            core.check_length("01234567890"),
            Err(ScanError::TextTooLong { len: 11, max: 10 })
        );
    }
}
