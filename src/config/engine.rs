// src/config/engine.rs
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::analyze::features::{FeatureExtractor, FeatureToggles};
use crate::analyze::scoring::{EnsembleScorer, ScoringPolicy};
use crate::analyze::weights::{RiskThresholds, WeightTable};
use crate::batch::BatchPolicy;
use crate::classifier::ClassifierSettings;
use crate::engine::EngineSettings;
use crate::lifecycle::LifecyclePolicy;

pub const ENV_CONFIG_PATH: &str = "SCAM_ENGINE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/engine.toml";

/// `[limits]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub min_length: usize,
    pub max_length: usize,
    pub predict_timeout_ms: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        let d = EngineSettings::default();
        Self {
            min_length: d.min_length,
            max_length: d.max_length,
            predict_timeout_ms: d.predict_timeout.as_millis() as u64,
        }
    }
}

/// `[lifecycle]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    pub load_timeout_secs: u64,
    pub retry_backoff_secs: u64,
    pub acquire_wait_ms: u64,
    /// Start loading the classifier at boot instead of on the first request.
    pub eager_load: bool,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        let d = LifecyclePolicy::default();
        Self {
            load_timeout_secs: d.load_timeout.as_secs(),
            retry_backoff_secs: d.retry_backoff.as_secs(),
            acquire_wait_ms: d.acquire_wait.as_millis() as u64,
            eager_load: true,
        }
    }
}

/// Whole engine configuration. Every section is optional in TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub scoring: ScoringPolicy,
    pub thresholds: RiskThresholds,
    /// Entries here are laid over the built-in table, not a replacement for it.
    #[serde(deserialize_with = "weights_over_defaults")]
    pub weights: WeightTable,
    pub limits: LimitsSection,
    pub lifecycle: LifecycleSection,
    pub batch: BatchPolicy,
    pub features: FeatureToggles,
    pub classifier: ClassifierSettings,
}

fn weights_over_defaults<'de, D>(d: D) -> Result<WeightTable, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = BTreeMap::<String, f32>::deserialize(d)?;
    let mut table = WeightTable::default();
    for (k, v) in overrides {
        table.set(&k, v);
    }
    Ok(table)
}

impl EngineConfig {
    /// File at `$SCAM_ENGINE_CONFIG` (or `config/engine.toml`), then `SCAM_*`
    /// env overrides, then sanitisation. A missing file means defaults.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_with(|k| std::env::var(k).ok())
    }

    /// Same as [`EngineConfig::load`] with an injectable env lookup.
    pub fn load_with<F>(env: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = env(ENV_CONFIG_PATH)
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut cfg = Self::from_path_or_default(&path)?;
        cfg.apply_env(&env);
        cfg.sanitize();
        Ok(cfg)
    }

    pub fn from_path_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            debug!(target: "engine", path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config at {}", path.display()))?;
        let cfg = Self::from_toml_str(&content)
            .with_context(|| format!("parsing engine config at {}", path.display()))?;
        info!(target: "engine", path = %path.display(), "engine config loaded");
        Ok(cfg)
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let cfg: EngineConfig = toml::from_str(s)?;
        Ok(cfg)
    }

    /// `SCAM_*` overrides. Unparseable values are ignored with a warning.
    pub fn apply_env<F>(&mut self, env: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env("SCAM_CLASSIFIER") {
            self.classifier.provider = v;
        }
        if let Some(v) = env("SCAM_CLASSIFIER_ENDPOINT") {
            self.classifier.endpoint = Some(v);
        }
        set_parsed(env, "SCAM_ML_WEIGHT", &mut self.scoring.ml_weight);
        set_parsed(env, "SCAM_FALLBACK_CONFIDENCE", &mut self.scoring.fallback_confidence);
        set_parsed(env, "SCAM_MAX_FACTORS", &mut self.scoring.max_factors);
        set_parsed(env, "SCAM_NOISE_THRESHOLD", &mut self.scoring.noise_threshold);
        set_parsed(env, "SCAM_MIN_LENGTH", &mut self.limits.min_length);
        set_parsed(env, "SCAM_MAX_LENGTH", &mut self.limits.max_length);
        set_parsed(env, "SCAM_PREDICT_TIMEOUT_MS", &mut self.limits.predict_timeout_ms);
        set_parsed(env, "SCAM_LOAD_TIMEOUT_SECS", &mut self.lifecycle.load_timeout_secs);
        set_parsed(env, "SCAM_RETRY_BACKOFF_SECS", &mut self.lifecycle.retry_backoff_secs);
        set_parsed(env, "SCAM_ACQUIRE_WAIT_MS", &mut self.lifecycle.acquire_wait_ms);
        set_parsed(env, "SCAM_EAGER_LOAD", &mut self.lifecycle.eager_load);
        set_parsed(env, "SCAM_BATCH_CAP", &mut self.batch.max_items);
        set_parsed(env, "SCAM_BATCH_CONCURRENCY", &mut self.batch.concurrency);

        if let Some(raw) = env("SCAM_RISK_THRESHOLDS") {
            match RiskThresholds::parse_list(&raw) {
                Some(t) => self.thresholds = t,
                None => warn!(target: "engine", value = %raw, "ignoring invalid SCAM_RISK_THRESHOLDS"),
            }
        }
        if let Some(raw) = env("SCAM_WEIGHTS") {
            self.weights.apply_overrides(&raw);
        }
    }

    /// Clamp numbers into usable ranges; invalid thresholds fall back to defaults.
    pub fn sanitize(&mut self) {
        let d = ScoringPolicy::default();
        let s = &mut self.scoring;
        s.ml_weight = unit_or(s.ml_weight, d.ml_weight);
        s.fallback_confidence = unit_or(s.fallback_confidence, d.fallback_confidence);
        s.noise_threshold = unit_or(s.noise_threshold, d.noise_threshold);
        if !s.count_cap.is_finite() || s.count_cap < 1.0 {
            s.count_cap = d.count_cap;
        }
        s.max_factors = s.max_factors.max(1);

        if !self.thresholds.is_valid() {
            warn!(target: "engine", thresholds = ?self.thresholds, "invalid risk thresholds, using defaults");
            self.thresholds = RiskThresholds::default();
        }

        self.limits.max_length = self.limits.max_length.max(self.limits.min_length).max(1);
        self.limits.predict_timeout_ms = self.limits.predict_timeout_ms.max(1);
        self.lifecycle.load_timeout_secs = self.lifecycle.load_timeout_secs.max(1);
        self.batch.max_items = self.batch.max_items.max(1);
        self.batch.concurrency = self.batch.concurrency.max(1);
        self.classifier.provider = self.classifier.provider.trim().to_ascii_lowercase();
    }

    pub fn scorer(&self) -> EnsembleScorer {
        EnsembleScorer::new(self.weights.clone(), self.thresholds, self.scoring.clone())
    }

    pub fn extractor(&self) -> FeatureExtractor {
        FeatureExtractor::new(self.features)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            min_length: self.limits.min_length,
            max_length: self.limits.max_length,
            predict_timeout: Duration::from_millis(self.limits.predict_timeout_ms),
        }
    }

    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            load_timeout: Duration::from_secs(self.lifecycle.load_timeout_secs),
            retry_backoff: Duration::from_secs(self.lifecycle.retry_backoff_secs),
            acquire_wait: Duration::from_millis(self.lifecycle.acquire_wait_ms),
        }
    }
}

fn set_parsed<F, T>(env: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = env(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => *slot = v,
        Err(_) => warn!(target: "engine", key, value = %raw, "ignoring unparseable env override"),
    }
}

fn unit_or(x: f32, fallback: f32) -> f32 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let m: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| m.get(k).cloned()
    }

    #[test]
    fn empty_toml_is_all_defaults() {
        let cfg = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.batch.max_items, 100);
        assert_eq!(cfg.lifecycle.retry_backoff_secs, 300);
        assert_eq!(cfg.lifecycle.load_timeout_secs, 120);
        assert_eq!(cfg.classifier.provider, "disabled");
    }

    #[test]
    fn weights_section_merges_over_defaults() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            [weights]
            has_urls = 0.5
            custom_signal = 0.2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.weights.get("has_urls"), Some(0.5));
        assert_eq!(cfg.weights.get("custom_signal"), Some(0.2));
        assert_eq!(cfg.weights.get("suspicious_url_count"), Some(0.9));
    }

    #[test]
    fn env_overrides_and_sanitize() {
        let mut cfg = EngineConfig::default();
        cfg.apply_env(&env_of(&[
            ("SCAM_ML_WEIGHT", "1.7"),
            ("SCAM_BATCH_CAP", "0"),
            ("SCAM_MIN_LENGTH", "nope"),
            ("SCAM_CLASSIFIER", " Mock "),
            ("SCAM_RISK_THRESHOLDS", "0.1,0.3,0.5,0.9"),
            ("SCAM_WEIGHTS", "has_urls=0.45"),
        ]));
        cfg.sanitize();
        assert_eq!(cfg.scoring.ml_weight, 1.0);
        assert_eq!(cfg.batch.max_items, 1);
        assert_eq!(cfg.limits.min_length, 3);
        assert_eq!(cfg.classifier.provider, "mock");
        assert_eq!(cfg.thresholds.critical, 0.9);
        assert_eq!(cfg.weights.get("has_urls"), Some(0.45));
    }

    #[test]
    fn bad_thresholds_in_file_are_replaced() {
        let mut cfg = EngineConfig::from_toml_str(
            r#"
            [thresholds]
            low = 0.6
            medium = 0.4
            high = 0.7
            critical = 0.9
            "#,
        )
        .unwrap();
        cfg.sanitize();
        assert_eq!(cfg.thresholds, RiskThresholds::default());
    }

    #[test]
    fn durations_follow_sections() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            [lifecycle]
            load_timeout_secs = 30
            acquire_wait_ms = 250

            [limits]
            predict_timeout_ms = 800
            "#,
        )
        .unwrap();
        let p = cfg.lifecycle_policy();
        assert_eq!(p.load_timeout, Duration::from_secs(30));
        assert_eq!(p.acquire_wait, Duration::from_millis(250));
        assert_eq!(p.retry_backoff, Duration::from_secs(300));
        assert_eq!(cfg.engine_settings().predict_timeout, Duration::from_millis(800));
    }

    #[test]
    fn missing_file_means_defaults() {
        let cfg = EngineConfig::load_with(env_of(&[(
            ENV_CONFIG_PATH,
            "/definitely/not/here/engine.toml",
        )]))
        .unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }
}
