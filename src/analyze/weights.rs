//! Fixed rule weights and the shared risk-level threshold table.
//!
//! Both are plain data: loaded from `[weights]` / `[thresholds]` in
//! `config/engine.toml` (or the built-in defaults below) and consumed by every
//! scoring path, single and batch alike.
//!
//! TOML shape:
//! ```toml
//! [thresholds]
//! low = 0.2
//! medium = 0.4
//! high = 0.6
//! critical = 0.8
//!
//! [weights]
//! has_personal_keywords = 0.8
//! sender_is_email = -0.1
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::scoring::RiskLevel;

/// Version tag of the default weight table. Bump when the defaults change.
pub const WEIGHT_TABLE_VERSION: &str = "2024.1";

/// Feature name → weight. Positive weights mark risk indicators, negative
/// weights mark protective signals. Iteration order is the feature name, so
/// summation and ranking are reproducible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightTable(BTreeMap<String, f32>);

impl Default for WeightTable {
    fn default() -> Self {
        let mut m = BTreeMap::new();
        for (k, v) in [
            // high-risk indicators
            ("has_personal_keywords", 0.8),
            ("suspicious_url_count", 0.9),
            ("has_threats_keywords", 0.7),
            ("has_urgency_keywords", 0.6),
            ("sender_suspicious", 0.6),
            // medium-risk indicators
            ("has_money_keywords", 0.5),
            ("has_action_keywords", 0.4),
            ("has_urls", 0.4),
            ("has_trust_keywords", 0.3),
            ("has_contact_info", 0.3),
            // text pattern risks
            ("uppercase_ratio", 0.3),
            ("exclamation_count", 0.2),
            ("is_night_time", 0.2),
            ("repeated_chars", 0.1),
            // protective
            ("sender_is_email", -0.1),
            ("sentence_count", -0.05),
            ("avg_sentence_length", -0.05),
        ] {
            m.insert(k.to_string(), v);
        }
        Self(m)
    }
}

impl WeightTable {
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, f32)>,
        K: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn get(&self, feature: &str) -> Option<f32> {
        self.0.get(feature).copied()
    }

    /// Insert or replace one weight. Non-finite values are ignored.
    pub fn set(&mut self, feature: &str, weight: f32) {
        if weight.is_finite() {
            self.0.insert(feature.to_string(), weight);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse `"has_urls=0.5, sender_suspicious=0.7"` style overrides.
    /// Malformed pairs are skipped.
    pub fn apply_overrides(&mut self, raw: &str) {
        for pair in raw.split(',') {
            let Some((k, v)) = pair.split_once('=') else {
                continue;
            };
            let k = k.trim();
            if k.is_empty() {
                continue;
            }
            if let Ok(w) = v.trim().parse::<f32>() {
                self.set(k, w);
            }
        }
    }
}

/// Lower bounds of each non-safe risk level. Anything below `low` is Safe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub low: f32,
    pub medium: f32,
    pub high: f32,
    pub critical: f32,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            low: 0.2,
            medium: 0.4,
            high: 0.6,
            critical: 0.8,
        }
    }
}

impl RiskThresholds {
    /// Strictly increasing and inside (0, 1].
    pub fn is_valid(&self) -> bool {
        let b = [self.low, self.medium, self.high, self.critical];
        b.iter().all(|x| x.is_finite() && *x > 0.0 && *x <= 1.0) && b.windows(2).all(|w| w[0] < w[1])
    }

    /// Parse `"0.2,0.4,0.6,0.8"`. Returns `None` unless exactly four valid,
    /// strictly increasing bounds are given.
    pub fn parse_list(raw: &str) -> Option<Self> {
        let vals = raw
            .split(',')
            .map(|s| s.trim().parse::<f32>().ok())
            .collect::<Option<Vec<_>>>()?;
        let [low, medium, high, critical] = vals.as_slice() else {
            return None;
        };
        let t = Self {
            low: *low,
            medium: *medium,
            high: *high,
            critical: *critical,
        };
        t.is_valid().then_some(t)
    }

    /// The unique bucket containing `score`. Out-of-range input is clamped first.
    pub fn level_for(&self, score: f32) -> RiskLevel {
        let s = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        if s >= self.critical {
            RiskLevel::Critical
        } else if s >= self.high {
            RiskLevel::High
        } else if s >= self.medium {
            RiskLevel::Medium
        } else if s >= self.low {
            RiskLevel::Low
        } else {
            RiskLevel::Safe
        }
    }
}
