//! Ensemble scoring: blend the rule score with an optional classifier output.
//!
//! ruleScore  = clamp(Σ weight × normalized(feature), 0, 1)
//! finalScore = clamp(ml_weight × p + (1 − ml_weight) × ruleScore, 0, 1)   (ML available)
//!            = ruleScore                                                (fallback)
//!
//! The level/classification mapping always goes through the shared
//! [`RiskThresholds`] table, so single and batch paths classify identically.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::features::FeatureVector;
use super::weights::{RiskThresholds, WeightTable};
use crate::classifier::ClassifierOutput;

pub const TOO_SHORT_CLASSIFICATION: &str = "too_short";

/// ML probability above which the explanation calls out the classifier.
const ML_CALLOUT_PROBABILITY: f32 = 0.6;
/// Max bullet points in the explanation text.
const MAX_EXPLANATION_POINTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 5] = [
        RiskLevel::Safe,
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ];

    pub fn classification(self) -> &'static str {
        match self {
            RiskLevel::Critical => "scam",
            RiskLevel::High => "phishing",
            RiskLevel::Medium => "suspicious",
            RiskLevel::Low => "questionable",
            RiskLevel::Safe => "legitimate",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RiskLevel::Critical => "CRITICAL RISK",
            RiskLevel::High => "HIGH RISK",
            RiskLevel::Medium => "MEDIUM RISK",
            RiskLevel::Low => "LOW RISK",
            RiskLevel::Safe => "SAFE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    MlEnsemble,
    RuleFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub risk_score: f32,
    pub risk_level: RiskLevel,
    pub classification: String,
    pub confidence: f32,
    pub explanation: String,
    pub contributing_factors: Vec<String>,
    pub mode: ScoringMode,
    pub rule_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ml_probability: Option<f32>,
    /// Per-call id stamped by the engine; `None` straight out of the scorer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<String>,
    /// Wall time from extraction to result, stamped by the engine.
    #[serde(default)]
    pub processing_time_ms: f64,
}

impl ScoreResult {
    /// Short-circuit result for text below the minimum length. Neither the
    /// classifier nor the rule engine has looked at it.
    pub fn too_short(min_length: usize) -> Self {
        Self {
            risk_score: 0.0,
            risk_level: RiskLevel::Low,
            classification: TOO_SHORT_CLASSIFICATION.to_string(),
            confidence: 0.0,
            explanation: format!(
                "Message too short to analyze (minimum {min_length} characters)."
            ),
            contributing_factors: Vec::new(),
            mode: ScoringMode::RuleFallback,
            rule_score: 0.0,
            ml_probability: None,
            scan_id: None,
            processing_time_ms: 0.0,
        }
    }

    pub fn is_too_short(&self) -> bool {
        self.classification == TOO_SHORT_CLASSIFICATION
    }
}

/// Numeric policy of the scorer. Defaults are the canonical table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    /// Weight of the classifier probability in the blend; rules get the rest.
    pub ml_weight: f32,
    /// Confidence reported when no classifier output was available.
    pub fallback_confidence: f32,
    /// Count features are divided by this before weighting.
    pub count_cap: f32,
    /// Contributions at or below this are not reported as factors.
    pub noise_threshold: f32,
    pub max_factors: usize,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            ml_weight: 0.7,
            fallback_confidence: 0.65,
            count_cap: 10.0,
            noise_threshold: 0.1,
            max_factors: 5,
        }
    }
}

/// One feature's signed share of the rule score.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub feature: String,
    pub value: f32,
}

#[derive(Debug, Clone)]
pub struct EnsembleScorer {
    weights: WeightTable,
    thresholds: RiskThresholds,
    policy: ScoringPolicy,
}

impl EnsembleScorer {
    pub fn new(weights: WeightTable, thresholds: RiskThresholds, policy: ScoringPolicy) -> Self {
        let thresholds = if thresholds.is_valid() {
            thresholds
        } else {
            RiskThresholds::default()
        };
        Self {
            weights,
            thresholds,
            policy,
        }
    }

    pub fn thresholds(&self) -> &RiskThresholds {
        &self.thresholds
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Per-feature contributions for every weighted feature that is present
    /// and non-zero, in feature-name order.
    pub fn contributions(&self, features: &FeatureVector) -> Vec<Contribution> {
        self.weights
            .iter()
            .filter_map(|(name, weight)| {
                let v = features.get(name)?.normalized(self.policy.count_cap);
                let c = weight * v;
                (c != 0.0).then(|| Contribution {
                    feature: name.to_string(),
                    value: c,
                })
            })
            .collect()
    }

    pub fn rule_score(&self, features: &FeatureVector) -> f32 {
        let sum: f32 = self.contributions(features).iter().map(|c| c.value).sum();
        clamp01(sum)
    }

    pub fn score(&self, features: &FeatureVector, classifier: Option<ClassifierOutput>) -> ScoreResult {
        let contributions = self.contributions(features);
        let rule_score = clamp01(contributions.iter().map(|c| c.value).sum());

        let (risk_score, mode, confidence, ml_probability) = match classifier {
            Some(out) => {
                let w = self.policy.ml_weight.clamp(0.0, 1.0);
                let p = clamp01(out.probability);
                (
                    clamp01(w * p + (1.0 - w) * rule_score),
                    ScoringMode::MlEnsemble,
                    clamp01(out.confidence),
                    Some(p),
                )
            }
            None => (
                rule_score,
                ScoringMode::RuleFallback,
                clamp01(self.policy.fallback_confidence),
                None,
            ),
        };

        let risk_level = self.thresholds.level_for(risk_score);
        let top = self.top_factors(contributions);
        let contributing_factors: Vec<String> = top.iter().map(|c| humanize(&c.feature)).collect();
        let explanation = explain(
            risk_level,
            mode,
            ml_probability,
            &contributing_factors,
            features,
        );

        ScoreResult {
            risk_score,
            risk_level,
            classification: risk_level.classification().to_string(),
            confidence,
            explanation,
            contributing_factors,
            mode,
            rule_score,
            ml_probability,
            scan_id: None,
            processing_time_ms: 0.0,
        }
    }

    /// Rank descending by contribution, ties broken by feature name, keep the
    /// ones above the noise threshold.
    fn top_factors(&self, mut contributions: Vec<Contribution>) -> Vec<Contribution> {
        contributions.retain(|c| c.value > self.policy.noise_threshold);
        contributions.sort_by(|a, b| {
            b.value
                .partial_cmp(&a.value)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.feature.cmp(&b.feature))
        });
        contributions.truncate(self.policy.max_factors);
        contributions
    }
}

impl Default for EnsembleScorer {
    fn default() -> Self {
        Self::new(
            WeightTable::default(),
            RiskThresholds::default(),
            ScoringPolicy::default(),
        )
    }
}

fn clamp01(x: f32) -> f32 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

/// `has_personal_keywords` → "Personal Info Requests"; unknown names are
/// title-cased.
pub fn humanize(feature: &str) -> String {
    let known = match feature {
        "has_personal_keywords" | "personal_keywords" => Some("Personal Info Requests"),
        "has_threats_keywords" | "threats_keywords" => Some("Threatening Language"),
        "has_urgency_keywords" | "urgency_keywords" => Some("Urgency Tactics"),
        "has_money_keywords" | "money_keywords" => Some("Money/Prize Claims"),
        "has_action_keywords" | "action_keywords" => Some("Call To Action"),
        "has_trust_keywords" | "trust_keywords" => Some("Authority Impersonation"),
        "suspicious_url_count" => Some("Suspicious URLs"),
        "has_urls" => Some("Contains Links"),
        "has_contact_info" => Some("Contact Details"),
        "sender_suspicious" => Some("Suspicious Sender"),
        "is_night_time" => Some("Sent At Night"),
        _ => None,
    };
    if let Some(k) = known {
        return k.to_string();
    }
    feature
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut cs = w.chars();
            match cs.next() {
                Some(f) => f.to_uppercase().chain(cs).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn explain(
    level: RiskLevel,
    mode: ScoringMode,
    ml_probability: Option<f32>,
    factors: &[String],
    features: &FeatureVector,
) -> String {
    let suffix = match mode {
        ScoringMode::RuleFallback => " (rule-based fallback)",
        ScoringMode::MlEnsemble => "",
    };
    if level == RiskLevel::Safe {
        return format!("Message appears safe{suffix}");
    }

    let mut parts: Vec<String> = Vec::new();
    if ml_probability.is_some_and(|p| p > ML_CALLOUT_PROBABILITY) {
        parts.push("ML classifier detected scam patterns".to_string());
    }
    parts.extend(factors.iter().take(3).cloned());
    if features.count("suspicious_url_count") > 0 {
        parts.push("Contains suspicious URLs".to_string());
    }
    if features.count("personal_keywords") > 0 {
        parts.push("Asks for personal information".to_string());
    }
    parts.truncate(MAX_EXPLANATION_POINTS);

    if parts.is_empty() {
        format!("{}{suffix}", level.label())
    } else {
        format!("{}: {}{suffix}", level.label(), parts.join(" • "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::features::{FeatureExtractor, MessageMetadata};

    fn fv(text: &str, sender: &str) -> FeatureVector {
        FeatureExtractor::default().extract(text, sender, &MessageMetadata::default())
    }

    #[test]
    fn fallback_uses_rule_score_and_fixed_confidence() {
        let s = EnsembleScorer::default();
        let f = fv("Your account is suspended. Verify your password now.", "");
        let r = s.score(&f, None);
        assert_eq!(r.mode, ScoringMode::RuleFallback);
        assert_eq!(r.confidence, 0.65);
        assert_eq!(r.risk_score, r.rule_score);
        assert!(r.ml_probability.is_none());
    }

    #[test]
    fn ensemble_blends_seventy_thirty() {
        let s = EnsembleScorer::default();
        let f = fv("lunch at noon tomorrow works for me", "");
        let rule = s.rule_score(&f);
        let r = s.score(
            &f,
            Some(ClassifierOutput {
                probability: 0.9,
                confidence: 0.8,
            }),
        );
        assert_eq!(r.mode, ScoringMode::MlEnsemble);
        assert!((r.risk_score - (0.7 * 0.9 + 0.3 * rule)).abs() < 1e-5);
        assert_eq!(r.confidence, 0.8);
        assert_eq!(r.ml_probability, Some(0.9));
    }

    #[test]
    fn prize_message_is_high_or_critical_without_ml() {
        let s = EnsembleScorer::default();
        let r = s.score(
            &fv("Congratulations! You've won $1,000,000! Click here now!", ""),
            None,
        );
        assert!(
            matches!(r.risk_level, RiskLevel::High | RiskLevel::Critical),
            "got {:?} ({})",
            r.risk_level,
            r.risk_score
        );
        assert!(r.contributing_factors.contains(&"Money/Prize Claims".to_string()));
        assert!(r.contributing_factors.contains(&"Call To Action".to_string()));
    }

    #[test]
    fn benign_message_is_safe() {
        let s = EnsembleScorer::default();
        let r = s.score(&fv("See you at the game on Sunday. Bring snacks.", ""), None);
        assert_eq!(r.risk_level, RiskLevel::Safe);
        assert_eq!(r.classification, "legitimate");
        assert!(r.explanation.starts_with("Message appears safe"));
        assert!(r.contributing_factors.is_empty());
    }

    #[test]
    fn all_caps_chatter_is_safe() {
        let s = EnsembleScorer::default();
        let f = fv("HEY JOHN LUNCH AT NOON TODAY OK", "");
        let r = s.score(&f, None);
        assert_eq!(r.risk_level, RiskLevel::Safe, "score {}", r.risk_score);
        assert!(!r.contributing_factors.contains(&"Uppercase Ratio".to_string()));
        let upper = s
            .contributions(&f)
            .into_iter()
            .find(|c| c.feature == "uppercase_ratio")
            .map(|c| c.value)
            .unwrap_or_default();
        assert!(upper <= 0.03, "uppercase share {upper}");
    }

    #[test]
    fn factor_ties_break_by_feature_name() {
        let weights = WeightTable::from_pairs([
            ("has_urls", 0.4),
            ("has_action_keywords", 0.4),
            ("has_money_keywords", 0.4),
        ]);
        let policy = ScoringPolicy {
            max_factors: 2,
            ..Default::default()
        };
        let s = EnsembleScorer::new(weights, RiskThresholds::default(), policy);
        let r = s.score(&fv("click for free cash at https://example.com", ""), None);
        assert_eq!(
            r.contributing_factors,
            vec!["Call To Action".to_string(), "Money/Prize Claims".to_string()]
        );
    }

    #[test]
    fn noise_threshold_filters_small_contributions() {
        let s = EnsembleScorer::default();
        // exclamation_count 2 → 0.2 × 0.2 = 0.04, below noise
        let r = s.score(&fv("Hello!! How are you", ""), None);
        assert!(!r.contributing_factors.iter().any(|f| f == "Exclamation Count"));
    }

    #[test]
    fn protective_weights_never_push_below_zero() {
        let s = EnsembleScorer::default();
        let r = s.score(
            &fv("Thanks for the notes. The meeting moved to Tuesday. Regards.", "jane@example.com"),
            None,
        );
        assert!(r.risk_score >= 0.0);
        assert_eq!(r.risk_level, RiskLevel::Safe);
    }

    #[test]
    fn invalid_thresholds_fall_back_to_defaults() {
        let bad = RiskThresholds {
            low: 0.5,
            medium: 0.4,
            high: 0.6,
            critical: 0.8,
        };
        let s = EnsembleScorer::new(WeightTable::default(), bad, ScoringPolicy::default());
        assert_eq!(*s.thresholds(), RiskThresholds::default());
    }

    #[test]
    fn humanize_falls_back_to_title_case() {
        assert_eq!(humanize("uppercase_ratio"), "Uppercase Ratio");
        assert_eq!(humanize("suspicious_url_count"), "Suspicious URLs");
    }

    #[test]
    fn too_short_result_shape() {
        let r = ScoreResult::too_short(3);
        assert!(r.is_too_short());
        assert_eq!(r.risk_level, RiskLevel::Low);
        assert_eq!(r.risk_score, 0.0);
    }
}
