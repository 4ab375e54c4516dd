//! Deterministic feature extraction: `(text, sender, metadata) -> FeatureVector`.
//!
//! Pure and lock-free. All regexes are compiled once into immutable statics
//! (`lexicon.rs`), and nothing here reads the clock or the environment: the
//! temporal features come from caller-supplied metadata only, so the same input
//! always yields the same vector.

use chrono::{DateTime, Datelike, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;

use super::lexicon::{
    is_suspicious_host, url_host, COMPILED_CATEGORIES, CURRENCY_SYMBOLS, EMAIL_RE, NUMBER_RE,
    PHONE_RE, ROLE_SENDER_TERMS, URL_RE,
};

/// Version of the feature vocabulary (names + meaning). Weight tables are
/// written against a specific version.
pub const FEATURE_VOCABULARY_VERSION: u32 = 2;

/// Midday: a neutral hour that never counts as night time.
const NEUTRAL_HOUR: u8 = 12;

/// A single feature value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Count(u32),
    /// Always within [0, 1].
    Ratio(f32),
}

impl FeatureValue {
    /// Map to [0, 1] for weighting: booleans are 0/1, every numeric value
    /// (counts and ratios alike) is divided by `count_cap` and capped at 1.
    pub fn normalized(&self, count_cap: f32) -> f32 {
        let cap = if count_cap > 0.0 { count_cap } else { 10.0 };
        match *self {
            FeatureValue::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            FeatureValue::Count(n) => (n as f32 / cap).min(1.0),
            FeatureValue::Ratio(r) => (r.clamp(0.0, 1.0) / cap).min(1.0),
        }
    }

    pub fn is_active(&self) -> bool {
        match *self {
            FeatureValue::Bool(b) => b,
            FeatureValue::Count(n) => n > 0,
            FeatureValue::Ratio(r) => r > 0.0,
        }
    }
}

/// Channel the message arrived on. Categorical context, never weighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Email,
    Call,
    #[default]
    Unknown,
}

impl Channel {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sms" | "text" | "mms" => Channel::Sms,
            "email" | "mail" => Channel::Email,
            "call" | "voice" | "transcript" => Channel::Call,
            _ => Channel::Unknown,
        }
    }
}

/// Caller-supplied context. Every field is optional; missing values fall back
/// to neutral defaults at extraction time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_weekend: Option<bool>,
    /// RFC 3339 send time; used when `hour`/`is_weekend` are absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl MessageMetadata {
    /// Lenient reader for free-form JSON metadata. Unknown keys and values of
    /// the wrong type are ignored instead of rejected.
    pub fn from_json(v: &Json) -> Self {
        let Some(obj) = v.as_object() else {
            return Self::default();
        };
        let hour = obj.get("hour").and_then(|h| match h {
            Json::Number(n) => n.as_u64(),
            Json::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        });
        let is_weekend = obj.get("is_weekend").and_then(Json::as_bool);
        let timestamp = obj
            .get("timestamp")
            .and_then(Json::as_str)
            .map(str::to_string);
        let channel = ["channel", "type", "message_type"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Json::as_str))
            .map(str::to_string);
        Self {
            hour: hour.filter(|h| *h < 24).map(|h| h as u8),
            is_weekend,
            timestamp,
            channel,
        }
    }

    /// Resolved (hour, weekend). Explicit fields win over the timestamp.
    fn resolve_time(&self) -> (u8, bool) {
        let parsed = self
            .timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts.trim()).ok());
        let hour = self
            .hour
            .filter(|h| *h < 24)
            .or_else(|| parsed.map(|dt| dt.hour() as u8))
            .unwrap_or(NEUTRAL_HOUR);
        let weekend = self
            .is_weekend
            .or_else(|| parsed.map(|dt| matches!(dt.weekday(), Weekday::Sat | Weekday::Sun)))
            .unwrap_or(false);
        (hour, weekend)
    }
}

/// Which signal families are extracted. All on by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureToggles {
    pub lexical: bool,
    pub keywords: bool,
    pub structural: bool,
    pub linguistic: bool,
    pub sender: bool,
    pub contextual: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            lexical: true,
            keywords: true,
            structural: true,
            linguistic: true,
            sender: true,
            contextual: true,
        }
    }
}

/// Immutable named feature set produced by [`FeatureExtractor::extract`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    version: u32,
    channel: Channel,
    values: BTreeMap<String, FeatureValue>,
}

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<FeatureValue> {
        self.values.get(name).copied()
    }

    /// Count value of `name`, 0 when absent or not a count.
    pub fn count(&self, name: &str) -> u32 {
        match self.values.get(name) {
            Some(FeatureValue::Count(n)) => *n,
            _ => 0,
        }
    }

    pub fn flag(&self, name: &str) -> bool {
        self.values.get(name).is_some_and(|v| v.is_active())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FeatureValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

/// Accumulates values during extraction; frozen into a `FeatureVector`.
struct Builder(BTreeMap<String, FeatureValue>);

impl Builder {
    fn flag(&mut self, k: &str, v: bool) {
        self.0.insert(k.to_string(), FeatureValue::Bool(v));
    }
    fn count(&mut self, k: &str, v: usize) {
        let v = u32::try_from(v).unwrap_or(u32::MAX);
        self.0.insert(k.to_string(), FeatureValue::Count(v));
    }
    fn ratio(&mut self, k: &str, num: usize, den: usize) {
        let r = if den == 0 { 0.0 } else { num as f32 / den as f32 };
        self.0.insert(k.to_string(), FeatureValue::Ratio(r.clamp(0.0, 1.0)));
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureExtractor {
    toggles: FeatureToggles,
}

impl FeatureExtractor {
    pub fn new(toggles: FeatureToggles) -> Self {
        Self { toggles }
    }

    pub fn toggles(&self) -> FeatureToggles {
        self.toggles
    }

    /// Never fails. Safe to call from any number of tasks at once.
    pub fn extract(&self, text: &str, sender: &str, metadata: &MessageMetadata) -> FeatureVector {
        let lower = text.to_lowercase();
        let mut b = Builder(BTreeMap::new());
        let t = self.toggles;

        if t.lexical {
            lexical(&mut b, text);
        }
        if t.keywords {
            keywords(&mut b, &lower);
        }
        if t.structural {
            structural(&mut b, text);
        }
        if t.linguistic {
            linguistic(&mut b, text, &lower);
        }
        if t.sender {
            sender_features(&mut b, sender);
        }
        let channel = if t.contextual {
            contextual(&mut b, metadata);
            metadata
                .channel
                .as_deref()
                .map(Channel::parse)
                .unwrap_or_default()
        } else {
            Channel::Unknown
        };

        FeatureVector {
            version: FEATURE_VOCABULARY_VERSION,
            channel,
            values: b.0,
        }
    }
}

fn lexical(b: &mut Builder, text: &str) {
    let len = text.chars().count();
    let words: Vec<&str> = text.split_whitespace().collect();

    b.count("length", len);
    b.count("word_count", words.len());
    b.ratio(
        "uppercase_ratio",
        text.chars().filter(|c| c.is_uppercase()).count(),
        len,
    );
    b.ratio(
        "digit_ratio",
        text.chars().filter(|c| c.is_ascii_digit()).count(),
        len,
    );
    b.count(
        "punctuation_count",
        text.chars().filter(|c| "!@#$%^&*()".contains(*c)).count(),
    );
    b.count("exclamation_count", text.matches('!').count());
    b.count("question_count", text.matches('?').count());

    if !words.is_empty() {
        let total: usize = words.iter().map(|w| w.chars().count()).sum();
        b.count(
            "avg_word_length",
            (total as f32 / words.len() as f32).round() as usize,
        );
        b.ratio(
            "long_words_ratio",
            words.iter().filter(|w| w.chars().count() > 8).count(),
            words.len(),
        );
    }
    b.count(
        "caps_lock_words",
        words
            .iter()
            .filter(|w| {
                let letters: Vec<char> = w.chars().filter(|c| c.is_alphabetic()).collect();
                letters.len() > 2 && letters.iter().all(|c| c.is_uppercase())
            })
            .count(),
    );
}

fn keywords(b: &mut Builder, lower: &str) {
    for cat in COMPILED_CATEGORIES.iter() {
        let hits = cat.count_hits(lower);
        b.count(&format!("{}_keywords", cat.name), hits as usize);
        b.flag(&format!("has_{}_keywords", cat.name), hits > 0);
    }
}

fn structural(b: &mut Builder, text: &str) {
    let urls: Vec<&str> = URL_RE.find_iter(text).map(|m| m.as_str()).collect();
    let suspicious = urls
        .iter()
        .filter(|u| is_suspicious_host(&url_host(u)))
        .count();
    let phones = PHONE_RE.find_iter(text).count();
    let emails = EMAIL_RE.find_iter(text).count();

    b.count("url_count", urls.len());
    b.flag("has_urls", !urls.is_empty());
    b.count("suspicious_url_count", suspicious);
    b.count("phone_count", phones);
    b.count("email_count", emails);
    b.flag("has_contact_info", phones > 0 || emails > 0);
}

fn linguistic(b: &mut Builder, text: &str, lower: &str) {
    let sentences = text
        .split(['.', '!', '?'])
        .filter(|s| !s.trim().is_empty())
        .count();
    let words = text.split_whitespace().count();

    b.count("sentence_count", sentences);
    b.count(
        "avg_sentence_length",
        (words as f32 / sentences.max(1) as f32).round() as usize,
    );
    b.count("repeated_chars", repeated_runs(lower, 3));
    b.count("numbers_in_text", NUMBER_RE.find_iter(text).count());
    b.count(
        "currency_symbols",
        text.chars().filter(|c| CURRENCY_SYMBOLS.contains(c)).count(),
    );
}

/// Number of runs where the same character repeats at least `min_run` times.
fn repeated_runs(s: &str, min_run: usize) -> usize {
    let mut runs = 0;
    let mut prev: Option<char> = None;
    let mut len = 0usize;
    for c in s.chars() {
        if Some(c) == prev {
            len += 1;
        } else {
            if len >= min_run {
                runs += 1;
            }
            prev = Some(c);
            len = 1;
        }
    }
    if len >= min_run {
        runs += 1;
    }
    runs
}

fn sender_features(b: &mut Builder, sender: &str) {
    let sender = sender.trim();
    b.flag("sender_present", !sender.is_empty());
    if sender.is_empty() {
        return;
    }
    let lower = sender.to_lowercase();
    let stripped: String = sender
        .chars()
        .filter(|c| !matches!(c, '-' | ' ' | '(' | ')' | '+' | '.'))
        .collect();

    b.count("sender_length", sender.chars().count());
    b.flag(
        "sender_has_numbers",
        sender.chars().any(|c| c.is_ascii_digit()),
    );
    b.flag(
        "sender_suspicious",
        ROLE_SENDER_TERMS.iter().any(|t| lower.contains(t)),
    );
    b.flag(
        "sender_is_email",
        EMAIL_RE
            .find(sender)
            .is_some_and(|m| m.start() == 0 && m.end() == sender.len()),
    );
    b.flag(
        "sender_is_phone",
        !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()),
    );
}

fn contextual(b: &mut Builder, metadata: &MessageMetadata) {
    let (hour, weekend) = metadata.resolve_time();
    b.count("time_of_day", hour as usize);
    b.flag("is_weekend", weekend);
    b.flag("is_night_time", !(6..=22).contains(&hour));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extract(text: &str, sender: &str) -> FeatureVector {
        FeatureExtractor::default().extract(text, sender, &MessageMetadata::default())
    }

    #[test]
    fn keyword_counts_and_flags_are_paired() {
        let fv = extract("URGENT: verify your password immediately", "");
        assert_eq!(fv.count("urgency_keywords"), 2);
        assert!(fv.flag("has_urgency_keywords"));
        assert_eq!(fv.count("personal_keywords"), 1);
        assert!(fv.flag("has_trust_keywords"));
        assert!(!fv.flag("has_money_keywords"));
        assert_eq!(fv.get("has_money_keywords"), Some(FeatureValue::Bool(false)));
    }

    #[test]
    fn suspicious_urls_are_counted_separately() {
        let fv = extract(
            "see https://bit.ly/x1 and https://example.org/docs and www.secure-bank-update.com",
            "",
        );
        assert_eq!(fv.count("url_count"), 3);
        assert_eq!(fv.count("suspicious_url_count"), 2);
        assert!(fv.flag("has_urls"));
    }

    #[test]
    fn contact_info_detected() {
        let fv = extract("Call 555-123-4567 or write help@example.com", "");
        assert_eq!(fv.count("phone_count"), 1);
        assert_eq!(fv.count("email_count"), 1);
        assert!(fv.flag("has_contact_info"));
    }

    #[test]
    fn sender_heuristics() {
        let fv = extract("hello there", "noreply@bank-alerts.com");
        assert!(fv.flag("sender_suspicious"));
        assert!(fv.flag("sender_is_email"));
        assert!(!fv.flag("sender_is_phone"));

        let fv = extract("hello there", "+1 (555) 010-9999");
        assert!(fv.flag("sender_is_phone"));
        assert!(fv.flag("sender_has_numbers"));

        let fv = extract("hello there", "");
        assert_eq!(fv.get("sender_present"), Some(FeatureValue::Bool(false)));
        assert!(fv.get("sender_suspicious").is_none());
    }

    #[test]
    fn missing_metadata_is_neutral() {
        let fv = extract("hello there", "");
        assert_eq!(fv.count("time_of_day"), 12);
        assert!(!fv.flag("is_night_time"));
        assert!(!fv.flag("is_weekend"));
        assert_eq!(fv.channel(), Channel::Unknown);
    }

    #[test]
    fn timestamp_metadata_drives_temporal_features() {
        // 2024-06-08 is a Saturday.
        let md = MessageMetadata::from_json(&json!({
            "timestamp": "2024-06-08T03:15:00+00:00",
            "type": "SMS",
            "unknown_field": [1, 2, 3]
        }));
        let fv = FeatureExtractor::default().extract("hello there", "", &md);
        assert_eq!(fv.count("time_of_day"), 3);
        assert!(fv.flag("is_night_time"));
        assert!(fv.flag("is_weekend"));
        assert_eq!(fv.channel(), Channel::Sms);

        // explicit fields win over the timestamp
        let md = MessageMetadata::from_json(&json!({
            "timestamp": "2024-06-08T03:15:00+00:00",
            "hour": 14,
            "is_weekend": false
        }));
        let fv = FeatureExtractor::default().extract("hello there", "", &md);
        assert_eq!(fv.count("time_of_day"), 14);
        assert!(!fv.flag("is_night_time"));
        assert!(!fv.flag("is_weekend"));
    }

    #[test]
    fn out_of_range_or_malformed_hour_is_ignored() {
        let md = MessageMetadata::from_json(&json!({ "hour": 99 }));
        assert_eq!(md.hour, None);
        let md = MessageMetadata::from_json(&json!({ "hour": "23" }));
        assert_eq!(md.hour, Some(23));
        let md = MessageMetadata::from_json(&json!("not an object"));
        assert_eq!(md, MessageMetadata::default());
    }

    #[test]
    fn disabled_families_emit_nothing() {
        let toggles = FeatureToggles {
            keywords: false,
            structural: false,
            ..Default::default()
        };
        let fv = FeatureExtractor::new(toggles).extract(
            "urgent https://bit.ly/x",
            "",
            &MessageMetadata::default(),
        );
        assert!(fv.get("urgency_keywords").is_none());
        assert!(fv.get("suspicious_url_count").is_none());
        assert!(fv.get("length").is_some());
    }

    #[test]
    fn repeated_runs_counts_each_run_once() {
        assert_eq!(repeated_runs("heeeey!!! sooo", 3), 3);
        assert_eq!(repeated_runs("aa bb", 3), 0);
        assert_eq!(repeated_runs("", 3), 0);
    }

    #[test]
    fn extraction_is_deterministic() {
        let md = MessageMetadata {
            hour: Some(23),
            ..Default::default()
        };
        let ex = FeatureExtractor::default();
        let a = ex.extract("WIN a FREE prize!!! http://tinyurl.com/abc", "alert@x.io", &md);
        for _ in 0..10 {
            assert_eq!(a, ex.extract("WIN a FREE prize!!! http://tinyurl.com/abc", "alert@x.io", &md));
        }
    }

    #[test]
    fn ratios_stay_in_unit_interval() {
        let fv = extract("ABC123", "");
        match fv.get("uppercase_ratio") {
            Some(FeatureValue::Ratio(r)) => assert!((r - 0.5).abs() < 1e-6),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(FeatureValue::Count(25).normalized(10.0), 1.0);
        assert_eq!(FeatureValue::Count(3).normalized(10.0), 0.3);
        assert_eq!(FeatureValue::Bool(true).normalized(10.0), 1.0);
        assert!((FeatureValue::Ratio(0.8).normalized(10.0) - 0.08).abs() < 1e-6);
    }
}
