//! Fixed keyword tables and domain lists used by the feature extractor.
//!
//! These lists are the auditable part of the rule engine: changing them changes
//! the feature vocabulary's meaning, so bump `FEATURE_VOCABULARY_VERSION` in
//! `features.rs` alongside any edit.

use once_cell::sync::Lazy;
use regex::Regex;

/// Keyword category → phrases. Order matters only for feature emission order.
pub const KEYWORD_CATEGORIES: &[(&str, &[&str])] = &[
    (
        "urgency",
        &[
            "urgent",
            "urgently",
            "immediately",
            "immediate action",
            "expires",
            "expiring",
            "limited time",
            "act now",
            "hurry",
            "final notice",
            "last chance",
            "within 24 hours",
            "asap",
        ],
    ),
    (
        "money",
        &[
            "prize",
            "winner",
            "you won",
            "you've won",
            "you have won",
            "congratulations",
            "free",
            "cash",
            "reward",
            "million",
            "inheritance",
            "lottery",
            "gift card",
            "refund",
            "$",
            "£",
            "€",
        ],
    ),
    (
        "trust",
        &[
            "government",
            "bank",
            "official",
            "verify",
            "confirm",
            "security",
            "irs",
            "customer service",
        ],
    ),
    (
        "action",
        &[
            "click",
            "click here",
            "download",
            "install",
            "call now",
            "reply",
            "forward",
            "log in",
            "login",
            "sign in",
        ],
    ),
    (
        "threats",
        &[
            "suspended",
            "blocked",
            "fraud",
            "unauthorized",
            "violation",
            "penalty",
            "locked",
            "arrest",
            "legal action",
        ],
    ),
    (
        "personal",
        &[
            "ssn",
            "social security",
            "credit card",
            "password",
            "pin",
            "account number",
            "bank details",
            "date of birth",
            "cvv",
            "otp",
        ],
    ),
];

/// URL shorteners and known scam-domain patterns. Matched as host suffixes.
pub const SUSPICIOUS_DOMAINS: &[&str] = &[
    "bit.ly",
    "tinyurl.com",
    "goo.gl",
    "t.co",
    "ow.ly",
    "is.gd",
    "cutt.ly",
    "rb.gy",
    "secure-bank-update.com",
    "verify-account.net",
];

/// Host fragments that scam domains commonly embed (e.g. `paypal-verify-login.xyz`).
pub const SUSPICIOUS_HOST_FRAGMENTS: &[&str] = &["-verify", "verify-", "-secure", "secure-", "-login", "login-"];

/// Role-account terms that make a sender look automated or impersonated.
pub const ROLE_SENDER_TERMS: &[&str] = &["noreply", "no-reply", "donotreply", "alert", "security", "admin"];

pub const CURRENCY_SYMBOLS: &[char] = &['$', '£', '€'];

/// One compiled keyword. Word-like phrases match on boundaries; symbols match anywhere.
pub struct KeywordMatcher {
    pub phrase: &'static str,
    re: Option<Regex>,
}

impl KeywordMatcher {
    fn new(phrase: &'static str) -> Self {
        let wordish = phrase
            .chars()
            .all(|c| c.is_alphanumeric() || c == ' ' || c == '-');
        let re = if wordish {
            Regex::new(&format!(r"(?i)\b{}\b", regex::escape(phrase))).ok()
        } else {
            None
        };
        Self { phrase, re }
    }

    /// `text_lower` must already be lowercased.
    pub fn is_match(&self, text_lower: &str) -> bool {
        match &self.re {
            Some(re) => re.is_match(text_lower),
            None => text_lower.contains(self.phrase),
        }
    }
}

pub struct CompiledCategory {
    pub name: &'static str,
    pub keywords: Vec<KeywordMatcher>,
}

impl CompiledCategory {
    /// Number of distinct table entries present in the text.
    pub fn count_hits(&self, text_lower: &str) -> u32 {
        self.keywords.iter().filter(|k| k.is_match(text_lower)).count() as u32
    }
}

pub static COMPILED_CATEGORIES: Lazy<Vec<CompiledCategory>> = Lazy::new(|| {
    KEYWORD_CATEGORIES
        .iter()
        .map(|&(name, words)| CompiledCategory {
            name,
            keywords: words.iter().map(|&w| KeywordMatcher::new(w)).collect(),
        })
        .collect()
});

pub static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:https?://|www\.)[^\s<>]+").expect("url regex"));

pub static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("email regex")
});

pub static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+?1[-.\s]?)?\(?\b[0-9]{3}\)?[-.\s]?[0-9]{3}[-.\s]?[0-9]{4}\b").expect("phone regex")
});

pub static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("number regex"));

/// Host part of a URL match, lowercased, without port or credentials.
pub fn url_host(url: &str) -> String {
    let lower = url.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = authority.rsplit('@').next().unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    host.trim_end_matches('.').to_string()
}

pub fn is_suspicious_host(host: &str) -> bool {
    if host.is_empty() {
        return false;
    }
    let listed = SUSPICIOUS_DOMAINS
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{d}")));
    listed || SUSPICIOUS_HOST_FRAGMENTS.iter().any(|f| host.contains(f))
}
