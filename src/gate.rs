//! Narrow seams to the outer service: "is this request permitted" and
//! "record this usage". The engine itself never looks at either.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allowed { client: String },
    Unauthorized,
    RateLimited,
}

impl GateDecision {
    pub fn is_permitted(&self) -> bool {
        matches!(self, GateDecision::Allowed { .. })
    }
}

pub trait AccessGate: Send + Sync {
    /// `credential` is the raw key from the request, if any.
    fn check(&self, credential: Option<&str>) -> GateDecision;
}

/// Lets everything through. Default when no keys are configured.
pub struct AllowAll;

impl AccessGate for AllowAll {
    fn check(&self, _credential: Option<&str>) -> GateDecision {
        GateDecision::Allowed {
            client: "anonymous".to_string(),
        }
    }
}

pub fn sha256_hex(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

struct DailyCount {
    day: NaiveDate,
    used: u64,
}

/// Static key set compared by SHA-256 digest; only digests are kept in
/// memory. Optional per-key daily quota, reset at UTC midnight.
pub struct StaticKeyGate {
    digests: Vec<String>,
    daily_limit: Option<u64>,
    usage: Mutex<HashMap<String, DailyCount>>,
}

impl StaticKeyGate {
    pub fn new<I, S>(keys: I, daily_limit: Option<u64>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let digests = keys
            .into_iter()
            .map(|k| k.as_ref().trim().to_string())
            .filter(|k| !k.is_empty())
            .map(|k| sha256_hex(&k))
            .collect();
        Self {
            digests,
            daily_limit: daily_limit.filter(|n| *n > 0),
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// Comma-separated raw keys, as in `SCAM_API_KEYS`.
    pub fn from_list(raw: &str, daily_limit: Option<u64>) -> Self {
        Self::new(raw.split(','), daily_limit)
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    fn take_quota(&self, digest: &str) -> bool {
        let Some(limit) = self.daily_limit else {
            return true;
        };
        let today = Utc::now().date_naive();
        let mut usage = self.usage.lock();
        let entry = usage.entry(digest.to_string()).or_insert(DailyCount {
            day: today,
            used: 0,
        });
        if entry.day != today {
            entry.day = today;
            entry.used = 0;
        }
        if entry.used >= limit {
            return false;
        }
        entry.used += 1;
        true
    }
}

impl AccessGate for StaticKeyGate {
    fn check(&self, credential: Option<&str>) -> GateDecision {
        let Some(key) = credential.map(str::trim).filter(|k| !k.is_empty()) else {
            return GateDecision::Unauthorized;
        };
        let digest = sha256_hex(key);
        if !self.digests.iter().any(|d| *d == digest) {
            return GateDecision::Unauthorized;
        }
        if !self.take_quota(&digest) {
            return GateDecision::RateLimited;
        }
        GateDecision::Allowed {
            client: digest[..12].to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub client: String,
    pub endpoint: &'static str,
    pub items: usize,
    pub status: u16,
    pub elapsed_ms: f64,
}

pub trait UsageSink: Send + Sync {
    fn record(&self, rec: &UsageRecord);
}

/// Usage log on the `usage` tracing target.
pub struct TracingUsageSink;

impl UsageSink for TracingUsageSink {
    fn record(&self, rec: &UsageRecord) {
        info!(
            target: "usage",
            client = %rec.client,
            endpoint = rec.endpoint,
            items = rec.items,
            status = rec.status,
            elapsed_ms = rec.elapsed_ms,
            "request served"
        );
    }
}
