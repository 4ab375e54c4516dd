//! Batch scoring with per-item fault isolation.
//!
//! The whole batch is rejected before any work when it is over the cap.
//! Otherwise every item runs on its own tokio task (bounded by a semaphore)
//! against the same classifier handle. A failure in one slot (validation or
//! panic) is recorded there without touching the others. Output order is
//! input order.

use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::analyze::features::MessageMetadata;
use crate::analyze::scoring::{RiskLevel, ScoreResult};
use crate::classifier::ClassifierHandle;
use crate::engine::{lenient_metadata, ScoringCore};
use crate::error::{ItemError, ItemErrorKind, ScanError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchPolicy {
    /// Max items per batch; larger batches are rejected wholesale.
    pub max_items: usize,
    /// Items scored at the same time.
    pub concurrency: usize,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_items: 100,
            concurrency: 8,
        }
    }
}

/// One message in a batch. Every field is optional on the wire so a single
/// malformed entry does not fail deserialization of the whole list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default, deserialize_with = "lenient_metadata")]
    pub metadata: MessageMetadata,
}

impl BatchItem {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            text: text.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Scored(ScoreResult),
    Error(ItemError),
}

impl ItemOutcome {
    pub fn result(&self) -> Option<&ScoreResult> {
        match self {
            ItemOutcome::Scored(r) => Some(r),
            ItemOutcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ItemError> {
        match self {
            ItemOutcome::Scored(_) => None,
            ItemOutcome::Error(e) => Some(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchEntry {
    pub index: usize,
    pub id: Option<String>,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub safe: usize,
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub critical: usize,
    pub errors: usize,
    /// Mean `processing_time_ms` over scored items; 0 when none were scored.
    pub avg_processing_time_ms: f64,
}

impl BatchSummary {
    pub fn from_entries(entries: &[BatchEntry]) -> Self {
        let mut s = BatchSummary {
            total: entries.len(),
            ..Default::default()
        };
        let mut total_ms = 0.0;
        for e in entries {
            match &e.outcome {
                ItemOutcome::Scored(r) => {
                    total_ms += r.processing_time_ms;
                    match r.risk_level {
                        RiskLevel::Safe => s.safe += 1,
                        RiskLevel::Low => s.low += 1,
                        RiskLevel::Medium => s.medium += 1,
                        RiskLevel::High => s.high += 1,
                        RiskLevel::Critical => s.critical += 1,
                    }
                }
                ItemOutcome::Error(_) => s.errors += 1,
            }
        }
        let scored = s.total - s.errors;
        if scored > 0 {
            s.avg_processing_time_ms = total_ms / scored as f64;
        }
        s
    }

    pub fn count(&self, level: RiskLevel) -> usize {
        match level {
            RiskLevel::Safe => self.safe,
            RiskLevel::Low => self.low,
            RiskLevel::Medium => self.medium,
            RiskLevel::High => self.high,
            RiskLevel::Critical => self.critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub results: Vec<BatchEntry>,
    pub summary: BatchSummary,
}

#[derive(Debug, Clone)]
pub struct BatchCoordinator {
    policy: BatchPolicy,
}

impl BatchCoordinator {
    pub fn new(policy: BatchPolicy) -> Self {
        let policy = BatchPolicy {
            max_items: policy.max_items.max(1),
            concurrency: policy.concurrency.max(1),
        };
        Self { policy }
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.policy
    }

    /// Size gate. Runs before anything else touches the items.
    pub fn check_size(&self, len: usize) -> Result<(), ScanError> {
        if len > self.policy.max_items {
            counter!("batch_rejected_total").increment(1);
            warn!(target: "batch", len, cap = self.policy.max_items, "batch rejected");
            return Err(ScanError::BatchTooLarge {
                len,
                cap: self.policy.max_items,
            });
        }
        Ok(())
    }

    pub async fn run(
        &self,
        core: Arc<ScoringCore>,
        handle: Option<ClassifierHandle>,
        items: Vec<BatchItem>,
    ) -> Result<BatchResult, ScanError> {
        self.check_size(items.len())?;

        let total = items.len();
        let permits = Arc::new(Semaphore::new(self.policy.concurrency));
        let mut pending = Vec::with_capacity(total);

        for (index, item) in items.into_iter().enumerate() {
            let id = item.id.clone();
            if let Err(e) = validate(&item) {
                pending.push((index, id, Err(e)));
                continue;
            }
            let core = core.clone();
            let handle = handle.clone();
            let permits = permits.clone();
            let task = tokio::spawn(async move {
                // Closed semaphore is impossible here; score anyway if it happens.
                let _permit = permits.acquire_owned().await.ok();
                core.score_item(&item.text, &item.sender, &item.metadata, handle.as_ref())
                    .await
            });
            pending.push((index, id, Ok(task)));
        }

        let mut results = Vec::with_capacity(total);
        for (index, id, slot) in pending {
            let outcome = match slot {
                Err(e) => ItemOutcome::Error(e),
                Ok(task) => match task.await {
                    Ok(Ok(r)) => ItemOutcome::Scored(r),
                    Ok(Err(e)) => ItemOutcome::Error(e.into()),
                    Err(join) => {
                        warn!(target: "batch", index, error = %join, "item scoring panicked");
                        ItemOutcome::Error(ItemError::new(
                            ItemErrorKind::Internal,
                            "internal error while scoring item",
                        ))
                    }
                },
            };
            if let ItemOutcome::Error(e) = &outcome {
                counter!("batch_item_errors_total").increment(1);
                debug!(target: "batch", index, kind = ?e.kind, "item failed");
            }
            results.push(BatchEntry { index, id, outcome });
        }

        let summary = BatchSummary::from_entries(&results);
        info!(
            target: "batch",
            total = summary.total,
            errors = summary.errors,
            high = summary.high,
            critical = summary.critical,
            ml = handle.is_some(),
            "batch scored"
        );
        Ok(BatchResult { results, summary })
    }
}

fn validate(item: &BatchItem) -> Result<(), ItemError> {
    if item.id.as_deref().map_or(true, |id| id.trim().is_empty()) {
        return Err(ItemError::new(ItemErrorKind::MissingId, "item has no id"));
    }
    if item.text.trim().is_empty() {
        return Err(ItemError::new(ItemErrorKind::EmptyText, "item text is empty"));
    }
    Ok(())
}
