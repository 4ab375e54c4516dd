use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Caller-facing input errors. Classifier trouble never shows up here; it
/// degrades to rule fallback instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("batch of {len} items exceeds the limit of {cap}")]
    BatchTooLarge { len: usize, cap: usize },

    #[error("text is {len} characters, the maximum is {max}")]
    TextTooLong { len: usize, max: usize },
}

impl ScanError {
    /// Stable machine-readable code for API bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            ScanError::BatchTooLarge { .. } => "batch_too_large",
            ScanError::TextTooLong { .. } => "text_too_long",
        }
    }
}

/// Why a single batch slot has no score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    MissingId,
    EmptyText,
    TextTooLong,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: ItemErrorKind,
    pub message: String,
}

impl ItemError {
    pub fn new(kind: ItemErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<ScanError> for ItemError {
    fn from(e: ScanError) -> Self {
        let kind = match e {
            ScanError::TextTooLong { .. } => ItemErrorKind::TextTooLong,
            ScanError::BatchTooLarge { .. } => ItemErrorKind::Internal,
        };
        Self::new(kind, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_and_codes() {
        let e = ScanError::BatchTooLarge { len: 101, cap: 100 };
        assert_eq!(e.code(), "batch_too_large");
        assert_eq!(e.to_string(), "batch of 101 items exceeds the limit of 100");

        let item: ItemError = ScanError::TextTooLong { len: 6000, max: 5000 }.into();
        assert_eq!(item.kind, ItemErrorKind::TextTooLong);
        assert!(item.message.contains("5000"));
    }

    #[test]
    fn item_error_kind_serializes_snake_case() {
        let s = serde_json::to_string(&ItemErrorKind::MissingId).unwrap();
        assert_eq!(s, "\"missing_id\"");
    }
}
