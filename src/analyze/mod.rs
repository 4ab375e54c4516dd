// src/analyze/mod.rs
//! Scoring pipeline: lexicon tables, feature extraction, weights and the
//! ensemble scorer.

pub mod features;
pub mod lexicon;
pub mod scoring;
pub mod weights;

pub use features::{
    Channel, FeatureExtractor, FeatureToggles, FeatureValue, FeatureVector, MessageMetadata,
    FEATURE_VOCABULARY_VERSION,
};
pub use scoring::{EnsembleScorer, RiskLevel, ScoreResult, ScoringMode, ScoringPolicy};
pub use weights::{RiskThresholds, WeightTable, WEIGHT_TABLE_VERSION};
