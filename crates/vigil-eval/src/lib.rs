//! Scoring of produced review results against curated ground truth.
//!
//! Predictions match ground-truth issues under tolerant positional rules
//! (same file and category, line ranges within a fixed slack), one-to-one,
//! greedy by predicted confidence. Aggregates into recall / precision / F1
//! plus a confidence-calibration signal.

pub mod fixtures;
pub mod matching;

pub use fixtures::{load_ground_truth, load_predictions, PredictionSet};
pub use matching::{score, GroundTruthIssue, MatchResult, ScoredEval, LINE_TOLERANCE};
