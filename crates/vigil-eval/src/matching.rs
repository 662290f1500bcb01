//! Tolerant one-to-one matching and metric aggregation.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use vigil_core::{Category, EvalResult, Issue, Severity};

/// Lines of slack added to each side of the predicted range when testing
/// overlap against a ground-truth range.
pub const LINE_TOLERANCE: u32 = 3;

/// One curated ground-truth issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthIssue {
    pub file: String,
    pub line_start: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_end: Option<u32>,
    pub category: Category,
    /// Expected severity; disagreement does not break a match, only counts
    /// toward the severity-mismatch signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub description: String,
}

impl GroundTruthIssue {
    fn line_range(&self) -> (u32, u32) {
        (self.line_start, self.line_end.unwrap_or(self.line_start))
    }
}

/// One prediction/ground-truth pairing the matcher settled on.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub predicted_index: usize,
    pub truth_index: usize,
    /// The severities disagree; the match still stands.
    pub severity_mismatch: bool,
}

/// Aggregate metrics plus the pairings behind them.
#[derive(Debug, Clone)]
pub struct ScoredEval {
    pub result: EvalResult,
    /// Settled pairings, ordered by predicted index.
    pub matches: Vec<MatchResult>,
    pub total_predicted: usize,
    pub total_truth: usize,
    pub severity_mismatches: usize,
}

/// Whether a prediction can match a ground-truth entry: same file, same
/// category, and the predicted range grown by [`LINE_TOLERANCE`] on each side
/// overlaps the ground-truth range.
///
/// # Examples
///
/// ```
/// use vigil_core::{Category, Issue, Language, Severity};
/// use vigil_eval::matching::{issue_matches, GroundTruthIssue};
///
/// let predicted = Issue {
///     file: "a.py".into(),
///     line_start: 10,
///     line_end: None,
///     severity: Severity::High,
///     category: Category::Bug,
///     description: "d".into(),
///     suggestion: "s".into(),
///     evidence_snippet: "a.py:L10-L10\nx".into(),
///     dedupe_key: "a.py:10:bug:abcdef01".into(),
///     confidence: 0.8,
///     language: Language::Python,
/// };
/// let near = GroundTruthIssue {
///     file: "a.py".into(),
///     line_start: 12,
///     line_end: None,
///     category: Category::Bug,
///     severity: None,
///     description: String::new(),
/// };
/// assert!(issue_matches(&predicted, &near));
/// ```
pub fn issue_matches(predicted: &Issue, truth: &GroundTruthIssue) -> bool {
    if predicted.file != truth.file || predicted.category != truth.category {
        return false;
    }
    let (predicted_start, predicted_end) = predicted.line_range();
    let (truth_start, truth_end) = truth.line_range();
    let low = predicted_start.saturating_sub(LINE_TOLERANCE);
    let high = predicted_end + LINE_TOLERANCE;
    low <= truth_end && truth_start <= high
}

/// Score a prediction set against ground truth.
///
/// Matching is one-to-one and greedy: predictions claim ground-truth entries
/// in order of descending confidence (original order breaks ties), and a
/// claimed entry leaves the pool. For a prediction with several eligible
/// entries, the earliest ground-truth entry wins, keeping the outcome
/// deterministic for identical inputs.
///
/// Calibration is the mean `|confidence - matched|` over all predictions,
/// where `matched` is 1 for matched predictions and 0 otherwise.
pub fn score(predicted: &[Issue], truth: &[GroundTruthIssue]) -> ScoredEval {
    let mut order: Vec<usize> = (0..predicted.len()).collect();
    order.sort_by(|&a, &b| {
        predicted[b]
            .confidence
            .partial_cmp(&predicted[a].confidence)
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });

    let mut truth_taken = vec![false; truth.len()];
    let mut predicted_matched = vec![false; predicted.len()];
    let mut matches = Vec::new();
    for &predicted_index in &order {
        let candidate = &predicted[predicted_index];
        let claimed = (0..truth.len())
            .find(|&ti| !truth_taken[ti] && issue_matches(candidate, &truth[ti]));
        if let Some(truth_index) = claimed {
            truth_taken[truth_index] = true;
            predicted_matched[predicted_index] = true;
            matches.push(MatchResult {
                predicted_index,
                truth_index,
                severity_mismatch: truth[truth_index]
                    .severity
                    .is_some_and(|s| s != candidate.severity),
            });
        }
    }
    matches.sort_by_key(|m| m.predicted_index);

    let matched = matches.len() as f64;
    let recall = if truth.is_empty() {
        0.0
    } else {
        matched / truth.len() as f64
    };
    let precision = if predicted.is_empty() {
        0.0
    } else {
        matched / predicted.len() as f64
    };
    let f1 = if recall + precision == 0.0 {
        0.0
    } else {
        2.0 * recall * precision / (recall + precision)
    };
    let avg_confidence_calibration = if predicted.is_empty() {
        0.0
    } else {
        predicted
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let indicator = if predicted_matched[i] { 1.0 } else { 0.0 };
                (p.confidence - indicator).abs()
            })
            .sum::<f64>()
            / predicted.len() as f64
    };
    let severity_mismatches = matches.iter().filter(|m| m.severity_mismatch).count();

    ScoredEval {
        result: EvalResult {
            schema_version: "v1".into(),
            recall,
            precision,
            f1,
            avg_confidence_calibration,
            cost_usd: 0.0,
            latency_seconds: 0.0,
        },
        matches,
        total_predicted: predicted.len(),
        total_truth: truth.len(),
        severity_mismatches,
    }
}
