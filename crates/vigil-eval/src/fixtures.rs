//! JSON fixture loading for eval runs.

use std::path::Path;

use vigil_core::{Issue, ReviewResult, VigilError};

use crate::matching::GroundTruthIssue;

/// Predictions plus whatever run stats came with them.
#[derive(Debug, Clone)]
pub struct PredictionSet {
    pub issues: Vec<Issue>,
    pub cost_usd: f64,
    pub latency_seconds: f64,
}

/// Load a ground-truth issue list from a JSON file.
///
/// # Errors
///
/// Returns [`VigilError::Io`] if the file cannot be read and
/// [`VigilError::Serialization`] if it is not a ground-truth array.
pub fn load_ground_truth(path: &Path) -> Result<Vec<GroundTruthIssue>, VigilError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Load predictions from a JSON file.
///
/// Accepts either a full `review.json` artifact (the run stats ride along
/// into the eval result) or a bare issue array.
///
/// # Errors
///
/// Returns [`VigilError::Io`] if the file cannot be read and
/// [`VigilError::Serialization`] if it is neither shape.
pub fn load_predictions(path: &Path) -> Result<PredictionSet, VigilError> {
    let content = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    if value.is_array() {
        let issues: Vec<Issue> = serde_json::from_value(value)?;
        return Ok(PredictionSet {
            issues,
            cost_usd: 0.0,
            latency_seconds: 0.0,
        });
    }
    let result: ReviewResult = serde_json::from_value(value)?;
    Ok(PredictionSet {
        issues: result.issues,
        cost_usd: result.stats.cost_usd,
        latency_seconds: result.stats.latency_seconds_e2e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_ground_truth_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truth.json");
        std::fs::write(
            &path,
            r#"[
                {"file": "a.py", "line_start": 10, "category": "bug", "severity": "high"},
                {"file": "b.py", "line_start": 3, "line_end": 6, "category": "security"}
            ]"#,
        )
        .unwrap();

        let truth = load_ground_truth(&path).unwrap();
        assert_eq!(truth.len(), 2);
        assert_eq!(truth[0].file, "a.py");
        assert_eq!(truth[1].line_end, Some(6));
        assert!(truth[1].severity.is_none());
    }

    #[test]
    fn loads_bare_issue_array_as_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("predictions.json");
        std::fs::write(
            &path,
            r#"[{
                "file": "a.py", "line_start": 10, "severity": "high", "category": "bug",
                "description": "d", "suggestion": "s",
                "evidence_snippet": "a.py:L10-L10\nx",
                "dedupe_key": "a.py:10:bug:abcdef01",
                "confidence": 0.8, "language": "python"
            }]"#,
        )
        .unwrap();

        let predictions = load_predictions(&path).unwrap();
        assert_eq!(predictions.issues.len(), 1);
        assert_eq!(predictions.cost_usd, 0.0);
    }

    #[test]
    fn loads_review_artifact_with_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("review.json");
        std::fs::write(
            &path,
            r#"{
                "review_id": "0123456789abcdef",
                "status": "ok",
                "model_used": "gpt-4o",
                "issues": [],
                "stats": {"cost_usd": 0.02, "latency_seconds_e2e": 7.5}
            }"#,
        )
        .unwrap();

        let predictions = load_predictions(&path).unwrap();
        assert!(predictions.issues.is_empty());
        assert!((predictions.cost_usd - 0.02).abs() < 1e-9);
        assert!((predictions.latency_seconds - 7.5).abs() < 1e-9);
    }

    #[test]
    fn malformed_json_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        let err = load_predictions(&path).unwrap_err();
        assert!(matches!(err, VigilError::Serialization(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_ground_truth(Path::new("/nonexistent/truth.json")).unwrap_err();
        assert!(matches!(err, VigilError::Io(_)));
    }
}
