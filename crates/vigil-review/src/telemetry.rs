//! Redacted per-run telemetry.
//!
//! The default record is counters and warnings only: no prompts, no
//! responses, no tokens or keys. The full result payload rides along only
//! when the operator explicitly opts in via `[output] full_payloads`.

use serde::{Deserialize, Serialize};
use vigil_core::ReviewResult;

/// Telemetry summary persisted as `telemetry.json` in the run artifact set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTelemetry {
    /// Artifact directory name, `{timestamp}_{review_id}`; unique per run.
    pub run_id: String,
    pub review_id: String,
    pub status: String,
    pub cost_usd: f64,
    pub tokens_used: u64,
    pub llm_calls: u32,
    pub tool_calls: u32,
    pub latency_seconds_e2e: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Full result payload, present only in explicit full-payload mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payloads: Option<serde_json::Value>,
}

impl RunTelemetry {
    /// Build the telemetry record for a finished run.
    ///
    /// `run_id` is filled in by the artifact writer once the run directory
    /// name is known.
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil_core::{ReviewResult, ReviewStats, ReviewStatus};
    /// use vigil_review::telemetry::RunTelemetry;
    ///
    /// let result = ReviewResult {
    ///     schema_version: "v1".into(),
    ///     review_id: "0123456789abcdef".into(),
    ///     status: ReviewStatus::Ok,
    ///     model_used: "gpt-4o".into(),
    ///     warnings: Vec::new(),
    ///     issues: Vec::new(),
    ///     summary: String::new(),
    ///     files_reviewed: Vec::new(),
    ///     stats: ReviewStats::default(),
    /// };
    /// let telemetry = RunTelemetry::from_run(&result, false);
    /// assert_eq!(telemetry.review_id, "0123456789abcdef");
    /// assert!(telemetry.payloads.is_none());
    /// ```
    pub fn from_run(result: &ReviewResult, full_payloads: bool) -> Self {
        let payloads = if full_payloads {
            serde_json::to_value(result).ok()
        } else {
            None
        };
        Self {
            run_id: String::new(),
            review_id: result.review_id.clone(),
            status: result.status.to_string(),
            cost_usd: result.stats.cost_usd,
            tokens_used: result.stats.tokens_used,
            llm_calls: result.stats.llm_calls,
            tool_calls: result.stats.tool_calls,
            latency_seconds_e2e: result.stats.latency_seconds_e2e,
            warnings: result.warnings.clone(),
            payloads,
        }
    }
}
