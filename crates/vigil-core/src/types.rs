use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Issue severity level.
///
/// # Examples
///
/// ```
/// use vigil_core::Severity;
///
/// let s: Severity = serde_json::from_str("\"critical\"").unwrap();
/// assert_eq!(s, Severity::Critical);
/// assert!(s.rank() < Severity::Low.rank());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Exploitable or data-destroying defect.
    Critical,
    /// Likely defect with significant impact.
    High,
    /// Defect or risk worth fixing.
    Medium,
    /// Minor issue.
    Low,
}

impl Severity {
    /// Ordering rank: lower is more severe (Critical = 0).
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
        }
    }

    /// Returns `true` for the severities eligible for escalation review.
    pub fn is_escalatable(self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }

    /// Returns `true` when this severity is at or above `threshold`.
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil_core::Severity;
    ///
    /// assert!(Severity::Critical.meets_threshold(Severity::High));
    /// assert!(!Severity::Low.meets_threshold(Severity::High));
    /// ```
    pub fn meets_threshold(self, threshold: Severity) -> bool {
        self.rank() <= threshold.rank()
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Low => write!(f, "low"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Issue category.
///
/// # Examples
///
/// ```
/// use vigil_core::Category;
///
/// let c: Category = serde_json::from_str("\"error_handling\"").unwrap();
/// assert_eq!(c, Category::ErrorHandling);
/// assert_eq!(c.to_string(), "error_handling");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Security,
    Bug,
    ErrorHandling,
    Performance,
    Style,
    Logic,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Security => write!(f, "security"),
            Category::Bug => write!(f, "bug"),
            Category::ErrorHandling => write!(f, "error_handling"),
            Category::Performance => write!(f, "performance"),
            Category::Style => write!(f, "style"),
            Category::Logic => write!(f, "logic"),
        }
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "security" => Ok(Category::Security),
            "bug" => Ok(Category::Bug),
            "error_handling" => Ok(Category::ErrorHandling),
            "performance" => Ok(Category::Performance),
            "style" => Ok(Category::Style),
            "logic" => Ok(Category::Logic),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

/// Source language of a reviewed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Typescript,
}

impl Language {
    /// Detect a supported language from a file path extension.
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil_core::Language;
    ///
    /// assert_eq!(Language::from_path("src/app.py"), Some(Language::Python));
    /// assert_eq!(Language::from_path("web/index.tsx"), Some(Language::Typescript));
    /// assert_eq!(Language::from_path("README.md"), None);
    /// ```
    pub fn from_path(path: &str) -> Option<Self> {
        let extension = path.rsplit('.').next()?;
        match extension {
            "py" => Some(Language::Python),
            "js" | "jsx" | "mjs" | "cjs" => Some(Language::Javascript),
            "ts" | "tsx" => Some(Language::Typescript),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::Javascript => write!(f, "javascript"),
            Language::Typescript => write!(f, "typescript"),
        }
    }
}

/// Terminal status of a review run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    /// The run completed within budget.
    Ok,
    /// A budget dimension was exhausted; the result is partial but valid.
    Truncated,
    /// The run could not produce issues (e.g. unparseable reviewer output).
    Error,
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewStatus::Ok => write!(f, "ok"),
            ReviewStatus::Truncated => write!(f, "truncated"),
            ReviewStatus::Error => write!(f, "error"),
        }
    }
}

/// A single issue found during a review.
///
/// `evidence_snippet` must be non-empty for every issue ever emitted to
/// output; it carries a `path:Lx-Ly` header line plus at least one body line
/// (see [`evidence_snippet_is_valid`]).
///
/// # Examples
///
/// ```
/// use vigil_core::{Category, Issue, Language, Severity};
///
/// let issue = Issue {
///     file: "src/auth.py".into(),
///     line_start: 42,
///     line_end: None,
///     severity: Severity::High,
///     category: Category::Security,
///     description: "Token compared with ==".into(),
///     suggestion: "Use a constant-time comparison".into(),
///     evidence_snippet: "src/auth.py:L42-L42\nif token == expected:".into(),
///     dedupe_key: "src/auth.py:42:security:deadbeef".into(),
///     confidence: 0.9,
///     language: Language::Python,
/// };
/// assert_eq!(issue.line_range(), (42, 42));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Path of the file the issue is in, relative to the repo root.
    pub file: String,
    /// First affected line in the head revision (1-indexed).
    pub line_start: u32,
    /// Last affected line, when the issue spans more than one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_end: Option<u32>,
    pub severity: Severity,
    pub category: Category,
    pub description: String,
    pub suggestion: String,
    /// `path:Lx-Ly` header plus the offending source lines.
    pub evidence_snippet: String,
    /// Stable identity across reruns: `{file}:{line_start}:{category}:{hash}`.
    pub dedupe_key: String,
    /// Reviewer self-rated confidence in `[0, 1]`.
    pub confidence: f64,
    pub language: Language,
}

impl Issue {
    /// Inclusive line range covered by this issue.
    pub fn line_range(&self) -> (u32, u32) {
        (self.line_start, self.line_end.unwrap_or(self.line_start))
    }
}

/// Rollup metrics for one review run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewStats {
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub latency_seconds_e2e: f64,
    #[serde(default)]
    pub latency_seconds_llm: f64,
    #[serde(default)]
    pub llm_calls: u32,
    #[serde(default)]
    pub tool_calls: u32,
}

/// Structured output contract of a review run.
///
/// Immutable after finalization; `review_id` is a pure function of the run
/// inputs (see [`compute_review_id`]), which is what makes comment updates
/// idempotent across reruns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// 16-character lowercase hex run identity.
    pub review_id: String,
    pub status: ReviewStatus,
    /// Every model actually invoked, comma-separated in invocation order.
    pub model_used: String,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub files_reviewed: Vec<String>,
    #[serde(default)]
    pub stats: ReviewStats,
}

fn default_schema_version() -> String {
    "v1".into()
}

/// Aggregated metrics for an eval run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResult {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub recall: f64,
    pub precision: f64,
    pub f1: f64,
    /// Mean `|confidence - matched|` over all predictions; lower is better.
    pub avg_confidence_calibration: f64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub latency_seconds: f64,
}

/// Compute the deterministic run identity for one review configuration.
///
/// The id is the 16-character lowercase hex prefix of the SHA-256 digest over
/// the run inputs. Two runs with identical inputs always produce the
/// identical id, which the output writer relies on for idempotent comment
/// updates.
///
/// # Examples
///
/// ```
/// use vigil_core::compute_review_id;
///
/// let a = compute_review_id("octo/demo", 7, "abc123", "v1", "gpt-4o", "default");
/// let b = compute_review_id("octo/demo", 7, "abc123", "v1", "gpt-4o", "default");
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 16);
/// assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
/// ```
pub fn compute_review_id(
    repo: &str,
    pr_number: u64,
    head_sha: &str,
    prompt_version: &str,
    model: &str,
    budget_profile: &str,
) -> String {
    let material =
        format!("{repo}\n{pr_number}\n{head_sha}\n{prompt_version}\n{model}\n{budget_profile}");
    let digest = Sha256::digest(material.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// Build a stable dedupe key for an issue.
///
/// Format: `{file}:{line_start}:{category}:{hash}` where the hash is the
/// first 16 hex chars of SHA-256 over the evidence snippet, so the same
/// logical finding keeps its identity across reruns even when descriptions
/// are reworded.
///
/// # Examples
///
/// ```
/// use vigil_core::{build_dedupe_key, dedupe_key_is_valid, Category};
///
/// let key = build_dedupe_key("src/db.py", 10, Category::Bug, "src/db.py:L10-L10\nx = rows[0]");
/// assert!(key.starts_with("src/db.py:10:bug:"));
/// assert!(dedupe_key_is_valid(&key));
/// ```
pub fn build_dedupe_key(
    file: &str,
    line_start: u32,
    category: Category,
    evidence_snippet: &str,
) -> String {
    let digest = Sha256::digest(evidence_snippet.as_bytes());
    let hash: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("{file}:{line_start}:{category}:{hash}")
}

/// Validate the dedupe key contract:
/// `{file}:{line_start}:{category}:{lowercase hex, 8-64 chars}`, where the
/// file segment contains no `:` and the line is a positive integer.
pub fn dedupe_key_is_valid(key: &str) -> bool {
    let mut parts = key.rsplitn(3, ':');
    let (Some(hash), Some(category), Some(prefix)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if hash.len() < 8 || hash.len() > 64 {
        return false;
    }
    if !hash
        .chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return false;
    }
    if category.parse::<Category>().is_err() {
        return false;
    }
    let Some((file, line)) = prefix.rsplit_once(':') else {
        return false;
    };
    if file.is_empty() || file.contains(':') || file.contains('\n') {
        return false;
    }
    !line.is_empty() && !line.starts_with('0') && line.chars().all(|c| c.is_ascii_digit())
}

/// Validate the evidence snippet contract: a `path:Lx-Ly` header line plus at
/// least one non-blank body line.
///
/// # Examples
///
/// ```
/// use vigil_core::evidence_snippet_is_valid;
///
/// assert!(evidence_snippet_is_valid("a.py:L3-L4\nreturn None"));
/// assert!(!evidence_snippet_is_valid("a.py:L3-L4"));
/// assert!(!evidence_snippet_is_valid("no header here\nbody"));
/// assert!(!evidence_snippet_is_valid(""));
/// ```
pub fn evidence_snippet_is_valid(snippet: &str) -> bool {
    let Some((header, body)) = snippet.split_once('\n') else {
        return false;
    };
    if body.trim().is_empty() {
        return false;
    }
    let Some((path, range)) = header.trim().split_once(':') else {
        return false;
    };
    if path.is_empty() || path.contains(':') {
        return false;
    }
    let Some(range) = range.strip_prefix('L') else {
        return false;
    };
    let Some((start, end)) = range.split_once("-L") else {
        return false;
    };
    !start.is_empty()
        && !end.is_empty()
        && start.chars().all(|c| c.is_ascii_digit())
        && end.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_roundtrips_through_json() {
        let json = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        let parsed: Severity = serde_json::from_str("\"medium\"").unwrap();
        assert_eq!(parsed, Severity::Medium);
    }

    #[test]
    fn severity_rank_orders_most_severe_first() {
        assert!(Severity::Critical.rank() < Severity::High.rank());
        assert!(Severity::High.rank() < Severity::Medium.rank());
        assert!(Severity::Medium.rank() < Severity::Low.rank());
    }

    #[test]
    fn severity_escalation_eligibility() {
        assert!(Severity::Critical.is_escalatable());
        assert!(Severity::High.is_escalatable());
        assert!(!Severity::Medium.is_escalatable());
        assert!(!Severity::Low.is_escalatable());
    }

    #[test]
    fn severity_threshold_catches_equal_and_above() {
        assert!(Severity::Critical.meets_threshold(Severity::High));
        assert!(Severity::High.meets_threshold(Severity::High));
        assert!(!Severity::Medium.meets_threshold(Severity::High));
        assert!(Severity::Low.meets_threshold(Severity::Low));
    }

    #[test]
    fn category_serializes_snake_case() {
        let json = serde_json::to_string(&Category::ErrorHandling).unwrap();
        assert_eq!(json, "\"error_handling\"");
        assert_eq!(
            "error_handling".parse::<Category>().unwrap(),
            Category::ErrorHandling
        );
    }

    #[test]
    fn language_from_path() {
        assert_eq!(Language::from_path("a/b/c.py"), Some(Language::Python));
        assert_eq!(Language::from_path("x.mjs"), Some(Language::Javascript));
        assert_eq!(Language::from_path("x.tsx"), Some(Language::Typescript));
        assert_eq!(Language::from_path("Makefile"), None);
    }

    #[test]
    fn review_id_is_pure_and_16_hex() {
        let id = compute_review_id("o/r", 1, "sha", "v1", "m", "default");
        let again = compute_review_id("o/r", 1, "sha", "v1", "m", "default");
        assert_eq!(id, again);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, id.to_lowercase());
    }

    #[test]
    fn review_id_changes_with_any_input() {
        let base = compute_review_id("o/r", 1, "sha", "v1", "m", "default");
        assert_ne!(base, compute_review_id("o/r", 2, "sha", "v1", "m", "default"));
        assert_ne!(base, compute_review_id("o/r", 1, "sha2", "v1", "m", "default"));
        assert_ne!(base, compute_review_id("o/r", 1, "sha", "v2", "m", "default"));
        assert_ne!(base, compute_review_id("o/r", 1, "sha", "v1", "m2", "default"));
        assert_ne!(base, compute_review_id("o/r", 1, "sha", "v1", "m", "strict"));
    }

    #[test]
    fn dedupe_key_builder_produces_valid_keys() {
        let key = build_dedupe_key("src/a.py", 3, Category::Logic, "src/a.py:L3-L3\nx");
        assert!(dedupe_key_is_valid(&key));
        // same evidence -> same key
        assert_eq!(
            key,
            build_dedupe_key("src/a.py", 3, Category::Logic, "src/a.py:L3-L3\nx")
        );
    }

    #[test]
    fn dedupe_key_validation_rejects_malformed() {
        assert!(dedupe_key_is_valid("a.py:12:security:abcdef01"));
        assert!(!dedupe_key_is_valid("a.py:0:security:abcdef01"));
        assert!(!dedupe_key_is_valid("a.py:12:notacategory:abcdef01"));
        assert!(!dedupe_key_is_valid("a.py:12:security:xyz"));
        assert!(!dedupe_key_is_valid("a.py:12:security:abc"));
        assert!(!dedupe_key_is_valid(":12:security:abcdef01"));
        assert!(!dedupe_key_is_valid("no-colons-at-all"));
    }

    #[test]
    fn evidence_snippet_validation() {
        assert!(evidence_snippet_is_valid("src/x.py:L1-L2\nline one\nline two"));
        assert!(!evidence_snippet_is_valid("src/x.py:L1-L2\n   \n"));
        assert!(!evidence_snippet_is_valid("src/x.py:1-2\nbody"));
        assert!(!evidence_snippet_is_valid("src/x.py:Labc-L2\nbody"));
    }

    #[test]
    fn issue_line_range_defaults_to_start() {
        let issue = Issue {
            file: "a.py".into(),
            line_start: 5,
            line_end: None,
            severity: Severity::Low,
            category: Category::Style,
            description: "d".into(),
            suggestion: "s".into(),
            evidence_snippet: "a.py:L5-L5\nx".into(),
            dedupe_key: "a.py:5:style:abcdef01".into(),
            confidence: 0.5,
            language: Language::Python,
        };
        assert_eq!(issue.line_range(), (5, 5));
    }

    #[test]
    fn review_result_roundtrips_through_json() {
        let result = ReviewResult {
            schema_version: "v1".into(),
            review_id: "0123456789abcdef".into(),
            status: ReviewStatus::Ok,
            model_used: "gpt-4o".into(),
            warnings: vec!["w".into()],
            issues: Vec::new(),
            summary: "fine".into(),
            files_reviewed: vec!["a.py".into()],
            stats: ReviewStats::default(),
        };
        let json = serde_json::to_string(&result).unwrap();
        let parsed: ReviewResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.review_id, result.review_id);
        assert_eq!(parsed.status, ReviewStatus::Ok);
        assert_eq!(parsed.files_reviewed, vec!["a.py".to_string()]);
    }
}
