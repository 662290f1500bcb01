//! Idempotent publication of a finished run.
//!
//! One bot comment per PR: the writer matches on the stable marker prefix
//! rather than the embedded review id, so whatever prior bot comment exists
//! is overwritten wholesale and a PR never carries two. Local artifacts
//! (`review.md`, `review.json`, `telemetry.json`) are written for ok,
//! truncated, and error runs alike, so the PR and the `runs/` directory
//! always reflect the latest attempt.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;
use vigil_core::{ReviewResult, VigilError};
use vigil_github::parse_repo_full_name;

use crate::telemetry::RunTelemetry;

/// Literal first line of every bot comment, up to the embedded id.
pub const COMMENT_MARKER_PREFIX: &str = "<!-- code-review-agent:review_id=";

const COMMENTS_PER_PAGE: usize = 100;

/// The slice of an existing PR comment the writer needs.
#[derive(Debug, Clone)]
pub struct PrComment {
    pub id: u64,
    pub body: String,
}

/// Issue-comment operations on one pull request.
///
/// Production uses [`OctocrabComments`]; tests script an in-memory fake.
#[async_trait]
pub trait CommentApi: Send + Sync {
    /// List every comment on the PR.
    async fn list_comments(
        &self,
        repo: &str,
        pr_number: u64,
    ) -> Result<Vec<PrComment>, VigilError>;

    /// Create a comment, returning its id.
    async fn create_comment(
        &self,
        repo: &str,
        pr_number: u64,
        body: &str,
    ) -> Result<u64, VigilError>;

    /// Replace an existing comment's body.
    async fn update_comment(
        &self,
        repo: &str,
        comment_id: u64,
        body: &str,
    ) -> Result<(), VigilError>;
}

/// What `publish` did to the remote comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishAction {
    Created,
    Updated,
}

/// Receipt for one publication: the comment touched plus the artifact set.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub action: PublishAction,
    pub comment_id: u64,
    pub artifact_paths: Vec<PathBuf>,
}

/// Render the markdown report for a result.
///
/// Warnings are always part of the report so truncated and error runs stay
/// visible on the PR.
pub fn render_markdown(result: &ReviewResult) -> String {
    let mut lines = vec![
        format!("# Review {}", result.review_id),
        String::new(),
        format!("Status: `{}` (model: {})", result.status, result.model_used),
        String::new(),
        "## Summary".to_string(),
        if result.summary.is_empty() {
            "No summary provided.".to_string()
        } else {
            result.summary.clone()
        },
        String::new(),
        "## Issues".to_string(),
    ];

    if result.issues.is_empty() {
        lines.push("- No issues found.".to_string());
    } else {
        for issue in &result.issues {
            let location = format!("{}:{}", issue.file, issue.line_start);
            lines.push(format!(
                "- **{} / {}** at `{location}` (confidence {:.2}): {}",
                issue.severity, issue.category, issue.confidence, issue.description
            ));
            lines.push(format!("  - Suggestion: {}", issue.suggestion));
        }
    }

    if !result.warnings.is_empty() {
        lines.push(String::new());
        lines.push("## Warnings".to_string());
        for warning in &result.warnings {
            lines.push(format!("- {warning}"));
        }
    }

    lines.push(String::new());
    lines.push(format!(
        "_{} file(s) reviewed, {} LLM call(s), ${:.4}_",
        result.files_reviewed.len(),
        result.stats.llm_calls,
        result.stats.cost_usd
    ));

    lines.join("\n")
}

/// Build the full comment body: marker line first, report below.
pub fn build_comment_body(result: &ReviewResult) -> String {
    format!(
        "{COMMENT_MARKER_PREFIX}{} -->\n{}",
        result.review_id,
        render_markdown(result)
    )
}

/// Write the per-run artifact set under `runs_dir`.
///
/// Creates `{timestamp}_{review_id}/` holding `review.md`, `review.json`,
/// and `telemetry.json`; the directory name becomes the telemetry `run_id`.
///
/// # Errors
///
/// Returns [`VigilError::Io`] if the directory or any file cannot be
/// written.
pub fn write_artifacts(
    runs_dir: &Path,
    result: &ReviewResult,
    telemetry: &RunTelemetry,
) -> Result<Vec<PathBuf>, VigilError> {
    let run_id = format!(
        "{}_{}",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        result.review_id
    );
    let run_dir = runs_dir.join(&run_id);
    std::fs::create_dir_all(&run_dir)?;

    let report_path = run_dir.join("review.md");
    std::fs::write(&report_path, render_markdown(result))?;

    let result_path = run_dir.join("review.json");
    std::fs::write(&result_path, serde_json::to_string_pretty(result)?)?;

    let mut telemetry = telemetry.clone();
    telemetry.run_id = run_id;
    let telemetry_path = run_dir.join("telemetry.json");
    std::fs::write(&telemetry_path, serde_json::to_string_pretty(&telemetry)?)?;

    info!(dir = %run_dir.display(), "run artifacts written");
    Ok(vec![report_path, result_path, telemetry_path])
}

/// Publish a finished run: write local artifacts, then create or update the
/// single bot comment on the PR.
///
/// Any comment starting with the marker prefix is treated as ours and
/// replaced, regardless of the id embedded in it.
///
/// # Errors
///
/// Returns [`VigilError::Io`] for artifact failures and the comment API's
/// errors for remote ones; artifacts are written before the remote call, so
/// they survive a failed post.
pub async fn publish(
    api: &dyn CommentApi,
    repo: &str,
    pr_number: u64,
    result: &ReviewResult,
    telemetry: &RunTelemetry,
    runs_dir: &Path,
) -> Result<PublishReceipt, VigilError> {
    let artifact_paths = write_artifacts(runs_dir, result, telemetry)?;
    let body = build_comment_body(result);

    let existing = api.list_comments(repo, pr_number).await?;
    let prior = existing
        .iter()
        .find(|c| c.body.starts_with(COMMENT_MARKER_PREFIX));

    let (action, comment_id) = match prior {
        Some(comment) => {
            api.update_comment(repo, comment.id, &body).await?;
            info!(repo, pr_number, comment_id = comment.id, "bot comment updated");
            (PublishAction::Updated, comment.id)
        }
        None => {
            let id = api.create_comment(repo, pr_number, &body).await?;
            info!(repo, pr_number, comment_id = id, "bot comment created");
            (PublishAction::Created, id)
        }
    };

    Ok(PublishReceipt {
        action,
        comment_id,
        artifact_paths,
    })
}

/// [`CommentApi`] backed by the GitHub issues API via octocrab.
pub struct OctocrabComments {
    octocrab: octocrab::Octocrab,
}

impl OctocrabComments {
    /// Create a client from an explicit token or the `GITHUB_TOKEN` /
    /// `GH_TOKEN` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Config`] when no token is available or the
    /// client cannot be built.
    pub fn new(token: Option<&str>) -> Result<Self, VigilError> {
        let token = match token {
            Some(t) => t.to_string(),
            None => std::env::var("GITHUB_TOKEN")
                .or_else(|_| std::env::var("GH_TOKEN"))
                .map_err(|_| {
                    VigilError::Config(
                        "GITHUB_TOKEN not set. Set [github] token or the GITHUB_TOKEN env var"
                            .into(),
                    )
                })?,
        };
        let octocrab = octocrab::Octocrab::builder()
            .personal_token(token)
            .build()
            .map_err(|e| VigilError::Config(format!("failed to create GitHub client: {e}")))?;
        Ok(Self { octocrab })
    }
}

#[async_trait]
impl CommentApi for OctocrabComments {
    async fn list_comments(
        &self,
        repo: &str,
        pr_number: u64,
    ) -> Result<Vec<PrComment>, VigilError> {
        let (owner, name) = parse_repo_full_name(repo)?;
        let mut comments = Vec::new();
        let mut page = 1u32;
        loop {
            let route = format!(
                "/repos/{owner}/{name}/issues/{pr_number}/comments?per_page={COMMENTS_PER_PAGE}&page={page}"
            );
            let rows: Vec<serde_json::Value> = self
                .octocrab
                .get(route, None::<&()>)
                .await
                .map_err(|e| VigilError::Api {
                    status: 0,
                    endpoint: format!("comments list: {e}"),
                })?;
            let row_count = rows.len();
            for row in rows {
                let Some(id) = row.get("id").and_then(|v| v.as_u64()) else {
                    continue;
                };
                let body = row
                    .get("body")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                comments.push(PrComment { id, body });
            }
            if row_count < COMMENTS_PER_PAGE {
                break;
            }
            page += 1;
        }
        Ok(comments)
    }

    async fn create_comment(
        &self,
        repo: &str,
        pr_number: u64,
        body: &str,
    ) -> Result<u64, VigilError> {
        let (owner, name) = parse_repo_full_name(repo)?;
        let route = format!("/repos/{owner}/{name}/issues/{pr_number}/comments");
        let payload = serde_json::json!({ "body": body });
        let created: serde_json::Value = self
            .octocrab
            .post(route, Some(&payload))
            .await
            .map_err(|e| VigilError::Api {
                status: 0,
                endpoint: format!("comment create: {e}"),
            })?;
        created
            .get("id")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| VigilError::Api {
                status: 0,
                endpoint: "comment create: response missing id".into(),
            })
    }

    async fn update_comment(
        &self,
        repo: &str,
        comment_id: u64,
        body: &str,
    ) -> Result<(), VigilError> {
        let (owner, name) = parse_repo_full_name(repo)?;
        let route = format!("/repos/{owner}/{name}/issues/comments/{comment_id}");
        let payload = serde_json::json!({ "body": body });
        let _updated: serde_json::Value = self
            .octocrab
            .patch(route, Some(&payload))
            .await
            .map_err(|e| VigilError::Api {
                status: 0,
                endpoint: format!("comment update: {e}"),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use vigil_core::{Category, Issue, Language, ReviewStats, ReviewStatus, Severity};

    /// In-memory comment store standing in for the GitHub issues API.
    #[derive(Default)]
    struct FakeComments {
        comments: Mutex<Vec<PrComment>>,
        next_id: Mutex<u64>,
    }

    impl FakeComments {
        fn seed(&self, body: &str) {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            self.comments.lock().unwrap().push(PrComment {
                id: *next,
                body: body.to_string(),
            });
        }

        fn bodies(&self) -> Vec<String> {
            self.comments
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.body.clone())
                .collect()
        }
    }

    #[async_trait]
    impl CommentApi for FakeComments {
        async fn list_comments(
            &self,
            _repo: &str,
            _pr_number: u64,
        ) -> Result<Vec<PrComment>, VigilError> {
            Ok(self.comments.lock().unwrap().clone())
        }

        async fn create_comment(
            &self,
            _repo: &str,
            _pr_number: u64,
            body: &str,
        ) -> Result<u64, VigilError> {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            self.comments.lock().unwrap().push(PrComment {
                id: *next,
                body: body.to_string(),
            });
            Ok(*next)
        }

        async fn update_comment(
            &self,
            _repo: &str,
            comment_id: u64,
            body: &str,
        ) -> Result<(), VigilError> {
            let mut comments = self.comments.lock().unwrap();
            let comment = comments
                .iter_mut()
                .find(|c| c.id == comment_id)
                .expect("updating a comment that exists");
            comment.body = body.to_string();
            Ok(())
        }
    }

    fn result(status: ReviewStatus) -> ReviewResult {
        ReviewResult {
            schema_version: "v1".into(),
            review_id: "0123456789abcdef".into(),
            status,
            model_used: "gpt-4o".into(),
            warnings: vec!["context truncated to fit the token budget".into()],
            issues: vec![Issue {
                file: "src/auth.py".into(),
                line_start: 42,
                line_end: None,
                severity: Severity::High,
                category: Category::Security,
                description: "Token compared with ==".into(),
                suggestion: "Use hmac.compare_digest".into(),
                evidence_snippet: "src/auth.py:L42-L42\nif token == expected:".into(),
                dedupe_key: "src/auth.py:42:security:deadbeef".into(),
                confidence: 0.9,
                language: Language::Python,
            }],
            summary: "One risky change.".into(),
            files_reviewed: vec!["src/auth.py".into()],
            stats: ReviewStats::default(),
        }
    }

    #[test]
    fn comment_body_starts_with_literal_marker_line() {
        let body = build_comment_body(&result(ReviewStatus::Ok));
        let first_line = body.lines().next().unwrap();
        assert_eq!(
            first_line,
            "<!-- code-review-agent:review_id=0123456789abcdef -->"
        );
    }

    #[test]
    fn report_shows_issues_and_warnings() {
        let markdown = render_markdown(&result(ReviewStatus::Truncated));
        assert!(markdown.contains("Status: `truncated`"));
        assert!(markdown.contains("**high / security** at `src/auth.py:42`"));
        assert!(markdown.contains("Use hmac.compare_digest"));
        assert!(markdown.contains("## Warnings"));
        assert!(markdown.contains("context truncated"));
    }

    #[test]
    fn report_without_issues_says_so() {
        let mut clean = result(ReviewStatus::Ok);
        clean.issues.clear();
        clean.warnings.clear();
        let markdown = render_markdown(&clean);
        assert!(markdown.contains("- No issues found."));
        assert!(!markdown.contains("## Warnings"));
    }

    #[tokio::test]
    async fn publish_twice_leaves_exactly_one_bot_comment() {
        let api = FakeComments::default();
        let dir = tempfile::tempdir().unwrap();
        let reviewed = result(ReviewStatus::Ok);
        let telemetry = RunTelemetry::from_run(&reviewed, false);

        let first = publish(&api, "o/r", 7, &reviewed, &telemetry, dir.path())
            .await
            .unwrap();
        assert_eq!(first.action, PublishAction::Created);

        let second = publish(&api, "o/r", 7, &reviewed, &telemetry, dir.path())
            .await
            .unwrap();
        assert_eq!(second.action, PublishAction::Updated);
        assert_eq!(second.comment_id, first.comment_id);

        let bodies = api.bodies();
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].starts_with(COMMENT_MARKER_PREFIX));
    }

    #[tokio::test]
    async fn prior_bot_comment_overwritten_even_with_different_embedded_id() {
        let api = FakeComments::default();
        api.seed("a human comment, left alone");
        api.seed("<!-- code-review-agent:review_id=ffffffffffffffff -->\nstale report");
        let dir = tempfile::tempdir().unwrap();
        let reviewed = result(ReviewStatus::Ok);
        let telemetry = RunTelemetry::from_run(&reviewed, false);

        let receipt = publish(&api, "o/r", 7, &reviewed, &telemetry, dir.path())
            .await
            .unwrap();
        assert_eq!(receipt.action, PublishAction::Updated);

        let bodies = api.bodies();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0], "a human comment, left alone");
        assert!(bodies[1].contains("review_id=0123456789abcdef"));
        assert!(!bodies[1].contains("stale report"));
    }

    #[tokio::test]
    async fn error_runs_still_publish_with_warnings_visible() {
        let api = FakeComments::default();
        let dir = tempfile::tempdir().unwrap();
        let mut failed = result(ReviewStatus::Error);
        failed.issues.clear();
        failed.warnings = vec!["reviewer returned unparseable output twice".into()];
        let telemetry = RunTelemetry::from_run(&failed, false);

        let receipt = publish(&api, "o/r", 7, &failed, &telemetry, dir.path())
            .await
            .unwrap();
        assert_eq!(receipt.action, PublishAction::Created);
        assert_eq!(receipt.artifact_paths.len(), 3);
        assert!(api.bodies()[0].contains("unparseable output"));
    }

    #[test]
    fn artifacts_written_under_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let reviewed = result(ReviewStatus::Ok);
        let telemetry = RunTelemetry::from_run(&reviewed, false);

        let paths = write_artifacts(dir.path(), &reviewed, &telemetry).unwrap();
        assert_eq!(paths.len(), 3);
        for path in &paths {
            assert!(path.exists(), "missing artifact {}", path.display());
        }
        assert!(paths[0].ends_with("review.md"));
        assert!(paths[1].ends_with("review.json"));
        assert!(paths[2].ends_with("telemetry.json"));

        // run dir name carries the review id and feeds the telemetry run_id
        let run_dir = paths[0].parent().unwrap();
        let dir_name = run_dir.file_name().unwrap().to_str().unwrap();
        assert!(dir_name.ends_with("_0123456789abcdef"));

        let stored: RunTelemetry = serde_json::from_str(
            &std::fs::read_to_string(&paths[2]).unwrap(),
        )
        .unwrap();
        assert_eq!(stored.run_id, dir_name);

        let roundtrip: ReviewResult = serde_json::from_str(
            &std::fs::read_to_string(&paths[1]).unwrap(),
        )
        .unwrap();
        assert_eq!(roundtrip.review_id, reviewed.review_id);
        assert!(roundtrip
            .issues
            .iter()
            .all(|i| !i.evidence_snippet.is_empty()));
    }
}
