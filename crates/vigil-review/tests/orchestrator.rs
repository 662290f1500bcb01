//! End-to-end runs of the orchestration loop against scripted capabilities.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use vigil_context::ContextBundle;
use vigil_core::{
    BudgetProfile, Category, Issue, Language, ReviewStatus, Severity, VigilConfig, VigilError,
};
use vigil_github::{
    ChangedFile, ChangedRange, FileContent, FileStatus, PullRequestMeta, PullRequestSnapshot,
};
use vigil_review::{
    DraftReview, InstructionVariant, LintFinding, LintOutcome, Linter, Orchestrator, Reviewer,
};

struct ScriptedReviewer {
    model: String,
    responses: Mutex<Vec<Result<DraftReview, VigilError>>>,
    calls: AtomicUsize,
}

impl ScriptedReviewer {
    fn new(model: &str, responses: Vec<Result<DraftReview, VigilError>>) -> Arc<Self> {
        Arc::new(Self {
            model: model.to_string(),
            responses: Mutex::new(responses),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reviewer for ScriptedReviewer {
    fn model(&self) -> &str {
        &self.model
    }

    async fn review(
        &self,
        _bundle: &ContextBundle,
        _instruction: InstructionVariant,
        _focus: &[Issue],
        _lint_findings: &[(String, LintFinding)],
        _timeout: Duration,
    ) -> Result<DraftReview, VigilError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(VigilError::Llm("script exhausted".into()));
        }
        responses.remove(0)
    }
}

struct UnavailableLinter;

#[async_trait]
impl Linter for UnavailableLinter {
    fn name(&self) -> &str {
        "ruff"
    }

    async fn lint(&self, _content: &str, _filename: &str, _language: Language) -> LintOutcome {
        LintOutcome::Unavailable("binary not installed".into())
    }
}

fn issue(key: &str, severity: Severity, confidence: f64) -> Issue {
    Issue {
        file: "src/app.py".into(),
        line_start: 10,
        line_end: None,
        severity,
        category: Category::Bug,
        description: "rows[0] may not exist".into(),
        suggestion: "guard the empty case".into(),
        evidence_snippet: "src/app.py:L10-L10\nvalue = rows[0]".into(),
        dedupe_key: key.into(),
        confidence,
        language: Language::Python,
    }
}

fn draft(issues: Vec<Issue>) -> Result<DraftReview, VigilError> {
    Ok(DraftReview {
        summary: "reviewed".into(),
        issues,
        skipped: Vec::new(),
        tokens_used: 100,
        cost_usd: 0.001,
    })
}

fn snapshot() -> PullRequestSnapshot {
    let source: String = (1..=40).map(|i| format!("line {i}\n")).collect();
    let mut file_contents = BTreeMap::new();
    file_contents.insert(
        "src/app.py".to_string(),
        FileContent::Text {
            text: source,
            sha: None,
        },
    );
    PullRequestSnapshot {
        repository: "o/r".into(),
        pr_number: 7,
        metadata: PullRequestMeta {
            number: 7,
            title: "Guard row access".into(),
            body: String::new(),
            state: "open".into(),
            draft: false,
            author_login: "dev".into(),
            html_url: "https://example.invalid".into(),
            base_ref: "main".into(),
            base_sha: "1".repeat(40),
            head_ref: "fix".into(),
            head_sha: "2".repeat(40),
        },
        files: vec![ChangedFile {
            path: "src/app.py".into(),
            status: FileStatus::Modified,
            additions: 1,
            deletions: 0,
            changes: 1,
            patch: Some("@@ -9,2 +9,3 @@\n context\n+value = rows[0]\n context\n".into()),
            previous_path: None,
            changed_ranges: vec![ChangedRange {
                line_start: 10,
                line_end: 10,
            }],
            hunks: Vec::new(),
        }],
        raw_diff: "diff --git a/src/app.py b/src/app.py\n".into(),
        file_contents,
        fetched_at: Utc::now(),
        warnings: Vec::new(),
        truncated: false,
    }
}

fn config(budget: BudgetProfile) -> VigilConfig {
    let mut config = VigilConfig::default();
    config.budget = budget;
    config
}

#[tokio::test]
async fn llm_limit_two_makes_exactly_two_invocations_then_truncates() {
    // draft + verify fit the budget; the escalation the run wants is denied
    let reviewer = ScriptedReviewer::new(
        "gpt-4o",
        vec![
            draft(vec![issue("k0", Severity::Critical, 0.3)]),
            draft(Vec::new()),
        ],
    );
    let escalation = ScriptedReviewer::new("gpt-4o-strong", vec![draft(Vec::new())]);
    let orchestrator = Orchestrator::new(
        Arc::clone(&reviewer) as Arc<dyn Reviewer>,
        Some(Arc::clone(&escalation) as Arc<dyn Reviewer>),
        None,
    );

    let budget = BudgetProfile {
        max_llm_calls: 2,
        ..BudgetProfile::default()
    };
    let result = orchestrator.run(&snapshot(), &config(budget)).await;

    assert_eq!(reviewer.calls() + escalation.calls(), 2);
    assert_eq!(escalation.calls(), 0);
    assert_eq!(result.status, ReviewStatus::Truncated);
    assert_eq!(result.stats.llm_calls, 2);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("budget denied during escalation")));
    // the draft issue still ships in the truncated result
    assert_eq!(result.issues.len(), 1);
}

#[tokio::test]
async fn double_parse_failure_finalizes_as_error_with_no_issues() {
    let reviewer = ScriptedReviewer::new(
        "gpt-4o",
        vec![
            Err(VigilError::StructuredOutput("not json".into())),
            Err(VigilError::StructuredOutput("still not json".into())),
        ],
    );
    let orchestrator = Orchestrator::new(Arc::clone(&reviewer) as Arc<dyn Reviewer>, None, None);

    let result = orchestrator
        .run(&snapshot(), &config(BudgetProfile::default()))
        .await;

    assert_eq!(reviewer.calls(), 2);
    assert_eq!(result.status, ReviewStatus::Error);
    assert!(result.issues.is_empty());
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("unparseable output twice")));
}

#[tokio::test]
async fn parse_failure_then_success_recovers() {
    let reviewer = ScriptedReviewer::new(
        "gpt-4o",
        vec![
            Err(VigilError::StructuredOutput("not json".into())),
            draft(vec![issue("k0", Severity::Low, 0.9)]),
        ],
    );
    let orchestrator = Orchestrator::new(Arc::clone(&reviewer) as Arc<dyn Reviewer>, None, None);

    let budget = BudgetProfile {
        max_verify_candidates: 0,
        ..BudgetProfile::default()
    };
    let result = orchestrator.run(&snapshot(), &config(budget)).await;

    assert_eq!(reviewer.calls(), 2);
    assert_eq!(result.status, ReviewStatus::Ok);
    assert_eq!(result.issues.len(), 1);
    assert!(result.warnings.iter().any(|w| w.contains("retrying once")));
}

#[tokio::test]
async fn escalation_records_both_models_and_never_adds_issues() {
    let reviewer = ScriptedReviewer::new(
        "gpt-4o",
        vec![draft(vec![issue("k0", Severity::Critical, 0.3)])],
    );
    let mut refined = issue("k0", Severity::Critical, 0.9);
    refined.description = "confirmed: rows may be empty".into();
    // the escalation response also tries to invent a second issue
    let escalation = ScriptedReviewer::new(
        "gpt-4o-strong",
        vec![draft(vec![refined, issue("invented", Severity::Critical, 1.0)])],
    );
    let orchestrator = Orchestrator::new(
        Arc::clone(&reviewer) as Arc<dyn Reviewer>,
        Some(Arc::clone(&escalation) as Arc<dyn Reviewer>),
        None,
    );

    let budget = BudgetProfile {
        max_llm_calls: 3,
        max_verify_candidates: 0,
        ..BudgetProfile::default()
    };
    let result = orchestrator.run(&snapshot(), &config(budget)).await;

    assert_eq!(result.status, ReviewStatus::Ok);
    assert_eq!(result.model_used, "gpt-4o,gpt-4o-strong");
    assert_eq!(result.issues.len(), 1);
    assert!((result.issues[0].confidence - 0.9).abs() < 1e-9);
    assert!(result.issues[0].description.starts_with("confirmed"));
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("1 new issue(s)")));
}

#[tokio::test]
async fn unavailable_linter_downgrades_to_warning() {
    let reviewer = ScriptedReviewer::new(
        "gpt-4o",
        vec![
            draft(vec![issue("k0", Severity::High, 0.4)]),
            draft(Vec::new()),
        ],
    );
    let orchestrator = Orchestrator::new(
        Arc::clone(&reviewer) as Arc<dyn Reviewer>,
        None,
        Some(Arc::new(UnavailableLinter)),
    );

    let result = orchestrator
        .run(&snapshot(), &config(BudgetProfile::default()))
        .await;

    assert_ne!(result.status, ReviewStatus::Error);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("'ruff' unavailable")));
    assert_eq!(result.issues.len(), 1);
}

#[tokio::test]
async fn review_id_is_stable_across_runs_on_the_same_snapshot() {
    let budget = BudgetProfile {
        max_verify_candidates: 0,
        ..BudgetProfile::default()
    };

    let mut ids = Vec::new();
    for _ in 0..2 {
        let reviewer =
            ScriptedReviewer::new("gpt-4o", vec![draft(vec![issue("k0", Severity::Low, 0.9)])]);
        let orchestrator =
            Orchestrator::new(Arc::clone(&reviewer) as Arc<dyn Reviewer>, None, None);
        let result = orchestrator.run(&snapshot(), &config(budget.clone())).await;
        ids.push(result.review_id);
    }
    assert_eq!(ids[0], ids[1]);
    assert_eq!(ids[0].len(), 16);
}
