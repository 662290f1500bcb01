//! The bounded review state machine:
//! `Draft -> {Expanding, Verifying} -> Escalating? -> Finalized`.
//!
//! Every reviewer and linter invocation reserves budget first; the first
//! denied reservation abandons all remaining optional work and the loop
//! proceeds directly to finalization with `status = truncated`. Whatever
//! happens, the caller receives a well-formed [`ReviewResult`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use vigil_context::{assemble, expand, ContextBundle, ContextPolicy, ExpandReason, ExpansionOutcome};
use vigil_core::{
    compute_review_id, evidence_snippet_is_valid, Issue, ReviewResult, ReviewStats, ReviewStatus,
    VigilConfig, VigilError,
};
use vigil_github::PullRequestSnapshot;

use crate::budget::{BudgetDimension, BudgetTracker, Reservation};
use crate::capability::{DraftReview, InstructionVariant, LintFinding, LintOutcome, Linter, Reviewer};

/// Issues at or above this confidence are not worth escalating.
const ESCALATION_CONFIDENCE_THRESHOLD: f64 = 0.6;
/// Expansion requests around a candidate reach this far beyond its range.
const EXPANSION_PADDING_LINES: u32 = 40;
/// Ceiling for any single reviewer call, further clamped by remaining wall
/// budget.
const REVIEWER_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Outcome of one budgeted reviewer invocation.
enum Invocation {
    Completed(DraftReview),
    ParseFailure,
    Denied(BudgetDimension),
    Failed(String),
}

/// Mutable run state threaded through every phase.
struct RunState {
    budget: BudgetTracker,
    warnings: Vec<String>,
    models_used: Vec<String>,
    tokens_used: u64,
    latency_llm_seconds: f64,
}

/// Drives one review run end to end.
pub struct Orchestrator {
    reviewer: Arc<dyn Reviewer>,
    escalation_reviewer: Option<Arc<dyn Reviewer>>,
    linter: Option<Arc<dyn Linter>>,
}

impl Orchestrator {
    pub fn new(
        reviewer: Arc<dyn Reviewer>,
        escalation_reviewer: Option<Arc<dyn Reviewer>>,
        linter: Option<Arc<dyn Linter>>,
    ) -> Self {
        Self {
            reviewer,
            escalation_reviewer,
            linter,
        }
    }

    /// Run the full review loop against a snapshot.
    ///
    /// Never fails: every error from the taxonomy is converted into warnings
    /// or the terminal status, and a well-formed result is always returned.
    pub async fn run(&self, snapshot: &PullRequestSnapshot, config: &VigilConfig) -> ReviewResult {
        let run_started = Instant::now();
        let review_id = compute_review_id(
            &snapshot.repository,
            snapshot.pr_number,
            snapshot.head_sha(),
            &config.llm.prompt_version,
            self.reviewer.model(),
            &config.budget.name,
        );
        info!(review_id, repo = %snapshot.repository, pr = snapshot.pr_number, "run starting");

        let mut state = RunState {
            budget: BudgetTracker::new(config.budget.clone()),
            warnings: snapshot.warnings.clone(),
            models_used: Vec::new(),
            tokens_used: 0,
            latency_llm_seconds: 0.0,
        };
        if snapshot.truncated {
            state.warnings.push("snapshot is partial; review covers fetched files only".into());
        }

        let policy = ContextPolicy {
            max_context_tokens: config.llm.max_context_tokens,
            ..ContextPolicy::default()
        };
        let mut bundle = assemble(snapshot, &policy);
        if bundle.truncated {
            state
                .warnings
                .push("context truncated to fit the token budget; least-changed files dropped".into());
        }

        let files_reviewed: Vec<String> = snapshot
            .files
            .iter()
            .filter(|f| f.patch.is_some())
            .map(|f| f.path.clone())
            .collect();

        let mut status = ReviewStatus::Ok;
        let mut summary = String::new();
        let mut issues: Vec<Issue> = Vec::new();

        // Draft
        info!(phase = "draft", "invoking reviewer");
        match self
            .invoke(&self.reviewer, &bundle, InstructionVariant::Draft, &[], &[], &mut state)
            .await
        {
            Invocation::Completed(draft) => {
                summary = draft.summary;
                issues = draft.issues;
            }
            Invocation::ParseFailure => {
                state
                    .warnings
                    .push("draft output was not valid structured JSON; retrying once".into());
                match self
                    .invoke(&self.reviewer, &bundle, InstructionVariant::Reformat, &[], &[], &mut state)
                    .await
                {
                    Invocation::Completed(draft) => {
                        summary = draft.summary;
                        issues = draft.issues;
                    }
                    Invocation::ParseFailure => {
                        state
                            .warnings
                            .push("reviewer returned unparseable output twice; no issues produced".into());
                        status = ReviewStatus::Error;
                    }
                    Invocation::Denied(dimension) => {
                        state.warnings.push(format!("budget denied during draft retry: {dimension}"));
                        status = ReviewStatus::Truncated;
                    }
                    Invocation::Failed(message) => {
                        state.warnings.push(message);
                        status = ReviewStatus::Error;
                    }
                }
            }
            Invocation::Denied(dimension) => {
                state.warnings.push(format!("budget denied before draft: {dimension}"));
                status = ReviewStatus::Truncated;
            }
            Invocation::Failed(message) => {
                state.warnings.push(message);
                status = ReviewStatus::Error;
            }
        }

        // Optional phases run only while nothing has gone wrong.
        let mut lint_findings: Vec<(String, LintFinding)> = Vec::new();
        if status == ReviewStatus::Ok && !issues.is_empty() {
            let candidates = rank_candidates(&issues, config.budget.max_verify_candidates);

            if let Some(denied) = self.lint_pass(snapshot, &issues, &candidates, &mut lint_findings, &mut state).await {
                state.warnings.push(format!("budget denied during lint pass: {denied}"));
                status = ReviewStatus::Truncated;
            }

            // Expanding / Verifying
            if status == ReviewStatus::Ok && !candidates.is_empty() {
                info!(phase = "verify", candidates = candidates.len(), "re-checking top candidates");
                for &index in &candidates {
                    let issue = &issues[index];
                    let reason = if issue.confidence < 0.5 {
                        ExpandReason::LowConfidence
                    } else {
                        ExpandReason::InsufficientEvidence
                    };
                    let (line_start, line_end) = issue.line_range();
                    let outcome = expand(
                        &mut bundle,
                        snapshot,
                        &policy,
                        &issue.file,
                        line_start.saturating_sub(EXPANSION_PADDING_LINES),
                        line_end + EXPANSION_PADDING_LINES,
                        reason,
                    );
                    if outcome == ExpansionOutcome::CappedOut {
                        // proceed with what we have
                        break;
                    }
                }

                let focus: Vec<Issue> = candidates.iter().map(|&i| issues[i].clone()).collect();
                match self
                    .invoke(&self.reviewer, &bundle, InstructionVariant::Verify, &focus, &lint_findings, &mut state)
                    .await
                {
                    Invocation::Completed(refined) => {
                        merge_refinements(&mut issues, refined, &mut state.warnings);
                    }
                    Invocation::ParseFailure => {
                        state.warnings.push("verify output unparseable; keeping draft issues".into());
                    }
                    Invocation::Denied(dimension) => {
                        state.warnings.push(format!("budget denied during verify: {dimension}"));
                        status = ReviewStatus::Truncated;
                    }
                    Invocation::Failed(message) => {
                        state.warnings.push(format!("verify pass failed: {message}"));
                    }
                }
            }
        }

        // Escalating
        if status == ReviewStatus::Ok {
            let eligible: Vec<Issue> = issues
                .iter()
                .filter(|i| {
                    i.severity.is_escalatable() && i.confidence < ESCALATION_CONFIDENCE_THRESHOLD
                })
                .cloned()
                .collect();
            if !eligible.is_empty() {
                match &self.escalation_reviewer {
                    None => {
                        state.warnings.push(format!(
                            "{} high-risk low-confidence issue(s) not escalated: no escalation model configured",
                            eligible.len()
                        ));
                    }
                    Some(escalation) => {
                        info!(phase = "escalate", eligible = eligible.len(), model = escalation.model(), "escalating");
                        match self
                            .invoke(escalation, &bundle, InstructionVariant::Escalate, &eligible, &lint_findings, &mut state)
                            .await
                        {
                            Invocation::Completed(refined) => {
                                merge_refinements(&mut issues, refined, &mut state.warnings);
                            }
                            Invocation::ParseFailure => {
                                state
                                    .warnings
                                    .push("escalation output unparseable; keeping prior issues".into());
                            }
                            Invocation::Denied(dimension) => {
                                state
                                    .warnings
                                    .push(format!("budget denied during escalation: {dimension}"));
                                status = ReviewStatus::Truncated;
                            }
                            Invocation::Failed(message) => {
                                state.warnings.push(format!("escalation failed: {message}"));
                            }
                        }
                    }
                }
            }
        }

        // Finalized
        let issues = finalize_issues(
            issues,
            config.budget.max_output_issues,
            &mut state.warnings,
        );
        let budget_state = state.budget.state();
        let model_used = if state.models_used.is_empty() {
            self.reviewer.model().to_string()
        } else {
            state.models_used.join(",")
        };
        info!(
            phase = "finalized",
            %status,
            issues = issues.len(),
            llm_calls = budget_state.llm_calls_used,
            "run complete"
        );

        ReviewResult {
            schema_version: "v1".into(),
            review_id,
            status,
            model_used,
            warnings: state.warnings,
            issues,
            summary,
            files_reviewed,
            stats: ReviewStats {
                tokens_used: state.tokens_used,
                cost_usd: budget_state.cost_usd_used,
                latency_seconds_e2e: run_started.elapsed().as_secs_f64(),
                latency_seconds_llm: state.latency_llm_seconds,
                llm_calls: budget_state.llm_calls_used,
                tool_calls: budget_state.tool_calls_used,
            },
        }
    }

    /// One budgeted, timeboxed reviewer invocation.
    async fn invoke(
        &self,
        reviewer: &Arc<dyn Reviewer>,
        bundle: &ContextBundle,
        instruction: InstructionVariant,
        focus: &[Issue],
        lint_findings: &[(String, LintFinding)],
        state: &mut RunState,
    ) -> Invocation {
        match state.budget.reserve(BudgetDimension::LlmCalls, 1.0) {
            Reservation::Denied(dimension) => return Invocation::Denied(dimension),
            Reservation::Granted => {}
        }

        let timeout = REVIEWER_CALL_TIMEOUT.min(state.budget.remaining_wall_time());
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            timeout,
            reviewer.review(bundle, instruction, focus, lint_findings, timeout),
        )
        .await;
        state.latency_llm_seconds += started.elapsed().as_secs_f64();

        match outcome {
            Err(_) => Invocation::Failed("reviewer call exceeded its timebox".into()),
            Ok(Err(VigilError::StructuredOutput(message))) => {
                warn!(?instruction, message, "structured output parse failure");
                Invocation::ParseFailure
            }
            Ok(Err(e)) => Invocation::Failed(format!("reviewer call failed: {e}")),
            Ok(Ok(draft)) => {
                state.budget.record(BudgetDimension::Cost, draft.cost_usd);
                state.tokens_used += draft.tokens_used;
                state.models_used.push(reviewer.model().to_string());
                for skipped in &draft.skipped {
                    state.warnings.push(format!("reviewer entry skipped: {skipped}"));
                }
                Invocation::Completed(draft)
            }
        }
    }

    /// Lint the files implicated by the verify candidates.
    ///
    /// Returns the denied dimension if a tool-call reservation fails; a
    /// linter that reports itself unavailable downgrades to a warning and
    /// stops the pass.
    async fn lint_pass(
        &self,
        snapshot: &PullRequestSnapshot,
        issues: &[Issue],
        candidates: &[usize],
        lint_findings: &mut Vec<(String, LintFinding)>,
        state: &mut RunState,
    ) -> Option<BudgetDimension> {
        let linter = self.linter.as_ref()?;

        let mut paths: Vec<&str> = Vec::new();
        for &index in candidates {
            let path = issues[index].file.as_str();
            if !paths.contains(&path) {
                paths.push(path);
            }
        }

        for path in paths {
            let Some(content) = snapshot.head_text(path) else {
                continue;
            };
            let Some(language) = vigil_core::Language::from_path(path) else {
                continue;
            };
            match state.budget.reserve(BudgetDimension::ToolCalls, 1.0) {
                Reservation::Denied(dimension) => return Some(dimension),
                Reservation::Granted => {}
            }
            match linter.lint(content, path, language).await {
                LintOutcome::Findings(findings) => {
                    for finding in findings {
                        lint_findings.push((path.to_string(), finding));
                    }
                }
                LintOutcome::Unavailable(reason) => {
                    state.warnings.push(format!(
                        "linter '{}' unavailable, continuing with reduced evidence: {reason}",
                        linter.name()
                    ));
                    break;
                }
            }
        }
        None
    }
}

/// Indices of the highest-risk issues: severity first, then lowest
/// confidence, original order as the stable tie-break.
fn rank_candidates(issues: &[Issue], max_candidates: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..issues.len()).collect();
    indices.sort_by(|&a, &b| {
        issues[a]
            .severity
            .rank()
            .cmp(&issues[b].severity.rank())
            .then(
                issues[a]
                    .confidence
                    .partial_cmp(&issues[b].confidence)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.cmp(&b))
    });
    indices.truncate(max_candidates);
    indices
}

/// Fold a verify/escalate response back into the issue list.
///
/// Existing issues (matched by dedupe key) take the refined description,
/// suggestion, confidence, and evidence; anything the refinement invents is
/// discarded so the issue count never grows after the draft.
fn merge_refinements(issues: &mut [Issue], refined: DraftReview, warnings: &mut Vec<String>) {
    let mut invented = 0usize;
    for refined_issue in refined.issues {
        match issues.iter_mut().find(|i| i.dedupe_key == refined_issue.dedupe_key) {
            Some(existing) => {
                existing.description = refined_issue.description;
                existing.suggestion = refined_issue.suggestion;
                existing.confidence = refined_issue.confidence;
                if evidence_snippet_is_valid(&refined_issue.evidence_snippet) {
                    existing.evidence_snippet = refined_issue.evidence_snippet;
                }
            }
            None => invented += 1,
        }
    }
    if invented > 0 {
        warnings.push(format!(
            "refinement pass proposed {invented} new issue(s); discarded to keep the draft set"
        ));
    }
}

/// Final output shaping: evidence filter, dedupe, deterministic ranking, cap.
fn finalize_issues(
    issues: Vec<Issue>,
    max_output_issues: usize,
    warnings: &mut Vec<String>,
) -> Vec<Issue> {
    let before = issues.len();
    let mut kept: Vec<Issue> = issues
        .into_iter()
        .filter(|i| evidence_snippet_is_valid(&i.evidence_snippet))
        .collect();
    let dropped_evidence = before - kept.len();
    if dropped_evidence > 0 {
        warnings.push(format!(
            "dropped {dropped_evidence} issue(s) lacking a usable evidence snippet"
        ));
    }

    let mut seen = HashSet::new();
    kept.retain(|i| seen.insert(i.dedupe_key.clone()));

    // severity desc, confidence desc, original order; indices keep the sort
    // deterministic when keys tie exactly
    let mut indexed: Vec<(usize, Issue)> = kept.into_iter().enumerate().collect();
    indexed.sort_by(|(ai, a), (bi, b)| {
        a.severity
            .rank()
            .cmp(&b.severity.rank())
            .then(
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(ai.cmp(bi))
    });
    let mut kept: Vec<Issue> = indexed.into_iter().map(|(_, issue)| issue).collect();

    if kept.len() > max_output_issues {
        let dropped = kept.len() - max_output_issues;
        kept.truncate(max_output_issues);
        warnings.push(format!(
            "issue cap reached; dropped {dropped} lower-priority issue(s)"
        ));
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{Category, Language, Severity};

    fn issue(key: &str, severity: Severity, confidence: f64, evidence: &str) -> Issue {
        Issue {
            file: "a.py".into(),
            line_start: 1,
            line_end: None,
            severity,
            category: Category::Bug,
            description: "d".into(),
            suggestion: "s".into(),
            evidence_snippet: evidence.into(),
            dedupe_key: key.into(),
            confidence,
            language: Language::Python,
        }
    }

    #[test]
    fn candidates_ranked_by_severity_then_inverse_confidence() {
        let issues = vec![
            issue("k0", Severity::Low, 0.1, "a.py:L1-L1\nx"),
            issue("k1", Severity::Critical, 0.9, "a.py:L1-L1\nx"),
            issue("k2", Severity::Critical, 0.2, "a.py:L1-L1\nx"),
            issue("k3", Severity::High, 0.5, "a.py:L1-L1\nx"),
        ];
        let ranked = rank_candidates(&issues, 3);
        assert_eq!(ranked, vec![2, 1, 3]);
    }

    #[test]
    fn candidate_ties_break_by_original_order() {
        let issues = vec![
            issue("k0", Severity::High, 0.5, "a.py:L1-L1\nx"),
            issue("k1", Severity::High, 0.5, "a.py:L1-L1\nx"),
        ];
        assert_eq!(rank_candidates(&issues, 5), vec![0, 1]);
    }

    #[test]
    fn merge_updates_matched_and_discards_invented() {
        let mut issues = vec![
            issue("k0", Severity::High, 0.4, "a.py:L1-L1\nx"),
            issue("k1", Severity::Low, 0.9, "a.py:L2-L2\ny"),
        ];
        let refined = DraftReview {
            issues: vec![
                {
                    let mut updated = issue("k0", Severity::High, 0.95, "a.py:L1-L2\nbetter evidence");
                    updated.description = "confirmed".into();
                    updated
                },
                issue("brand-new", Severity::Critical, 1.0, "a.py:L9-L9\nz"),
            ],
            ..DraftReview::default()
        };
        let mut warnings = Vec::new();
        merge_refinements(&mut issues, refined, &mut warnings);

        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].description, "confirmed");
        assert_eq!(issues[0].confidence, 0.95);
        assert_eq!(issues[0].evidence_snippet, "a.py:L1-L2\nbetter evidence");
        assert_eq!(issues[1].confidence, 0.9);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("1 new issue(s)"));
    }

    #[test]
    fn merge_keeps_old_evidence_when_refined_evidence_invalid() {
        let mut issues = vec![issue("k0", Severity::High, 0.4, "a.py:L1-L1\nx")];
        let refined = DraftReview {
            issues: vec![issue("k0", Severity::High, 0.9, "")],
            ..DraftReview::default()
        };
        merge_refinements(&mut issues, refined, &mut Vec::new());
        assert_eq!(issues[0].evidence_snippet, "a.py:L1-L1\nx");
        assert_eq!(issues[0].confidence, 0.9);
    }

    #[test]
    fn finalize_drops_evidence_less_issues_with_warning() {
        let issues = vec![
            issue("k0", Severity::High, 0.9, "a.py:L1-L1\nx"),
            issue("k1", Severity::Critical, 0.9, ""),
            issue("k2", Severity::Low, 0.9, "not a header"),
        ];
        let mut warnings = Vec::new();
        let kept = finalize_issues(issues, 15, &mut warnings);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].dedupe_key, "k0");
        assert!(warnings.iter().any(|w| w.contains("2 issue(s)")));
    }

    #[test]
    fn finalize_dedupes_keeping_first_occurrence() {
        let mut first = issue("same", Severity::High, 0.9, "a.py:L1-L1\nx");
        first.description = "first".into();
        let mut second = issue("same", Severity::High, 0.9, "a.py:L1-L1\nx");
        second.description = "second".into();
        let kept = finalize_issues(vec![first, second], 15, &mut Vec::new());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].description, "first");
    }

    #[test]
    fn finalize_sorts_severity_desc_confidence_desc_stable() {
        let issues = vec![
            issue("low-hi", Severity::Low, 0.99, "a.py:L1-L1\nx"),
            issue("crit-lo", Severity::Critical, 0.3, "a.py:L1-L1\nx"),
            issue("crit-hi", Severity::Critical, 0.8, "a.py:L1-L1\nx"),
            issue("tie-a", Severity::Medium, 0.5, "a.py:L1-L1\nx"),
            issue("tie-b", Severity::Medium, 0.5, "a.py:L1-L1\nx"),
        ];
        let kept = finalize_issues(issues, 15, &mut Vec::new());
        let keys: Vec<&str> = kept.iter().map(|i| i.dedupe_key.as_str()).collect();
        assert_eq!(keys, vec!["crit-hi", "crit-lo", "tie-a", "tie-b", "low-hi"]);
    }

    #[test]
    fn finalize_caps_output_and_names_dropped_count() {
        let issues: Vec<Issue> = (0..20)
            .map(|i| issue(&format!("k{i}"), Severity::Medium, 0.5, "a.py:L1-L1\nx"))
            .collect();
        let mut warnings = Vec::new();
        let kept = finalize_issues(issues, 15, &mut warnings);
        assert_eq!(kept.len(), 15);
        assert!(warnings.iter().any(|w| w.contains("dropped 5")));
    }
}
