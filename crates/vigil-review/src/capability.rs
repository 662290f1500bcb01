//! Capability seams for the external reviewer and linter collaborators.
//!
//! Both are polymorphic with a single production implementation today,
//! designed so a different model provider or linter can be swapped in without
//! touching the orchestration loop.

use std::time::Duration;

use async_trait::async_trait;
use vigil_context::ContextBundle;
use vigil_core::{Issue, Language, VigilError};

/// Instruction variant selecting the prompt for one reviewer invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionVariant {
    /// Initial full review of the bundle.
    Draft,
    /// Retry after unparseable output: demand valid structured output.
    Reformat,
    /// Re-check specific candidate issues with expanded context.
    Verify,
    /// Stronger-model re-analysis of low-confidence high-severity issues.
    Escalate,
}

/// Parsed output of one reviewer invocation.
#[derive(Debug, Clone, Default)]
pub struct DraftReview {
    pub summary: String,
    pub issues: Vec<Issue>,
    /// Per-entry validation problems the parser skipped over.
    pub skipped: Vec<String>,
    pub tokens_used: u64,
    pub cost_usd: f64,
}

/// The external reviewer capability.
///
/// Accepts a context bundle and an instruction variant, returns structured
/// review output or a parse-level error. `focus` carries the candidate
/// issues for the verify and escalate variants; `lint_findings` is
/// supporting evidence gathered from the linter, keyed by path.
#[async_trait]
pub trait Reviewer: Send + Sync {
    /// Model identifier recorded in run output.
    fn model(&self) -> &str;

    /// Run one review invocation, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::StructuredOutput`] when the response is not
    /// valid structured JSON, [`VigilError::Llm`] for transport failures.
    async fn review(
        &self,
        bundle: &ContextBundle,
        instruction: InstructionVariant,
        focus: &[Issue],
        lint_findings: &[(String, LintFinding)],
        timeout: Duration,
    ) -> Result<DraftReview, VigilError>;
}

/// One finding from a lint run.
#[derive(Debug, Clone)]
pub struct LintFinding {
    pub line: u32,
    pub code: String,
    pub message: String,
}

/// Outcome of a lint attempt; never a hard failure of the overall run.
#[derive(Debug, Clone)]
pub enum LintOutcome {
    Findings(Vec<LintFinding>),
    /// The tool cannot run here (missing binary, unsupported input, ...).
    Unavailable(String),
}

/// The external linter capability.
#[async_trait]
pub trait Linter: Send + Sync {
    /// Tool identifier used in warnings.
    fn name(&self) -> &str;

    /// Lint one file's content. A structured "cannot run" outcome stands in
    /// for every failure mode.
    async fn lint(&self, content: &str, filename: &str, language: Language) -> LintOutcome;
}
