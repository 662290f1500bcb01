use std::str::FromStr;

use serde::Deserialize;
use vigil_context::ContextBundle;
use vigil_core::{build_dedupe_key, dedupe_key_is_valid, Category, Issue, Language, Severity, VigilError};

use crate::capability::{DraftReview, InstructionVariant, LintFinding};

const SYSTEM_PROMPT: &str = "\
You are Vigil, an expert code reviewer. Your job is to find genuine bugs, \
security issues, and significant problems in a pull request.

Rules:
- Only report issues you can support with evidence from the provided context
- Reference head-revision line numbers
- Quote the offending lines in evidence_snippet, prefixed by a path:Lx-Ly header line
- Do not speculate about code you cannot see
- Do not comment on style or naming unless it creates a defect

Respond with a JSON object:
{
  \"summary\": \"One-paragraph overview of the change and its risks\",
  \"issues\": [
    {
      \"file\": \"path/to/file.py\",
      \"line_start\": 42,
      \"line_end\": 45,
      \"severity\": \"critical\" | \"high\" | \"medium\" | \"low\",
      \"category\": \"security\" | \"bug\" | \"error_handling\" | \"performance\" | \"style\" | \"logic\",
      \"description\": \"What is wrong\",
      \"suggestion\": \"How to fix it\",
      \"evidence_snippet\": \"path/to/file.py:L42-L45\\n<the offending lines>\",
      \"confidence\": 0.0-1.0,
      \"language\": \"python\" | \"javascript\" | \"typescript\"
    }
  ]
}

If you find no issues, return: { \"summary\": \"...\", \"issues\": [] }";

const REFORMAT_INSTRUCTION: &str = "\
Your previous reply was not valid JSON. Return ONLY a valid JSON object \
matching the schema from the system prompt. No prose, no code fences.";

/// Build the system prompt for the reviewer.
pub fn build_system_prompt() -> String {
    SYSTEM_PROMPT.to_string()
}

/// Build the user prompt for one invocation.
///
/// The draft and reformat variants carry the full bundle; verify and
/// escalate additionally name the candidate issues to re-check and any
/// linter findings gathered as extra evidence.
pub fn build_user_prompt(
    bundle: &ContextBundle,
    instruction: InstructionVariant,
    focus: &[Issue],
    lint_findings: &[(String, LintFinding)],
) -> String {
    let mut prompt = String::new();

    match instruction {
        InstructionVariant::Draft => {
            prompt.push_str("Review the following pull request.\n\n");
        }
        InstructionVariant::Reformat => {
            prompt.push_str(REFORMAT_INSTRUCTION);
            prompt.push_str("\n\nReview the following pull request.\n\n");
        }
        InstructionVariant::Verify => {
            prompt.push_str(
                "Re-examine ONLY the candidate issues listed below against the \
                 expanded context. Confirm, refine, or reject each one; do not \
                 introduce new issues.\n\n",
            );
        }
        InstructionVariant::Escalate => {
            prompt.push_str(
                "You are the escalation reviewer. Re-analyze the high-risk \
                 candidate issues below with maximum rigor. Improve their \
                 descriptions and confidence; do not introduce new issues.\n\n",
            );
        }
    }

    if !focus.is_empty() {
        prompt.push_str("Candidate issues:\n");
        for issue in focus {
            prompt.push_str(&format!(
                "- {} [{}/{}] at {}:{} (confidence {:.2}): {}\n",
                issue.dedupe_key,
                issue.severity,
                issue.category,
                issue.file,
                issue.line_start,
                issue.confidence,
                issue.description,
            ));
        }
        prompt.push('\n');
    }

    if !lint_findings.is_empty() {
        prompt.push_str("Linter findings (supporting evidence only):\n");
        for (path, finding) in lint_findings {
            prompt.push_str(&format!(
                "- {path}:{} {} {}\n",
                finding.line, finding.code, finding.message
            ));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!("```diff\n{}\n```\n", bundle.diff_text));

    for window in &bundle.windows {
        prompt.push_str(&format!(
            "\nFile context {}:L{}-L{}:\n```\n{}\n```\n",
            window.path, window.line_start, window.line_end, window.text
        ));
    }

    prompt
}

#[derive(Deserialize)]
struct ResponseWire {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    issues: Vec<IssueWire>,
}

#[derive(Deserialize)]
struct IssueWire {
    file: Option<String>,
    line_start: Option<u32>,
    line_end: Option<u32>,
    severity: Option<String>,
    category: Option<String>,
    description: Option<String>,
    suggestion: Option<String>,
    evidence_snippet: Option<String>,
    dedupe_key: Option<String>,
    confidence: Option<f64>,
    language: Option<String>,
}

/// Parse the reviewer's JSON response into a [`DraftReview`].
///
/// A top-level parse failure is a [`VigilError::StructuredOutput`] (the
/// caller gets one bounded retry). Individual malformed entries are skipped
/// and reported in `skipped` rather than failing the invocation.
///
/// # Errors
///
/// Returns [`VigilError::StructuredOutput`] when the response is not a JSON
/// object of the expected shape.
///
/// # Examples
///
/// ```
/// use vigil_review::prompt::parse_review_response;
///
/// let draft = parse_review_response(r#"{"summary":"ok","issues":[]}"#).unwrap();
/// assert_eq!(draft.summary, "ok");
/// assert!(parse_review_response("not json").is_err());
/// ```
pub fn parse_review_response(response: &str) -> Result<DraftReview, VigilError> {
    let cleaned = strip_code_fences(response);
    let wire: ResponseWire = serde_json::from_str(cleaned)
        .map_err(|e| VigilError::StructuredOutput(format!("invalid reviewer JSON: {e}")))?;

    let mut issues = Vec::new();
    let mut skipped = Vec::new();
    for (index, entry) in wire.issues.into_iter().enumerate() {
        match validate_issue(entry) {
            Ok(issue) => issues.push(issue),
            Err(reason) => skipped.push(format!("issue {index}: {reason}")),
        }
    }

    Ok(DraftReview {
        summary: wire.summary,
        issues,
        skipped,
        tokens_used: 0,
        cost_usd: 0.0,
    })
}

fn validate_issue(wire: IssueWire) -> Result<Issue, String> {
    let file = wire.file.filter(|f| !f.is_empty()).ok_or("missing file")?;
    let line_start = wire.line_start.filter(|l| *l >= 1).ok_or("missing or zero line_start")?;
    let line_end = match wire.line_end {
        Some(end) if end < line_start => return Err("line_end before line_start".into()),
        other => other,
    };
    let severity = wire
        .severity
        .as_deref()
        .and_then(|s| Severity::from_str(s).ok())
        .ok_or("missing or unknown severity")?;
    let category = wire
        .category
        .as_deref()
        .and_then(|c| Category::from_str(c).ok())
        .ok_or("missing or unknown category")?;
    let description = wire
        .description
        .filter(|d| !d.trim().is_empty())
        .ok_or("missing description")?;
    let suggestion = wire
        .suggestion
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "No concrete suggestion provided.".into());
    let evidence_snippet = wire.evidence_snippet.unwrap_or_default();
    let confidence = wire
        .confidence
        .map(|c| c.clamp(0.0, 1.0))
        .ok_or("missing confidence")?;
    let language = match wire.language.as_deref() {
        Some("python") => Language::Python,
        Some("javascript") => Language::Javascript,
        Some("typescript") => Language::Typescript,
        _ => Language::from_path(&file).ok_or("missing or unknown language")?,
    };

    let dedupe_key = match wire.dedupe_key {
        Some(key) if dedupe_key_is_valid(&key) => key,
        _ => build_dedupe_key(&file, line_start, category, &evidence_snippet),
    };

    Ok(Issue {
        file,
        line_start,
        line_end,
        severity,
        category,
        description,
        suggestion,
        evidence_snippet,
        dedupe_key,
        confidence,
        language,
    })
}

fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        if let Some(inner) = rest.strip_suffix("```") {
            return inner.trim();
        }
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(inner) = rest.strip_suffix("```") {
            return inner.trim();
        }
    }
    trimmed
}
