//! Context bundle assembly, expansion, and token-budget truncation.

use std::fmt;

use serde::Serialize;
use tracing::debug;
use vigil_core::Language;
use vigil_github::PullRequestSnapshot;

use crate::boundary::enclosing_span;

/// Expansion policy for one review run.
///
/// # Examples
///
/// ```
/// use vigil_context::ContextPolicy;
///
/// let policy = ContextPolicy::default();
/// assert_eq!(policy.window_lines, 20);
/// assert_eq!(policy.max_extra_files, 2);
/// assert_eq!(policy.max_extra_lines_per_file, 200);
/// ```
#[derive(Debug, Clone)]
pub struct ContextPolicy {
    /// Minimum context lines on each side of a changed range.
    pub window_lines: u32,
    /// Number of on-demand expansions allowed per run.
    pub max_extra_files: usize,
    /// Line clip applied to each expansion.
    pub max_extra_lines_per_file: u32,
    /// Estimated-token ceiling for the assembled bundle.
    pub max_context_tokens: usize,
}

impl Default for ContextPolicy {
    fn default() -> Self {
        Self {
            window_lines: 20,
            max_extra_files: 2,
            max_extra_lines_per_file: 200,
            max_context_tokens: 24_000,
        }
    }
}

/// Reason tag attached to an expansion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpandReason {
    LowConfidence,
    InsufficientEvidence,
    CrossFileSuspicion,
}

impl fmt::Display for ExpandReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpandReason::LowConfidence => write!(f, "low_confidence"),
            ExpandReason::InsufficientEvidence => write!(f, "insufficient_evidence"),
            ExpandReason::CrossFileSuspicion => write!(f, "cross_file_suspicion"),
        }
    }
}

/// Outcome of an expansion request.
///
/// `CappedOut` is a signal, not an error: the caller proceeds with the
/// context it already has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionOutcome {
    Expanded,
    CappedOut,
}

/// One contiguous slice of head file content.
#[derive(Debug, Clone, Serialize)]
pub struct FileWindow {
    pub path: String,
    pub line_start: u32,
    pub line_end: u32,
    pub text: String,
    /// Changed-line count of the source file; drives truncation priority.
    pub changes: u32,
}

/// The evidence bundle handed to the reviewer.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    /// Full raw unified diff of the PR.
    pub diff_text: String,
    /// Boundary-snapped content windows, highest-priority files first.
    pub windows: Vec<FileWindow>,
    /// Expansions consumed so far, counted against `max_extra_files`.
    pub extra_files_used: usize,
    /// Set when windows were dropped to fit the token ceiling.
    pub truncated: bool,
}

impl ContextBundle {
    /// Estimated token size of the bundle.
    pub fn token_estimate(&self) -> usize {
        let window_chars: usize = self.windows.iter().map(|w| w.text.len()).sum();
        estimate_tokens(&self.diff_text) + window_chars / 4
    }
}

/// Rough chars/4 token estimate.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Assemble the initial context bundle for a snapshot.
///
/// Includes the full diff, plus a window around every changed range of every
/// file with fetched head content: at least `window_lines` each side, snapped
/// outward to enclosing function/class boundaries, overlapping windows
/// merged. Oversized bundles drop the least-changed files first and are
/// marked truncated.
///
/// # Examples
///
/// ```no_run
/// use vigil_context::{assemble, ContextPolicy};
/// # let snapshot: vigil_github::PullRequestSnapshot = unimplemented!();
///
/// let bundle = assemble(&snapshot, &ContextPolicy::default());
/// assert!(!bundle.diff_text.is_empty());
/// ```
pub fn assemble(snapshot: &PullRequestSnapshot, policy: &ContextPolicy) -> ContextBundle {
    let mut windows = Vec::new();

    // snapshot.files is already ordered most-changed-first
    for file in &snapshot.files {
        let Some(text) = snapshot.head_text(&file.path) else {
            continue;
        };
        if file.changed_ranges.is_empty() {
            continue;
        }
        let language = Language::from_path(&file.path);
        let line_count = text.lines().count() as u32;

        let mut spans: Vec<(u32, u32)> = Vec::new();
        for range in &file.changed_ranges {
            let mut start = range.line_start.saturating_sub(policy.window_lines).max(1);
            let mut end = (range.line_end + policy.window_lines).min(line_count.max(1));
            if let Some(lang) = language {
                if let Some((def_start, def_end)) =
                    enclosing_span(text, lang, range.line_start, range.line_end)
                {
                    start = start.min(def_start);
                    end = end.max(def_end.min(line_count.max(1)));
                }
            }
            spans.push((start, end));
        }
        merge_spans(&mut spans);

        for (start, end) in spans {
            windows.push(FileWindow {
                path: file.path.clone(),
                line_start: start,
                line_end: end,
                text: slice_lines(text, start, end),
                changes: file.changes,
            });
        }
    }

    let mut bundle = ContextBundle {
        diff_text: snapshot.raw_diff.clone(),
        windows,
        extra_files_used: 0,
        truncated: false,
    };
    truncate_to_budget(&mut bundle, policy.max_context_tokens);
    debug!(
        windows = bundle.windows.len(),
        tokens = bundle.token_estimate(),
        truncated = bundle.truncated,
        "context bundle assembled"
    );
    bundle
}

/// Request a targeted expansion of the bundle.
///
/// Consumes one unit of the expansion cap and clips the range to
/// `max_extra_lines_per_file`. Requests beyond the cap, or for content the
/// snapshot does not hold, return [`ExpansionOutcome::CappedOut`].
pub fn expand(
    bundle: &mut ContextBundle,
    snapshot: &PullRequestSnapshot,
    policy: &ContextPolicy,
    path: &str,
    line_start: u32,
    line_end: u32,
    reason: ExpandReason,
) -> ExpansionOutcome {
    if bundle.extra_files_used >= policy.max_extra_files {
        debug!(path, %reason, "expansion rejected: cap reached");
        return ExpansionOutcome::CappedOut;
    }
    let Some(text) = snapshot.head_text(path) else {
        debug!(path, %reason, "expansion rejected: no head content");
        return ExpansionOutcome::CappedOut;
    };

    let line_count = text.lines().count() as u32;
    let start = line_start.max(1).min(line_count.max(1));
    let mut end = line_end.max(start).min(line_count.max(1));
    if end - start + 1 > policy.max_extra_lines_per_file {
        end = start + policy.max_extra_lines_per_file - 1;
    }

    let changes = snapshot
        .files
        .iter()
        .find(|f| f.path == path)
        .map(|f| f.changes)
        .unwrap_or(0);

    bundle.windows.push(FileWindow {
        path: path.to_string(),
        line_start: start,
        line_end: end,
        text: slice_lines(text, start, end),
        changes,
    });
    bundle.extra_files_used += 1;
    debug!(path, start, end, %reason, "expansion granted");
    ExpansionOutcome::Expanded
}

fn merge_spans(spans: &mut Vec<(u32, u32)>) {
    spans.sort_unstable();
    let mut merged: Vec<(u32, u32)> = Vec::with_capacity(spans.len());
    for &(start, end) in spans.iter() {
        match merged.last_mut() {
            Some((_, last_end)) if start <= *last_end + 1 => *last_end = (*last_end).max(end),
            _ => merged.push((start, end)),
        }
    }
    *spans = merged;
}

fn slice_lines(text: &str, line_start: u32, line_end: u32) -> String {
    text.lines()
        .skip(line_start.saturating_sub(1) as usize)
        .take((line_end - line_start + 1) as usize)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drop windows of the least-changed files until the estimate fits.
fn truncate_to_budget(bundle: &mut ContextBundle, max_tokens: usize) {
    while bundle.token_estimate() > max_tokens && !bundle.windows.is_empty() {
        let min_changes = bundle.windows.iter().map(|w| w.changes).min().unwrap_or(0);
        // Peel one lowest-priority file at a time, all its windows together.
        let victim = bundle
            .windows
            .iter()
            .rev()
            .find(|w| w.changes == min_changes)
            .map(|w| w.path.clone());
        let Some(victim) = victim else { break };
        bundle.windows.retain(|w| w.path != victim);
        bundle.truncated = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use vigil_github::{
        ChangedFile, ChangedRange, FileContent, FileStatus, PullRequestMeta, PullRequestSnapshot,
    };

    fn make_file(path: &str, changes: u32, ranges: Vec<(u32, u32)>) -> ChangedFile {
        ChangedFile {
            path: path.into(),
            status: FileStatus::Modified,
            additions: changes,
            deletions: 0,
            changes,
            patch: Some(String::new()),
            previous_path: None,
            changed_ranges: ranges
                .into_iter()
                .map(|(line_start, line_end)| ChangedRange { line_start, line_end })
                .collect(),
            hunks: Vec::new(),
        }
    }

    fn make_snapshot(
        files: Vec<ChangedFile>,
        contents: Vec<(&str, String)>,
        diff: &str,
    ) -> PullRequestSnapshot {
        let mut file_contents = BTreeMap::new();
        for (path, text) in contents {
            file_contents.insert(path.to_string(), FileContent::Text { text, sha: None });
        }
        PullRequestSnapshot {
            repository: "o/r".into(),
            pr_number: 1,
            metadata: PullRequestMeta {
                number: 1,
                title: "t".into(),
                body: String::new(),
                state: "open".into(),
                draft: false,
                author_login: "dev".into(),
                html_url: "https://example.invalid".into(),
                base_ref: "main".into(),
                base_sha: "1".repeat(40),
                head_ref: "x".into(),
                head_sha: "2".repeat(40),
            },
            files,
            raw_diff: diff.into(),
            file_contents,
            fetched_at: Utc::now(),
            warnings: Vec::new(),
            truncated: false,
        }
    }

    fn numbered_lines(count: u32) -> String {
        (1..=count).map(|i| format!("line {i}\n")).collect()
    }

    #[test]
    fn windows_cover_changed_ranges_with_padding() {
        let snapshot = make_snapshot(
            vec![make_file("notes.txt", 1, vec![(50, 52)])],
            vec![("notes.txt", numbered_lines(100))],
            "diff",
        );
        let bundle = assemble(&snapshot, &ContextPolicy::default());
        assert_eq!(bundle.windows.len(), 1);
        let window = &bundle.windows[0];
        assert_eq!(window.line_start, 30);
        assert_eq!(window.line_end, 72);
        assert!(window.text.starts_with("line 30"));
        assert!(window.text.ends_with("line 72"));
    }

    #[test]
    fn windows_clamp_to_file_bounds() {
        let snapshot = make_snapshot(
            vec![make_file("notes.txt", 1, vec![(2, 3)])],
            vec![("notes.txt", numbered_lines(10))],
            "diff",
        );
        let bundle = assemble(&snapshot, &ContextPolicy::default());
        let window = &bundle.windows[0];
        assert_eq!(window.line_start, 1);
        assert_eq!(window.line_end, 10);
    }

    #[test]
    fn overlapping_windows_merge() {
        let snapshot = make_snapshot(
            vec![make_file("notes.txt", 2, vec![(30, 30), (45, 45)])],
            vec![("notes.txt", numbered_lines(200))],
            "diff",
        );
        // ranges 30±20 = [10,50] and 45±20 = [25,65] overlap -> one window
        let bundle = assemble(&snapshot, &ContextPolicy::default());
        assert_eq!(bundle.windows.len(), 1);
        assert_eq!(bundle.windows[0].line_start, 10);
        assert_eq!(bundle.windows[0].line_end, 65);
    }

    #[test]
    fn disjoint_windows_stay_separate() {
        let snapshot = make_snapshot(
            vec![make_file("notes.txt", 2, vec![(30, 30), (150, 150)])],
            vec![("notes.txt", numbered_lines(400))],
            "diff",
        );
        let bundle = assemble(&snapshot, &ContextPolicy::default());
        assert_eq!(bundle.windows.len(), 2);
    }

    #[test]
    fn python_windows_snap_to_function_boundaries() {
        let mut source = String::from("def compute():\n");
        for i in 0..60 {
            source.push_str(&format!("    step_{i} = {i}\n"));
        }
        source.push_str("    return step_0\n");
        // file is 62 lines; change on line 55 sits inside compute()
        let snapshot = make_snapshot(
            vec![make_file("calc.py", 1, vec![(55, 55)])],
            vec![("calc.py", source)],
            "diff",
        );
        let bundle = assemble(&snapshot, &ContextPolicy::default());
        let window = &bundle.windows[0];
        // snapped up to the def on line 1, not just 55-20
        assert_eq!(window.line_start, 1);
        assert_eq!(window.line_end, 62);
    }

    #[test]
    fn files_without_content_are_skipped() {
        let snapshot = make_snapshot(
            vec![make_file("missing.py", 3, vec![(1, 1)])],
            Vec::new(),
            "diff",
        );
        let bundle = assemble(&snapshot, &ContextPolicy::default());
        assert!(bundle.windows.is_empty());
    }

    #[test]
    fn expansion_consumes_cap_then_signals_capped_out() {
        let snapshot = make_snapshot(
            vec![make_file("notes.txt", 1, vec![(5, 5)])],
            vec![("notes.txt", numbered_lines(300))],
            "diff",
        );
        let policy = ContextPolicy::default();
        let mut bundle = assemble(&snapshot, &policy);

        assert_eq!(
            expand(&mut bundle, &snapshot, &policy, "notes.txt", 100, 120, ExpandReason::LowConfidence),
            ExpansionOutcome::Expanded
        );
        assert_eq!(
            expand(&mut bundle, &snapshot, &policy, "notes.txt", 150, 160, ExpandReason::InsufficientEvidence),
            ExpansionOutcome::Expanded
        );
        // third request exceeds max_extra_files = 2
        assert_eq!(
            expand(&mut bundle, &snapshot, &policy, "notes.txt", 200, 210, ExpandReason::CrossFileSuspicion),
            ExpansionOutcome::CappedOut
        );
        assert_eq!(bundle.extra_files_used, 2);
    }

    #[test]
    fn expansion_clips_to_per_file_line_cap() {
        let snapshot = make_snapshot(
            vec![make_file("notes.txt", 1, vec![(5, 5)])],
            vec![("notes.txt", numbered_lines(500))],
            "diff",
        );
        let policy = ContextPolicy::default();
        let mut bundle = assemble(&snapshot, &policy);

        expand(&mut bundle, &snapshot, &policy, "notes.txt", 1, 450, ExpandReason::LowConfidence);
        let window = bundle.windows.last().unwrap();
        assert_eq!(window.line_end - window.line_start + 1, 200);
    }

    #[test]
    fn expansion_for_unknown_file_is_capped_out() {
        let snapshot = make_snapshot(Vec::new(), Vec::new(), "diff");
        let policy = ContextPolicy::default();
        let mut bundle = assemble(&snapshot, &policy);
        assert_eq!(
            expand(&mut bundle, &snapshot, &policy, "ghost.py", 1, 10, ExpandReason::LowConfidence),
            ExpansionOutcome::CappedOut
        );
    }

    #[test]
    fn oversized_bundle_drops_least_changed_files_first() {
        let snapshot = make_snapshot(
            vec![
                make_file("hot.txt", 50, vec![(100, 100)]),
                make_file("cold.txt", 1, vec![(100, 100)]),
            ],
            vec![
                ("hot.txt", numbered_lines(300)),
                ("cold.txt", numbered_lines(300)),
            ],
            "diff",
        );
        let policy = ContextPolicy {
            // each ~41-line window is ~330 chars -> ~82 tokens; allow one
            max_context_tokens: 120,
            ..ContextPolicy::default()
        };
        let bundle = assemble(&snapshot, &policy);
        assert!(bundle.truncated);
        assert_eq!(bundle.windows.len(), 1);
        assert_eq!(bundle.windows[0].path, "hot.txt");
    }

    #[test]
    fn token_estimate_counts_diff_and_windows() {
        let bundle = ContextBundle {
            diff_text: "x".repeat(400),
            windows: vec![FileWindow {
                path: "a".into(),
                line_start: 1,
                line_end: 1,
                text: "y".repeat(200),
                changes: 1,
            }],
            extra_files_used: 0,
            truncated: false,
        };
        assert_eq!(bundle.token_estimate(), 150);
        assert_eq!(estimate_tokens("abcd"), 1);
    }
}
