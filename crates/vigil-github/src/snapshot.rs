//! Pull request snapshot fetch and normalization.
//!
//! A snapshot is a point-in-time capture of one PR: metadata, changed files
//! (with parsed hunks and head-side changed ranges), the raw unified diff,
//! and head file contents. The cache layer owns it; downstream code only
//! reads it. Files come back most-changed-first so any later truncation
//! drops the least signal.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vigil_core::VigilError;

use crate::client::{parse_repo_full_name, validate_pr_number, GitHubClient};

const FILES_PER_PAGE: usize = 100;

/// Normalized PR metadata required by the review pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestMeta {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: String,
    pub draft: bool,
    pub author_login: String,
    pub html_url: String,
    pub base_ref: String,
    pub base_sha: String,
    pub head_ref: String,
    pub head_sha: String,
}

/// Status of one changed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Removed,
    Renamed,
    /// No textual patch is available for the file.
    Binary,
}

/// Span of changed line numbers in the PR head revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedRange {
    pub line_start: u32,
    pub line_end: u32,
}

/// One hunk header from a unified diff patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub old_start: u32,
    pub old_len: u32,
    pub new_start: u32,
    pub new_len: u32,
}

/// Changed file details from the pull request files API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub status: FileStatus,
    pub additions: u32,
    pub deletions: u32,
    pub changes: u32,
    /// Unified diff patch for the file; absent for binary files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    /// Previous path for renamed files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_path: Option<String>,
    /// Head-side spans of added lines, parsed from the patch.
    #[serde(default)]
    pub changed_ranges: Vec<ChangedRange>,
    /// Parsed hunk headers from the patch.
    #[serde(default)]
    pub hunks: Vec<Hunk>,
}

/// File-content lookup result at one `(path, ref)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileContent {
    /// UTF-8 text content.
    Text { text: String, sha: Option<String> },
    /// Content exists but cannot be reviewed as text.
    Binary { reason: String },
    /// The path does not exist at the ref.
    NotFound,
}

/// Immutable point-in-time capture of one pull request.
///
/// Revalidation never mutates a snapshot: a rerun either confirms freshness
/// through the cache (serving identical bytes) or produces a wholly new
/// snapshot value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestSnapshot {
    pub repository: String,
    pub pr_number: u64,
    pub metadata: PullRequestMeta,
    /// Changed files, ordered most-changed-lines first (then by path).
    pub files: Vec<ChangedFile>,
    pub raw_diff: String,
    /// Head-revision contents keyed by path, for files that could be fetched.
    pub file_contents: BTreeMap<String, FileContent>,
    pub fetched_at: DateTime<Utc>,
    pub warnings: Vec<String>,
    /// Set when pagination or hydration stopped early; the snapshot is still
    /// usable, with priority files present.
    pub truncated: bool,
}

impl PullRequestSnapshot {
    /// Head commit SHA this snapshot was taken at.
    pub fn head_sha(&self) -> &str {
        &self.metadata.head_sha
    }

    /// Head-revision text content for a path, when available.
    pub fn head_text(&self, path: &str) -> Option<&str> {
        match self.file_contents.get(path) {
            Some(FileContent::Text { text, .. }) => Some(text),
            _ => None,
        }
    }
}

// Wire-format structs for the GitHub REST payloads we consume.

#[derive(Deserialize)]
struct PullWire {
    number: u64,
    title: String,
    body: Option<String>,
    state: String,
    #[serde(default)]
    draft: bool,
    user: ActorWire,
    html_url: String,
    base: RefWire,
    head: RefWire,
}

#[derive(Deserialize)]
struct ActorWire {
    login: String,
}

#[derive(Deserialize)]
struct RefWire {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: String,
}

#[derive(Deserialize)]
struct FileWire {
    filename: String,
    status: String,
    additions: u32,
    deletions: u32,
    changes: u32,
    patch: Option<String>,
    previous_filename: Option<String>,
}

#[derive(Deserialize)]
struct ContentWire {
    #[serde(rename = "type")]
    content_type: Option<String>,
    sha: Option<String>,
    encoding: Option<String>,
    content: Option<String>,
}

/// Parse one `@@ -a,b +c,d @@` hunk header.
///
/// # Examples
///
/// ```
/// use vigil_github::snapshot::parse_hunk_header;
///
/// let hunk = parse_hunk_header("@@ -10,5 +12,8 @@ fn main()").unwrap();
/// assert_eq!((hunk.old_start, hunk.old_len, hunk.new_start, hunk.new_len), (10, 5, 12, 8));
/// assert_eq!(parse_hunk_header("@@ -3 +4 @@").map(|h| h.old_len), Some(1));
/// assert!(parse_hunk_header("not a hunk").is_none());
/// ```
pub fn parse_hunk_header(line: &str) -> Option<Hunk> {
    let rest = line.strip_prefix("@@ -")?;
    let (old_part, rest) = rest.split_once(" +")?;
    let (new_part, _) = rest.split_once(" @@")?;

    let parse_pair = |part: &str| -> Option<(u32, u32)> {
        match part.split_once(',') {
            Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
            None => Some((part.parse().ok()?, 1)),
        }
    };

    let (old_start, old_len) = parse_pair(old_part)?;
    let (new_start, new_len) = parse_pair(new_part)?;
    Some(Hunk {
        old_start,
        old_len,
        new_start,
        new_len,
    })
}

/// Parse every hunk header in a file patch.
pub fn parse_patch_hunks(patch: &str) -> Vec<Hunk> {
    patch.lines().filter_map(parse_hunk_header).collect()
}

/// Extract head-side changed line spans (added lines) from a file patch.
///
/// # Examples
///
/// ```
/// use vigil_github::snapshot::head_changed_ranges;
///
/// let patch = "@@ -1,2 +1,3 @@\n context\n+added\n context\n";
/// let ranges = head_changed_ranges(patch);
/// assert_eq!(ranges.len(), 1);
/// assert_eq!((ranges[0].line_start, ranges[0].line_end), (2, 2));
/// ```
pub fn head_changed_ranges(patch: &str) -> Vec<ChangedRange> {
    let mut ranges = Vec::new();
    let mut in_hunk = false;
    let mut head_line = 0u32;
    let mut open: Option<(u32, u32)> = None;

    let mut flush = |open: &mut Option<(u32, u32)>, ranges: &mut Vec<ChangedRange>| {
        if let Some((start, end)) = open.take() {
            ranges.push(ChangedRange {
                line_start: start,
                line_end: end,
            });
        }
    };

    for line in patch.lines() {
        if let Some(hunk) = parse_hunk_header(line) {
            flush(&mut open, &mut ranges);
            in_hunk = true;
            head_line = hunk.new_start;
            continue;
        }
        if !in_hunk {
            continue;
        }

        if line.starts_with('+') && !line.starts_with("+++") {
            match &mut open {
                Some((_, end)) => *end = head_line,
                None => open = Some((head_line, head_line)),
            }
            head_line += 1;
        } else if line.starts_with(' ') {
            flush(&mut open, &mut ranges);
            head_line += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            flush(&mut open, &mut ranges);
        } else if line.starts_with('\\') {
            // "\ No newline at end of file" advances nothing.
        } else {
            flush(&mut open, &mut ranges);
        }
    }

    flush(&mut open, &mut ranges);
    ranges
}

fn file_from_wire(wire: FileWire) -> ChangedFile {
    let status = match wire.status.as_str() {
        "added" => FileStatus::Added,
        "removed" => FileStatus::Removed,
        "renamed" => FileStatus::Renamed,
        _ => FileStatus::Modified,
    };
    // Files the API returns without a textual patch are binary (or too large
    // to diff); either way there is nothing reviewable.
    let status = if wire.patch.is_none() && status != FileStatus::Removed {
        FileStatus::Binary
    } else {
        status
    };

    let changed_ranges = wire
        .patch
        .as_deref()
        .map(head_changed_ranges)
        .unwrap_or_default();
    let hunks = wire
        .patch
        .as_deref()
        .map(parse_patch_hunks)
        .unwrap_or_default();

    ChangedFile {
        path: wire.filename,
        status,
        additions: wire.additions,
        deletions: wire.deletions,
        changes: wire.changes,
        patch: wire.patch,
        previous_path: wire.previous_filename,
        changed_ranges,
        hunks,
    }
}

/// Fetch pull request metadata.
///
/// # Errors
///
/// Propagates client errors ([`VigilError::RateLimited`],
/// [`VigilError::Api`], ...).
pub async fn fetch_pull_request_metadata(
    client: &GitHubClient,
    repo_full_name: &str,
    pr_number: u64,
    wall_cap: Option<Duration>,
) -> Result<PullRequestMeta, VigilError> {
    let (owner, repo) = parse_repo_full_name(repo_full_name)?;
    let pr_number = validate_pr_number(pr_number)?;
    let endpoint = format!("/repos/{owner}/{repo}/pulls/{pr_number}");

    let wire: PullWire = client.get_json(&endpoint, wall_cap).await?;
    Ok(PullRequestMeta {
        number: wire.number,
        title: wire.title,
        body: wire.body.unwrap_or_default(),
        state: wire.state,
        draft: wire.draft,
        author_login: wire.user.login,
        html_url: wire.html_url,
        base_ref: wire.base.git_ref,
        base_sha: wire.base.sha,
        head_ref: wire.head.git_ref,
        head_sha: wire.head.sha,
    })
}

/// Fetch all changed files for a pull request, draining pagination.
///
/// A page failure after at least one successful page keeps the pages already
/// fetched and reports `truncated = true` instead of discarding them.
///
/// # Errors
///
/// Propagates client errors only when the very first page fails.
pub async fn fetch_pull_request_files(
    client: &GitHubClient,
    repo_full_name: &str,
    pr_number: u64,
    wall_cap: Option<Duration>,
) -> Result<(Vec<ChangedFile>, bool, Vec<String>), VigilError> {
    let (owner, repo) = parse_repo_full_name(repo_full_name)?;
    let pr_number = validate_pr_number(pr_number)?;
    let base_endpoint = format!("/repos/{owner}/{repo}/pulls/{pr_number}/files");

    let mut files: Vec<ChangedFile> = Vec::new();
    let mut warnings = Vec::new();
    let mut truncated = false;
    let mut page = 1u32;
    loop {
        let endpoint = format!("{base_endpoint}?per_page={FILES_PER_PAGE}&page={page}");
        let rows: Vec<FileWire> = match client.get_json(&endpoint, wall_cap).await {
            Ok(rows) => rows,
            Err(e) if page > 1 => {
                warn!(page, error = %e, "file pagination stopped early");
                warnings.push(format!(
                    "changed-file listing truncated after {} file(s): {e}",
                    files.len()
                ));
                truncated = true;
                break;
            }
            Err(e) => return Err(e),
        };

        let row_count = rows.len();
        files.extend(rows.into_iter().map(file_from_wire));
        if row_count < FILES_PER_PAGE {
            break;
        }
        page += 1;
    }

    // Deterministic order: most changed lines first, path as tie-break, so
    // downstream truncation keeps the highest-signal files.
    files.sort_by(|a, b| b.changes.cmp(&a.changes).then_with(|| a.path.cmp(&b.path)));

    Ok((files, truncated, warnings))
}

/// Fetch the full raw unified diff for a pull request.
///
/// # Errors
///
/// Propagates client errors.
pub async fn fetch_pull_request_diff(
    client: &GitHubClient,
    repo_full_name: &str,
    pr_number: u64,
    wall_cap: Option<Duration>,
) -> Result<String, VigilError> {
    let (owner, repo) = parse_repo_full_name(repo_full_name)?;
    let pr_number = validate_pr_number(pr_number)?;
    let endpoint = format!("/repos/{owner}/{repo}/pulls/{pr_number}");
    client
        .get_text(&endpoint, "application/vnd.github.diff", wall_cap)
        .await
}

/// Fetch one file's content at a specific git ref.
///
/// Missing paths resolve to [`FileContent::NotFound`]; directories,
/// submodules, oversized payloads, invalid base64, and non-UTF-8 bytes all
/// resolve to [`FileContent::Binary`] with a reason. None of these are
/// errors: the caller skips the file and records a warning.
///
/// # Errors
///
/// Propagates client errors (network, rate limit).
pub async fn fetch_file_content(
    client: &GitHubClient,
    repo_full_name: &str,
    path: &str,
    git_ref: &str,
    wall_cap: Option<Duration>,
) -> Result<FileContent, VigilError> {
    let (owner, repo) = parse_repo_full_name(repo_full_name)?;
    let normalized_path = path.trim_start_matches('/');
    if normalized_path.is_empty() {
        return Err(VigilError::InvalidInput(
            "invalid file path '', expected a non-empty repository path".into(),
        ));
    }
    if git_ref.is_empty() {
        return Err(VigilError::InvalidInput(
            "invalid ref '', expected a non-empty git ref".into(),
        ));
    }

    let endpoint = format!("/repos/{owner}/{repo}/contents/{normalized_path}?ref={git_ref}");
    let fetched = client
        .get_with_retries(&endpoint, Some("application/vnd.github+json"), true, wall_cap)
        .await?;
    if fetched.status == 404 {
        return Ok(FileContent::NotFound);
    }

    let wire: ContentWire = serde_json::from_slice(&fetched.body)?;
    if wire.content_type.as_deref().is_some_and(|t| t != "file") {
        return Ok(FileContent::Binary {
            reason: format!(
                "unsupported content type '{}' for '{normalized_path}'",
                wire.content_type.unwrap_or_default()
            ),
        });
    }
    let Some(content) = wire.content else {
        return Ok(FileContent::Binary {
            reason: format!("missing content payload for '{normalized_path}' at '{git_ref}'"),
        });
    };

    match wire.encoding.as_deref() {
        Some("base64") => {
            let stripped: String = content.chars().filter(|c| !c.is_whitespace()).collect();
            let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(stripped) else {
                return Ok(FileContent::Binary {
                    reason: format!("invalid base64 payload for '{normalized_path}'"),
                });
            };
            match String::from_utf8(bytes) {
                Ok(text) => Ok(FileContent::Text {
                    text,
                    sha: wire.sha,
                }),
                Err(_) => Ok(FileContent::Binary {
                    reason: format!("non-UTF-8 content for '{normalized_path}' at '{git_ref}'"),
                }),
            }
        }
        Some("utf-8") | Some("utf8") => Ok(FileContent::Text {
            text: content,
            sha: wire.sha,
        }),
        other => Ok(FileContent::Binary {
            reason: format!(
                "unsupported content encoding '{}' for '{normalized_path}'",
                other.unwrap_or("none")
            ),
        }),
    }
}

/// Fetch metadata, files, diff, and head contents into one snapshot.
///
/// Head contents are hydrated for every reviewable file (cached lookups make
/// reruns free). Per-file content problems downgrade to warnings; a
/// transient failure mid-hydration keeps what was fetched and marks the
/// snapshot truncated.
///
/// # Errors
///
/// Propagates client errors from the metadata, first files page, or diff
/// fetches; the snapshot cannot exist without those.
pub async fn fetch_pull_request_snapshot(
    client: &GitHubClient,
    repo_full_name: &str,
    pr_number: u64,
    wall_cap: Option<Duration>,
) -> Result<PullRequestSnapshot, VigilError> {
    let metadata =
        fetch_pull_request_metadata(client, repo_full_name, pr_number, wall_cap).await?;
    let (files, mut truncated, mut warnings) =
        fetch_pull_request_files(client, repo_full_name, pr_number, wall_cap).await?;
    let raw_diff = fetch_pull_request_diff(client, repo_full_name, pr_number, wall_cap).await?;

    let without_patch: Vec<&str> = files
        .iter()
        .filter(|f| f.patch.is_none())
        .map(|f| f.path.as_str())
        .collect();
    if !without_patch.is_empty() {
        let mut displayed = without_patch[..without_patch.len().min(5)].join(", ");
        if without_patch.len() > 5 {
            displayed.push_str(", ...");
        }
        warnings.push(format!(
            "{} file(s) missing patch content (binary or truncated): {displayed}",
            without_patch.len()
        ));
    }

    let mut file_contents = BTreeMap::new();
    for file in &files {
        if file.status == FileStatus::Removed || file.status == FileStatus::Binary {
            continue;
        }
        match fetch_file_content(
            client,
            repo_full_name,
            &file.path,
            &metadata.head_sha,
            wall_cap,
        )
        .await
        {
            Ok(FileContent::Text { text, sha }) => {
                file_contents.insert(file.path.clone(), FileContent::Text { text, sha });
            }
            Ok(FileContent::Binary { reason }) => {
                warnings.push(reason);
            }
            Ok(FileContent::NotFound) => {
                warnings.push(format!(
                    "file '{}' not found at head ref '{}'",
                    file.path, metadata.head_sha
                ));
            }
            Err(e) if e.is_transient() => {
                warnings.push(format!(
                    "content hydration stopped at '{}': {e}",
                    file.path
                ));
                truncated = true;
                break;
            }
            Err(e) => {
                warnings.push(format!("failed to fetch content for '{}': {e}", file.path));
            }
        }
    }

    debug!(
        repo = repo_full_name,
        pr = pr_number,
        files = files.len(),
        hydrated = file_contents.len(),
        truncated,
        "snapshot assembled"
    );

    Ok(PullRequestSnapshot {
        repository: repo_full_name.to_string(),
        pr_number,
        metadata,
        files,
        raw_diff,
        file_contents,
        fetched_at: Utc::now(),
        warnings,
        truncated,
    })
}
