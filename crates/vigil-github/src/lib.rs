//! Cached, rate-limit-aware GitHub API client and PR snapshot layer.
//!
//! Fetches pull request metadata, changed files, raw diffs, and file contents
//! into an immutable [`PullRequestSnapshot`], backed by a SQLite response
//! cache with conditional-request revalidation and bounded retry/backoff.

pub mod cache;
pub mod client;
pub mod snapshot;

pub use cache::{CachePolicy, CachedResponse, ResponseCache};
pub use client::{
    parse_repo_full_name, validate_pr_number, Fetched, GitHubClient, Transport, WireResponse,
};
pub use snapshot::{
    fetch_file_content, fetch_pull_request_snapshot, ChangedFile, ChangedRange, FileContent,
    FileStatus, Hunk, PullRequestMeta, PullRequestSnapshot,
};
