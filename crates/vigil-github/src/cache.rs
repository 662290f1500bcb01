//! SQLite-backed response cache for GitHub API GET requests.
//!
//! Each row stores one endpoint's payload together with its validator tokens
//! (ETag / Last-Modified) and freshness window. Entries are replaced with a
//! single upsert so readers never observe a half-written row; revalidation
//! only touches the freshness timestamps.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use vigil_core::VigilError;

/// Freshness window for mutable endpoints (PR metadata, files, diff).
pub const MUTABLE_TTL_SECONDS: f64 = 60.0;
/// Freshness window for file contents at a branch ref.
pub const BRANCH_CONTENT_TTL_SECONDS: f64 = 120.0;
/// Freshness window for file contents at a full commit SHA (effectively
/// immutable; never revalidated).
pub const IMMUTABLE_CONTENT_TTL_SECONDS: f64 = 60.0 * 60.0 * 24.0 * 30.0;

/// API version mixed into cache keys so format changes invalidate cleanly.
const CACHE_KEY_API_VERSION: &str = "2022-11-28";

/// Per-endpoint cache policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachePolicy {
    /// Seconds an entry stays fresh; `None` means fresh forever.
    pub ttl_seconds: Option<f64>,
    /// Immutable entries are never revalidated with conditional requests.
    pub immutable: bool,
}

impl CachePolicy {
    /// Expiration timestamp for an entry written at `now` under this policy.
    pub fn expires_at(&self, now: f64) -> Option<f64> {
        if self.immutable {
            return None;
        }
        self.ttl_seconds.map(|ttl| now + ttl)
    }
}

/// Cached response payload with metadata for revalidation.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Entity tag for `If-None-Match`.
    pub etag: Option<String>,
    /// Fallback validator for `If-Modified-Since`.
    pub last_modified: Option<String>,
    /// Unix timestamp of the last successful fetch or revalidation.
    pub fetched_at: f64,
    /// Unix timestamp the entry goes stale; `None` means never.
    pub expires_at: Option<f64>,
    pub immutable: bool,
}

impl CachedResponse {
    /// Whether the entry can be served without any network request.
    pub fn is_fresh(&self, now: f64) -> bool {
        match self.expires_at {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }
}

/// Build the cache key for one request variant.
///
/// The Accept header participates so the JSON and diff renderings of the same
/// endpoint cache independently.
///
/// # Examples
///
/// ```
/// use vigil_github::cache::cache_key;
///
/// let a = cache_key("/repos/o/r/pulls/1", Some("application/vnd.github+json"));
/// let b = cache_key("/repos/o/r/pulls/1", Some("application/vnd.github.diff"));
/// assert_ne!(a, b);
/// assert_eq!(a, cache_key("/repos/o/r/pulls/1", Some("application/vnd.github+json")));
/// ```
pub fn cache_key(endpoint: &str, accept_header: Option<&str>) -> String {
    let material = format!(
        "GET\n{endpoint}\n{}\n{CACHE_KEY_API_VERSION}",
        accept_header.unwrap_or("")
    );
    let digest = Sha256::digest(material.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// SQLite-backed response cache shared by concurrent runs.
///
/// Readers run concurrently; writes serialize through the connection and each
/// replacement is a single atomic upsert (last-writer-wins on full refresh).
///
/// # Examples
///
/// ```
/// use vigil_github::cache::ResponseCache;
///
/// let cache = ResponseCache::in_memory().unwrap();
/// assert!(cache.get("missing").unwrap().is_none());
/// ```
pub struct ResponseCache {
    conn: Mutex<Connection>,
}

impl ResponseCache {
    /// Open or create a cache database at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Cache`] if the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self, VigilError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VigilError::Cache(format!("failed to create cache directory: {e}")))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| VigilError::Cache(format!("failed to open cache database: {e}")))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| VigilError::Cache(format!("failed to set busy timeout: {e}")))?;

        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.init_schema()?;
        Ok(cache)
    }

    /// Create an in-memory cache (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Cache`] if schema creation fails.
    pub fn in_memory() -> Result<Self, VigilError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| VigilError::Cache(format!("failed to create in-memory cache: {e}")))?;
        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.init_schema()?;
        Ok(cache)
    }

    fn init_schema(&self) -> Result<(), VigilError> {
        let conn = self.lock_conn();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS github_response_cache (
                cache_key TEXT PRIMARY KEY,
                endpoint TEXT NOT NULL,
                accept_header TEXT,
                status_code INTEGER NOT NULL,
                body BLOB NOT NULL,
                etag TEXT,
                last_modified TEXT,
                fetched_at REAL NOT NULL,
                expires_at REAL,
                immutable INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_github_response_cache_expires_at
            ON github_response_cache (expires_at);
            ",
        )
        .map_err(|e| VigilError::Cache(format!("failed to create cache schema: {e}")))?;
        Ok(())
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock only happens if a previous holder panicked; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read a cache entry by key.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Cache`] on query failure.
    pub fn get(&self, key: &str) -> Result<Option<CachedResponse>, VigilError> {
        let conn = self.lock_conn();
        let result = conn.query_row(
            "SELECT status_code, body, etag, last_modified, fetched_at, expires_at, immutable
             FROM github_response_cache
             WHERE cache_key = ?1",
            params![key],
            |row| {
                Ok(CachedResponse {
                    status: row.get::<_, i64>(0)? as u16,
                    body: row.get(1)?,
                    etag: row.get(2)?,
                    last_modified: row.get(3)?,
                    fetched_at: row.get(4)?,
                    expires_at: row.get(5)?,
                    immutable: row.get::<_, i64>(6)? != 0,
                })
            },
        );

        match result {
            Ok(entry) => Ok(Some(entry)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(VigilError::Cache(format!("failed to read cache entry: {e}"))),
        }
    }

    /// Insert or atomically replace a cache entry.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Cache`] on write failure.
    pub fn upsert(
        &self,
        key: &str,
        endpoint: &str,
        accept_header: Option<&str>,
        entry: &CachedResponse,
    ) -> Result<(), VigilError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO github_response_cache (
                cache_key, endpoint, accept_header, status_code, body, etag,
                last_modified, fetched_at, expires_at, immutable
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(cache_key) DO UPDATE SET
                endpoint = excluded.endpoint,
                accept_header = excluded.accept_header,
                status_code = excluded.status_code,
                body = excluded.body,
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                fetched_at = excluded.fetched_at,
                expires_at = excluded.expires_at,
                immutable = excluded.immutable",
            params![
                key,
                endpoint,
                accept_header,
                entry.status as i64,
                entry.body,
                entry.etag,
                entry.last_modified,
                entry.fetched_at,
                entry.expires_at,
                entry.immutable as i64,
            ],
        )
        .map_err(|e| VigilError::Cache(format!("failed to upsert cache entry: {e}")))?;
        Ok(())
    }

    /// Restart the freshness window of an existing entry after a 304,
    /// leaving body and validators untouched.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Cache`] on write failure.
    pub fn touch(
        &self,
        key: &str,
        fetched_at: f64,
        expires_at: Option<f64>,
    ) -> Result<(), VigilError> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE github_response_cache
             SET fetched_at = ?1, expires_at = ?2
             WHERE cache_key = ?3",
            params![fetched_at, expires_at, key],
        )
        .map_err(|e| VigilError::Cache(format!("failed to touch cache entry: {e}")))?;
        Ok(())
    }

    /// Cache policy for an endpoint, based on its path and query.
    ///
    /// File contents pinned to a full commit SHA never change and are cached
    /// immutably; branch-ref contents and all other endpoints get short TTLs.
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil_github::cache::ResponseCache;
    ///
    /// let cache = ResponseCache::in_memory().unwrap();
    /// let sha = "0123456789abcdef0123456789abcdef01234567";
    /// assert!(cache.policy_for_endpoint(&format!("/repos/o/r/contents/a.py?ref={sha}")).immutable);
    /// assert!(!cache.policy_for_endpoint("/repos/o/r/contents/a.py?ref=main").immutable);
    /// assert!(!cache.policy_for_endpoint("/repos/o/r/pulls/1").immutable);
    /// ```
    pub fn policy_for_endpoint(&self, endpoint: &str) -> CachePolicy {
        let (path, query) = match endpoint.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (endpoint, None),
        };

        if path.contains("/contents/") {
            let ref_value = query.and_then(|q| {
                q.split('&')
                    .find_map(|pair| pair.strip_prefix("ref="))
                    .map(str::to_string)
            });
            if ref_value.as_deref().is_some_and(is_commit_sha) {
                return CachePolicy {
                    ttl_seconds: Some(IMMUTABLE_CONTENT_TTL_SECONDS),
                    immutable: true,
                };
            }
            return CachePolicy {
                ttl_seconds: Some(BRANCH_CONTENT_TTL_SECONDS),
                immutable: false,
            };
        }

        CachePolicy {
            ttl_seconds: Some(MUTABLE_TTL_SECONDS),
            immutable: false,
        }
    }

    /// Prune entries whose freshness window ended before `now`.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Cache`] on write failure.
    pub fn delete_expired(&self, now: f64) -> Result<(), VigilError> {
        let conn = self.lock_conn();
        conn.execute(
            "DELETE FROM github_response_cache
             WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )
        .map_err(|e| VigilError::Cache(format!("failed to prune cache: {e}")))?;
        Ok(())
    }
}

/// Whether a ref string is a full or abbreviated lowercase commit SHA.
fn is_commit_sha(value: &str) -> bool {
    (7..=40).contains(&value.len())
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}
