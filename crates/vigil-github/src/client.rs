//! Conditional-request HTTP client with bounded retry and backoff.
//!
//! All GitHub GETs flow through [`GitHubClient::get_with_retries`], which
//! consults the response cache first, revalidates stale entries with
//! `If-None-Match` / `If-Modified-Since`, and retries 429/5xx/timeouts under
//! an explicit attempt-counter loop. The wire is abstracted behind
//! [`Transport`] so the retry and revalidation logic is testable without a
//! network.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use vigil_core::VigilError;

use crate::cache::{cache_key, CachedResponse, ResponseCache};

pub const GITHUB_API_BASE_URL: &str = "https://api.github.com";
pub const GITHUB_API_VERSION: &str = "2022-11-28";
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const USER_AGENT: &str = "vigil";

/// One wire-level response, reduced to the fields the client consumes.
#[derive(Debug, Clone)]
pub struct WireResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Server-advised resume delay from `Retry-After`, in seconds.
    pub retry_after_seconds: Option<f64>,
    pub body: Vec<u8>,
}

/// Transport seam for issuing one GET request.
///
/// The production implementation wraps `reqwest`; tests script responses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET for `endpoint` (path + query, relative to the API base)
    /// with extra request headers, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::NetworkTimeout`] when the timebox elapses and
    /// [`VigilError::Api`] for connection-level failures.
    async fn get(
        &self,
        endpoint: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<WireResponse, VigilError>;
}

struct ReqwestTransport {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        endpoint: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<WireResponse, VigilError> {
        let url = format!("{}{endpoint}", self.base_url);
        let mut request = self
            .http
            .get(&url)
            .timeout(timeout)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .header("User-Agent", USER_AGENT);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                VigilError::NetworkTimeout {
                    endpoint: endpoint.to_string(),
                }
            } else {
                VigilError::Api {
                    status: 0,
                    endpoint: endpoint.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let header_value = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header_value("ETag");
        let last_modified = header_value("Last-Modified");
        let retry_after_seconds = header_value("Retry-After")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| *v >= 0.0);

        let body = response
            .bytes()
            .await
            .map_err(|_| VigilError::Api {
                status,
                endpoint: endpoint.to_string(),
            })?
            .to_vec();

        Ok(WireResponse {
            status,
            etag,
            last_modified,
            retry_after_seconds,
            body,
        })
    }
}

/// A response as seen by callers, after cache resolution.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub status: u16,
    pub body: Vec<u8>,
    /// Whether the body was served from the cache (fresh hit or 304).
    pub from_cache: bool,
}

/// Cached, rate-limit-aware GitHub API client.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use vigil_github::{GitHubClient, ResponseCache};
///
/// let cache = Arc::new(ResponseCache::in_memory().unwrap());
/// let client = GitHubClient::new("ghp_xxxx", Some(cache), 20).unwrap();
/// ```
pub struct GitHubClient {
    transport: Arc<dyn Transport>,
    cache: Option<Arc<ResponseCache>>,
    max_attempts: u32,
    backoff_base: Duration,
    default_timeout: Duration,
}

impl GitHubClient {
    /// Create a client with a reqwest-backed transport.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Config`] if the HTTP client cannot be built.
    pub fn new(
        token: &str,
        cache: Option<Arc<ResponseCache>>,
        timeout_seconds: u64,
    ) -> Result<Self, VigilError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| VigilError::Config(format!("failed to create HTTP client: {e}")))?;
        let transport = Arc::new(ReqwestTransport {
            http,
            base_url: GITHUB_API_BASE_URL.to_string(),
            token: token.to_string(),
        });
        Ok(Self {
            transport,
            cache,
            max_attempts: MAX_ATTEMPTS,
            backoff_base: BACKOFF_BASE,
            default_timeout: Duration::from_secs(timeout_seconds),
        })
    }

    /// Create a client over an arbitrary transport (used by tests).
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        cache: Option<Arc<ResponseCache>>,
    ) -> Self {
        Self {
            transport,
            cache,
            max_attempts: MAX_ATTEMPTS,
            backoff_base: BACKOFF_BASE,
            default_timeout: Duration::from_secs(20),
        }
    }

    /// Override the backoff base interval (used by tests to avoid sleeping).
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// The per-call timebox: the configured ceiling, clamped below the
    /// caller's remaining wall budget when one is given.
    pub fn effective_timeout(&self, wall_cap: Option<Duration>) -> Duration {
        match wall_cap {
            Some(cap) => self.default_timeout.min(cap),
            None => self.default_timeout,
        }
    }

    /// Perform a GET with cache resolution, revalidation, and bounded retry.
    ///
    /// Fresh cache entries are returned without touching the network. Stale
    /// entries are revalidated conditionally; a 304 restarts the freshness
    /// window and serves the stored payload unchanged. Any 2xx replaces the
    /// entry atomically. 404 is only tolerated (and cached) when
    /// `allow_not_found` is set.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::RateLimited`] when 429 persists through all
    /// attempts, [`VigilError::NetworkTimeout`] when timeouts do, and
    /// [`VigilError::Api`] for other failure statuses.
    pub async fn get_with_retries(
        &self,
        endpoint: &str,
        accept_header: Option<&str>,
        allow_not_found: bool,
        wall_cap: Option<Duration>,
    ) -> Result<Fetched, VigilError> {
        let key = cache_key(endpoint, accept_header);
        let now = epoch_now();

        let mut cache_entry = match &self.cache {
            Some(cache) => cache.get(&key).unwrap_or_else(|e| {
                warn!(endpoint, error = %e, "cache read failed; fetching fresh");
                None
            }),
            None => None,
        };

        // A cached 404 only short-circuits lookups that tolerate it.
        if !allow_not_found && cache_entry.as_ref().is_some_and(|e| e.status == 404) {
            cache_entry = None;
        }

        if let Some(entry) = &cache_entry {
            if entry.is_fresh(now) {
                debug!(endpoint, "serving fresh cache entry");
                return Ok(Fetched {
                    status: entry.status,
                    body: entry.body.clone(),
                    from_cache: true,
                });
            }
        }

        let mut headers: Vec<(String, String)> = Vec::new();
        if let Some(accept) = accept_header {
            headers.push(("Accept".into(), accept.into()));
        }
        if let Some(entry) = &cache_entry {
            if !entry.immutable {
                if let Some(etag) = &entry.etag {
                    headers.push(("If-None-Match".into(), etag.clone()));
                } else if let Some(last_modified) = &entry.last_modified {
                    headers.push(("If-Modified-Since".into(), last_modified.clone()));
                }
            }
        }

        let timeout = self.effective_timeout(wall_cap);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = match self.transport.get(endpoint, &headers, timeout).await {
                Ok(response) => response,
                Err(e @ VigilError::NetworkTimeout { .. }) => {
                    if attempt >= self.max_attempts {
                        return Err(e);
                    }
                    let delay = self.backoff_delay(attempt, None);
                    warn!(endpoint, attempt, "request timed out; retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if response.status == 304 {
                if let Some(entry) = &cache_entry {
                    if let Some(cache) = &self.cache {
                        let policy = cache.policy_for_endpoint(endpoint);
                        let now = epoch_now();
                        if let Err(e) = cache.touch(&key, now, policy.expires_at(now)) {
                            warn!(endpoint, error = %e, "cache touch failed");
                        }
                    }
                    debug!(endpoint, "revalidated; serving cached payload");
                    return Ok(Fetched {
                        status: entry.status,
                        body: entry.body.clone(),
                        from_cache: true,
                    });
                }
                // 304 without a stored entry cannot be satisfied locally.
                return Err(VigilError::Api {
                    status: 304,
                    endpoint: endpoint.to_string(),
                });
            }

            if response.status < 400 || (allow_not_found && response.status == 404) {
                self.store(&key, endpoint, accept_header, &response);
                return Ok(Fetched {
                    status: response.status,
                    body: response.body,
                    from_cache: false,
                });
            }

            let retryable = response.status == 429 || (500..600).contains(&response.status);
            if !retryable || attempt >= self.max_attempts {
                if response.status == 429 {
                    return Err(VigilError::RateLimited {
                        endpoint: endpoint.to_string(),
                        attempts: attempt,
                    });
                }
                return Err(VigilError::Api {
                    status: response.status,
                    endpoint: endpoint.to_string(),
                });
            }

            let delay = self.backoff_delay(attempt, response.retry_after_seconds);
            warn!(
                endpoint,
                status = response.status,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retryable response; backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Perform a GET and deserialize the JSON body.
    ///
    /// # Errors
    ///
    /// Propagates transport errors plus [`VigilError::Serialization`] when
    /// the payload does not match `T`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        wall_cap: Option<Duration>,
    ) -> Result<T, VigilError> {
        let fetched = self
            .get_with_retries(endpoint, Some("application/vnd.github+json"), false, wall_cap)
            .await?;
        Ok(serde_json::from_slice(&fetched.body)?)
    }

    /// Perform a GET with an explicit Accept header and return text.
    ///
    /// # Errors
    ///
    /// Propagates transport errors; non-UTF-8 bodies become
    /// [`VigilError::Api`].
    pub async fn get_text(
        &self,
        endpoint: &str,
        accept_header: &str,
        wall_cap: Option<Duration>,
    ) -> Result<String, VigilError> {
        let fetched = self
            .get_with_retries(endpoint, Some(accept_header), false, wall_cap)
            .await?;
        String::from_utf8(fetched.body).map_err(|_| VigilError::Api {
            status: fetched.status,
            endpoint: endpoint.to_string(),
        })
    }

    fn store(&self, key: &str, endpoint: &str, accept_header: Option<&str>, wire: &WireResponse) {
        let Some(cache) = &self.cache else { return };
        let policy = cache.policy_for_endpoint(endpoint);
        let now = epoch_now();
        let entry = CachedResponse {
            status: wire.status,
            body: wire.body.clone(),
            etag: wire.etag.clone(),
            last_modified: wire.last_modified.clone(),
            fetched_at: now,
            expires_at: policy.expires_at(now),
            immutable: policy.immutable,
        };
        if let Err(e) = cache.upsert(key, endpoint, accept_header, &entry) {
            warn!(endpoint, error = %e, "cache write failed");
        }
    }

    /// Delay before the next attempt: the server-advised resume delay when
    /// present, otherwise exponential backoff with jitter.
    fn backoff_delay(&self, attempt: u32, retry_after_seconds: Option<f64>) -> Duration {
        if let Some(seconds) = retry_after_seconds {
            return Duration::from_secs_f64(seconds);
        }
        let exponential = self.backoff_base.as_secs_f64() * 2_f64.powi(attempt as i32 - 1);
        let jitter = rand::rng().random_range(0.0..0.25);
        Duration::from_secs_f64(exponential * (1.0 + jitter))
    }
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Parse and validate repository input in `owner/repo` format.
///
/// # Errors
///
/// Returns [`VigilError::InvalidInput`] if the format is invalid.
///
/// # Examples
///
/// ```
/// use vigil_github::parse_repo_full_name;
///
/// let (owner, repo) = parse_repo_full_name("octocat/hello-world").unwrap();
/// assert_eq!(owner, "octocat");
/// assert_eq!(repo, "hello-world");
/// assert!(parse_repo_full_name("no-slash").is_err());
/// ```
pub fn parse_repo_full_name(repo_full_name: &str) -> Result<(String, String), VigilError> {
    let trimmed = repo_full_name.trim();
    let Some((owner, repo)) = trimmed.split_once('/') else {
        return Err(VigilError::InvalidInput(format!(
            "invalid repo '{repo_full_name}', expected owner/repo"
        )));
    };
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return Err(VigilError::InvalidInput(format!(
            "invalid repo '{repo_full_name}', expected owner/repo"
        )));
    }
    Ok((owner.to_string(), repo.to_string()))
}

/// Validate a pull request number.
///
/// # Errors
///
/// Returns [`VigilError::InvalidInput`] for zero.
pub fn validate_pr_number(pr_number: u64) -> Result<u64, VigilError> {
    if pr_number == 0 {
        return Err(VigilError::InvalidInput(
            "invalid PR number '0', expected a positive integer".into(),
        ));
    }
    Ok(pr_number)
}
