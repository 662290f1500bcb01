/// Errors that can occur across the Vigil platform.
///
/// Each variant wraps a specific error domain. Library crates use this type
/// directly; the binary crate converts to `miette::Report` at the boundary.
///
/// # Examples
///
/// ```
/// use vigil_core::VigilError;
///
/// let err = VigilError::Config("missing API key".into());
/// assert!(err.to_string().contains("missing API key"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid caller-supplied input (repo reference, PR number, path).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Cache database failure.
    #[error("cache error: {0}")]
    Cache(String),

    /// GitHub API request failed with a non-retryable status.
    #[error("GitHub API error {status} for '{endpoint}'")]
    Api { status: u16, endpoint: String },

    /// Rate limiting persisted through all retry attempts.
    #[error("rate limited after {attempts} attempts for '{endpoint}'")]
    RateLimited { endpoint: String, attempts: u32 },

    /// A single network call exceeded its timebox.
    #[error("network timeout for '{endpoint}'")]
    NetworkTimeout { endpoint: String },

    /// A requested resource does not exist at the given ref.
    #[error("not found: {0}")]
    NotFound(String),

    /// LLM API or transport error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// The reviewer returned output that is not valid structured JSON.
    #[error("structured output parse error: {0}")]
    StructuredOutput(String),

    /// A budget dimension is exhausted; the run must finalize as truncated.
    #[error("budget exhausted: {0}")]
    BudgetExceeded(String),

    /// An auxiliary tool could not run; the review continues with less evidence.
    #[error("tool unavailable: {0}")]
    ToolUnavailable(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl VigilError {
    /// Returns `true` for transient failures the caller may retry under the
    /// bounded backoff policy (rate limits and timeouts share one policy).
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil_core::VigilError;
    ///
    /// let err = VigilError::NetworkTimeout { endpoint: "/user".into() };
    /// assert!(err.is_transient());
    /// assert!(!VigilError::Config("bad".into()).is_transient());
    /// ```
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VigilError::NetworkTimeout { .. } | VigilError::RateLimited { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: VigilError = io_err.into();
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn config_error_displays_message() {
        let err = VigilError::Config("bad value".into());
        assert_eq!(err.to_string(), "configuration error: bad value");
    }

    #[test]
    fn api_error_shows_status_and_endpoint() {
        let err = VigilError::Api {
            status: 502,
            endpoint: "/repos/a/b/pulls/1".into(),
        };
        assert!(err.to_string().contains("502"));
        assert!(err.to_string().contains("/repos/a/b/pulls/1"));
    }

    #[test]
    fn transient_classification() {
        assert!(VigilError::RateLimited {
            endpoint: "/x".into(),
            attempts: 3
        }
        .is_transient());
        assert!(!VigilError::BudgetExceeded("llm_calls".into()).is_transient());
        assert!(!VigilError::StructuredOutput("bad json".into()).is_transient());
    }
}
