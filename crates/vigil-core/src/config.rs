use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::VigilError;

/// Top-level configuration loaded from `.vigil.toml`.
///
/// Supports layered resolution: CLI flags > env vars > local config > defaults.
///
/// # Examples
///
/// ```
/// use vigil_core::VigilConfig;
///
/// let config = VigilConfig::default();
/// assert_eq!(config.budget.max_llm_calls, 2);
/// assert_eq!(config.llm.prompt_version, "v1");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmConfig,
    /// GitHub API and cache settings.
    #[serde(default)]
    pub github: GithubConfig,
    /// Hard resource ceilings for one review run.
    #[serde(default)]
    pub budget: BudgetProfile,
    /// Artifact output settings.
    #[serde(default)]
    pub output: OutputConfig,
}

impl VigilConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Io`] if the file cannot be read, or
    /// [`VigilError::Toml`] if the content is not valid TOML.
    pub fn from_file(path: &Path) -> Result<Self, VigilError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Toml`] if parsing fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil_core::VigilConfig;
    ///
    /// let toml = r#"
    /// [budget]
    /// max_llm_calls = 4
    /// "#;
    /// let config = VigilConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.budget.max_llm_calls, 4);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, VigilError> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }
}

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model identifier for draft and verify passes.
    #[serde(default = "default_model")]
    pub model: String,
    /// Stronger model used for escalation; escalation is skipped when unset.
    pub escalation_model: Option<String>,
    /// API key for the provider.
    pub api_key: Option<String>,
    /// Custom base URL for API requests.
    pub base_url: Option<String>,
    /// Version tag of the prompt set; part of the review id.
    #[serde(default = "default_prompt_version")]
    pub prompt_version: String,
    /// Upper bound on assembled context size, in estimated tokens.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
}

fn default_model() -> String {
    "gpt-4o".into()
}

fn default_prompt_version() -> String {
    "v1".into()
}

fn default_max_context_tokens() -> usize {
    24_000
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            escalation_model: None,
            api_key: None,
            base_url: None,
            prompt_version: default_prompt_version(),
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

/// GitHub API and response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    /// Personal access token; falls back to `GITHUB_TOKEN` / `GH_TOKEN`.
    pub token: Option<String>,
    /// Path of the SQLite response cache.
    #[serde(default = "default_cache_db_path")]
    pub cache_db_path: String,
    /// Per-request timeout ceiling in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_cache_db_path() -> String {
    ".cache/github_cache.sqlite".into()
}

fn default_timeout_seconds() -> u64 {
    20
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            token: None,
            cache_db_path: default_cache_db_path(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// Named set of hard ceilings for one review run.
///
/// Limits are ceilings, not targets: once any dimension is exhausted the run
/// finalizes as truncated and no further spend-incurring operation executes.
///
/// # Examples
///
/// ```
/// use vigil_core::BudgetProfile;
///
/// let profile = BudgetProfile::default();
/// assert_eq!(profile.name, "default");
/// assert_eq!(profile.max_llm_calls, 2);
/// assert_eq!(profile.max_tool_calls, 3);
/// assert_eq!(profile.max_wall_time_seconds, 60);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetProfile {
    /// Profile name; part of the review id.
    #[serde(default = "default_profile_name")]
    pub name: String,
    #[serde(default = "default_max_llm_calls")]
    pub max_llm_calls: u32,
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,
    /// Upper bound on issues re-checked during the verify pass.
    #[serde(default = "default_max_verify_candidates")]
    pub max_verify_candidates: usize,
    /// Upper bound on issues in the final result.
    #[serde(default = "default_max_output_issues")]
    pub max_output_issues: usize,
    #[serde(default = "default_max_wall_time_seconds")]
    pub max_wall_time_seconds: u64,
    #[serde(default = "default_max_cost_usd")]
    pub max_cost_usd: f64,
}

fn default_profile_name() -> String {
    "default".into()
}

fn default_max_llm_calls() -> u32 {
    2
}

fn default_max_tool_calls() -> u32 {
    3
}

fn default_max_verify_candidates() -> usize {
    5
}

fn default_max_output_issues() -> usize {
    15
}

fn default_max_wall_time_seconds() -> u64 {
    60
}

fn default_max_cost_usd() -> f64 {
    0.50
}

impl Default for BudgetProfile {
    fn default() -> Self {
        Self {
            name: default_profile_name(),
            max_llm_calls: default_max_llm_calls(),
            max_tool_calls: default_max_tool_calls(),
            max_verify_candidates: default_max_verify_candidates(),
            max_output_issues: default_max_output_issues(),
            max_wall_time_seconds: default_max_wall_time_seconds(),
            max_cost_usd: default_max_cost_usd(),
        }
    }
}

/// Artifact output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory holding per-run artifact sets.
    #[serde(default = "default_runs_dir")]
    pub runs_dir: String,
    /// When `true`, telemetry includes full request/response payloads.
    /// Off by default; secrets are never written either way.
    #[serde(default)]
    pub full_payloads: bool,
}

fn default_runs_dir() -> String {
    "runs".into()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            runs_dir: default_runs_dir(),
            full_payloads: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = VigilConfig::default();
        assert_eq!(config.llm.model, "gpt-4o");
        assert_eq!(config.llm.prompt_version, "v1");
        assert!(config.llm.escalation_model.is_none());
        assert_eq!(config.github.cache_db_path, ".cache/github_cache.sqlite");
        assert_eq!(config.github.timeout_seconds, 20);
        assert_eq!(config.budget.max_llm_calls, 2);
        assert_eq!(config.budget.max_tool_calls, 3);
        assert_eq!(config.budget.max_verify_candidates, 5);
        assert_eq!(config.budget.max_output_issues, 15);
        assert_eq!(config.budget.max_wall_time_seconds, 60);
        assert!((config.budget.max_cost_usd - 0.50).abs() < f64::EPSILON);
        assert_eq!(config.output.runs_dir, "runs");
        assert!(!config.output.full_payloads);
    }

    #[test]
    fn parse_minimal_toml() {
        let toml = r#"
[llm]
model = "gpt-4o-mini"
escalation_model = "gpt-4o"

[budget]
name = "strict"
max_llm_calls = 1
"#;
        let config = VigilConfig::from_toml(toml).unwrap();
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.llm.escalation_model.as_deref(), Some("gpt-4o"));
        assert_eq!(config.budget.name, "strict");
        assert_eq!(config.budget.max_llm_calls, 1);
        // untouched sections keep defaults
        assert_eq!(config.budget.max_tool_calls, 3);
        assert_eq!(config.github.timeout_seconds, 20);
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = VigilConfig::from_toml("").unwrap();
        assert_eq!(config.budget.name, "default");
        assert_eq!(config.llm.model, "gpt-4o");
    }

    #[test]
    fn invalid_toml_returns_error() {
        let result = VigilConfig::from_toml("{{invalid}}");
        assert!(result.is_err());
    }
}
