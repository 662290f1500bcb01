use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vigil_context::ContextBundle;
use vigil_core::{Issue, LlmConfig, VigilError};

use crate::capability::{DraftReview, InstructionVariant, LintFinding, Reviewer};
use crate::prompt;

/// Blended per-token price used for cost accounting when the provider does
/// not report one.
const COST_PER_TOKEN_USD: f64 = 5.0e-6;

/// A message in a chat conversation with the LLM.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Role in the chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// OpenAI-compatible chat-completions reviewer.
///
/// Works with any provider that exposes the `/v1/chat/completions` endpoint.
///
/// # Examples
///
/// ```
/// use vigil_core::LlmConfig;
/// use vigil_review::llm::ChatReviewer;
///
/// let config = LlmConfig::default();
/// let reviewer = ChatReviewer::new(&config, &config.model).unwrap();
/// ```
pub struct ChatReviewer {
    client: reqwest::Client,
    model: String,
    api_key: Option<String>,
    base_url: Option<String>,
}

impl ChatReviewer {
    /// Create a reviewer for `model` using the shared provider settings.
    ///
    /// The same constructor builds the draft reviewer and the escalation
    /// variant; only the model differs.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Llm`] if the HTTP client cannot be built.
    pub fn new(config: &LlmConfig, model: &str) -> Result<Self, VigilError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| VigilError::Llm(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            model: model.to_string(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
        })
    }

    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        timeout: Duration,
    ) -> Result<(String, u64), VigilError> {
        let base_url = self.base_url.as_deref().unwrap_or("https://api.openai.com");
        let url = format!("{base_url}/v1/chat/completions");

        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.1,
            "response_format": { "type": "json_object" },
        });

        let mut request = self.client.post(&url).timeout(timeout);
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }
        request = request.header("Content-Type", "application/json");

        let response = request.json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                VigilError::NetworkTimeout {
                    endpoint: "/v1/chat/completions".into(),
                }
            } else {
                VigilError::Llm(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(VigilError::Llm(format!("LLM API error {status}: {body_text}")));
        }

        let response_body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VigilError::Llm(format!("failed to parse response: {e}")))?;

        let content = response_body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                VigilError::Llm(format!("unexpected response structure: {response_body}"))
            })?
            .to_string();

        let tokens_used = response_body
            .get("usage")
            .and_then(|u| u.get("total_tokens"))
            .and_then(|t| t.as_u64())
            .unwrap_or(0);

        Ok((content, tokens_used))
    }
}

#[async_trait]
impl Reviewer for ChatReviewer {
    fn model(&self) -> &str {
        &self.model
    }

    async fn review(
        &self,
        bundle: &ContextBundle,
        instruction: InstructionVariant,
        focus: &[Issue],
        lint_findings: &[(String, LintFinding)],
        timeout: Duration,
    ) -> Result<DraftReview, VigilError> {
        let messages = vec![
            ChatMessage {
                role: Role::System,
                content: prompt::build_system_prompt(),
            },
            ChatMessage {
                role: Role::User,
                content: prompt::build_user_prompt(bundle, instruction, focus, lint_findings),
            },
        ];

        let (content, tokens_used) = self.chat(messages, timeout).await?;
        debug!(model = %self.model, ?instruction, tokens_used, "reviewer responded");

        let mut draft = prompt::parse_review_response(&content)?;
        draft.tokens_used = tokens_used;
        draft.cost_usd = tokens_used as f64 * COST_PER_TOKEN_USD;
        Ok(draft)
    }
}
