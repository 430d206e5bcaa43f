use crate::anthropic::AnthropicClient;
use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{ChatMessage, ChatResponse, ToolDefinition};
use async_trait::async_trait;
use std::time::Duration;

const MAX_TOOL_NAME_LEN: usize = 64;

/// One chat completion with optional tools. The turn engine depends on this
/// seam rather than on a concrete provider client.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model(&self) -> &str;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    model: String,
    base_url: Option<String>,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, model: &str, request_timeout: Duration) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(LlmError::InvalidInput("api key is required".to_string()));
        }
        if model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model is required".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            provider: detect_provider(model),
            api_key: api_key.trim().to_string(),
            model: model.trim().to_string(),
            base_url: None,
            client,
        })
    }

    /// Point the client at an OpenAI-compatible gateway instead of api.openai.com.
    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    fn model(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse> {
        for tool in tools {
            validate_tool_name(&tool.name)?;
        }
        match self.provider {
            Provider::OpenAI => {
                let c = OpenAiClient::new(
                    self.client.clone(),
                    &self.api_key,
                    &self.model,
                    self.base_url.as_deref(),
                );
                c.chat(messages, tools).await
            }
            Provider::Anthropic => {
                let c = AnthropicClient::new(self.client.clone(), &self.api_key, &self.model);
                c.chat(messages, tools).await
            }
        }
    }
}

fn detect_provider(model: &str) -> Provider {
    let m = model.trim().to_ascii_lowercase();
    if m.starts_with("claude-") {
        return Provider::Anthropic;
    }
    Provider::OpenAI
}

/// Tool names must satisfy both OpenAI (`^[a-zA-Z0-9_-]{1,64}$`) and Anthropic rules.
pub fn validate_tool_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_TOOL_NAME_LEN {
        return Err(LlmError::InvalidInput(format!(
            "tool name must be 1..={MAX_TOOL_NAME_LEN} characters: {name:?}"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-'))
    {
        return Err(LlmError::InvalidInput(format!(
            "tool name {name:?} contains unsupported character {bad:?}"
        )));
    }
    Ok(())
}
