use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, ChatResponse, Role, ToolCall, ToolDefinition, Usage};
use serde::{Deserialize, Serialize};

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 1024;

#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, api_key: &str, model: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse> {
        let req = AnthropicRequest::new(&self.model, messages, tools);

        let response = self
            .http
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: AnthropicResponse = serde_json::from_str(&body)?;
        parsed.try_into()
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
}

impl AnthropicRequest {
    fn new(model: &str, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Self {
        let mut system = String::new();
        let mut out_messages: Vec<AnthropicMessage> = Vec::new();

        for m in messages {
            let next = match m.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(m.content.trim());
                    continue;
                }
                Role::User => to_anthropic_user_message(m),
                Role::Assistant => to_anthropic_assistant_message(m),
                Role::Tool => to_anthropic_tool_result_message(m),
            };
            // Consecutive same-role turns must be merged; customers often send
            // several messages in a row.
            match out_messages.last_mut() {
                Some(prev) if prev.role == next.role => prev.content.extend(next.content),
                _ => out_messages.push(next),
            }
        }

        Self {
            model: model.to_string(),
            max_tokens: ANTHROPIC_MAX_TOKENS,
            system,
            messages: out_messages,
            tools: tools.iter().map(to_anthropic_tool).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

fn to_anthropic_tool(t: &ToolDefinition) -> AnthropicTool {
    AnthropicTool {
        name: t.name.clone(),
        description: t.description.clone(),
        input_schema: t.parameters.clone(),
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

fn to_anthropic_user_message(m: &ChatMessage) -> AnthropicMessage {
    AnthropicMessage {
        role: "user".to_string(),
        content: vec![AnthropicContentBlock::Text {
            text: m.content.clone(),
        }],
    }
}

fn to_anthropic_tool_result_message(m: &ChatMessage) -> AnthropicMessage {
    AnthropicMessage {
        role: "user".to_string(),
        content: vec![AnthropicContentBlock::ToolResult {
            tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
            content: m.content.clone(),
        }],
    }
}

fn to_anthropic_assistant_message(m: &ChatMessage) -> AnthropicMessage {
    let mut blocks = Vec::new();
    if !m.content.trim().is_empty() {
        blocks.push(AnthropicContentBlock::Text {
            text: m.content.clone(),
        });
    }
    for tc in &m.tool_calls {
        let input = serde_json::from_str(&tc.arguments).unwrap_or_else(|_| serde_json::json!({}));
        blocks.push(AnthropicContentBlock::ToolUse {
            id: tc.id.clone(),
            name: tc.name.clone(),
            input,
        });
    }
    AnthropicMessage {
        role: "assistant".to_string(),
        content: blocks,
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: String,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl TryFrom<AnthropicResponse> for ChatResponse {
    type Error = LlmError;

    fn try_from(v: AnthropicResponse) -> Result<Self> {
        let mut content = String::new();
        let mut tool_calls = Vec::new();

        for block in v.content {
            match block {
                AnthropicContentBlock::Text { text } => content.push_str(&text),
                AnthropicContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments: serde_json::to_string(&input)?,
                    });
                }
                AnthropicContentBlock::ToolResult { .. } => {}
            }
        }

        Ok(ChatResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content,
                tool_calls,
                tool_call_id: None,
            },
            usage: Usage {
                prompt_tokens: u32::try_from(v.usage.input_tokens).unwrap_or(u32::MAX),
                completion_tokens: u32::try_from(v.usage.output_tokens).unwrap_or(u32::MAX),
            },
            finish_reason: v.stop_reason,
        })
    }
}
