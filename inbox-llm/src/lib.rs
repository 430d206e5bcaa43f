//! Bring-your-own-key LLM client used by the inbox turn engine.
//!
//! Pure HTTP client: one non-streaming chat call with optional tool definitions,
//! against OpenAI-compatible or Anthropic endpoints.

mod anthropic;
mod client;
mod error;
mod openai;
mod types;

pub use client::{ChatModel, LlmClient, Provider, validate_tool_name};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatResponse, Role, ToolCall, ToolDefinition, Usage};
