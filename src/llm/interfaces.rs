use crate::error::LLMError;
use crate::tools::ToolBox;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Supported LLM models
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Model {
    // OpenAI Models
    GPT4o,
    GPT4oMini,
    GPT41,

    // Anthropic Models
    ClaudeSonnet,
    ClaudeHaiku,

    // Open Source Models (via Ollama)
    Llama3,
    QwenCoder,

    // Custom model string
    Custom(String),
}

impl Model {
    pub fn as_str(&self) -> &str {
        match self {
            Model::GPT4o => "gpt-4o",
            Model::GPT4oMini => "gpt-4o-mini",
            Model::GPT41 => "gpt-4.1",
            Model::ClaudeSonnet => "claude-sonnet-4-20250514",
            Model::ClaudeHaiku => "claude-3-5-haiku-latest",
            Model::Llama3 => "llama3",
            Model::QwenCoder => "qwen2.5-coder",
            Model::Custom(s) => s,
        }
    }

    /// Parse a user-supplied selector, keeping unknown names as `Custom`.
    pub fn from_selector(selector: &str) -> Self {
        match selector.trim() {
            "gpt-4o" => Model::GPT4o,
            "gpt-4o-mini" => Model::GPT4oMini,
            "gpt-4.1" => Model::GPT41,
            "claude-sonnet-4-20250514" | "sonnet" => Model::ClaudeSonnet,
            "claude-3-5-haiku-latest" | "haiku" => Model::ClaudeHaiku,
            "llama3" => Model::Llama3,
            "qwen2.5-coder" => Model::QwenCoder,
            other => Model::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// LLM request structure
#[derive(Debug, Clone)]
pub struct LLMRequest {
    pub messages: Vec<Message>,
    pub model: Model,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    /// Tools the model may call; `None` when the conversation has no tool access.
    pub toolbox: Option<Arc<ToolBox>>,
}

/// Message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// Tool definition for function calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// LLM response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMResponse {
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Configuration for LLM providers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMConfig {
    pub provider: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub timeout_seconds: u64,
    /// Extra attempts after the first when opening a request fails transiently.
    pub max_retries: u32,
    pub max_tool_rounds: usize,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            api_key: None,
            base_url: None,
            default_model: None,
            timeout_seconds: 300,
            max_retries: 3,
            max_tool_rounds: 16,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Receives each incremental text fragment, in production order.
pub type FragmentCallback = Box<dyn Fn(String) + Send + Sync>;

/// Main LLM interface trait
#[async_trait]
pub trait LLMInterface: Send + Sync {
    /// Stream a completion; returns once every fragment has been delivered.
    async fn stream_complete(
        &self,
        request: LLMRequest,
        callback: FragmentCallback,
    ) -> Result<LLMResponse, LLMError>;

    /// Check if the provider is available
    async fn health_check(&self) -> Result<bool, LLMError>;
}
