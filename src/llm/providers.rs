use super::interfaces::*;
use crate::error::LLMError;
use crate::tools::ToolBox;
use async_trait::async_trait;
use backoff::future::retry_notify;
use backoff::ExponentialBackoffBuilder;
use eventsource_stream::Eventsource;
use futures::io::AsyncBufReadExt;
use futures::{StreamExt, TryStreamExt};
use reqwest::{header, Client, RequestBuilder, Response};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Supported provider backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
    Ollama,
}

impl ProviderKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "OpenAI",
            ProviderKind::Anthropic => "Anthropic",
            ProviderKind::Ollama => "Ollama",
        }
    }

    pub fn default_model(&self) -> Model {
        match self {
            ProviderKind::OpenAI => Model::GPT4o,
            ProviderKind::Anthropic => Model::ClaudeSonnet,
            ProviderKind::Ollama => Model::QwenCoder,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
            ProviderKind::Ollama => "http://localhost:11434",
        }
    }

    /// Environment variable holding the API key, for hosted providers.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAI => Some("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Ollama => None,
        }
    }

    /// API key from config or environment; `None` if the provider needs none.
    pub fn resolve_api_key(&self, config: &LLMConfig) -> Result<Option<String>, LLMError> {
        let Some(var) = self.api_key_env() else {
            return Ok(None);
        };
        config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(var).ok().filter(|k| !k.trim().is_empty()))
            .map(Some)
            .ok_or_else(|| LLMError::Configuration(format!("{} API key not found (set {})", self.name(), var)))
    }
}

impl FromStr for ProviderKind {
    type Err = LLMError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAI),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "ollama" => Ok(ProviderKind::Ollama),
            _ => Err(LLMError::Configuration(format!("Unknown LLM provider: {}", s))),
        }
    }
}

fn http_client(config: &LLMConfig) -> Result<Client, LLMError> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(config.timeout_seconds))
        .build()?)
}

/// Open a request, retrying transient failures with exponential backoff.
///
/// Only connection setup and the HTTP status are retried; once the body
/// starts streaming, errors propagate so no fragment is delivered twice.
async fn send_with_retry<F>(provider: &str, max_retries: u32, build: F) -> Result<Response, LLMError>
where
    F: Fn() -> RequestBuilder,
{
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(None)
        .build();

    let mut attempt = 0;
    retry_notify(
        policy,
        || {
            attempt += 1;
            let attempt = attempt;
            let request = build();
            async move {
                let error = match request.send().await {
                    Ok(response) if response.status().is_success() => return Ok(response),
                    Ok(response) => {
                        let status = response.status().as_u16();
                        let body = response.text().await.unwrap_or_default();
                        LLMError::Api { status, body }
                    }
                    Err(e) => LLMError::Http(e),
                };

                if error.is_transient() && attempt <= max_retries {
                    Err(backoff::Error::transient(error))
                } else {
                    Err(backoff::Error::permanent(error))
                }
            }
        },
        |error: LLMError, wait: Duration| {
            warn!("{} request failed: {}; retrying in {:?}", provider, error, wait);
        },
    )
    .await
}

fn stream_error(e: impl std::fmt::Display) -> LLMError {
    LLMError::Stream(e.to_string())
}

fn incomplete(provider: &str) -> LLMError {
    LLMError::Stream(format!("{} stream ended before completion", provider))
}

/// OpenAI Provider Implementation
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
    config: LLMConfig,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct StreamedTurn {
    content: String,
    tool_calls: Vec<PartialToolCall>,
    /// Set once the server reports why the turn ended.
    finish_reason: Option<FinishReason>,
    usage: Usage,
}

impl OpenAIProvider {
    pub fn new(config: LLMConfig) -> Result<Self, LLMError> {
        let api_key = ProviderKind::OpenAI
            .resolve_api_key(&config)?
            .unwrap_or_default();

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| ProviderKind::OpenAI.default_base_url().to_string());

        Ok(Self {
            client: http_client(&config)?,
            api_key,
            base_url,
            config,
        })
    }

    fn initial_messages(request: &LLMRequest) -> Vec<Value> {
        let mut messages = vec![];

        if let Some(system) = &request.system_prompt {
            messages.push(json!({
                "role": "system",
                "content": system
            }));
        }

        for msg in &request.messages {
            messages.push(json!({
                "role": msg.role.as_str(),
                "content": msg.content
            }));
        }

        messages
    }

    fn body(&self, request: &LLMRequest, messages: &[Value]) -> Value {
        let mut body = json!({
            "model": request.model.as_str(),
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        if let Some(toolbox) = &request.toolbox {
            body["tools"] = json!(toolbox
                .definitions()
                .iter()
                .map(|t| json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters
                    }
                }))
                .collect::<Vec<_>>());
        }

        body
    }

    async fn read_stream(response: Response, callback: &FragmentCallback) -> Result<StreamedTurn, LLMError> {
        let mut events = Box::pin(response.bytes_stream().eventsource());
        let mut turn = StreamedTurn::default();
        let mut done = false;

        while let Some(event) = events.next().await {
            let event = event.map_err(stream_error)?;
            if event.data == "[DONE]" {
                done = true;
                break;
            }
            if event.data.is_empty() {
                continue;
            }
            Self::apply_chunk(&serde_json::from_str(&event.data)?, &mut turn, callback)?;
        }

        if !done && turn.finish_reason.is_none() {
            return Err(incomplete("OpenAI"));
        }
        Ok(turn)
    }

    fn apply_chunk(data: &Value, turn: &mut StreamedTurn, callback: &FragmentCallback) -> Result<(), LLMError> {
        if let Some(message) = data["error"]["message"].as_str() {
            return Err(LLMError::Stream(message.to_string()));
        }

        if let Some(usage) = data.get("usage").filter(|u| !u.is_null()) {
            turn.usage = Usage {
                prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
                total_tokens: usage["total_tokens"].as_u64().unwrap_or(0) as u32,
            };
        }

        let choice = &data["choices"][0];
        if let Some(text) = choice["delta"]["content"].as_str() {
            if !text.is_empty() {
                turn.content.push_str(text);
                callback(text.to_string());
            }
        }

        if let Some(calls) = choice["delta"]["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or(0) as usize;
                if turn.tool_calls.len() <= index {
                    turn.tool_calls.resize_with(index + 1, PartialToolCall::default);
                }
                let slot = &mut turn.tool_calls[index];
                if let Some(id) = call["id"].as_str() {
                    slot.id = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    slot.name.push_str(name);
                }
                if let Some(arguments) = call["function"]["arguments"].as_str() {
                    slot.arguments.push_str(arguments);
                }
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            turn.finish_reason = Some(match reason {
                "length" => FinishReason::Length,
                "tool_calls" => FinishReason::ToolCalls,
                "content_filter" => FinishReason::ContentFilter,
                _ => FinishReason::Stop,
            });
        }

        Ok(())
    }

    async fn run_tools(toolbox: &ToolBox, calls: &[PartialToolCall], messages: &mut Vec<Value>) {
        messages.push(json!({
            "role": "assistant",
            "content": Value::Null,
            "tool_calls": calls.iter().map(|c| json!({
                "id": c.id,
                "type": "function",
                "function": { "name": c.name, "arguments": c.arguments }
            })).collect::<Vec<_>>()
        }));

        for call in calls {
            let output = toolbox.execute(&call.name, &call.arguments).await;
            messages.push(json!({
                "role": "tool",
                "tool_call_id": call.id,
                "content": output
            }));
        }
    }
}

#[async_trait]
impl LLMInterface for OpenAIProvider {
    #[instrument(skip(self, request, callback), fields(provider = "openai", model = %request.model))]
    async fn stream_complete(
        &self,
        request: LLMRequest,
        callback: FragmentCallback,
    ) -> Result<LLMResponse, LLMError> {
        let mut messages = Self::initial_messages(&request);
        let mut content = String::new();
        let mut usage = Usage::default();

        for round in 0..=self.config.max_tool_rounds {
            let body = self.body(&request, &messages);
            let response = send_with_retry("OpenAI", self.config.max_retries, || {
                self.client
                    .post(format!("{}/chat/completions", self.base_url))
                    .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
                    .json(&body)
            })
            .await?;

            let turn = Self::read_stream(response, &callback).await?;
            content.push_str(&turn.content);
            usage.prompt_tokens += turn.usage.prompt_tokens;
            usage.completion_tokens += turn.usage.completion_tokens;
            usage.total_tokens += turn.usage.total_tokens;

            let toolbox = match &request.toolbox {
                Some(toolbox) if !turn.tool_calls.is_empty() => toolbox,
                _ => {
                    return Ok(LLMResponse {
                        content,
                        finish_reason: turn.finish_reason.unwrap_or(FinishReason::Stop),
                        usage,
                    });
                }
            };

            debug!("Round {}: executing {} tool calls", round, turn.tool_calls.len());
            Self::run_tools(toolbox, &turn.tool_calls, &mut messages).await;
        }

        Err(LLMError::ToolLoop(self.config.max_tool_rounds))
    }

    async fn health_check(&self) -> Result<bool, LLMError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .send()
            .await?;

        Ok(response.status().is_success())
    }
}

/// Anthropic Provider Implementation
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    config: LLMConfig,
}

impl AnthropicProvider {
    pub fn new(config: LLMConfig) -> Result<Self, LLMError> {
        let api_key = ProviderKind::Anthropic
            .resolve_api_key(&config)?
            .unwrap_or_default();

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| ProviderKind::Anthropic.default_base_url().to_string());

        Ok(Self {
            client: http_client(&config)?,
            api_key,
            base_url,
            config,
        })
    }

    fn apply_event(
        event: Option<&str>,
        data: &Value,
        content: &mut String,
        finish_reason: &mut FinishReason,
        usage: &mut Usage,
        callback: &FragmentCallback,
    ) -> Result<bool, LLMError> {
        match event.or_else(|| data["type"].as_str()) {
            Some("message_start") => {
                usage.prompt_tokens = data["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
            }
            Some("content_block_delta") => {
                if let Some(text) = data["delta"]["text"].as_str() {
                    content.push_str(text);
                    callback(text.to_string());
                }
            }
            Some("message_delta") => {
                usage.completion_tokens = data["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;
                *finish_reason = match data["delta"]["stop_reason"].as_str() {
                    Some("max_tokens") => FinishReason::Length,
                    _ => FinishReason::Stop,
                };
            }
            Some("message_stop") => return Ok(true),
            Some("error") => {
                let message = data["error"]["message"].as_str().unwrap_or("unknown error");
                return Err(LLMError::Stream(message.to_string()));
            }
            _ => {}
        }
        Ok(false)
    }
}

#[async_trait]
impl LLMInterface for AnthropicProvider {
    #[instrument(skip(self, request, callback), fields(provider = "anthropic", model = %request.model))]
    async fn stream_complete(
        &self,
        request: LLMRequest,
        callback: FragmentCallback,
    ) -> Result<LLMResponse, LLMError> {
        if request.toolbox.is_some() {
            warn!("Anthropic provider does not run tools; continuing without repository access");
        }

        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut body = json!({
            "model": request.model.as_str(),
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(8192),
            "stream": true,
        });
        if let Some(system) = &request.system_prompt {
            body["system"] = json!(system);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        let response = send_with_retry("Anthropic", self.config.max_retries, || {
            self.client
                .post(format!("{}/messages", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&body)
        })
        .await?;

        let mut events = Box::pin(response.bytes_stream().eventsource());
        let mut content = String::new();
        let mut finish_reason = FinishReason::Stop;
        let mut usage = Usage::default();
        let mut stopped = false;

        while let Some(event) = events.next().await {
            let event = event.map_err(stream_error)?;
            if event.data.is_empty() {
                continue;
            }
            let data: Value = serde_json::from_str(&event.data)?;
            // Unnamed events arrive as "message"; fall back to the payload type.
            let name = Some(event.event.as_str()).filter(|n| !n.is_empty() && *n != "message");
            if Self::apply_event(name, &data, &mut content, &mut finish_reason, &mut usage, &callback)? {
                stopped = true;
                break;
            }
        }

        if !stopped {
            return Err(incomplete("Anthropic"));
        }

        usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        Ok(LLMResponse {
            content,
            finish_reason,
            usage,
        })
    }

    async fn health_check(&self) -> Result<bool, LLMError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .send()
            .await?;

        Ok(response.status().is_success())
    }
}

/// Ollama Provider Implementation (for local models)
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    config: LLMConfig,
}

impl OllamaProvider {
    pub fn new(config: LLMConfig) -> Result<Self, LLMError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| ProviderKind::Ollama.default_base_url().to_string());

        Ok(Self {
            client: http_client(&config)?,
            base_url,
            config,
        })
    }
}

#[async_trait]
impl LLMInterface for OllamaProvider {
    #[instrument(skip(self, request, callback), fields(provider = "ollama", model = %request.model))]
    async fn stream_complete(
        &self,
        request: LLMRequest,
        callback: FragmentCallback,
    ) -> Result<LLMResponse, LLMError> {
        if request.toolbox.is_some() {
            debug!("Ollama provider runs without tools");
        }

        let mut messages = vec![];
        if let Some(system) = &request.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for msg in &request.messages {
            messages.push(json!({ "role": msg.role.as_str(), "content": msg.content }));
        }

        let mut body = json!({
            "model": request.model.as_str(),
            "messages": messages,
            "stream": true,
        });
        if let Some(temperature) = request.temperature {
            body["options"] = json!({ "temperature": temperature });
        }

        let response = send_with_retry("Ollama", self.config.max_retries, || {
            self.client
                .post(format!("{}/api/chat", self.base_url))
                .json(&body)
        })
        .await?;

        let body = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        let mut lines = body.into_async_read().lines();
        let mut content = String::new();
        let mut usage = Usage::default();
        let mut done = false;

        while let Some(line) = lines.next().await {
            let line = line.map_err(stream_error)?;
            if line.trim().is_empty() {
                continue;
            }
            let data: Value = serde_json::from_str(&line)?;
            if let Some(message) = data["error"].as_str() {
                return Err(LLMError::Stream(message.to_string()));
            }
            if let Some(text) = data["message"]["content"].as_str() {
                if !text.is_empty() {
                    content.push_str(text);
                    callback(text.to_string());
                }
            }
            if data["done"].as_bool().unwrap_or(false) {
                usage.prompt_tokens = data["prompt_eval_count"].as_u64().unwrap_or(0) as u32;
                usage.completion_tokens = data["eval_count"].as_u64().unwrap_or(0) as u32;
                usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
                done = true;
                break;
            }
        }

        if !done {
            return Err(incomplete("Ollama"));
        }

        Ok(LLMResponse {
            content,
            finish_reason: FinishReason::Stop,
            usage,
        })
    }

    async fn health_check(&self) -> Result<bool, LLMError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?;

        Ok(response.status().is_success())
    }
}

/// Factory for creating LLM providers
pub struct LLMProviderFactory;

impl LLMProviderFactory {
    pub fn create(config: LLMConfig) -> Result<Arc<dyn LLMInterface>, LLMError> {
        match config.provider.parse::<ProviderKind>()? {
            ProviderKind::OpenAI => Ok(Arc::new(OpenAIProvider::new(config)?)),
            ProviderKind::Anthropic => Ok(Arc::new(AnthropicProvider::new(config)?)),
            ProviderKind::Ollama => Ok(Arc::new(OllamaProvider::new(config)?)),
        }
    }
}
