//! Scripted stand-in for a model provider, used by unit tests.

use super::interfaces::{FinishReason, FragmentCallback, LLMInterface, LLMRequest, LLMResponse, Usage};
use crate::error::LLMError;
use crate::types::ToolAccess;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Behaviour for every conversation whose system prompt matches a key.
#[derive(Debug, Clone)]
pub struct Script {
    pub fragments: Vec<String>,
    pub delay: Duration,
    pub failure: Option<String>,
}

impl Script {
    pub fn fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            delay: Duration::ZERO,
            failure: None,
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fragments: Vec::new(),
            delay: Duration::ZERO,
            failure: Some(message.into()),
        }
    }

    /// Fail once every fragment has been streamed.
    pub fn then_failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// What one `stream_complete` call saw and when it ran.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub system: String,
    pub messages: Vec<String>,
    pub tool_access: Option<ToolAccess>,
    pub started: Instant,
    pub finished: Instant,
}

impl CallRecord {
    pub fn prompt(&self) -> &str {
        self.messages.last().map(String::as_str).unwrap_or("")
    }
}

#[derive(Default)]
pub struct ScriptedLLM {
    scripts: HashMap<String, Script>,
    fallback: Option<Script>,
    calls: Mutex<Vec<CallRecord>>,
}

impl ScriptedLLM {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, system: impl Into<String>, script: Script) -> Self {
        self.scripts.insert(system.into(), script);
        self
    }

    pub fn fallback(mut self, script: Script) -> Self {
        self.fallback = Some(script);
        self
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, system: &str) -> Vec<CallRecord> {
        self.calls().into_iter().filter(|c| c.system == system).collect()
    }
}

#[async_trait]
impl LLMInterface for ScriptedLLM {
    async fn stream_complete(
        &self,
        request: LLMRequest,
        callback: FragmentCallback,
    ) -> Result<LLMResponse, LLMError> {
        let started = Instant::now();
        let system = request.system_prompt.clone().unwrap_or_default();
        let script = self
            .scripts
            .get(&system)
            .or(self.fallback.as_ref())
            .cloned()
            .unwrap_or_else(|| Script::fragments(Vec::<String>::new()));

        let steps = script.fragments.len().max(1) as u32;
        let mut content = String::new();
        for fragment in &script.fragments {
            tokio::time::sleep(script.delay / steps).await;
            content.push_str(fragment);
            callback(fragment.clone());
        }
        if script.fragments.is_empty() {
            tokio::time::sleep(script.delay).await;
        }

        self.calls.lock().unwrap().push(CallRecord {
            system,
            messages: request.messages.iter().map(|m| m.content.clone()).collect(),
            tool_access: request.toolbox.as_ref().map(|t| t.access()),
            started,
            finished: Instant::now(),
        });

        if let Some(message) = script.failure {
            return Err(LLMError::Stream(message));
        }

        Ok(LLMResponse {
            content,
            finish_reason: FinishReason::Stop,
            usage: Usage::default(),
        })
    }

    async fn health_check(&self) -> Result<bool, LLMError> {
        Ok(true)
    }
}
