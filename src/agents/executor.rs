use crate::error::ReviewError;
use crate::llm::conversation::{Conversation, ConversationConfig};
use crate::llm::interfaces::{LLMInterface, Model};
use crate::llm::prompts::AgentPrompts;
use crate::tools::ToolLimits;
use crate::types::{AgentDescriptor, AgentReport, ReviewRequest, ToolAccess};
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

/// Runs one review agent to completion in its own conversation.
#[derive(Clone)]
pub struct AgentTaskExecutor {
    llm: Arc<dyn LLMInterface>,
    tool_limits: ToolLimits,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl AgentTaskExecutor {
    pub fn new(llm: Arc<dyn LLMInterface>) -> Self {
        Self {
            llm,
            tool_limits: ToolLimits::default(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_tool_limits(mut self, limits: ToolLimits) -> Self {
        self.tool_limits = limits;
        self
    }

    pub fn with_sampling(mut self, temperature: Option<f32>, max_tokens: Option<u32>) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Review the request's diff as `descriptor` and return the full report.
    ///
    /// The conversation is ephemeral with read-only repository access. No
    /// retries happen here; errors propagate unchanged.
    #[instrument(skip(self, descriptor, request), fields(agent = %descriptor.id))]
    pub async fn run(
        &self,
        descriptor: &AgentDescriptor,
        request: &ReviewRequest,
        model: &Model,
    ) -> Result<AgentReport, ReviewError> {
        let mut config = ConversationConfig::new(&request.working_dir, model.clone(), &descriptor.instructions)
            .tool_access(ToolAccess::ReadOnly);
        config.tool_limits = self.tool_limits.clone();
        config.temperature = self.temperature;
        config.max_tokens = self.max_tokens;

        let mut conversation = Conversation::open(Arc::clone(&self.llm), config).await?;

        let accumulated = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&accumulated);
        conversation.subscribe(move |fragment| {
            sink.lock().unwrap_or_else(|p| p.into_inner()).push_str(fragment);
        });

        let prompt = AgentPrompts::review_prompt(&request.diff_text, &request.extra_context);
        let outcome = conversation.prompt(&prompt).await;
        conversation.dispose();
        outcome?;

        let text = std::mem::take(&mut *accumulated.lock().unwrap_or_else(|p| p.into_inner()));
        debug!("Agent {} produced {} chars", descriptor.id, text.len());

        Ok(AgentReport {
            agent_id: descriptor.id.clone(),
            text,
        })
    }
}
