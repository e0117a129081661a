use crate::config::SessionPaths;
use crate::error::ReviewError;
use crate::llm::conversation::{Conversation, ConversationConfig};
use crate::llm::interfaces::{LLMInterface, Model};
use crate::llm::prompts::AgentPrompts;
use crate::llm::session_log;
use crate::reports::OutputSink;
use crate::types::{ReportCollection, ToolAccess};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Merges agent reports into one streamed review and persists the
/// conversation for later continuation.
#[derive(Clone)]
pub struct SynthesisStage {
    llm: Arc<dyn LLMInterface>,
    paths: SessionPaths,
    keep_sessions: usize,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl SynthesisStage {
    pub fn new(llm: Arc<dyn LLMInterface>, paths: SessionPaths) -> Self {
        Self {
            llm,
            paths,
            keep_sessions: 20,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_keep_sessions(mut self, keep: usize) -> Self {
        self.keep_sessions = keep.max(1);
        self
    }

    pub fn with_sampling(mut self, temperature: Option<f32>, max_tokens: Option<u32>) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    /// Stream the synthesized review to `sink` and promote the conversation
    /// to the well-known pointer. Returns the pointer path.
    ///
    /// On failure the pointer is not touched.
    #[instrument(skip(self, diff, reports, sink), fields(reports = reports.len(), model = %model))]
    pub async fn synthesize(
        &self,
        diff: &str,
        reports: &ReportCollection,
        model: &Model,
        working_dir: &Path,
        sink: Arc<dyn OutputSink>,
    ) -> Result<PathBuf, ReviewError> {
        let internal = self.internal_path();
        let mut config = ConversationConfig::new(working_dir, model.clone(), AgentPrompts::synthesis())
            .tool_access(ToolAccess::None)
            .durable(&internal);
        config.temperature = self.temperature;
        config.max_tokens = self.max_tokens;

        let mut conversation = Conversation::open(Arc::clone(&self.llm), config).await?;
        let writer = Arc::clone(&sink);
        conversation.subscribe(move |fragment| {
            if let Err(e) = writer.write(fragment) {
                warn!("Failed to write synthesis output: {}", e);
            }
        });

        let prompt = AgentPrompts::synthesis_prompt(diff, reports);
        let outcome = conversation.prompt(&prompt).await;
        conversation.dispose();
        outcome?;

        if let Err(e) = sink.finish() {
            warn!("Failed to finish synthesis output: {}", e);
        }

        session_log::promote(&internal, &self.paths.last_session).await?;

        match session_log::prune(&self.paths.sessions_dir, self.keep_sessions).await {
            Ok(0) => {}
            Ok(removed) => info!("Pruned {} old session logs", removed),
            Err(e) => warn!("Failed to prune old session logs: {}", e),
        }

        Ok(self.paths.last_session.clone())
    }

    fn internal_path(&self) -> PathBuf {
        self.paths.sessions_dir.join(format!(
            "{}-{}.jsonl",
            Utc::now().format("%Y%m%dT%H%M%S"),
            Uuid::new_v4().simple()
        ))
    }
}
