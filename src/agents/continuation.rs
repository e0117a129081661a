use crate::agents::events::{ReviewEvent, ReviewEventBus};
use crate::error::ReviewError;
use crate::llm::conversation::{Conversation, ReopenOverrides};
use crate::llm::interfaces::{LLMInterface, Model};
use crate::reports::OutputSink;
use crate::tools::ToolLimits;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Default)]
pub struct ContinueOptions {
    /// Overrides the model recorded in the session.
    pub model: Option<Model>,
    pub tool_limits: Option<ToolLimits>,
}

/// Appends follow-up turns to the last review's conversation.
///
/// The pointer file is reopened in place, so each completed turn lands in
/// it directly without another promotion.
pub struct ContinuationHandler {
    llm: Arc<dyn LLMInterface>,
    pointer: PathBuf,
    events: Option<Arc<ReviewEventBus>>,
}

impl ContinuationHandler {
    pub fn new(llm: Arc<dyn LLMInterface>, pointer: impl Into<PathBuf>) -> Self {
        Self {
            llm,
            pointer: pointer.into(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<ReviewEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    #[instrument(skip(self, message, options, sink), fields(pointer = %self.pointer.display()))]
    pub async fn continue_session(
        &self,
        message: &str,
        options: ContinueOptions,
        sink: Arc<dyn OutputSink>,
    ) -> Result<PathBuf, ReviewError> {
        let overrides = ReopenOverrides {
            model: options.model,
            tool_limits: options.tool_limits,
            ..ReopenOverrides::default()
        };
        let mut conversation = Conversation::reopen(Arc::clone(&self.llm), &self.pointer, overrides).await?;
        info!(
            "Continuing session with {} prior exchanges",
            conversation.exchanges().len()
        );

        let writer = Arc::clone(&sink);
        conversation.subscribe(move |fragment| {
            if let Err(e) = writer.write(fragment) {
                warn!("Failed to write continuation output: {}", e);
            }
        });

        let outcome = conversation.prompt(message).await;
        conversation.dispose();
        outcome?;

        if let Err(e) = sink.finish() {
            warn!("Failed to finish continuation output: {}", e);
        }

        if let Some(events) = &self.events {
            events
                .publish(ReviewEvent::ContinuationCompleted {
                    path: self.pointer.clone(),
                })
                .await;
        }

        Ok(self.pointer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::session_log::{SessionHeader, SessionLog};
    use crate::llm::testing::{Script, ScriptedLLM};
    use crate::reports::MemorySink;
    use crate::types::ToolAccess;
    use chrono::Utc;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn seed(path: &std::path::Path) {
        let header = SessionHeader {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            model: "gpt-4o".to_string(),
            system: "SYNTH".to_string(),
            tool_access: ToolAccess::None,
            working_dir: PathBuf::from("/repo"),
        };
        let log = SessionLog::create(path, &header).await.unwrap();
        log.append(&crate::llm::session_log::Exchange {
            timestamp: Utc::now(),
            prompt: "reports".to_string(),
            response: "summary".to_string(),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_missing_pointer_is_no_previous_session() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(ScriptedLLM::new());
        let handler = ContinuationHandler::new(llm.clone(), dir.path().join("last-review.jsonl"));

        let err = handler
            .continue_session("why?", ContinueOptions::default(), Arc::new(MemorySink::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, ReviewError::NoPreviousSession { .. }));
        assert!(llm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_continuation_replays_history_and_streams() {
        let dir = TempDir::new().unwrap();
        let pointer = dir.path().join("last-review.jsonl");
        seed(&pointer).await;

        let llm = Arc::new(ScriptedLLM::new().script("SYNTH", Script::fragments(["Because ", "of X."])));
        let events = Arc::new(ReviewEventBus::new());
        let handler = ContinuationHandler::new(llm.clone(), &pointer).with_events(events.clone());
        let sink = Arc::new(MemorySink::new());

        let path = handler
            .continue_session("why?", ContinueOptions::default(), sink.clone())
            .await
            .unwrap();

        assert_eq!(path, pointer);
        assert_eq!(sink.contents(), "Because of X.");
        assert_eq!(llm.calls()[0].messages, vec!["reports", "summary", "why?"]);
        assert_eq!(
            events.history().await,
            vec![ReviewEvent::ContinuationCompleted { path: pointer.clone() }]
        );
    }

    #[tokio::test]
    async fn test_failed_continuation_leaves_pointer_unchanged() {
        let dir = TempDir::new().unwrap();
        let pointer = dir.path().join("last-review.jsonl");
        seed(&pointer).await;
        let before = std::fs::read(&pointer).unwrap();

        let llm = Arc::new(ScriptedLLM::new().script("SYNTH", Script::failing("502")));
        let handler = ContinuationHandler::new(llm, &pointer);

        let err = handler
            .continue_session("and?", ContinueOptions::default(), Arc::new(MemorySink::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, ReviewError::ModelInvocationFailed { .. }));
        assert_eq!(std::fs::read(&pointer).unwrap(), before);
    }

    #[tokio::test]
    async fn test_continuation_failing_mid_stream_leaves_pointer_unchanged() {
        let dir = TempDir::new().unwrap();
        let pointer = dir.path().join("last-review.jsonl");
        seed(&pointer).await;
        let before = std::fs::read(&pointer).unwrap();

        let llm = Arc::new(
            ScriptedLLM::new().script("SYNTH", Script::fragments(["Partly ", "because"]).then_failing("reset")),
        );
        let handler = ContinuationHandler::new(llm, &pointer);
        let sink = Arc::new(MemorySink::new());

        let err = handler
            .continue_session("why?", ContinueOptions::default(), sink.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, ReviewError::ModelInvocationFailed { .. }));
        assert_eq!(sink.contents(), "Partly because");
        assert_eq!(sink.finish_count(), 0);
        assert_eq!(std::fs::read(&pointer).unwrap(), before);
    }
}
