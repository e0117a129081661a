use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

const HISTORY_LIMIT: usize = 1000;

/// Progress notifications emitted while a review or continuation runs.
///
/// Agent completions are published in completion order, which is
/// independent of the order reports are aggregated in.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReviewEvent {
    ReviewStarted { agents: Vec<String>, model: String },
    AgentStarted { agent_id: String },
    AgentCompleted { agent_id: String, elapsed_ms: u64, chars: usize },
    AgentFailed { agent_id: String, error: String },
    SynthesisStarted { reports: usize },
    SessionPromoted { path: PathBuf },
    ContinuationCompleted { path: PathBuf },
}

impl fmt::Display for ReviewEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewEvent::ReviewStarted { agents, model } => {
                write!(f, "reviewing with {} ({})", agents.join(", "), model)
            }
            ReviewEvent::AgentStarted { agent_id } => write!(f, "{} started", agent_id),
            ReviewEvent::AgentCompleted { agent_id, elapsed_ms, .. } => {
                write!(f, "{} finished in {:.1}s", agent_id, *elapsed_ms as f64 / 1000.0)
            }
            ReviewEvent::AgentFailed { agent_id, error } => write!(f, "{} failed: {}", agent_id, error),
            ReviewEvent::SynthesisStarted { reports } => write!(f, "synthesizing {} reports", reports),
            ReviewEvent::SessionPromoted { path } => write!(f, "session saved to {}", path.display()),
            ReviewEvent::ContinuationCompleted { path } => write!(f, "session updated at {}", path.display()),
        }
    }
}

/// Broadcast bus for review progress, with a bounded in-memory history.
pub struct ReviewEventBus {
    sender: broadcast::Sender<ReviewEvent>,
    history: Arc<RwLock<Vec<ReviewEvent>>>,
}

impl ReviewEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);

        Self {
            sender,
            history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn publish(&self, event: ReviewEvent) {
        debug!("Publishing event: {}", event);

        {
            let mut history = self.history.write().await;
            history.push(event.clone());
            if history.len() > HISTORY_LIMIT {
                let excess = history.len() - HISTORY_LIMIT;
                history.drain(0..excess);
            }
        }

        if self.sender.send(event).is_err() {
            debug!("No active subscribers for event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReviewEvent> {
        self.sender.subscribe()
    }

    pub async fn history(&self) -> Vec<ReviewEvent> {
        self.history.read().await.clone()
    }
}

impl Default for ReviewEventBus {
    fn default() -> Self {
        Self::new()
    }
}
