//! Conversation handles over the model-invocation contract.
//!
//! A handle owns the turn history of one conversation. Ephemeral handles
//! keep it in memory only; durable handles mirror every completed exchange
//! to a [`SessionLog`] so the conversation can be reopened later.

use super::interfaces::{FragmentCallback, LLMInterface, LLMRequest, Message, Model};
use super::session_log::{Exchange, SessionHeader, SessionLog};
use crate::error::ReviewError;
use crate::tools::{ToolBox, ToolLimits};
use crate::types::ToolAccess;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Where a conversation's turns are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    Ephemeral,
    Durable(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ConversationConfig {
    pub working_dir: PathBuf,
    pub model: Model,
    pub system_instructions: String,
    pub tool_access: ToolAccess,
    pub storage: Storage,
    pub tool_limits: ToolLimits,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ConversationConfig {
    pub fn new(working_dir: impl Into<PathBuf>, model: Model, system_instructions: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            model,
            system_instructions: system_instructions.into(),
            tool_access: ToolAccess::None,
            storage: Storage::Ephemeral,
            tool_limits: ToolLimits::default(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn tool_access(mut self, access: ToolAccess) -> Self {
        self.tool_access = access;
        self
    }

    pub fn durable(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage = Storage::Durable(path.into());
        self
    }
}

/// Optional settings applied when reopening a durable conversation.
#[derive(Debug, Clone, Default)]
pub struct ReopenOverrides {
    pub model: Option<Model>,
    pub tool_limits: Option<ToolLimits>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Identifies one registered fragment handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type FragmentHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(SubscriptionId, FragmentHandler)>>,
}

impl Subscribers {
    fn add(&self, handler: FragmentHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, handler));
        id
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn dispatch(&self, fragment: &str) {
        let handlers: Vec<FragmentHandler> = self.lock().iter().map(|(_, h)| Arc::clone(h)).collect();
        for handler in handlers {
            handler(fragment);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, FragmentHandler)>> {
        self.handlers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Ready,
    Failed,
    Disposed,
}

/// One conversation with the model.
///
/// At most one prompt may be in flight; `prompt` takes `&mut self` so the
/// borrow checker enforces that for callers.
pub struct Conversation {
    llm: Arc<dyn LLMInterface>,
    config: ConversationConfig,
    toolbox: Option<Arc<ToolBox>>,
    history: Vec<Exchange>,
    log: Option<SessionLog>,
    subscribers: Arc<Subscribers>,
    state: HandleState,
}

impl Conversation {
    /// Start a fresh conversation. Durable storage creates its backing file now.
    pub async fn open(llm: Arc<dyn LLMInterface>, config: ConversationConfig) -> Result<Self, ReviewError> {
        let log = match &config.storage {
            Storage::Ephemeral => None,
            Storage::Durable(path) => {
                let header = SessionHeader {
                    id: Uuid::new_v4(),
                    created_at: Utc::now(),
                    model: config.model.as_str().to_string(),
                    system: config.system_instructions.clone(),
                    tool_access: config.tool_access,
                    working_dir: config.working_dir.clone(),
                };
                Some(SessionLog::create(path, &header).await?)
            }
        };

        Ok(Self::assemble(llm, config, Vec::new(), log))
    }

    /// Reopen a durable conversation in place; later turns append to `path`.
    pub async fn reopen(
        llm: Arc<dyn LLMInterface>,
        path: impl Into<PathBuf>,
        overrides: ReopenOverrides,
    ) -> Result<Self, ReviewError> {
        let path = path.into();
        let (log, header, history) = SessionLog::load(&path).await?;
        debug!("Reopened {:?} with {} prior exchanges", path, history.len());

        let config = ConversationConfig {
            working_dir: header.working_dir,
            model: overrides
                .model
                .unwrap_or_else(|| Model::from_selector(&header.model)),
            system_instructions: header.system,
            tool_access: header.tool_access,
            storage: Storage::Durable(path),
            tool_limits: overrides.tool_limits.unwrap_or_default(),
            temperature: overrides.temperature,
            max_tokens: overrides.max_tokens,
        };

        Ok(Self::assemble(llm, config, history, Some(log)))
    }

    fn assemble(
        llm: Arc<dyn LLMInterface>,
        config: ConversationConfig,
        history: Vec<Exchange>,
        log: Option<SessionLog>,
    ) -> Self {
        let toolbox = ToolBox::new(&config.working_dir, config.tool_access, config.tool_limits.clone())
            .map(Arc::new);
        Self {
            llm,
            config,
            toolbox,
            history,
            log,
            subscribers: Arc::new(Subscribers::default()),
            state: HandleState::Ready,
        }
    }

    /// Register a handler called once per streamed text fragment.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribers.add(Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(id)
    }

    /// Send one prompt and wait for the full assistant turn.
    ///
    /// Every fragment has been handed to subscribers by the time this
    /// returns. On failure the handle becomes unusable.
    #[instrument(skip(self, text), fields(model = %self.config.model, durable = self.log.is_some()))]
    pub async fn prompt(&mut self, text: &str) -> Result<String, ReviewError> {
        match self.state {
            HandleState::Ready => {}
            HandleState::Failed => return Err(ReviewError::HandleUnusable("a previous prompt failed")),
            HandleState::Disposed => return Err(ReviewError::HandleUnusable("disposed")),
        }

        let request = self.build_request(text);
        let subscribers = Arc::clone(&self.subscribers);
        let callback: FragmentCallback = Box::new(move |fragment: String| {
            subscribers.dispatch(&fragment);
        });

        let response = match self.llm.stream_complete(request, callback).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Prompt failed: {}", e);
                self.state = HandleState::Failed;
                return Err(ReviewError::from(e));
            }
        };

        let exchange = Exchange {
            timestamp: Utc::now(),
            prompt: text.to_string(),
            response: response.content.clone(),
        };

        if let Some(log) = &self.log {
            if let Err(e) = log.append(&exchange).await {
                self.state = HandleState::Failed;
                return Err(e);
            }
        }
        self.history.push(exchange);

        debug!(
            "Turn complete: {} prompt tokens, {} completion tokens",
            response.usage.prompt_tokens, response.usage.completion_tokens
        );
        Ok(response.content)
    }

    fn build_request(&self, text: &str) -> LLMRequest {
        let mut messages = Vec::with_capacity(self.history.len() * 2 + 1);
        for exchange in &self.history {
            messages.push(Message::user(exchange.prompt.clone()));
            messages.push(Message::assistant(exchange.response.clone()));
        }
        messages.push(Message::user(text));

        LLMRequest {
            messages,
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            system_prompt: Some(self.config.system_instructions.clone()),
            toolbox: self.toolbox.clone(),
        }
    }

    /// Release the handle. Idempotent; durable storage stays on disk.
    pub fn dispose(&mut self) {
        if self.state == HandleState::Disposed {
            return;
        }
        self.subscribers.clear();
        self.state = HandleState::Disposed;
    }

    pub fn exchanges(&self) -> &[Exchange] {
        &self.history
    }

    pub fn storage_path(&self) -> Option<&Path> {
        self.log.as_ref().map(|log| log.path())
    }

    pub fn model(&self) -> &Model {
        &self.config.model
    }

    pub fn is_usable(&self) -> bool {
        self.state == HandleState::Ready
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.dispose();
    }
}
