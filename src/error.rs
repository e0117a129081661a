use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced to the caller of a review or continuation.
///
/// Every variant is terminal for the current invocation.
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("unknown agent '{id}' (available: {})", .available.join(", "))]
    UnknownAgent { id: String, available: Vec<String> },

    #[error("agent id '{0}' is registered more than once")]
    DuplicateAgent(String),

    #[error("no model available: {0}")]
    NoModelAvailable(String),

    #[error("model invocation failed: {source}")]
    ModelInvocationFailed {
        #[source]
        source: LLMError,
    },

    #[error("no previous review session found at {}", .path.display())]
    NoPreviousSession { path: PathBuf },

    #[error("session storage error at {}: {source}", .path.display())]
    Session {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("conversation handle is no longer usable ({0})")]
    HandleUnusable(&'static str),

    #[error("the diff is empty; nothing to review")]
    EmptyDiff,

    #[error("agent reports incomplete: {}", .missing.join(", "))]
    IncompleteReports { missing: Vec<String> },

    #[error("agent task aborted: {0}")]
    TaskAborted(String),
}

impl ReviewError {
    pub fn session(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ReviewError::Session {
            path: path.into(),
            source,
        }
    }
}

impl From<LLMError> for ReviewError {
    fn from(source: LLMError) -> Self {
        ReviewError::ModelInvocationFailed { source }
    }
}

/// Transport and provider failures raised while talking to a model.
#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("could not decode provider payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("provider misconfigured: {0}")]
    Configuration(String),

    #[error("tool loop exceeded {0} rounds")]
    ToolLoop(usize),
}

impl LLMError {
    /// Whether a fresh attempt at the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LLMError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LLMError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
