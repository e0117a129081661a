pub mod conversation;
pub mod interfaces;
pub mod prompts;
pub mod providers;
pub mod session_log;
pub mod tokens;

#[cfg(test)]
pub(crate) mod testing;

pub use conversation::{Conversation, ConversationConfig, ReopenOverrides, Storage, SubscriptionId};
pub use interfaces::{FragmentCallback, LLMConfig, LLMInterface, LLMRequest, LLMResponse, Model};
pub use prompts::AgentPrompts;
pub use providers::{AnthropicProvider, LLMProviderFactory, OllamaProvider, OpenAIProvider, ProviderKind};
pub use session_log::{Exchange, SessionHeader, SessionLog};
