pub mod continuation;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod registry;
pub mod synthesis;

pub use continuation::{ContinuationHandler, ContinueOptions};
pub use events::{ReviewEvent, ReviewEventBus};
pub use executor::AgentTaskExecutor;
pub use orchestrator::{ConfiguredModelResolver, ModelResolver, ReviewOrchestrator, ReviewOutcome};
pub use registry::AgentRegistry;
pub use synthesis::SynthesisStage;
