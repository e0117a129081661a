pub mod agents;
pub mod config;
pub mod error;
pub mod git;
pub mod llm;
pub mod reports;
pub mod tools;
pub mod types;

pub use error::{LLMError, ReviewError};
