/// Configuration management for the PR review agent
use crate::llm::interfaces::LLMConfig;
use crate::llm::providers::ProviderKind;
use crate::tools::ToolLimits;
use crate::types::AgentDescriptor;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LLMConfig,
    pub review: ReviewSettings,
    pub session: SessionSettings,
    pub tools: ToolLimits,
    /// Custom agents appended after the built-in ones.
    pub agents: Vec<AgentDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewSettings {
    /// Ordered; empty selects every registered agent.
    pub default_agents: Vec<String>,
    pub extra_context: Option<String>,
    pub max_diff_tokens: usize,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            default_agents: Vec::new(),
            extra_context: None,
            max_diff_tokens: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub cache_dir: Option<PathBuf>,
    pub keep_sessions: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            cache_dir: None,
            keep_sessions: 20,
        }
    }
}

/// Filesystem locations of synthesis conversation logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    /// Internal per-review logs, written before promotion.
    pub sessions_dir: PathBuf,
    /// The well-known pointer to the last successful review conversation.
    pub last_session: PathBuf,
}

impl SessionPaths {
    pub fn under(cache_dir: impl AsRef<Path>) -> Self {
        let cache_dir = cache_dir.as_ref();
        Self {
            sessions_dir: cache_dir.join("sessions"),
            last_session: cache_dir.join("last-review.jsonl"),
        }
    }

    pub fn resolve(settings: &SessionSettings) -> Result<Self> {
        if let Some(dir) = &settings.cache_dir {
            return Ok(Self::under(dir));
        }

        let dirs = ProjectDirs::from("", "", "pr-review")
            .context("Could not determine a user cache directory; set session.cache_dir")?;
        Ok(Self::under(dirs.cache_dir()))
    }
}

const CONFIG_HEADER: &str = "\
# pr-review configuration
#
# llm.provider: openai | anthropic | ollama
# llm.api_key may be left empty; OPENAI_API_KEY / ANTHROPIC_API_KEY are read instead.
# review.default_agents: ordered agent ids; empty runs every registered agent.
# agents: custom reviewers, each with id, display_name, description, instructions.
";

impl Config {
    /// Load configuration from file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Default configuration rendered as commented YAML, for `init`.
    pub fn default_yaml() -> Result<String> {
        let body = serde_yaml::to_string(&Config::default())?;
        Ok(format!("{}\n{}", CONFIG_HEADER, body))
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(provider) = std::env::var("PR_REVIEW_PROVIDER") {
            config.llm.provider = provider;
        }

        if let Ok(model) = std::env::var("PR_REVIEW_MODEL") {
            config.llm.default_model = Some(model);
        }

        if let Ok(base_url) = std::env::var("PR_REVIEW_BASE_URL") {
            config.llm.base_url = Some(base_url);
        }

        if let Ok(retries) = std::env::var("PR_REVIEW_MAX_RETRIES") {
            config.llm.max_retries = retries
                .parse()
                .context("PR_REVIEW_MAX_RETRIES must be a non-negative integer")?;
        }

        if let Ok(timeout) = std::env::var("PR_REVIEW_TIMEOUT_SECONDS") {
            config.llm.timeout_seconds = timeout
                .parse()
                .context("PR_REVIEW_TIMEOUT_SECONDS must be a positive integer")?;
        }

        if let Ok(cache_dir) = std::env::var("PR_REVIEW_CACHE_DIR") {
            config.session.cache_dir = Some(PathBuf::from(cache_dir));
        }

        Ok(config)
    }

    /// Merge with another configuration (other takes precedence where it
    /// differs from the defaults)
    pub fn merge_with(&mut self, other: Config) {
        let defaults = Config::default();

        if other.llm.provider != defaults.llm.provider {
            self.llm.provider = other.llm.provider;
        }
        if other.llm.api_key.is_some() {
            self.llm.api_key = other.llm.api_key;
        }
        if other.llm.base_url.is_some() {
            self.llm.base_url = other.llm.base_url;
        }
        if other.llm.default_model.is_some() {
            self.llm.default_model = other.llm.default_model;
        }
        if other.llm.timeout_seconds != defaults.llm.timeout_seconds {
            self.llm.timeout_seconds = other.llm.timeout_seconds;
        }
        if other.llm.max_retries != defaults.llm.max_retries {
            self.llm.max_retries = other.llm.max_retries;
        }
        if other.llm.max_tool_rounds != defaults.llm.max_tool_rounds {
            self.llm.max_tool_rounds = other.llm.max_tool_rounds;
        }
        if other.llm.temperature.is_some() {
            self.llm.temperature = other.llm.temperature;
        }
        if other.llm.max_tokens.is_some() {
            self.llm.max_tokens = other.llm.max_tokens;
        }

        if !other.review.default_agents.is_empty() {
            self.review.default_agents = other.review.default_agents;
        }
        if other.review.extra_context.is_some() {
            self.review.extra_context = other.review.extra_context;
        }
        if other.review.max_diff_tokens != defaults.review.max_diff_tokens {
            self.review.max_diff_tokens = other.review.max_diff_tokens;
        }

        if other.session.cache_dir.is_some() {
            self.session.cache_dir = other.session.cache_dir;
        }
        if other.session.keep_sessions != defaults.session.keep_sessions {
            self.session.keep_sessions = other.session.keep_sessions;
        }

        if other.tools.max_file_bytes != defaults.tools.max_file_bytes {
            self.tools.max_file_bytes = other.tools.max_file_bytes;
        }
        if other.tools.max_search_results != defaults.tools.max_search_results {
            self.tools.max_search_results = other.tools.max_search_results;
        }
        if other.tools.max_list_depth != defaults.tools.max_list_depth {
            self.tools.max_list_depth = other.tools.max_list_depth;
        }

        self.agents.extend(other.agents);
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.llm.provider.parse::<ProviderKind>()?;

        if self.llm.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("LLM timeout must be greater than 0"));
        }

        if self.llm.max_tool_rounds == 0 {
            return Err(anyhow::anyhow!("max_tool_rounds must be at least 1"));
        }

        if let Some(temperature) = self.llm.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(anyhow::anyhow!("Temperature must be between 0 and 2"));
            }
        }

        if self.session.keep_sessions == 0 {
            return Err(anyhow::anyhow!("keep_sessions must be at least 1"));
        }

        if self.tools.max_file_bytes == 0 {
            return Err(anyhow::anyhow!("max_file_bytes must be greater than 0"));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(anyhow::anyhow!("Custom agents need a non-empty id"));
            }
            if agent.instructions.trim().is_empty() {
                return Err(anyhow::anyhow!("Custom agent '{}' has no instructions", agent.id));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(anyhow::anyhow!("Custom agent '{}' is defined twice", agent.id));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_config_save_and_load() {
        let mut config = Config::default();
        config.llm.provider = "ollama".to_string();
        config.agents.push(AgentDescriptor::new("docs", "Docs", "", "Check the docs."));
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).await.unwrap();
        let loaded = Config::load_from_file(temp_file.path()).await.unwrap();

        assert_eq!(loaded.llm.provider, "ollama");
        assert_eq!(loaded.llm.max_retries, 3);
        assert_eq!(loaded.agents.len(), 1);
        assert_eq!(loaded.agents[0].id, "docs");
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("llm:\n  provider: anthropic\n").unwrap();
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.llm.timeout_seconds, 300);
        assert_eq!(config.session.keep_sessions, 20);
        assert_eq!(config.tools.max_file_bytes, 256 * 1024);
        assert!(config.review.default_agents.is_empty());
    }

    #[test]
    fn test_default_yaml_parses_back() {
        let text = Config::default_yaml().unwrap();
        assert!(text.starts_with("# pr-review configuration"));
        let parsed: Config = serde_yaml::from_str(&text).unwrap();
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.llm.timeout_seconds = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.llm.provider = "bard".to_string();
        assert!(config.validate().is_err());

        config = Config::default();
        config.agents.push(AgentDescriptor::new("docs", "Docs", "", "a"));
        config.agents.push(AgentDescriptor::new("docs", "Docs again", "", "b"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config::default();
        base.llm.default_model = Some("gpt-4o".to_string());
        let mut over = Config::default();

        over.llm.provider = "ollama".to_string();
        over.review.default_agents = vec!["bug".to_string()];
        over.session.keep_sessions = 5;

        base.merge_with(over);

        assert_eq!(base.llm.provider, "ollama");
        assert_eq!(base.llm.default_model.as_deref(), Some("gpt-4o"));
        assert_eq!(base.review.default_agents, vec!["bug"]);
        assert_eq!(base.session.keep_sessions, 5);
    }

    #[test]
    fn test_session_paths_under_override() {
        let settings = SessionSettings {
            cache_dir: Some(PathBuf::from("/tmp/pr-review-cache")),
            keep_sessions: 20,
        };
        let paths = SessionPaths::resolve(&settings).unwrap();
        assert_eq!(paths.sessions_dir, PathBuf::from("/tmp/pr-review-cache/sessions"));
        assert_eq!(paths.last_session, PathBuf::from("/tmp/pr-review-cache/last-review.jsonl"));
    }
}
