use crate::error::ReviewError;
use crate::llm::prompts::AgentPrompts;
use crate::types::AgentDescriptor;
use std::collections::HashSet;

/// Immutable set of review agents, in definition order.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: Vec<AgentDescriptor>,
}

impl AgentRegistry {
    /// The four built-in reviewers.
    pub fn builtin() -> Self {
        Self {
            agents: vec![
                AgentDescriptor::new(
                    "bug",
                    "Bug Hunter",
                    "Correctness defects, error handling, concurrency and security bugs",
                    AgentPrompts::bug_hunter(),
                ),
                AgentDescriptor::new(
                    "quality",
                    "Code Quality",
                    "Style, conventions, readability and maintainability",
                    AgentPrompts::code_quality(),
                ),
                AgentDescriptor::new(
                    "tests",
                    "Test Coverage",
                    "Missing, weak or brittle tests for the changed behaviour",
                    AgentPrompts::test_coverage(),
                ),
                AgentDescriptor::new(
                    "api",
                    "API Contracts",
                    "Breaking changes to public APIs, formats and defaults",
                    AgentPrompts::api_contracts(),
                ),
            ],
        }
    }

    pub fn from_descriptors(agents: Vec<AgentDescriptor>) -> Result<Self, ReviewError> {
        Self { agents: Vec::new() }.with_custom(agents)
    }

    /// Append agents after the existing ones; ids must stay unique.
    pub fn with_custom(mut self, custom: Vec<AgentDescriptor>) -> Result<Self, ReviewError> {
        for agent in custom {
            if self.lookup(&agent.id).is_some() {
                return Err(ReviewError::DuplicateAgent(agent.id));
            }
            self.agents.push(agent);
        }
        Ok(self)
    }

    pub fn lookup(&self, id: &str) -> Option<&AgentDescriptor> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.id.clone()).collect()
    }

    pub fn descriptors(&self) -> &[AgentDescriptor] {
        &self.agents
    }

    /// Resolve a caller's selection into descriptors.
    ///
    /// Empty means every agent. Repeated ids keep their first position.
    /// Any unknown id rejects the whole selection.
    pub fn resolve_selection(&self, ids: &[String]) -> Result<Vec<AgentDescriptor>, ReviewError> {
        if ids.is_empty() {
            return Ok(self.agents.clone());
        }

        let mut seen = HashSet::new();
        let mut selected = Vec::with_capacity(ids.len());
        for id in ids {
            let descriptor = self.lookup(id).ok_or_else(|| ReviewError::UnknownAgent {
                id: id.clone(),
                available: self.all_ids(),
            })?;
            if seen.insert(id.as_str()) {
                selected.push(descriptor.clone());
            }
        }
        Ok(selected)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_builtin_definition_order() {
        let registry = AgentRegistry::builtin();
        assert_eq!(registry.all_ids(), ids(&["bug", "quality", "tests", "api"]));
        assert_eq!(registry.lookup("quality").unwrap().display_name, "Code Quality");
        assert!(registry.lookup("perf").is_none());
    }

    #[test]
    fn test_selection_keeps_caller_order_and_dedupes() {
        let registry = AgentRegistry::builtin();
        let selected = registry
            .resolve_selection(&ids(&["api", "bug", "api"]))
            .unwrap();
        let selected_ids: Vec<_> = selected.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(selected_ids, vec!["api", "bug"]);
    }

    #[test]
    fn test_empty_selection_means_all() {
        let registry = AgentRegistry::builtin();
        assert_eq!(registry.resolve_selection(&[]).unwrap().len(), 4);
    }

    #[test]
    fn test_unknown_agent_rejected() {
        let registry = AgentRegistry::builtin();
        let err = registry.resolve_selection(&ids(&["bug", "perf"])).unwrap_err();
        match err {
            ReviewError::UnknownAgent { id, available } => {
                assert_eq!(id, "perf");
                assert_eq!(available.len(), 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_custom_agents_append_and_collide() {
        let docs = AgentDescriptor::new("docs", "Docs", "", "Check docs.");
        let registry = AgentRegistry::builtin().with_custom(vec![docs]).unwrap();
        assert_eq!(registry.all_ids().last().map(String::as_str), Some("docs"));

        let clash = AgentDescriptor::new("bug", "Another", "", "x");
        assert!(matches!(
            AgentRegistry::builtin().with_custom(vec![clash]),
            Err(ReviewError::DuplicateAgent(id)) if id == "bug"
        ));
    }
}
