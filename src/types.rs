use crate::error::ReviewError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Core types for the review orchestration engine

/// Static description of one review agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub instructions: String,
}

impl AgentDescriptor {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        description: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            description: description.into(),
            instructions: instructions.into(),
        }
    }
}

/// One invocation's worth of review input. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub diff_text: String,
    pub working_dir: PathBuf,
    /// Caller-specified order; an empty list selects every registered agent.
    pub selected_agent_ids: Vec<String>,
    pub model_selector: Option<String>,
    pub extra_context: String,
}

impl ReviewRequest {
    pub fn new(diff_text: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            diff_text: diff_text.into(),
            working_dir: working_dir.into(),
            selected_agent_ids: Vec::new(),
            model_selector: None,
            extra_context: String::new(),
        }
    }

    pub fn with_agents<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selected_agent_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_selector = Some(model.into());
        self
    }

    pub fn with_extra_context(mut self, context: impl Into<String>) -> Self {
        self.extra_context = context.into();
        self
    }
}

/// The finished output of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent_id: String,
    pub text: String,
}

/// Agent reports in request order, independent of completion order.
///
/// Only constructible from a complete set of slots, so a partially
/// populated collection never reaches synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportCollection {
    reports: Vec<AgentReport>,
}

impl ReportCollection {
    /// Build the collection from slots indexed by request position.
    pub fn assemble(
        ordered_ids: &[String],
        slots: Vec<Option<AgentReport>>,
    ) -> Result<Self, ReviewError> {
        if ordered_ids.len() != slots.len() {
            return Err(ReviewError::IncompleteReports {
                missing: ordered_ids.to_vec(),
            });
        }

        let missing: Vec<String> = ordered_ids
            .iter()
            .zip(slots.iter())
            .filter(|(id, slot)| match slot {
                Some(report) => &report.agent_id != *id,
                None => true,
            })
            .map(|(id, _)| id.clone())
            .collect();

        if !missing.is_empty() {
            return Err(ReviewError::IncompleteReports { missing });
        }

        Ok(Self {
            reports: slots.into_iter().flatten().collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentReport> {
        self.reports.iter().find(|r| r.agent_id == agent_id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.reports.iter().map(|r| r.agent_id.as_str()).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AgentReport> {
        self.reports.iter()
    }
}

impl<'a> IntoIterator for &'a ReportCollection {
    type Item = &'a AgentReport;
    type IntoIter = std::slice::Iter<'a, AgentReport>;

    fn into_iter(self) -> Self::IntoIter {
        self.reports.iter()
    }
}

/// Tool capability granted to a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolAccess {
    ReadWrite,
    ReadOnly,
    None,
}

impl ToolAccess {
    pub fn allows_read(&self) -> bool {
        !matches!(self, ToolAccess::None)
    }

    pub fn allows_write(&self) -> bool {
        matches!(self, ToolAccess::ReadWrite)
    }
}

impl fmt::Display for ToolAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ToolAccess::ReadWrite => "read-write",
            ToolAccess::ReadOnly => "read-only",
            ToolAccess::None => "none",
        };
        f.write_str(label)
    }
}
