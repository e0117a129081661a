use crate::types::ReportCollection;
use anyhow::Result;
use serde::Serialize;

/// Trait for report formatters
pub trait ReportFormatter: Send + Sync {
    fn format(&self, reports: &ReportCollection) -> Result<String>;

    /// File extension used when the formatted reports are saved.
    fn extension(&self) -> &'static str;
}

/// Markdown formatter
pub struct MarkdownFormatter;

impl ReportFormatter for MarkdownFormatter {
    fn format(&self, reports: &ReportCollection) -> Result<String> {
        let mut out = String::from("# Agent Reports\n");
        for report in reports {
            out.push_str(&format!("\n## {}\n\n", report.agent_id));
            out.push_str(report.text.trim());
            out.push('\n');
        }
        Ok(out)
    }

    fn extension(&self) -> &'static str {
        "md"
    }
}

/// JSON formatter
pub struct JsonFormatter;

#[derive(Serialize)]
struct JsonReports<'a> {
    generated_at: chrono::DateTime<chrono::Utc>,
    reports: Vec<&'a crate::types::AgentReport>,
}

impl ReportFormatter for JsonFormatter {
    fn format(&self, reports: &ReportCollection) -> Result<String> {
        let document = JsonReports {
            generated_at: chrono::Utc::now(),
            reports: reports.iter().collect(),
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    fn extension(&self) -> &'static str {
        "json"
    }
}
