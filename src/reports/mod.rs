pub mod formatters;
pub mod sink;

pub use formatters::{JsonFormatter, MarkdownFormatter, ReportFormatter};
pub use sink::{MemorySink, OutputSink, StdoutSink};
