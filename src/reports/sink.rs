use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Append-only destination for streamed review text.
///
/// Fragments are written as they arrive; implementations must not buffer
/// beyond what the underlying stream does.
pub trait OutputSink: Send + Sync {
    fn write(&self, fragment: &str) -> io::Result<()>;

    /// Called once the streamed turn has completed.
    fn finish(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes fragments straight to stdout, flushing each one.
#[derive(Debug)]
pub struct StdoutSink {
    at_line_start: AtomicBool,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            at_line_start: AtomicBool::new(true),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSink for StdoutSink {
    fn write(&self, fragment: &str) -> io::Result<()> {
        if fragment.is_empty() {
            return Ok(());
        }
        let mut out = io::stdout().lock();
        out.write_all(fragment.as_bytes())?;
        out.flush()?;
        self.at_line_start.store(fragment.ends_with('\n'), Ordering::Relaxed);
        Ok(())
    }

    fn finish(&self) -> io::Result<()> {
        if !self.at_line_start.swap(true, Ordering::Relaxed) {
            let mut out = io::stdout().lock();
            out.write_all(b"\n")?;
            out.flush()?;
        }
        Ok(())
    }
}

/// Collects fragments in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    buffer: Mutex<String>,
    fragments: AtomicUsize,
    finished: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.buffer.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.load(Ordering::Relaxed)
    }

    pub fn finish_count(&self) -> usize {
        self.finished.load(Ordering::Relaxed)
    }
}

impl OutputSink for MemorySink {
    fn write(&self, fragment: &str) -> io::Result<()> {
        self.buffer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_str(fragment);
        self.fragments.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn finish(&self) -> io::Result<()> {
        self.finished.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
