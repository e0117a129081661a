//! Append-only JSON Lines storage for durable conversations.
//!
//! Layout: one `session` header line followed by one `exchange` line per
//! completed turn. An exchange is appended with a single write and synced;
//! if the write fails the file is truncated back to its prior length, so a
//! failed turn never leaves a partial record behind.

use crate::error::ReviewError;
use crate::types::ToolAccess;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub model: String,
    pub system: String,
    pub tool_access: ToolAccess,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    pub response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LogRecord {
    Session(SessionHeader),
    Exchange(Exchange),
}

/// A conversation log file on disk.
#[derive(Debug, Clone)]
pub struct SessionLog {
    path: PathBuf,
}

impl SessionLog {
    /// Create (or replace) a log containing only `header`.
    pub async fn create(path: impl Into<PathBuf>, header: &SessionHeader) -> Result<Self, ReviewError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ReviewError::session(parent, e))?;
        }

        let line = encode(&LogRecord::Session(header.clone()), &path)?;
        tokio::fs::write(&path, line)
            .await
            .map_err(|e| ReviewError::session(&path, e))?;

        debug!("Created session log {:?}", path);
        Ok(Self { path })
    }

    /// Read an existing log; `NoPreviousSession` when the file is absent.
    pub async fn load(path: impl Into<PathBuf>) -> Result<(Self, SessionHeader, Vec<Exchange>), ReviewError> {
        let path = path.into();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReviewError::NoPreviousSession { path });
            }
            Err(e) => return Err(ReviewError::session(&path, e)),
        };

        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut header = None;
        let mut exchanges = Vec::new();
        let mut torn = false;

        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str::<LogRecord>(line) {
                Ok(LogRecord::Session(h)) if header.is_none() => header = Some(h),
                Ok(LogRecord::Session(_)) => {
                    warn!("Ignoring duplicate session header in {:?}", path);
                }
                Ok(LogRecord::Exchange(exchange)) => exchanges.push(exchange),
                Err(e) if index + 1 == lines.len() && !content.ends_with('\n') => {
                    warn!("Skipping torn trailing record in {:?}: {}", path, e);
                    torn = true;
                }
                Err(e) => {
                    return Err(ReviewError::session(
                        &path,
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                    ));
                }
            }
        }

        let header = header.ok_or_else(|| {
            ReviewError::session(
                &path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "missing session header"),
            )
        })?;

        if torn {
            // The next append must start on a fresh line.
            let intact = content.rfind('\n').map_or(0, |i| i + 1) as u64;
            truncate(&path, intact).await?;
        }

        Ok((Self { path }, header, exchanges))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one exchange, rolling back on a failed write.
    pub async fn append(&self, exchange: &Exchange) -> Result<(), ReviewError> {
        let line = encode(&LogRecord::Exchange(exchange.clone()), &self.path)?;

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| ReviewError::session(&self.path, e))?;
        let original_len = file
            .metadata()
            .await
            .map_err(|e| ReviewError::session(&self.path, e))?
            .len();

        let written = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;

        if let Err(e) = written {
            warn!("Append to {:?} failed, rolling back: {}", self.path, e);
            if let Err(rollback) = file.set_len(original_len).await {
                warn!("Rollback of {:?} failed: {}", self.path, rollback);
            }
            return Err(ReviewError::session(&self.path, e));
        }

        Ok(())
    }
}

async fn truncate(path: &Path, len: u64) -> Result<(), ReviewError> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| ReviewError::session(path, e))?;
    file.set_len(len).await.map_err(|e| ReviewError::session(path, e))?;
    file.sync_data().await.map_err(|e| ReviewError::session(path, e))?;
    debug!("Truncated {:?} to {} bytes", path, len);
    Ok(())
}

fn encode(record: &LogRecord, path: &Path) -> Result<String, ReviewError> {
    let mut line = serde_json::to_string(record).map_err(|e| {
        ReviewError::session(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    line.push('\n');
    Ok(line)
}

/// Copy `source` onto `pointer` atomically (temp file + rename).
pub async fn promote(source: &Path, pointer: &Path) -> Result<(), ReviewError> {
    if let Some(parent) = pointer.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ReviewError::session(parent, e))?;
    }

    let staging = staging_path(pointer);
    tokio::fs::copy(source, &staging)
        .await
        .map_err(|e| ReviewError::session(source, e))?;
    if let Err(e) = tokio::fs::rename(&staging, pointer).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(ReviewError::session(pointer, e));
    }

    info!("Promoted {:?} to {:?}", source, pointer);
    Ok(())
}

fn staging_path(pointer: &Path) -> PathBuf {
    let mut name = pointer
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    pointer.with_file_name(name)
}

/// Delete all but the `keep` most recent `.jsonl` logs in `dir`.
pub async fn prune(dir: &Path, keep: usize) -> Result<usize, ReviewError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(ReviewError::session(dir, e)),
    };

    let mut logs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ReviewError::session(dir, e))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let modified = entry
            .metadata()
            .await
            .and_then(|m| m.modified())
            .map_err(|e| ReviewError::session(&path, e))?;
        logs.push((modified, path));
    }

    if logs.len() <= keep {
        return Ok(0);
    }

    logs.sort_by(|a, b| b.0.cmp(&a.0));
    let mut removed = 0;
    for (_, path) in logs.into_iter().skip(keep) {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => warn!("Could not prune {:?}: {}", path, e),
        }
    }
    debug!("Pruned {} old session logs from {:?}", removed, dir);
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn header() -> SessionHeader {
        SessionHeader {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            model: "gpt-4o".to_string(),
            system: "You synthesize reviews.".to_string(),
            tool_access: ToolAccess::None,
            working_dir: PathBuf::from("/repo"),
        }
    }

    fn exchange(prompt: &str, response: &str) -> Exchange {
        Exchange {
            timestamp: Utc::now(),
            prompt: prompt.to_string(),
            response: response.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_append_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/session.jsonl");
        let header = header();

        let log = SessionLog::create(&path, &header).await.unwrap();
        log.append(&exchange("review this", "looks fine")).await.unwrap();
        log.append(&exchange("why?", "tests cover it")).await.unwrap();

        let (_, loaded_header, exchanges) = SessionLog::load(&path).await.unwrap();
        assert_eq!(loaded_header, header);
        assert_eq!(exchanges.len(), 2);
        assert_eq!(exchanges[1].response, "tests cover it");

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert!(content.lines().next().unwrap().contains("\"type\":\"session\""));
    }

    #[tokio::test]
    async fn test_missing_log_is_no_previous_session() {
        let dir = TempDir::new().unwrap();
        let result = SessionLog::load(dir.path().join("absent.jsonl")).await;
        assert!(matches!(result, Err(ReviewError::NoPreviousSession { .. })));
    }

    #[tokio::test]
    async fn test_torn_trailing_record_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torn.jsonl");
        let log = SessionLog::create(&path, &header()).await.unwrap();
        log.append(&exchange("a", "b")).await.unwrap();

        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"type\":\"exchange\",\"prom");
        std::fs::write(&path, content).unwrap();

        let (log, _, exchanges) = SessionLog::load(&path).await.unwrap();
        assert_eq!(exchanges.len(), 1);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));

        log.append(&exchange("c", "d")).await.unwrap();
        let (_, _, exchanges) = SessionLog::load(&path).await.unwrap();
        assert_eq!(exchanges.len(), 2);
        assert_eq!(exchanges[1].prompt, "c");
    }

    #[tokio::test]
    async fn test_corrupt_middle_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.jsonl");
        SessionLog::create(&path, &header()).await.unwrap();

        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("not json\n");
        std::fs::write(&path, content).unwrap();

        assert!(matches!(
            SessionLog::load(&path).await,
            Err(ReviewError::Session { .. })
        ));
    }

    #[tokio::test]
    async fn test_promote_replaces_pointer() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("sessions/internal.jsonl");
        let pointer = dir.path().join("last-review.jsonl");
        std::fs::write(&pointer, "old").unwrap();

        let log = SessionLog::create(&source, &header()).await.unwrap();
        log.append(&exchange("p", "r")).await.unwrap();
        promote(&source, &pointer).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&pointer).unwrap(),
            std::fs::read_to_string(&source).unwrap()
        );
        assert!(!dir.path().join("last-review.jsonl.tmp").exists());
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_prune_keeps_most_recent() {
        let dir = TempDir::new().unwrap();
        for i in 0..4 {
            std::fs::write(dir.path().join(format!("{}.jsonl", i)), "x").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        std::fs::write(dir.path().join("keep.txt"), "x").unwrap();

        let removed = prune(dir.path(), 2).await.unwrap();
        assert_eq!(removed, 2);
        assert!(dir.path().join("3.jsonl").exists());
        assert!(dir.path().join("2.jsonl").exists());
        assert!(!dir.path().join("0.jsonl").exists());
        assert!(dir.path().join("keep.txt").exists());
    }
}
