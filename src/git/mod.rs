use crate::error::ReviewError;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Where the diff under review comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffSource {
    /// Uncommitted changes against `HEAD`.
    WorkingTree,
    Staged,
    /// Changes on this branch since it diverged from `base`.
    Base(String),
    File(PathBuf),
    Stdin,
}

impl DiffSource {
    fn git_args(&self) -> Option<Vec<String>> {
        match self {
            DiffSource::WorkingTree => Some(vec!["diff".into(), "HEAD".into()]),
            DiffSource::Staged => Some(vec!["diff".into(), "--cached".into()]),
            DiffSource::Base(base) => Some(vec!["diff".into(), format!("{}...HEAD", base)]),
            DiffSource::File(_) | DiffSource::Stdin => None,
        }
    }
}

/// Fetch the diff text; an empty diff is rejected with [`ReviewError::EmptyDiff`].
pub async fn collect_diff(working_dir: &Path, source: &DiffSource) -> Result<String> {
    let diff = match source {
        DiffSource::File(path) if path.as_os_str() == "-" => read_stdin().await?,
        DiffSource::File(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read diff file {}", path.display()))?,
        DiffSource::Stdin => read_stdin().await?,
        _ => run_git(working_dir, source).await?,
    };

    if diff.trim().is_empty() {
        return Err(ReviewError::EmptyDiff.into());
    }

    info!("Collected diff: {} lines", diff.lines().count());
    Ok(diff)
}

async fn run_git(working_dir: &Path, source: &DiffSource) -> Result<String> {
    let args = source.git_args().unwrap_or_default();
    debug!("Running git {}", args.join(" "));

    let output = Command::new("git")
        .args(&args)
        .current_dir(working_dir)
        .output()
        .await
        .context("Failed to run git; is it installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }

    String::from_utf8(output.stdout).context("git diff output is not valid UTF-8")
}

async fn read_stdin() -> Result<String> {
    let mut diff = String::new();
    tokio::io::stdin()
        .read_to_string(&mut diff)
        .await
        .context("Failed to read diff from stdin")?;
    Ok(diff)
}
