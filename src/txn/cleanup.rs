//! Sweep of abandoned transaction workspaces.
//!
//! A worker that dies between `fork` and `discard` leaves its worktree
//! behind. The sweeper removes workspaces older than a threshold; callers
//! hold the `cleanup` lock around a sweep so concurrent sweepers do not
//! race each other.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use super::executor::VcsPort;
use super::git::GitVcs;

/// Remove transaction workspaces whose directory is older than `max_age`.
///
/// Returns the number removed. Failures on individual workspaces are logged
/// and skipped; one wedged directory must not stop the sweep.
pub async fn sweep_stale_workspaces(vcs: &GitVcs, max_age: Duration) -> Result<u32> {
    let dir = vcs.workspaces_dir();
    if !dir.exists() {
        return Ok(0);
    }

    let mut removed = 0u32;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if !is_older_than(&path, max_age).await {
            continue;
        }

        match vcs.discard(&path).await {
            Ok(()) => {
                info!(workspace = %path.display(), "removed stale transaction workspace");
                removed += 1;
            }
            Err(e) => {
                warn!(workspace = %path.display(), err = %e, "failed to remove stale workspace");
            }
        }
    }

    Ok(removed)
}

async fn is_older_than(path: &Path, max_age: Duration) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .map(|age| age > max_age)
            .unwrap_or(false),
        Err(_) => false,
    }
}
