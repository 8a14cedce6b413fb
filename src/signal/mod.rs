//! In-flight transition markers.
//!
//! Just before an agent publishes a claim or release it drops a signal file
//! at `.wu/signals/<wu_id>.json`, and clears it when the publish settles.
//! Signals are local coordination hints, not ledger facts: they are never
//! committed, and the reconciler uses them to avoid "fixing" a divergence
//! that is simply a transition still on its way to the remote.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::WU_DIR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Claim,
    Release,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub wu_id: String,
    pub kind: SignalKind,
    pub at: DateTime<Utc>,
}

/// Signal files under one repository root.
pub struct SignalStore {
    dir: PathBuf,
}

impl SignalStore {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join(WU_DIR).join("signals"),
        }
    }

    fn signal_path(&self, wu_id: &str) -> PathBuf {
        self.dir.join(format!("{wu_id}.json"))
    }

    /// Raise a signal for `wu_id`, replacing any existing one.
    pub async fn raise(&self, wu_id: &str, kind: SignalKind) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .context("failed to create signals directory")?;
        let signal = Signal {
            wu_id: wu_id.to_string(),
            kind,
            at: Utc::now(),
        };
        let json = serde_json::to_string(&signal).context("failed to serialize signal")?;
        tokio::fs::write(self.signal_path(wu_id), json)
            .await
            .context("failed to write signal file")?;
        Ok(())
    }

    /// Clear the signal for `wu_id`. Missing files are fine; clearing is
    /// called from cleanup paths that must not fail.
    pub async fn clear(&self, wu_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.signal_path(wu_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("failed to remove signal file"),
        }
    }

    /// List all current signals.
    ///
    /// Signals are advisory; a file that fails to parse is skipped with a
    /// warning rather than failing the listing.
    pub async fn list(&self) -> Result<Vec<Signal>> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }

        let mut signals = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<Signal>(&content) {
                Ok(signal) => signals.push(signal),
                Err(e) => {
                    warn!(file = %path.display(), err = %e, "skipping malformed signal file");
                }
            }
        }

        signals.sort_by(|a, b| a.wu_id.cmp(&b.wu_id));
        Ok(signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn raise_list_clear() {
        let dir = TempDir::new().unwrap();
        let store = SignalStore::new(dir.path());

        store.raise("wu-1", SignalKind::Claim).await.unwrap();
        let signals = store.list().await.unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].wu_id, "wu-1");
        assert_eq!(signals[0].kind, SignalKind::Claim);

        store.clear("wu-1").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_is_a_no_op_when_absent() {
        let dir = TempDir::new().unwrap();
        let store = SignalStore::new(dir.path());
        store.clear("never-raised").await.unwrap();
    }

    #[tokio::test]
    async fn malformed_signal_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let store = SignalStore::new(dir.path());
        store.raise("wu-1", SignalKind::Release).await.unwrap();

        let bad = dir.path().join(WU_DIR).join("signals").join("bad.json");
        tokio::fs::write(&bad, "not json").await.unwrap();

        let signals = store.list().await.unwrap();
        assert_eq!(signals.len(), 1);
    }
}
