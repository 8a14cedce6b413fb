use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::WU_DIR;

const DEFAULT_BRANCH: &str = "main";
const DEFAULT_REMOTE: &str = "origin";
const DEFAULT_POLL_MS: u64 = 250;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 15;
const DEFAULT_MERGE_STALE_SECS: u64 = 120;
const DEFAULT_CLEANUP_STALE_SECS: u64 = 600;
const DEFAULT_WORKSPACE_MAX_AGE_SECS: u64 = 3600;

// ─── LockConfig ──────────────────────────────────────────────────────────────

/// Lock pacing (`[lock]` in `.wu/config.toml`).
///
/// Must satisfy `poll < acquire timeout < merge staleness < cleanup
/// staleness`: a live holder always renews or finishes before being presumed
/// dead, a crashed one is reclaimed without an operator.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    pub poll_ms: u64,
    pub acquire_timeout_secs: u64,
    pub merge_stale_secs: u64,
    pub cleanup_stale_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_ms: DEFAULT_POLL_MS,
            acquire_timeout_secs: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            merge_stale_secs: DEFAULT_MERGE_STALE_SECS,
            cleanup_stale_secs: DEFAULT_CLEANUP_STALE_SECS,
        }
    }
}

impl LockConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn merge_stale_after(&self) -> Duration {
        Duration::from_secs(self.merge_stale_secs)
    }

    pub fn cleanup_stale_after(&self) -> Duration {
        Duration::from_secs(self.cleanup_stale_secs)
    }

    fn validate(&self) -> Result<()> {
        let poll = self.poll_interval();
        if !(poll < self.acquire_timeout()
            && self.acquire_timeout() < self.merge_stale_after()
            && self.merge_stale_after() < self.cleanup_stale_after())
        {
            bail!(
                "invalid [lock] config: require poll ({:?}) < acquire timeout ({:?}) \
                 < merge staleness ({:?}) < cleanup staleness ({:?})",
                poll,
                self.acquire_timeout(),
                self.merge_stale_after(),
                self.cleanup_stale_after()
            );
        }
        Ok(())
    }
}

// ─── TxnConfig ───────────────────────────────────────────────────────────────

/// Transaction / repository settings (`[txn]` in `.wu/config.toml`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TxnConfig {
    /// Shared branch acting as the publish target.
    pub branch: String,
    /// Remote acting as the ordering authority.
    pub remote: String,
    /// Where transaction worktrees are created. Defaults to a per-user
    /// directory under the system temp dir.
    pub data_dir: Option<PathBuf>,
    /// Age beyond which an abandoned workspace is swept.
    pub workspace_max_age_secs: u64,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            branch: DEFAULT_BRANCH.to_string(),
            remote: DEFAULT_REMOTE.to_string(),
            data_dir: None,
            workspace_max_age_secs: DEFAULT_WORKSPACE_MAX_AGE_SECS,
        }
    }
}

impl TxnConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("wud"))
    }

    pub fn workspace_max_age(&self) -> Duration {
        Duration::from_secs(self.workspace_max_age_secs)
    }
}

// ─── WudConfig ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WudConfig {
    pub lock: LockConfig,
    pub txn: TxnConfig,
}

impl WudConfig {
    /// Load `.wu/config.toml` under `root`, falling back to defaults when it
    /// does not exist. A present-but-invalid file is an error; silently
    /// ignoring a typo'd staleness threshold would undermine the reclaim
    /// guarantees.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(WU_DIR).join("config.toml");
        let config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: WudConfig = toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            debug!(path = %path.display(), "config loaded");
            config
        } else {
            WudConfig::default()
        };

        config.lock.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_satisfy_the_threshold_ordering() {
        let config = WudConfig::default();
        config.lock.validate().unwrap();
        assert!(config.lock.poll_interval() < config.lock.acquire_timeout());
        assert!(config.lock.acquire_timeout() < config.lock.merge_stale_after());
        assert!(config.lock.merge_stale_after() < config.lock.cleanup_stale_after());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = TempDir::new().unwrap();
        let config = WudConfig::load(dir.path()).unwrap();
        assert_eq!(config.txn.branch, "main");
        assert_eq!(config.txn.remote, "origin");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let wu = dir.path().join(WU_DIR);
        std::fs::create_dir_all(&wu).unwrap();
        std::fs::write(wu.join("config.toml"), "[txn]\nbranch = \"trunk\"\n").unwrap();

        let config = WudConfig::load(dir.path()).unwrap();
        assert_eq!(config.txn.branch, "trunk");
        assert_eq!(config.lock.poll_ms, DEFAULT_POLL_MS);
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let dir = TempDir::new().unwrap();
        let wu = dir.path().join(WU_DIR);
        std::fs::create_dir_all(&wu).unwrap();
        std::fs::write(
            wu.join("config.toml"),
            "[lock]\nmerge_stale_secs = 5\nacquire_timeout_secs = 30\n",
        )
        .unwrap();

        assert!(WudConfig::load(dir.path()).is_err());
    }
}
