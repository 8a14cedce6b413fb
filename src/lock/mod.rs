// SPDX-License-Identifier: MIT
//! Sentinel-file mutual exclusion with staleness recovery.
//!
//! A lock is a JSON file at `.wu/locks/<resource>.lock` naming its holder and
//! acquisition time. Acquisition is an atomic `create_new`; a record older
//! than its declared staleness threshold is presumed abandoned and reclaimed.
//! Reclaim is also atomic: the stale sentinel is renamed to a unique name
//! first, so of two racing reclaimers exactly one wins the rename and the
//! other goes back to polling. There is no read-then-write window in which
//! both could believe they hold the lock.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::WU_DIR;

/// Lock serializing writers of the shared ledger branch. Held across one
/// transition publish, so its staleness threshold is short.
pub const MERGE_LOCK: &str = "merge";

/// Lock serializing workspace sweeps, which can take much longer.
pub const CLEANUP_LOCK: &str = "cleanup";

/// Default pacing. The ordering `poll < timeout < merge staleness <
/// cleanup staleness` is what lets a live holder always finish before being
/// presumed dead, while a crashed one is reclaimed without operator help.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(15);
pub const MERGE_STALE_AFTER: Duration = Duration::from_secs(120);
pub const CLEANUP_STALE_AFTER: Duration = Duration::from_secs(600);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock '{resource}' is held by {holder}")]
    Busy { resource: String, holder: String },
    #[error("lock io: {0}")]
    Io(#[from] std::io::Error),
}

/// The mutual-exclusion contract callers depend on.
///
/// `LockManager` is the sentinel-file implementation; an environment without
/// a shared filesystem can substitute one backed by e.g. a database row, as
/// long as acquisition of an absent-or-stale lock stays atomic.
#[async_trait::async_trait]
pub trait LockPort: Send + Sync {
    async fn acquire(
        &self,
        resource: &str,
        holder: &str,
        stale_after: Duration,
        timeout: Duration,
    ) -> Result<(), LockError>;

    async fn release(&self, resource: &str, holder: &str) -> Result<(), LockError>;
}

/// On-disk contents of a lock sentinel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub resource: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub stale_after_secs: u64,
}

impl LockRecord {
    pub fn is_stale(&self) -> bool {
        let age = Utc::now() - self.acquired_at;
        age > chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

enum Sentinel {
    Absent,
    Record(LockRecord),
    /// Exists but does not parse. Happens in the window between `create_new`
    /// and the record write, or after a crash mid-write.
    Corrupt,
}

/// Named locks under one repository root.
pub struct LockManager {
    locks_dir: PathBuf,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(root: &Path) -> Self {
        Self {
            locks_dir: root.join(WU_DIR).join("locks"),
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Identity recorded as the holder: `<user>@<host>:<pid>`. Distinguishes
    /// symmetric worker processes well enough for an operator to find one.
    pub fn default_holder() -> String {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        format!("{user}@{host}:{}", std::process::id())
    }

    fn lock_path(&self, resource: &str) -> PathBuf {
        self.locks_dir.join(format!("{resource}.lock"))
    }

    /// Acquire `resource` for `holder`, polling until `timeout`.
    ///
    /// Succeeds by creating the sentinel when none exists, or by reclaiming
    /// one older than `stale_after`. Fails `Busy` naming the current holder
    /// once the timeout elapses.
    pub async fn acquire(
        &self,
        resource: &str,
        holder: &str,
        stale_after: Duration,
        timeout: Duration,
    ) -> Result<(), LockError> {
        tokio::fs::create_dir_all(&self.locks_dir).await?;

        let path = self.lock_path(resource);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last_holder = "unknown".to_string();

        loop {
            if self.try_create(&path, resource, holder, stale_after).await? {
                debug!(resource, holder, "lock acquired");
                return Ok(());
            }

            match self.read_sentinel(&path).await? {
                Sentinel::Absent => {
                    // Released between our create attempt and the read; try
                    // again immediately.
                    continue;
                }
                Sentinel::Record(record) => {
                    if record.is_stale() {
                        if self.reclaim(&path, resource, &record.holder).await? {
                            continue;
                        }
                    } else {
                        last_holder = record.holder;
                    }
                }
                Sentinel::Corrupt => {
                    // Only reclaim a corrupt sentinel once it is old enough
                    // that no live writer can still be mid-write.
                    if self.sentinel_age(&path).await? > stale_after {
                        if self.reclaim(&path, resource, "corrupt").await? {
                            continue;
                        }
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(LockError::Busy {
                    resource: resource.to_string(),
                    holder: last_holder,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Release `resource` if `holder` is the recorded holder.
    ///
    /// Releasing a lock you do not hold (or that no longer exists) is a
    /// no-op, so a double release after a staleness reclaim cannot delete
    /// the new holder's lock.
    pub async fn release(&self, resource: &str, holder: &str) -> Result<(), LockError> {
        let path = self.lock_path(resource);
        match self.read_sentinel(&path).await? {
            Sentinel::Record(record) if record.holder == holder => {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        debug!(resource, holder, "lock released");
                        Ok(())
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Sentinel::Record(record) => {
                debug!(
                    resource,
                    holder,
                    current = %record.holder,
                    "release skipped: not the recorded holder"
                );
                Ok(())
            }
            Sentinel::Absent | Sentinel::Corrupt => Ok(()),
        }
    }

    /// Current holder of `resource`, if any record is readable.
    pub async fn holder_of(&self, resource: &str) -> Result<Option<String>, LockError> {
        match self.read_sentinel(&self.lock_path(resource)).await? {
            Sentinel::Record(record) => Ok(Some(record.holder)),
            _ => Ok(None),
        }
    }

    /// One `create_new` attempt. Returns false if the sentinel already exists.
    async fn try_create(
        &self,
        path: &Path,
        resource: &str,
        holder: &str,
        stale_after: Duration,
    ) -> Result<bool, LockError> {
        let record = LockRecord {
            resource: resource.to_string(),
            holder: holder.to_string(),
            acquired_at: Utc::now(),
            stale_after_secs: stale_after.as_secs(),
        };
        let json = serde_json::to_string(&record).map_err(|e| {
            LockError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(mut file) => {
                file.write_all(json.as_bytes()).await?;
                file.flush().await?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically take a stale sentinel out of the way. Rename is the
    /// arbitration point: the loser's rename fails with NotFound.
    async fn reclaim(
        &self,
        path: &Path,
        resource: &str,
        previous_holder: &str,
    ) -> Result<bool, LockError> {
        let reclaim_path = self
            .locks_dir
            .join(format!("{resource}.stale.{}", uuid::Uuid::new_v4()));
        match tokio::fs::rename(path, &reclaim_path).await {
            Ok(()) => {
                warn!(
                    resource,
                    previous_holder, "reclaimed stale lock from presumed-dead holder"
                );
                let _ = tokio::fs::remove_file(&reclaim_path).await;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_sentinel(&self, path: &Path) -> Result<Sentinel, LockError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => match serde_json::from_str::<LockRecord>(&content) {
                Ok(record) => Ok(Sentinel::Record(record)),
                Err(_) => Ok(Sentinel::Corrupt),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Sentinel::Absent),
            Err(e) => Err(e.into()),
        }
    }

    async fn sentinel_age(&self, path: &Path) -> Result<Duration, LockError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                let modified = meta.modified()?;
                Ok(modified.elapsed().unwrap_or(Duration::ZERO))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Duration::ZERO),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl LockPort for LockManager {
    async fn acquire(
        &self,
        resource: &str,
        holder: &str,
        stale_after: Duration,
        timeout: Duration,
    ) -> Result<(), LockError> {
        LockManager::acquire(self, resource, holder, stale_after, timeout).await
    }

    async fn release(&self, resource: &str, holder: &str) -> Result<(), LockError> {
        LockManager::release(self, resource, holder).await
    }
}
