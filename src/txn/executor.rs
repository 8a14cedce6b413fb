use std::future::Future;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::TxnError;

/// What a transaction callback hands back: the files it changed (relative to
/// the repository root) and the message to commit them under.
#[derive(Debug, Clone, PartialEq)]
pub struct TxnOutcome {
    pub commit_message: String,
    pub files: Vec<PathBuf>,
}

/// Record of a published transaction.
#[derive(Debug, Clone)]
pub struct TxnReceipt {
    pub txn_id: String,
    /// Revision of the shared branch before the transaction.
    pub base: String,
    /// The published commit.
    pub commit: String,
    pub files: Vec<PathBuf>,
}

/// Whether to fold newer published history into the workspace before the
/// callback runs. Callers already serialized by the lock manager know they
/// are the sole writer and skip the sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    Sync,
    PushOnly,
}

/// Version-control operations the executor needs.
///
/// The executor's guarantees (atomic publish, rollback on rejected publish,
/// unconditional workspace teardown) are stated against this contract, not
/// against any particular tool. `GitVcs` is the production implementation.
#[async_trait]
pub trait VcsPort: Send + Sync {
    /// Current revision of the shared branch.
    async fn tip(&self) -> Result<String, TxnError>;
    /// Create an isolated workspace forked from the current tip.
    async fn fork(&self, txn_id: &str) -> Result<PathBuf, TxnError>;
    /// Fast-forward the workspace onto newer published history.
    async fn sync(&self, workspace: &Path) -> Result<(), TxnError>;
    /// Stage exactly `files` (relative to the repository root).
    async fn stage(&self, workspace: &Path, files: &[PathBuf]) -> Result<(), TxnError>;
    /// Commit the staged files as one unit and advance the shared branch to
    /// the new revision. Returns the commit id.
    async fn commit(&self, workspace: &Path, message: &str) -> Result<String, TxnError>;
    /// Push the shared branch to the remote.
    async fn publish(&self) -> Result<(), TxnError>;
    /// Reset the shared branch to `revision`.
    async fn rollback(&self, revision: &str) -> Result<(), TxnError>;
    /// Remove an isolated workspace.
    async fn discard(&self, workspace: &Path) -> Result<(), TxnError>;
}

/// Runs operation callbacks inside isolated workspaces and publishes their
/// writes atomically.
pub struct TxnExecutor<V> {
    vcs: V,
}

impl<V: VcsPort> TxnExecutor<V> {
    pub fn new(vcs: V) -> Self {
        Self { vcs }
    }

    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    /// Run one transaction.
    ///
    /// Either every file the callback declares is published together, or the
    /// shared branch is left at its pre-transaction revision. The workspace
    /// is discarded whatever happens, including on callback error.
    pub async fn run<F, Fut>(
        &self,
        op: &str,
        txn_id: &str,
        mode: TxnMode,
        callback: F,
    ) -> Result<TxnReceipt, TxnError>
    where
        F: FnOnce(PathBuf) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<TxnOutcome>> + Send,
    {
        let base = self.vcs.tip().await?;
        let workspace = self.vcs.fork(txn_id).await?;
        debug!(op, txn_id, base = %base, workspace = %workspace.display(), "transaction forked");

        let result = self
            .run_in_workspace(op, txn_id, &base, &workspace, mode, callback)
            .await;

        // Teardown runs on every path out of the workspace.
        if let Err(e) = self.vcs.discard(&workspace).await {
            warn!(op, txn_id, err = %e, "failed to discard transaction workspace");
        }

        result
    }

    async fn run_in_workspace<F, Fut>(
        &self,
        op: &str,
        txn_id: &str,
        base: &str,
        workspace: &Path,
        mode: TxnMode,
        callback: F,
    ) -> Result<TxnReceipt, TxnError>
    where
        F: FnOnce(PathBuf) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<TxnOutcome>> + Send,
    {
        if mode == TxnMode::Sync {
            self.vcs.sync(workspace).await?;
        }

        let outcome = callback(workspace.to_path_buf())
            .await
            .map_err(|source| TxnError::Callback {
                op: op.to_string(),
                source,
            })?;

        self.vcs.stage(workspace, &outcome.files).await?;
        let commit = self.vcs.commit(workspace, &outcome.commit_message).await?;

        if let Err(publish_err) = self.vcs.publish().await {
            // A committed-but-unpublished revision must not survive as the
            // branch tip.
            if let Err(rb) = self.vcs.rollback(base).await {
                warn!(op, txn_id, err = %rb, "rollback after rejected publish failed");
            }
            return Err(TxnError::PublishRejected {
                op: op.to_string(),
                base: base.to_string(),
                message: publish_err.to_string(),
            });
        }

        debug!(op, txn_id, commit = %commit, "transaction published");
        Ok(TxnReceipt {
            txn_id: txn_id.to_string(),
            base: base.to_string(),
            commit,
            files: outcome.files,
        })
    }
}
