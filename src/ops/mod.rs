//! Lifecycle operations: the only write path to the shared repository.
//!
//! Every transition follows the same shape: take the merge lock, stage the
//! event append (and any task-document update) in an isolated transaction,
//! publish, release the lock. The reconciler's corrective events go through
//! the exact same path; there is no privileged bypass.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::board::{Board, TaskDoc};
use crate::config::WudConfig;
use crate::ledger::{EventLog, ProjectedState, WuEvent, WuEventKind, WuStatus};
use crate::lock::{LockManager, CLEANUP_LOCK, MERGE_LOCK};
use crate::reconcile::{self, DiagnoseOptions, DiagnoseReport, ReconcilePorts};
use crate::signal::{Signal, SignalKind, SignalStore};
use crate::txn::{self, GitVcs, TxnExecutor, TxnMode, TxnOutcome, TxnReceipt};

/// What a transition does to the task document, besides appending its event.
enum DocWrite {
    /// Ledger-only transition (checkpoint, delegate, corrective events).
    Keep,
    /// Rewrite the document's declared status.
    SetStatus(WuStatus),
    /// Create a fresh document; fails if one already exists.
    Fresh { lane: String, title: String },
}

pub struct WuOps {
    root: PathBuf,
    config: WudConfig,
    locks: LockManager,
    signals: SignalStore,
    txn: TxnExecutor<GitVcs>,
    holder: String,
}

impl WuOps {
    pub fn new(root: &Path, config: WudConfig) -> Self {
        let vcs = GitVcs::new(
            root,
            &config.txn.data_dir(),
            &config.txn.branch,
            &config.txn.remote,
        );
        let locks = LockManager::new(root).with_poll_interval(config.lock.poll_interval());
        Self {
            root: root.to_path_buf(),
            locks,
            signals: SignalStore::new(root),
            txn: TxnExecutor::new(vcs),
            holder: LockManager::default_holder(),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rebuild the projection from the shared checkout's ledger.
    pub async fn state(&self) -> Result<ProjectedState> {
        Ok(ProjectedState::load(&EventLog::new(&self.root)).await?)
    }

    // ── Transitions ─────────────────────────────────────────────────────────

    pub async fn create(&self, wu_id: &str, lane: &str, title: &str) -> Result<TxnReceipt> {
        self.transition(
            wu_id,
            WuEventKind::Create {
                lane: lane.to_string(),
                title: title.to_string(),
            },
            DocWrite::Fresh {
                lane: lane.to_string(),
                title: title.to_string(),
            },
        )
        .await
    }

    /// Claim an existing work unit. Lane and title ride along on the event
    /// so the ledger alone can rebuild them.
    pub async fn claim(&self, wu_id: &str) -> Result<TxnReceipt> {
        let doc = self.require_doc(wu_id).await?;
        self.signals.raise(wu_id, SignalKind::Claim).await?;
        let result = self
            .transition(
                wu_id,
                WuEventKind::Claim {
                    lane: doc.lane,
                    title: doc.title,
                    reason: None,
                },
                DocWrite::SetStatus(WuStatus::InProgress),
            )
            .await;
        self.clear_signal(wu_id).await;
        result
    }

    pub async fn block(&self, wu_id: &str, note: Option<String>) -> Result<TxnReceipt> {
        self.transition(
            wu_id,
            WuEventKind::Block { note },
            DocWrite::SetStatus(WuStatus::Blocked),
        )
        .await
    }

    pub async fn unblock(&self, wu_id: &str) -> Result<TxnReceipt> {
        self.transition(
            wu_id,
            WuEventKind::Unblock,
            DocWrite::SetStatus(WuStatus::InProgress),
        )
        .await
    }

    pub async fn complete(&self, wu_id: &str) -> Result<TxnReceipt> {
        self.transition(
            wu_id,
            WuEventKind::Complete,
            DocWrite::SetStatus(WuStatus::Done),
        )
        .await
    }

    /// Record progress without changing status.
    pub async fn checkpoint(&self, wu_id: &str, note: &str) -> Result<TxnReceipt> {
        self.transition(
            wu_id,
            WuEventKind::Checkpoint {
                note: note.to_string(),
            },
            DocWrite::Keep,
        )
        .await
    }

    /// Register `wu_id` as delegated from `parent_wu_id`.
    pub async fn delegate(&self, wu_id: &str, parent_wu_id: &str) -> Result<TxnReceipt> {
        self.transition(
            wu_id,
            WuEventKind::Delegate {
                parent_wu_id: parent_wu_id.to_string(),
            },
            DocWrite::Keep,
        )
        .await
    }

    /// Return an orphaned in-progress unit to the available pool.
    pub async fn release(&self, wu_id: &str, reason: Option<String>) -> Result<TxnReceipt> {
        self.signals.raise(wu_id, SignalKind::Release).await?;
        let result = self
            .transition(
                wu_id,
                WuEventKind::Release { reason },
                DocWrite::SetStatus(WuStatus::Ready),
            )
            .await;
        self.clear_signal(wu_id).await;
        result
    }

    // ── Reconciliation & maintenance ────────────────────────────────────────

    pub async fn diagnose(&self, options: DiagnoseOptions) -> Result<DiagnoseReport> {
        let ports = LedgerPorts { ops: self };
        reconcile::diagnose(&ports, options).await
    }

    /// Sweep abandoned transaction workspaces under the cleanup lock.
    pub async fn cleanup(&self) -> Result<u32> {
        self.locks
            .acquire(
                CLEANUP_LOCK,
                &self.holder,
                self.config.lock.cleanup_stale_after(),
                self.config.lock.acquire_timeout(),
            )
            .await?;

        let result =
            txn::cleanup::sweep_stale_workspaces(self.txn.vcs(), self.config.txn.workspace_max_age())
                .await;

        if let Err(e) = self.locks.release(CLEANUP_LOCK, &self.holder).await {
            warn!(err = %e, "failed to release cleanup lock");
        }
        result
    }

    // ── Internals ───────────────────────────────────────────────────────────

    /// Serialize against other writers, then publish one event append (plus
    /// optional document write) as a single isolated transaction.
    async fn transition(
        &self,
        wu_id: &str,
        kind: WuEventKind,
        doc_write: DocWrite,
    ) -> Result<TxnReceipt> {
        let verb = kind.verb();
        self.locks
            .acquire(
                MERGE_LOCK,
                &self.holder,
                self.config.lock.merge_stale_after(),
                self.config.lock.acquire_timeout(),
            )
            .await
            .with_context(|| format!("cannot {verb} '{wu_id}'"))?;

        let result = self.publish_transition(wu_id, kind, doc_write).await;

        if let Err(e) = self.locks.release(MERGE_LOCK, &self.holder).await {
            warn!(err = %e, "failed to release merge lock");
        }

        match &result {
            Ok(receipt) => {
                info!(wu_id, verb, commit = %receipt.commit, "transition published");
            }
            Err(e) => {
                warn!(wu_id, verb, err = %e, "transition failed");
            }
        }
        result
    }

    async fn publish_transition(
        &self,
        wu_id: &str,
        kind: WuEventKind,
        doc_write: DocWrite,
    ) -> Result<TxnReceipt> {
        let verb = kind.verb();
        let txn_id = txn::new_txn_id();
        let event = WuEvent::new(wu_id, kind);
        let wu_id = wu_id.to_string();

        // The lock manager already serialized us; no other writer can have
        // published since we read the tip, so the transaction skips the sync.
        let receipt = self
            .txn
            .run(verb, &txn_id, TxnMode::PushOnly, move |workspace| async move {
                let log = EventLog::new(&workspace);
                log.append(&event).await?;
                let mut files = vec![EventLog::relative_path()];

                match doc_write {
                    DocWrite::Keep => {}
                    DocWrite::SetStatus(status) => {
                        let board = Board::new(&workspace);
                        let mut doc = board
                            .load(&wu_id)
                            .await?
                            .ok_or_else(|| anyhow!("no task document for '{wu_id}'"))?;
                        doc.status = status;
                        board.save(&doc).await?;
                        files.push(Board::relative_doc_path(&wu_id));
                    }
                    DocWrite::Fresh { lane, title } => {
                        let board = Board::new(&workspace);
                        if board.load(&wu_id).await?.is_some() {
                            bail!("work unit '{wu_id}' already exists");
                        }
                        board
                            .save(&TaskDoc::new(&wu_id, &lane, &title, WuStatus::InProgress))
                            .await?;
                        files.push(Board::relative_doc_path(&wu_id));
                    }
                }

                Ok(TxnOutcome {
                    commit_message: format!("wu({wu_id}): {verb}"),
                    files,
                })
            })
            .await?;

        Ok(receipt)
    }

    async fn require_doc(&self, wu_id: &str) -> Result<TaskDoc> {
        Board::new(&self.root)
            .load(wu_id)
            .await?
            .ok_or_else(|| anyhow!("no task document for '{wu_id}'"))
    }

    async fn clear_signal(&self, wu_id: &str) {
        if let Err(e) = self.signals.clear(wu_id).await {
            warn!(wu_id, err = %e, "failed to clear signal");
        }
    }
}

/// Production reconciler ports: read the checkout, append through `WuOps`.
pub struct LedgerPorts<'a> {
    ops: &'a WuOps,
}

#[async_trait]
impl ReconcilePorts for LedgerPorts<'_> {
    async fn list_tasks(&self) -> Result<Vec<TaskDoc>> {
        Board::new(&self.ops.root).load_all().await
    }

    async fn list_events(&self) -> Result<Vec<WuEvent>> {
        Ok(EventLog::new(&self.ops.root).read_all().await?)
    }

    async fn list_signals(&self) -> Result<Vec<Signal>> {
        self.ops.signals.list().await
    }

    async fn emit_event(&self, event: WuEvent) -> Result<()> {
        // Same lock + micro-worktree path as a normal transition; the
        // document is already the side we trust, so only the ledger moves.
        let wu_id = event.wu_id.clone();
        self.ops
            .transition(&wu_id, event.kind, DocWrite::Keep)
            .await?;
        Ok(())
    }
}
