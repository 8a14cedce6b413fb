// SPDX-License-Identifier: MIT
//! git2-backed implementation of the transaction `VcsPort`.
//!
//! Workspaces are real git worktrees at `{data_dir}/txn/{txn_id}`, branched
//! as `wu/txn/<txn-id>` from the shared branch tip. All libgit2 calls are
//! blocking and run on the blocking pool.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::executor::VcsPort;
use super::TxnError;
use crate::WU_DIR;

pub struct GitVcs {
    repo_root: PathBuf,
    /// Parent directory of all transaction workspaces.
    workspaces_dir: PathBuf,
    branch: String,
    remote: String,
}

impl GitVcs {
    pub fn new(repo_root: &Path, data_dir: &Path, branch: &str, remote: &str) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            workspaces_dir: data_dir.join("txn"),
            branch: branch.to_string(),
            remote: remote.to_string(),
        }
    }

    pub fn workspaces_dir(&self) -> &Path {
        &self.workspaces_dir
    }

    fn txn_branch(txn_id: &str) -> String {
        format!("wu/txn/{txn_id}")
    }

    async fn blocking<T, F>(action: &'static str, f: F) -> Result<T, TxnError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| TxnError::vcs(action, format!("task panicked: {e}")))?
            .map_err(|e| TxnError::Vcs {
                action,
                message: format!("{e:#}"),
            })
    }
}

#[async_trait]
impl VcsPort for GitVcs {
    async fn tip(&self) -> Result<String, TxnError> {
        let root = self.repo_root.clone();
        let branch = self.branch.clone();
        Self::blocking("tip", move || tip_blocking(&root, &branch)).await
    }

    async fn fork(&self, txn_id: &str) -> Result<PathBuf, TxnError> {
        let root = self.repo_root.clone();
        let branch = self.branch.clone();
        let ws_path = self.workspaces_dir.join(txn_id);
        let txn_branch = Self::txn_branch(txn_id);
        Self::blocking("fork", move || {
            fork_blocking(&root, &branch, &txn_branch, &ws_path)
        })
        .await
    }

    async fn sync(&self, workspace: &Path) -> Result<(), TxnError> {
        let root = self.repo_root.clone();
        let branch = self.branch.clone();
        let remote = self.remote.clone();
        let ws = workspace.to_path_buf();
        Self::blocking("sync", move || sync_blocking(&root, &ws, &branch, &remote)).await
    }

    async fn stage(&self, workspace: &Path, files: &[PathBuf]) -> Result<(), TxnError> {
        let ws = workspace.to_path_buf();
        let files = files.to_vec();
        Self::blocking("stage", move || stage_blocking(&ws, &files)).await
    }

    async fn commit(&self, workspace: &Path, message: &str) -> Result<String, TxnError> {
        let root = self.repo_root.clone();
        let branch = self.branch.clone();
        let ws = workspace.to_path_buf();
        let message = message.to_string();
        Self::blocking("commit", move || {
            commit_blocking(&root, &ws, &branch, &message)
        })
        .await
    }

    async fn publish(&self) -> Result<(), TxnError> {
        let root = self.repo_root.clone();
        let branch = self.branch.clone();
        let remote = self.remote.clone();
        Self::blocking("publish", move || publish_blocking(&root, &branch, &remote)).await
    }

    async fn rollback(&self, revision: &str) -> Result<(), TxnError> {
        let root = self.repo_root.clone();
        let branch = self.branch.clone();
        let revision = revision.to_string();
        Self::blocking("rollback", move || {
            rollback_blocking(&root, &branch, &revision)
        })
        .await
    }

    async fn discard(&self, workspace: &Path) -> Result<(), TxnError> {
        let root = self.repo_root.clone();
        let ws = workspace.to_path_buf();
        Self::blocking("discard", move || discard_blocking(&root, &ws)).await
    }
}

// ── Blocking git2 helpers ────────────────────────────────────────────────────

fn branch_ref(branch: &str) -> String {
    format!("refs/heads/{branch}")
}

fn tip_blocking(repo_root: &Path, branch: &str) -> Result<String> {
    let repo = git2::Repository::open(repo_root).context("failed to open repository")?;
    let commit = repo
        .find_reference(&branch_ref(branch))
        .with_context(|| format!("branch {branch} not found"))?
        .peel_to_commit()
        .context("branch does not point to a commit")?;
    Ok(commit.id().to_string())
}

fn fork_blocking(
    repo_root: &Path,
    branch: &str,
    txn_branch: &str,
    ws_path: &Path,
) -> Result<PathBuf> {
    let repo = git2::Repository::open(repo_root).context("failed to open repository")?;
    let tip = repo
        .find_reference(&branch_ref(branch))
        .with_context(|| format!("branch {branch} not found"))?
        .peel_to_commit()
        .context("branch does not point to a commit")?;

    if let Some(parent) = ws_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create workspaces directory")?;
    }

    // Transaction ids are unique, so a leftover branch from a crashed run
    // with the same id can only be stale; overwrite it.
    let txn_ref = repo
        .branch(txn_branch, &tip, true)
        .with_context(|| format!("failed to create branch {txn_branch}"))?;

    // '/' is not allowed in worktree names; derive a flat name.
    let wt_name = txn_branch.replace('/', "--");
    let mut wt_opts = git2::WorktreeAddOptions::new();
    wt_opts.reference(Some(txn_ref.get()));
    repo.worktree(&wt_name, ws_path, Some(&wt_opts))
        .context("failed to add transaction worktree")?;

    Ok(ws_path.to_path_buf())
}

fn sync_blocking(repo_root: &Path, ws_path: &Path, branch: &str, remote_name: &str) -> Result<()> {
    let repo = git2::Repository::open(repo_root).context("failed to open repository")?;

    let mut remote = match repo.find_remote(remote_name) {
        Ok(r) => r,
        // No remote configured: local-only repository, nothing to fold in.
        Err(_) => return Ok(()),
    };
    let refspec = format!("+refs/heads/{branch}:refs/remotes/{remote_name}/{branch}");
    remote
        .fetch(&[refspec.as_str()], None, None)
        .with_context(|| format!("failed to fetch {branch} from {remote_name}"))?;

    let remote_tip = match repo.find_reference(&format!("refs/remotes/{remote_name}/{branch}")) {
        Ok(r) => r.peel_to_commit().context("remote branch is not a commit")?,
        Err(_) => return Ok(()),
    };

    // The workspace has no local commits before the callback runs, so
    // folding in newer history is a plain hard reset.
    let ws_repo = git2::Repository::open(ws_path).context("failed to open workspace")?;
    let target = ws_repo
        .find_commit(remote_tip.id())
        .context("fetched commit missing from workspace")?;
    ws_repo
        .reset(target.as_object(), git2::ResetType::Hard, None)
        .context("failed to reset workspace onto published history")?;

    debug!(branch, tip = %remote_tip.id(), "workspace synced onto remote history");
    Ok(())
}

fn stage_blocking(ws_path: &Path, files: &[PathBuf]) -> Result<()> {
    let repo = git2::Repository::open(ws_path).context("failed to open workspace")?;
    let mut index = repo.index().context("failed to open workspace index")?;

    for file in files {
        if ws_path.join(file).exists() {
            index
                .add_path(file)
                .with_context(|| format!("failed to stage {}", file.display()))?;
        } else {
            index
                .remove_path(file)
                .with_context(|| format!("failed to stage removal of {}", file.display()))?;
        }
    }

    index.write().context("failed to write workspace index")?;
    Ok(())
}

fn commit_blocking(repo_root: &Path, ws_path: &Path, branch: &str, message: &str) -> Result<String> {
    let ws_repo = git2::Repository::open(ws_path).context("failed to open workspace")?;

    let tree_oid = {
        let mut index = ws_repo.index().context("failed to open workspace index")?;
        index.write_tree().context("failed to write tree")?
    };
    let tree = ws_repo.find_tree(tree_oid).context("failed to find tree")?;

    let parent = ws_repo
        .head()
        .context("workspace has no HEAD")?
        .peel_to_commit()
        .context("workspace HEAD is not a commit")?;

    let sig = ws_repo
        .signature()
        .or_else(|_| git2::Signature::now("wud", "wud@localhost"))
        .context("failed to build signature")?;

    let commit_oid = ws_repo
        .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
        .context("failed to create commit")?;

    // Advance the shared branch: this is the single moment the transaction
    // becomes visible to other local readers.
    let repo = git2::Repository::open(repo_root).context("failed to open repository")?;
    repo.reference(
        &branch_ref(branch),
        commit_oid,
        true,
        &format!("wud: commit {message}"),
    )
    .with_context(|| format!("failed to advance branch {branch}"))?;

    Ok(commit_oid.to_string())
}

fn publish_blocking(repo_root: &Path, branch: &str, remote_name: &str) -> Result<()> {
    let repo = git2::Repository::open(repo_root).context("failed to open repository")?;

    match repo.find_remote(remote_name) {
        Ok(mut remote) => {
            let refspec = format!("{r}:{r}", r = branch_ref(branch));
            remote
                .push(&[refspec.as_str()], None)
                .with_context(|| format!("push of {branch} to {remote_name} rejected"))?;
        }
        Err(_) => {
            // Local-only repository: the branch ref is already the published
            // state.
            debug!(branch, "no remote configured; publish is local");
        }
    }

    refresh_wu_checkout(&repo, branch).context("failed to refresh .wu checkout")?;
    Ok(())
}

/// Bring the main checkout's `.wu/` directory up to the published tip so
/// subsequent reads of the ledger and task documents see the new history.
/// User files outside `.wu/` are never touched.
fn refresh_wu_checkout(repo: &git2::Repository, branch: &str) -> Result<()> {
    if repo.is_bare() {
        return Ok(());
    }
    let head = match repo.head() {
        Ok(h) => h,
        Err(_) => return Ok(()),
    };
    if head.shorthand() != Some(branch) {
        return Ok(());
    }

    let commit = repo
        .find_reference(&branch_ref(branch))?
        .peel_to_commit()
        .context("branch does not point to a commit")?;
    let mut checkout = git2::build::CheckoutBuilder::new();
    checkout.force();
    checkout.path(WU_DIR);
    repo.checkout_tree(commit.as_object(), Some(&mut checkout))
        .context("checkout of published tree failed")?;
    Ok(())
}

fn rollback_blocking(repo_root: &Path, branch: &str, revision: &str) -> Result<()> {
    let repo = git2::Repository::open(repo_root).context("failed to open repository")?;
    let oid = git2::Oid::from_str(revision).context("invalid rollback revision")?;
    if repo.find_commit(oid).is_err() {
        bail!("rollback revision {revision} is not a commit");
    }
    repo.reference(
        &branch_ref(branch),
        oid,
        true,
        &format!("wud: rollback to {revision}"),
    )
    .with_context(|| format!("failed to roll back branch {branch}"))?;
    Ok(())
}

fn discard_blocking(repo_root: &Path, ws_path: &Path) -> Result<()> {
    let repo = git2::Repository::open(repo_root).context("failed to open repository")?;

    // Find the worktree by path and prune it; fall back to plain directory
    // removal for workspaces git no longer knows about.
    let names = repo.worktrees().context("failed to list worktrees")?;
    for name in names.iter().flatten() {
        if let Ok(wt) = repo.find_worktree(name) {
            if wt.path() == ws_path {
                let mut opts = git2::WorktreePruneOptions::new();
                opts.valid(true).working_tree(true);
                wt.prune(Some(&mut opts))
                    .context("failed to prune transaction worktree")?;
                break;
            }
        }
    }

    if ws_path.exists() {
        std::fs::remove_dir_all(ws_path).context("failed to remove workspace directory")?;
    }

    // The per-transaction branch is disposable too.
    if let Some(txn_id) = ws_path.file_name().and_then(|n| n.to_str()) {
        if let Ok(mut branch) =
            repo.find_branch(&GitVcs::txn_branch(txn_id), git2::BranchType::Local)
        {
            let _ = branch.delete();
        }
    }

    Ok(())
}
