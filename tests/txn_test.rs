//! Integration tests for the git-backed transaction executor.

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use wud::txn::{cleanup, GitVcs, TxnError, TxnExecutor, TxnMode, TxnOutcome, VcsPort};

/// Create a repository with one commit on `main` and a checked-out worktree.
fn init_test_repo(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let repo = git2::Repository::init(dir)?;
    repo.set_head("refs/heads/main")?;

    let sig = git2::Signature::now("Test", "test@example.com")?;
    let tree_id = {
        let blob = repo.blob(b"initial")?;
        let mut tb = repo.treebuilder(None)?;
        tb.insert("README", blob, 0o100644)?;
        tb.write()?
    };
    let tree = repo.find_tree(tree_id)?;
    repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])?;
    repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;

    Ok(())
}

/// Add a bare `origin` remote seeded with the repo's current `main`.
fn add_bare_remote(repo_dir: &Path, remote_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    git2::Repository::init_bare(remote_dir)?;
    let repo = git2::Repository::open(repo_dir)?;
    repo.remote("origin", remote_dir.to_str().unwrap())?;
    let mut remote = repo.find_remote("origin")?;
    remote.push(&["refs/heads/main:refs/heads/main"], None)?;
    Ok(())
}

fn branch_tip(repo_dir: &Path) -> String {
    let repo = git2::Repository::open(repo_dir).unwrap();
    let id = repo
        .find_reference("refs/heads/main")
        .unwrap()
        .peel_to_commit()
        .unwrap()
        .id()
        .to_string();
    id
}

/// Advance the remote's `main` by one commit, making the next push non-ff.
fn advance_remote(remote_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let repo = git2::Repository::open(remote_dir)?;
    let head = repo
        .find_reference("refs/heads/main")?
        .peel_to_commit()?;
    let sig = git2::Signature::now("Other", "other@example.com")?;
    let tree = head.tree()?;
    repo.commit(
        Some("refs/heads/main"),
        &sig,
        &sig,
        "concurrent publish",
        &tree,
        &[&head],
    )?;
    Ok(())
}

fn vcs_for(tmp: &TempDir, repo_dir: &Path) -> GitVcs {
    GitVcs::new(repo_dir, &tmp.path().join("data"), "main", "origin")
}

#[tokio::test]
async fn transaction_publishes_declared_files_atomically() {
    let tmp = TempDir::new().unwrap();
    let repo_dir = tmp.path().join("repo");
    let remote_dir = tmp.path().join("remote.git");
    std::fs::create_dir_all(&repo_dir).unwrap();
    init_test_repo(&repo_dir).unwrap();
    add_bare_remote(&repo_dir, &remote_dir).unwrap();

    let base = branch_tip(&repo_dir);
    let exec = TxnExecutor::new(vcs_for(&tmp, &repo_dir));

    let receipt = exec
        .run("claim", "txn-happy", TxnMode::PushOnly, |workspace| async move {
            let wu = workspace.join(".wu");
            tokio::fs::create_dir_all(&wu).await?;
            tokio::fs::write(wu.join("events.jsonl"), "{}\n").await?;
            Ok(TxnOutcome {
                commit_message: "wu(wu-1): claim".to_string(),
                files: vec![".wu/events.jsonl".into()],
            })
        })
        .await
        .unwrap();

    assert_eq!(receipt.base, base);
    assert_ne!(receipt.commit, base);

    // Local branch, remote branch, and the refreshed checkout all agree.
    assert_eq!(branch_tip(&repo_dir), receipt.commit);
    assert_eq!(branch_tip(&remote_dir), receipt.commit);
    assert!(repo_dir.join(".wu").join("events.jsonl").exists());

    // The workspace is gone and the worktree is deregistered.
    assert!(!tmp.path().join("data").join("txn").join("txn-happy").exists());
    let repo = git2::Repository::open(&repo_dir).unwrap();
    assert!(repo.worktrees().unwrap().is_empty());
}

#[tokio::test]
async fn rejected_publish_rolls_the_branch_back() {
    let tmp = TempDir::new().unwrap();
    let repo_dir = tmp.path().join("repo");
    let remote_dir = tmp.path().join("remote.git");
    std::fs::create_dir_all(&repo_dir).unwrap();
    init_test_repo(&repo_dir).unwrap();
    add_bare_remote(&repo_dir, &remote_dir).unwrap();

    // Someone else publishes first; our push will be non-fast-forward.
    advance_remote(&remote_dir).unwrap();

    let base = branch_tip(&repo_dir);
    let exec = TxnExecutor::new(vcs_for(&tmp, &repo_dir));

    let err = exec
        .run("claim", "txn-reject", TxnMode::PushOnly, |workspace| async move {
            let wu = workspace.join(".wu");
            tokio::fs::create_dir_all(&wu).await?;
            tokio::fs::write(wu.join("events.jsonl"), "{}\n").await?;
            Ok(TxnOutcome {
                commit_message: "wu(wu-1): claim".to_string(),
                files: vec![".wu/events.jsonl".into()],
            })
        })
        .await
        .unwrap_err();

    match &err {
        TxnError::PublishRejected { base: b, .. } => assert_eq!(b, &base),
        other => panic!("expected PublishRejected, got {other:?}"),
    }

    // No committed-but-unpublished zombie: the tip is back at base and the
    // checkout never saw the staged file.
    assert_eq!(branch_tip(&repo_dir), base);
    assert!(!repo_dir.join(".wu").join("events.jsonl").exists());
    assert!(!tmp.path().join("data").join("txn").join("txn-reject").exists());
}

#[tokio::test]
async fn callback_failure_leaves_no_trace() {
    let tmp = TempDir::new().unwrap();
    let repo_dir = tmp.path().join("repo");
    std::fs::create_dir_all(&repo_dir).unwrap();
    init_test_repo(&repo_dir).unwrap();

    let base = branch_tip(&repo_dir);
    let exec = TxnExecutor::new(vcs_for(&tmp, &repo_dir));

    let err = exec
        .run("claim", "txn-cb", TxnMode::PushOnly, |_workspace| async move {
            anyhow::bail!("callback exploded")
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TxnError::Callback { .. }));
    assert_eq!(branch_tip(&repo_dir), base);
    assert!(!tmp.path().join("data").join("txn").join("txn-cb").exists());
}

#[tokio::test]
async fn stale_workspaces_are_swept() {
    let tmp = TempDir::new().unwrap();
    let repo_dir = tmp.path().join("repo");
    std::fs::create_dir_all(&repo_dir).unwrap();
    init_test_repo(&repo_dir).unwrap();

    let vcs = vcs_for(&tmp, &repo_dir);

    // Simulate a crash between fork and discard.
    let ws = vcs.fork("txn-abandoned").await.unwrap();
    assert!(ws.exists());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let removed = cleanup::sweep_stale_workspaces(&vcs, Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(removed, 1);
    assert!(!ws.exists());
    let repo = git2::Repository::open(&repo_dir).unwrap();
    assert!(repo.worktrees().unwrap().is_empty());
}

#[tokio::test]
async fn fresh_workspaces_survive_a_sweep() {
    let tmp = TempDir::new().unwrap();
    let repo_dir = tmp.path().join("repo");
    std::fs::create_dir_all(&repo_dir).unwrap();
    init_test_repo(&repo_dir).unwrap();

    let vcs = vcs_for(&tmp, &repo_dir);
    let ws = vcs.fork("txn-live").await.unwrap();

    let removed = cleanup::sweep_stale_workspaces(&vcs, Duration::from_secs(3600))
        .await
        .unwrap();

    assert_eq!(removed, 0);
    assert!(ws.exists());

    vcs.discard(&ws).await.unwrap();
}
