//! Isolated transactions ("micro-worktrees").
//!
//! Every write to the shared repository is staged in an ephemeral worktree
//! forked from the published tip, committed as one unit, and pushed. A
//! rejected push rolls the branch back; the workspace is discarded in every
//! outcome.

pub mod cleanup;
pub mod executor;
pub mod git;

pub use executor::{TxnExecutor, TxnMode, TxnOutcome, TxnReceipt, VcsPort};
pub use git::GitVcs;

/// Generate a fresh transaction id (UUID v4).
pub fn new_txn_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum TxnError {
    #[error("transaction callback for '{op}' failed: {source}")]
    Callback {
        op: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("publish of '{op}' rejected ({message}); branch rolled back to {base}")]
    PublishRejected {
        op: String,
        base: String,
        message: String,
    },
    #[error("vcs {action} failed: {message}")]
    Vcs {
        action: &'static str,
        message: String,
    },
}

impl TxnError {
    pub(crate) fn vcs(action: &'static str, err: impl std::fmt::Display) -> Self {
        TxnError::Vcs {
            action,
            message: err.to_string(),
        }
    }
}
