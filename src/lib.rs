pub mod board;
pub mod config;
pub mod ledger;
pub mod lock;
pub mod observability;
pub mod ops;
pub mod reconcile;
pub mod signal;
pub mod txn;

pub use config::WudConfig;
pub use ops::WuOps;

/// Name of the version-controlled coordination directory at the repo root.
///
/// Everything the agents share through git lives under it: the event ledger
/// (`events.jsonl`), task documents (`tasks/`), plus the uncommitted
/// coordination files (`locks/`, `signals/`).
pub const WU_DIR: &str = ".wu";
