//! The event ledger: an append-only JSONL log of work-unit lifecycle facts
//! and the in-memory projection derived from it.

pub mod events;
pub mod log;
pub mod projector;

pub use events::{WuEvent, WuEventKind};
pub use log::{EventLog, LedgerError};
pub use projector::{ProjectedState, WuEntry, WuStatus};
