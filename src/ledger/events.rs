use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All distinct event kinds the ledger can record.
///
/// The wire form is one JSON object per line, discriminated by `type`:
/// `{"wuId":"wu-42","type":"claim","timestamp":"...","lane":"core","title":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WuEventKind {
    Create {
        lane: String,
        title: String,
    },
    Claim {
        lane: String,
        title: String,
        /// Set on synthetic claims so their origin is auditable in the log.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Block {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    Unblock,
    Complete,
    Checkpoint {
        note: String,
    },
    Delegate {
        /// The work unit that delegated this one.
        parent_wu_id: String,
    },
    Release {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl WuEventKind {
    /// Lowercase verb used in commit messages and CLI output.
    pub fn verb(&self) -> &'static str {
        match self {
            WuEventKind::Create { .. } => "create",
            WuEventKind::Claim { .. } => "claim",
            WuEventKind::Block { .. } => "block",
            WuEventKind::Unblock => "unblock",
            WuEventKind::Complete => "complete",
            WuEventKind::Checkpoint { .. } => "checkpoint",
            WuEventKind::Delegate { .. } => "delegate",
            WuEventKind::Release { .. } => "release",
        }
    }
}

/// A single immutable event in the ledger.
///
/// Events are appended, never mutated or deleted. Their physical order in
/// the log is the system's total order: each publish to the shared remote
/// is one atomic append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WuEvent {
    pub wu_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: WuEventKind,
}

impl WuEvent {
    /// Create a new event stamped with the current time.
    pub fn new(wu_id: &str, kind: WuEventKind) -> Self {
        Self {
            wu_id: wu_id.to_string(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Create an event with an explicit timestamp (replay fixtures, tests).
    pub fn at(wu_id: &str, timestamp: DateTime<Utc>, kind: WuEventKind) -> Self {
        Self {
            wu_id: wu_id.to_string(),
            timestamp,
            kind,
        }
    }
}
