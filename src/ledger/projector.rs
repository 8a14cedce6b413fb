use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::{WuEvent, WuEventKind};
use super::log::{EventLog, LedgerError};

/// The finite set of states a work unit can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WuStatus {
    Ready,
    InProgress,
    Blocked,
    Done,
}

impl std::fmt::Display for WuStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WuStatus::Ready => "ready",
            WuStatus::InProgress => "in-progress",
            WuStatus::Blocked => "blocked",
            WuStatus::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// Projected state of one work unit, derived solely from the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WuEntry {
    pub status: WuStatus,
    pub lane: String,
    pub title: String,
    pub last_note: Option<String>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    /// Taken from the `complete` event's own timestamp, never the wall clock
    /// at apply time, so replay stays deterministic.
    pub completed_at: Option<DateTime<Utc>>,
}

/// In-memory projection of the full event log.
///
/// Rebuildable from the log alone: folding the same event sequence from an
/// empty state always produces the same entries and indexes. The state is an
/// owned value passed around explicitly; there is no ambient singleton.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProjectedState {
    entries: HashMap<String, WuEntry>,
    by_status: HashMap<WuStatus, HashSet<String>>,
    by_lane: HashMap<String, HashSet<String>>,
    /// parent id -> ids delegated to it.
    children: HashMap<String, HashSet<String>>,
}

impl ProjectedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild projections from scratch by reading the entire log.
    ///
    /// Side-effect-free on the log and idempotent: calling it any number of
    /// times yields the same state.
    pub async fn load(log: &EventLog) -> Result<Self, LedgerError> {
        let mut state = Self::new();
        for event in log.read_all().await? {
            state.apply_event(&event);
        }
        Ok(state)
    }

    /// Fold one event into the projection.
    ///
    /// Index maintenance is transactional within one application: the id is
    /// removed from its old status/lane bucket before being inserted into the
    /// new one, so a work unit is never in zero or two buckets when this
    /// returns. Non-create events naming an unknown id are no-ops; a partial
    /// log must not crash the projector.
    pub fn apply_event(&mut self, event: &WuEvent) {
        let id = event.wu_id.as_str();
        match &event.kind {
            WuEventKind::Create { lane, title }
            | WuEventKind::Claim { lane, title, .. } => {
                self.upsert(id, lane, title);
            }
            WuEventKind::Block { .. } => self.set_status(id, WuStatus::Blocked),
            WuEventKind::Unblock => self.set_status(id, WuStatus::InProgress),
            WuEventKind::Release { .. } => self.set_status(id, WuStatus::Ready),
            WuEventKind::Complete => {
                if self.entries.contains_key(id) {
                    self.set_status(id, WuStatus::Done);
                    if let Some(entry) = self.entries.get_mut(id) {
                        entry.completed_at = Some(event.timestamp);
                    }
                }
            }
            WuEventKind::Checkpoint { note } => {
                if let Some(entry) = self.entries.get_mut(id) {
                    entry.last_note = Some(note.clone());
                    entry.last_checkpoint_at = Some(event.timestamp);
                }
            }
            WuEventKind::Delegate { parent_wu_id } => {
                if self.entries.contains_key(id) {
                    self.children
                        .entry(parent_wu_id.clone())
                        .or_default()
                        .insert(id.to_string());
                }
            }
        }
    }

    pub fn entry(&self, id: &str) -> Option<&WuEntry> {
        self.entries.get(id)
    }

    pub fn status_of(&self, id: &str) -> Option<WuStatus> {
        self.entries.get(id).map(|e| e.status)
    }

    pub fn in_status(&self, status: WuStatus) -> impl Iterator<Item = &str> {
        self.by_status
            .get(&status)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn in_lane(&self, lane: &str) -> impl Iterator<Item = &str> {
        self.by_lane
            .get(lane)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn children_of(&self, parent_id: &str) -> impl Iterator<Item = &str> {
        self.children
            .get(parent_id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count of ids in each status bucket, summed. Equals `len()` whenever
    /// the exclusivity invariant holds.
    pub fn status_bucket_total(&self) -> usize {
        self.by_status.values().map(HashSet::len).sum()
    }

    /// `create`/`claim`: set in-progress and (re)record lane/title. Claims on
    /// unknown ids create the entry; the reconciler relies on this when it
    /// re-emits a lost claim.
    fn upsert(&mut self, id: &str, lane: &str, title: &str) {
        match self.entries.get_mut(id) {
            Some(entry) => {
                let old_status = entry.status;
                let old_lane = entry.lane.clone();
                entry.status = WuStatus::InProgress;
                entry.lane = lane.to_string();
                entry.title = title.to_string();
                self.move_status_bucket(id, Some(old_status), WuStatus::InProgress);
                if old_lane != lane {
                    self.move_lane_bucket(id, Some(old_lane.as_str()), lane);
                }
            }
            None => {
                self.entries.insert(
                    id.to_string(),
                    WuEntry {
                        status: WuStatus::InProgress,
                        lane: lane.to_string(),
                        title: title.to_string(),
                        last_note: None,
                        last_checkpoint_at: None,
                        completed_at: None,
                    },
                );
                self.move_status_bucket(id, None, WuStatus::InProgress);
                self.move_lane_bucket(id, None, lane);
            }
        }
    }

    fn set_status(&mut self, id: &str, to: WuStatus) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        let from = entry.status;
        entry.status = to;
        if from != to {
            self.move_status_bucket(id, Some(from), to);
        }
    }

    fn move_status_bucket(&mut self, id: &str, from: Option<WuStatus>, to: WuStatus) {
        if let Some(from) = from {
            if let Some(set) = self.by_status.get_mut(&from) {
                set.remove(id);
                if set.is_empty() {
                    self.by_status.remove(&from);
                }
            }
        }
        self.by_status.entry(to).or_default().insert(id.to_string());
    }

    fn move_lane_bucket(&mut self, id: &str, from: Option<&str>, to: &str) {
        if let Some(from) = from {
            if let Some(set) = self.by_lane.get_mut(from) {
                set.remove(id);
                if set.is_empty() {
                    self.by_lane.remove(from);
                }
            }
        }
        self.by_lane
            .entry(to.to_string())
            .or_default()
            .insert(id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn claim(id: &str, lane: &str) -> WuEvent {
        WuEvent::new(
            id,
            WuEventKind::Claim {
                lane: lane.to_string(),
                title: format!("Task {id}"),
                reason: None,
            },
        )
    }

    #[test]
    fn claim_sets_in_progress_and_indexes() {
        let mut state = ProjectedState::new();
        state.apply_event(&claim("wu-1", "core"));

        assert_eq!(state.status_of("wu-1"), Some(WuStatus::InProgress));
        assert_eq!(
            state.in_status(WuStatus::InProgress).collect::<Vec<_>>(),
            vec!["wu-1"]
        );
        assert_eq!(state.in_lane("core").collect::<Vec<_>>(), vec!["wu-1"]);
    }

    #[test]
    fn transitions_move_between_status_buckets() {
        let mut state = ProjectedState::new();
        state.apply_event(&claim("wu-1", "core"));
        state.apply_event(&WuEvent::new("wu-1", WuEventKind::Block { note: None }));

        assert_eq!(state.status_of("wu-1"), Some(WuStatus::Blocked));
        assert_eq!(state.in_status(WuStatus::InProgress).count(), 0);
        assert_eq!(state.in_status(WuStatus::Blocked).count(), 1);
        // Exactly one bucket holds the id.
        assert_eq!(state.status_bucket_total(), state.len());
    }

    #[test]
    fn complete_records_the_event_timestamp() {
        let mut state = ProjectedState::new();
        state.apply_event(&claim("wu-1", "core"));

        let done_at = Utc::now();
        state.apply_event(&WuEvent::at("wu-1", done_at, WuEventKind::Complete));

        let entry = state.entry("wu-1").unwrap();
        assert_eq!(entry.status, WuStatus::Done);
        assert_eq!(entry.completed_at, Some(done_at));
    }

    #[test]
    fn checkpoint_updates_note_without_touching_status() {
        let mut state = ProjectedState::new();
        state.apply_event(&claim("wu-1", "core"));
        state.apply_event(&WuEvent::new(
            "wu-1",
            WuEventKind::Checkpoint {
                note: "halfway".to_string(),
            },
        ));

        let entry = state.entry("wu-1").unwrap();
        assert_eq!(entry.status, WuStatus::InProgress);
        assert_eq!(entry.last_note.as_deref(), Some("halfway"));
        assert!(entry.last_checkpoint_at.is_some());
    }

    #[test]
    fn delegate_registers_parent_child_relation_only() {
        let mut state = ProjectedState::new();
        state.apply_event(&claim("wu-parent", "core"));
        state.apply_event(&claim("wu-child", "core"));
        state.apply_event(&WuEvent::new(
            "wu-child",
            WuEventKind::Delegate {
                parent_wu_id: "wu-parent".to_string(),
            },
        ));

        assert_eq!(
            state.children_of("wu-parent").collect::<Vec<_>>(),
            vec!["wu-child"]
        );
        assert_eq!(state.status_of("wu-child"), Some(WuStatus::InProgress));
    }

    #[test]
    fn events_for_unknown_ids_are_no_ops() {
        let mut state = ProjectedState::new();
        state.apply_event(&WuEvent::new("ghost", WuEventKind::Complete));
        state.apply_event(&WuEvent::new("ghost", WuEventKind::Block { note: None }));
        state.apply_event(&WuEvent::new(
            "ghost",
            WuEventKind::Checkpoint {
                note: "x".to_string(),
            },
        ));
        assert!(state.is_empty());
        assert_eq!(state.status_bucket_total(), 0);
    }

    #[test]
    fn release_returns_unit_to_ready() {
        let mut state = ProjectedState::new();
        state.apply_event(&claim("wu-1", "core"));
        state.apply_event(&WuEvent::new("wu-1", WuEventKind::Release { reason: None }));

        assert_eq!(state.status_of("wu-1"), Some(WuStatus::Ready));
        assert_eq!(state.in_status(WuStatus::Ready).count(), 1);
    }

    #[test]
    fn reclaim_moves_lane_bucket_when_lane_changes() {
        let mut state = ProjectedState::new();
        state.apply_event(&claim("wu-1", "core"));
        state.apply_event(&claim("wu-1", "infra"));

        assert_eq!(state.in_lane("core").count(), 0);
        assert_eq!(state.in_lane("infra").count(), 1);
        assert_eq!(state.entry("wu-1").unwrap().lane, "infra");
    }
}
