use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use super::events::WuEvent;
use crate::WU_DIR;

/// Errors surfaced by the event log.
///
/// A malformed line is corruption, not a steady-state condition: replay must
/// not silently skip history, so `Malformed` is fatal to the read.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("malformed event record at {path}:{line}: {source}")]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("event log serialize: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("event log io: {0}")]
    Io(#[from] std::io::Error),
}

/// Append-only JSONL event log, one JSON object per line.
///
/// The log lives at `.wu/events.jsonl` under a repository root. It grows
/// monotonically; lines are never rewritten. Appends go through the isolated
/// transaction path, so an `EventLog` is pointed either at the shared
/// checkout (reads) or at a transaction workspace (writes).
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    /// Event log handle for the repository rooted at `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(WU_DIR).join("events.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Relative path of the log inside a repository, for staging.
    pub fn relative_path() -> PathBuf {
        PathBuf::from(WU_DIR).join("events.jsonl")
    }

    /// Read and parse the entire log, strictly.
    ///
    /// A missing file is an empty log. A line that does not parse is a fatal
    /// `Malformed` error naming the 1-based line number; unknown work-unit
    /// ids are tolerated downstream, corrupt records are not.
    pub async fn read_all(&self) -> Result<Vec<WuEvent>, LedgerError> {
        if !self.path.exists() {
            return Ok(vec![]);
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        let mut events = Vec::new();

        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event =
                serde_json::from_str::<WuEvent>(line).map_err(|e| LedgerError::Malformed {
                    path: self.path.clone(),
                    line: idx + 1,
                    source: e,
                })?;
            events.push(event);
        }

        Ok(events)
    }

    /// Append one event as a single line plus newline.
    pub async fn append(&self, event: &WuEvent) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_string(event).map_err(LedgerError::Serialize)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::events::WuEventKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path());
        assert!(log.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_then_read_preserves_order() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path());

        log.append(&WuEvent::new(
            "wu-1",
            WuEventKind::Create {
                lane: "core".into(),
                title: "First".into(),
            },
        ))
        .await
        .unwrap();
        log.append(&WuEvent::new("wu-1", WuEventKind::Complete))
            .await
            .unwrap();

        let events = log.read_all().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind.verb(), "create");
        assert_eq!(events[1].kind.verb(), "complete");
    }

    #[tokio::test]
    async fn malformed_line_is_a_fatal_parse_error() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path());
        log.append(&WuEvent::new("wu-1", WuEventKind::Unblock))
            .await
            .unwrap();

        tokio::fs::write(
            log.path(),
            "{\"wuId\":\"wu-1\",\"type\":\"unblock\",\"timestamp\":\"2026-01-01T00:00:00Z\"}\nnot json\n",
        )
        .await
        .unwrap();

        let err = log.read_all().await.unwrap_err();
        match err {
            LedgerError::Malformed { line, .. } => assert_eq!(line, 2),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }
}
