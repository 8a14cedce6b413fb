//! Declarative per-task documents.
//!
//! Each work unit has a YAML document at `.wu/tasks/<id>.yaml` recording what
//! its owners believe its state to be. The documents are externally owned:
//! the core reads `id`/`status`/`lane`/`title` and rewrites `status` during
//! transitions, but any other fields belong to their producers and are
//! carried through untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ledger::WuStatus;
use crate::WU_DIR;

/// The declarative view of one work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDoc {
    pub id: String,
    pub status: WuStatus,
    pub lane: String,
    pub title: String,
    /// Fields the core does not define. Preserved verbatim on rewrite.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl TaskDoc {
    pub fn new(id: &str, lane: &str, title: &str, status: WuStatus) -> Self {
        Self {
            id: id.to_string(),
            status,
            lane: lane.to_string(),
            title: title.to_string(),
            extra: BTreeMap::new(),
        }
    }
}

/// Read/write access to the task documents under one repository root.
pub struct Board {
    tasks_dir: PathBuf,
}

impl Board {
    pub fn new(root: &Path) -> Self {
        Self {
            tasks_dir: root.join(WU_DIR).join("tasks"),
        }
    }

    pub fn doc_path(&self, wu_id: &str) -> PathBuf {
        self.tasks_dir.join(format!("{wu_id}.yaml"))
    }

    /// Relative path of a document inside the repository, for staging.
    pub fn relative_doc_path(wu_id: &str) -> PathBuf {
        PathBuf::from(WU_DIR).join("tasks").join(format!("{wu_id}.yaml"))
    }

    /// Load one document, or `None` if it does not exist.
    pub async fn load(&self, wu_id: &str) -> Result<Option<TaskDoc>> {
        let path = self.doc_path(wu_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read task document {}", path.display()))?;
        let doc: TaskDoc = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse task document {}", path.display()))?;
        Ok(Some(doc))
    }

    /// Load every `*.yaml` document in the tasks directory.
    pub async fn load_all(&self) -> Result<Vec<TaskDoc>> {
        if !self.tasks_dir.exists() {
            return Ok(vec![]);
        }

        let mut docs = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.tasks_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read task document {}", path.display()))?;
            let doc: TaskDoc = serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse task document {}", path.display()))?;
            docs.push(doc);
        }

        // Directory iteration order is platform-dependent; keep output stable.
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    /// Write a document, creating the tasks directory if needed.
    pub async fn save(&self, doc: &TaskDoc) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.tasks_dir)
            .await
            .context("failed to create tasks directory")?;
        let path = self.doc_path(&doc.id);
        let yaml = serde_yaml::to_string(doc).context("failed to serialize task document")?;
        tokio::fs::write(&path, yaml)
            .await
            .with_context(|| format!("failed to write task document {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let board = Board::new(dir.path());

        let doc = TaskDoc::new("wu-1", "core", "Wire the parser", WuStatus::Ready);
        board.save(&doc).await.unwrap();

        let loaded = board.load("wu-1").await.unwrap().unwrap();
        assert_eq!(loaded, doc);
    }

    #[tokio::test]
    async fn load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let board = Board::new(dir.path());
        assert!(board.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_fields_survive_a_rewrite() {
        let dir = TempDir::new().unwrap();
        let board = Board::new(dir.path());

        let mut doc = TaskDoc::new("wu-2", "infra", "Rotate keys", WuStatus::Ready);
        doc.extra.insert(
            "owner".to_string(),
            serde_yaml::Value::String("alice".to_string()),
        );
        board.save(&doc).await.unwrap();

        let mut loaded = board.load("wu-2").await.unwrap().unwrap();
        loaded.status = WuStatus::InProgress;
        board.save(&loaded).await.unwrap();

        let again = board.load("wu-2").await.unwrap().unwrap();
        assert_eq!(
            again.extra.get("owner"),
            Some(&serde_yaml::Value::String("alice".to_string()))
        );
        assert_eq!(again.status, WuStatus::InProgress);
    }

    #[tokio::test]
    async fn load_all_is_sorted_by_id() {
        let dir = TempDir::new().unwrap();
        let board = Board::new(dir.path());
        for id in ["wu-b", "wu-a", "wu-c"] {
            board
                .save(&TaskDoc::new(id, "core", "t", WuStatus::Ready))
                .await
                .unwrap();
        }
        let all = board.load_all().await.unwrap();
        let ids: Vec<&str> = all.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["wu-a", "wu-b", "wu-c"]);
    }
}
