use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const PAIRFLOW_DIR: &str = ".pairflow";
pub const BUBBLES_DIR: &str = "bubbles";
pub const STATE_FILE: &str = "state.json";
pub const INBOX_FILE: &str = "inbox.ndjson";
pub const TRANSCRIPT_FILE: &str = "transcript.ndjson";

pub fn bubbles_root(repo: &Path) -> PathBuf {
    repo.join(PAIRFLOW_DIR).join(BUBBLES_DIR)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BubblePaths {
    pub dir: PathBuf,
    pub state: PathBuf,
    pub inbox: PathBuf,
    pub transcript: PathBuf,
}

impl BubblePaths {
    pub fn new(repo: &Path, bubble_id: &str) -> Self {
        let dir = bubbles_root(repo).join(bubble_id);
        Self {
            state: dir.join(STATE_FILE),
            inbox: dir.join(INBOX_FILE),
            transcript: dir.join(TRANSCRIPT_FILE),
            dir,
        }
    }

    /// Files whose content can change underneath a running bubble.
    pub fn tracked_files(&self) -> [&Path; 3] {
        [&self.state, &self.inbox, &self.transcript]
    }
}

/// Bubble ids under `<repo>/.pairflow/bubbles`, sorted. A repo without the
/// directory simply has no bubbles.
pub fn list_bubble_ids(repo: &Path) -> io::Result<Vec<String>> {
    let root = bubbles_root(repo);
    let entries = match std::fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        ids.push(name);
    }
    ids.sort();
    Ok(ids)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BubbleStateFile {
    pub bubble_id: String,
    pub state: String,
    #[serde(default)]
    pub round: u32,
    #[serde(default)]
    pub active_agent: Option<String>,
    #[serde(default)]
    pub active_role: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Error)]
pub enum BubbleStateError {
    #[error("bubble state not found at {0}")]
    Missing(PathBuf),
    #[error("failed to read bubble state {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed bubble state {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

pub fn read_bubble_state(path: &Path) -> Result<BubbleStateFile, BubbleStateError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(BubbleStateError::Missing(path.to_path_buf()))
        }
        Err(source) => {
            return Err(BubbleStateError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let state: BubbleStateFile =
        serde_json::from_str(&content).map_err(|err| BubbleStateError::Malformed {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    if state.state.trim().is_empty() {
        return Err(BubbleStateError::Malformed {
            path: path.to_path_buf(),
            reason: "empty lifecycle state".to_string(),
        });
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_only_bubble_directories_in_order() {
        let repo = tempfile::tempdir().expect("tempdir");
        let root = bubbles_root(repo.path());
        std::fs::create_dir_all(root.join("b2")).expect("b2");
        std::fs::create_dir_all(root.join("b1")).expect("b1");
        std::fs::create_dir_all(root.join(".trash")).expect("hidden");
        std::fs::write(root.join("notes.txt"), "x").expect("file");

        let ids = list_bubble_ids(repo.path()).expect("list");
        assert_eq!(ids, vec!["b1".to_string(), "b2".to_string()]);
    }

    #[test]
    fn missing_bubbles_root_yields_no_bubbles() {
        let repo = tempfile::tempdir().expect("tempdir");
        assert!(list_bubble_ids(repo.path()).expect("list").is_empty());
    }

    #[test]
    fn reads_state_file_and_rejects_malformed_content() {
        let repo = tempfile::tempdir().expect("tempdir");
        let paths = BubblePaths::new(repo.path(), "b1");
        std::fs::create_dir_all(&paths.dir).expect("dir");

        assert!(matches!(
            read_bubble_state(&paths.state),
            Err(BubbleStateError::Missing(_))
        ));

        std::fs::write(
            &paths.state,
            r#"{"bubbleId":"b1","state":"RUNNING","round":3,"activeRole":"reviewer"}"#,
        )
        .expect("write state");
        let state = read_bubble_state(&paths.state).expect("read");
        assert_eq!(state.round, 3);
        assert_eq!(state.active_role.as_deref(), Some("reviewer"));
        assert_eq!(state.active_agent, None);

        std::fs::write(&paths.state, "{\"bubbleId\":").expect("write partial");
        assert!(matches!(
            read_bubble_state(&paths.state),
            Err(BubbleStateError::Malformed { .. })
        ));
    }
}
