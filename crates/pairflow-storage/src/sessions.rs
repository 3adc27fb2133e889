use crate::registry::{LockedRegistry, ReadOptions, RegistryDocument};
use crate::repos::normalize_repo_path;
use crate::RegistryError;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const RUNTIME_SESSIONS_VERSION: u32 = 1;

/// Live tmux session backing one bubble. Entries are replaced whole, never
/// patched field by field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSessionEntry {
    pub bubble_id: String,
    pub repo_path: PathBuf,
    pub worktree_path: PathBuf,
    pub tmux_session_name: String,
    pub updated_at: String,
}

impl RuntimeSessionEntry {
    pub fn new(
        bubble_id: impl Into<String>,
        repo_path: impl Into<PathBuf>,
        worktree_path: impl Into<PathBuf>,
        tmux_session_name: impl Into<String>,
    ) -> Self {
        Self {
            bubble_id: bubble_id.into(),
            repo_path: repo_path.into(),
            worktree_path: worktree_path.into(),
            tmux_session_name: tmux_session_name.into(),
            updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeSessionRegistryDocument {
    pub version: u32,
    pub sessions: BTreeMap<String, RuntimeSessionEntry>,
}

impl Default for RuntimeSessionRegistryDocument {
    fn default() -> Self {
        Self {
            version: RUNTIME_SESSIONS_VERSION,
            sessions: BTreeMap::new(),
        }
    }
}

impl RegistryDocument for RuntimeSessionRegistryDocument {
    const SCHEMA_VERSION: u32 = RUNTIME_SESSIONS_VERSION;

    fn version(&self) -> u32 {
        self.version
    }

    fn validate(&self) -> Result<(), String> {
        for (key, entry) in &self.sessions {
            if key != &entry.bubble_id {
                return Err(format!(
                    "session key '{}' does not match bubbleId '{}'",
                    key, entry.bubble_id
                ));
            }
            if entry.bubble_id.trim().is_empty() {
                return Err("session entry has empty bubbleId".to_string());
            }
            if entry.tmux_session_name.trim().is_empty() {
                return Err(format!("session '{key}' has empty tmuxSessionName"));
            }
            if entry.repo_path.as_os_str().is_empty() || entry.worktree_path.as_os_str().is_empty()
            {
                return Err(format!("session '{key}' has empty repoPath or worktreePath"));
            }
            if chrono::DateTime::parse_from_rfc3339(&entry.updated_at).is_err() {
                return Err(format!(
                    "session '{key}' has invalid updatedAt '{}'",
                    entry.updated_at
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSessionRegistry {
    inner: LockedRegistry<RuntimeSessionRegistryDocument>,
}

impl RuntimeSessionRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: LockedRegistry::new(path),
        }
    }

    pub fn with_lock_timeout(self, timeout: Duration) -> Self {
        Self {
            inner: self.inner.with_lock_timeout(timeout),
        }
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Inserts or fully replaces the entry for `entry.bubble_id`, returning
    /// the replaced entry.
    pub fn upsert(
        &self,
        entry: RuntimeSessionEntry,
    ) -> Result<Option<RuntimeSessionEntry>, RegistryError> {
        self.inner
            .mutate(|doc| Ok(doc.sessions.insert(entry.bubble_id.clone(), entry)))
    }

    pub fn remove(&self, bubble_id: &str) -> Result<bool, RegistryError> {
        self.inner
            .mutate(|doc| Ok(doc.sessions.remove(bubble_id).is_some()))
    }

    pub fn get(&self, bubble_id: &str) -> Result<Option<RuntimeSessionEntry>, RegistryError> {
        let doc = self.inner.read(ReadOptions::allow_missing())?;
        Ok(doc.sessions.get(bubble_id).cloned())
    }

    pub fn list(&self) -> Result<Vec<RuntimeSessionEntry>, RegistryError> {
        let doc = self.inner.read(ReadOptions::allow_missing())?;
        Ok(doc.sessions.into_values().collect())
    }

    pub fn list_for_repo(&self, repo: &Path) -> Result<Vec<RuntimeSessionEntry>, RegistryError> {
        let target = normalize_repo_path(repo).unwrap_or_else(|_| repo.to_path_buf());
        Ok(self
            .list()?
            .into_iter()
            .filter(|entry| {
                normalize_repo_path(&entry.repo_path)
                    .map(|path| path == target)
                    .unwrap_or(entry.repo_path == target)
            })
            .collect())
    }

    /// Drops every entry `keep` rejects and returns the dropped entries.
    pub fn prune<F>(&self, mut keep: F) -> Result<Vec<RuntimeSessionEntry>, RegistryError>
    where
        F: FnMut(&RuntimeSessionEntry) -> bool,
    {
        self.inner.mutate(|doc| {
            let mut dropped = Vec::new();
            doc.sessions.retain(|_, entry| {
                if keep(entry) {
                    true
                } else {
                    dropped.push(entry.clone());
                    false
                }
            });
            Ok(dropped)
        })
    }
}
