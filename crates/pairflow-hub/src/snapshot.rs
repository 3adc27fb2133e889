use pairflow_core::bubble::{
    bubbles_root, list_bubble_ids, read_bubble_state, BubblePaths, PAIRFLOW_DIR,
};
use pairflow_storage::{RegistryError, RuntimeSessionEntry, RuntimeSessionRegistry};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;

/// Lifecycle reported for a bubble whose state file cannot be read.
pub const UNKNOWN_LIFECYCLE: &str = "unknown";
const MISSING_SIGNATURE: &str = "missing";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to scan {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("scan task failed for {path}: {reason}")]
    Task { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BubbleSnapshot {
    pub bubble_id: String,
    pub repo_path: PathBuf,
    pub lifecycle: String,
    pub round: u32,
    pub active_agent: Option<String>,
    pub active_role: Option<String>,
    pub runtime_session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub fingerprint: String,
}

impl BubbleSnapshot {
    pub fn same_as(&self, other: &BubbleSnapshot) -> bool {
        self.fingerprint == other.fingerprint
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeSessionHealth {
    pub active: usize,
    pub stale: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSummary {
    pub repo_path: PathBuf,
    pub bubble_count: usize,
    pub state_counts: BTreeMap<String, usize>,
    pub runtime_sessions: RuntimeSessionHealth,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSnapshot {
    pub summary: RepoSummary,
    pub bubbles: BTreeMap<String, BubbleSnapshot>,
}

impl RepoSnapshot {
    /// Builds the summary from the bubble map. `stale_sessions` counts
    /// registry sessions of this repo whose bubble directory is gone.
    pub fn from_bubbles(
        repo_path: PathBuf,
        bubbles: BTreeMap<String, BubbleSnapshot>,
        stale_sessions: usize,
    ) -> Self {
        let mut state_counts = BTreeMap::new();
        for bubble in bubbles.values() {
            *state_counts.entry(bubble.lifecycle.clone()).or_insert(0) += 1;
        }
        let active = bubbles
            .values()
            .filter(|bubble| bubble.runtime_session.is_some())
            .count();
        Self {
            summary: RepoSummary {
                repo_path,
                bubble_count: bubbles.len(),
                state_counts,
                runtime_sessions: RuntimeSessionHealth {
                    active,
                    stale: stale_sessions,
                },
            },
            bubbles,
        }
    }
}

/// Produces repo snapshots for the broker. Called on the blocking pool.
pub trait SnapshotSource: Send + Sync + 'static {
    fn scan_repo(&self, repo: &Path) -> Result<RepoSnapshot, ScanError>;

    /// Paths whose changes should trigger an early rescan of `repo`.
    fn watch_targets(&self, repo: &Path) -> Vec<PathBuf>;
}

/// Reads bubble directories and the runtime-session registry from disk.
#[derive(Debug, Clone, Default)]
pub struct FsSnapshotSource {
    sessions: Option<RuntimeSessionRegistry>,
}

impl FsSnapshotSource {
    pub fn new(sessions: Option<RuntimeSessionRegistry>) -> Self {
        Self { sessions }
    }

    fn sessions_for(&self, repo: &Path) -> Result<BTreeMap<String, RuntimeSessionEntry>, ScanError> {
        let Some(registry) = &self.sessions else {
            return Ok(BTreeMap::new());
        };
        Ok(registry
            .list_for_repo(repo)?
            .into_iter()
            .map(|entry| (entry.bubble_id.clone(), entry))
            .collect())
    }
}

impl SnapshotSource for FsSnapshotSource {
    fn scan_repo(&self, repo: &Path) -> Result<RepoSnapshot, ScanError> {
        if !repo.is_dir() {
            return Err(ScanError::Io {
                path: repo.to_path_buf(),
                source: io::Error::new(io::ErrorKind::NotFound, "repository directory missing"),
            });
        }
        let ids = list_bubble_ids(repo).map_err(|source| ScanError::Io {
            path: bubbles_root(repo),
            source,
        })?;
        let sessions = self.sessions_for(repo)?;

        let mut bubbles = BTreeMap::new();
        for id in &ids {
            let session = sessions.get(id);
            bubbles.insert(id.clone(), scan_bubble(repo, id, session));
        }
        let known: BTreeSet<&String> = ids.iter().collect();
        let stale = sessions.keys().filter(|id| !known.contains(id)).count();
        Ok(RepoSnapshot::from_bubbles(repo.to_path_buf(), bubbles, stale))
    }

    fn watch_targets(&self, repo: &Path) -> Vec<PathBuf> {
        let root = bubbles_root(repo);
        if !root.is_dir() {
            let state_dir = repo.join(PAIRFLOW_DIR);
            return vec![if state_dir.is_dir() { state_dir } else { repo.to_path_buf() }];
        }
        let mut targets = vec![root.clone()];
        if let Ok(ids) = list_bubble_ids(repo) {
            targets.extend(ids.into_iter().map(|id| root.join(id)));
        }
        targets
    }
}

pub fn scan_bubble(
    repo: &Path,
    bubble_id: &str,
    session: Option<&RuntimeSessionEntry>,
) -> BubbleSnapshot {
    let paths = BubblePaths::new(repo, bubble_id);
    let (lifecycle, round, active_agent, active_role, error) = match read_bubble_state(&paths.state)
    {
        Ok(state) => (state.state, state.round, state.active_agent, state.active_role, None),
        Err(err) => (UNKNOWN_LIFECYCLE.to_string(), 0, None, None, Some(err.to_string())),
    };
    let fingerprint = fingerprint(
        &paths,
        session.map(|entry| entry.updated_at.as_str()),
        &lifecycle,
        round,
    );
    BubbleSnapshot {
        bubble_id: bubble_id.to_string(),
        repo_path: repo.to_path_buf(),
        lifecycle,
        round,
        active_agent,
        active_role,
        runtime_session: session.map(|entry| entry.tmux_session_name.clone()),
        error,
        fingerprint,
    }
}

/// `size:mtime_ns` of a file, or `missing`.
pub fn file_signature(path: &Path) -> String {
    let Ok(metadata) = std::fs::metadata(path) else {
        return MISSING_SIGNATURE.to_string();
    };
    let mtime_ns = metadata
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!("{}:{}", metadata.len(), mtime_ns)
}

pub fn fingerprint(
    paths: &BubblePaths,
    session_updated_at: Option<&str>,
    lifecycle: &str,
    round: u32,
) -> String {
    let mut parts: Vec<String> = paths
        .tracked_files()
        .iter()
        .map(|path| file_signature(path))
        .collect();
    parts.push(session_updated_at.unwrap_or(MISSING_SIGNATURE).to_string());
    parts.push(lifecycle.to_string());
    parts.push(round.to_string());
    parts.join("|")
}
