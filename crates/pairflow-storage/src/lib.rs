mod lock;
mod paths;
mod registry;
mod repos;
mod sessions;

pub use lock::{with_file_lock, FileLock, LOCK_POLL_INTERVAL};
pub use paths::{
    default_repo_registry_path, default_runtime_sessions_path, lock_path_for,
    resolve_registry_path, REPO_REGISTRY_ENV, RUNTIME_SESSIONS_ENV,
};
pub use registry::{
    write_atomic, write_atomic_with, LockedRegistry, ReadOptions, RegistryDocument,
    DEFAULT_LOCK_TIMEOUT,
};
pub use repos::{
    dedupe_repository_entries, normalize_repo_path, ListOptions, RefreshOutcome,
    RegisterOutcome, RemoveOutcome, RepositoryEntry, RepositoryListing, RepositoryRegistry,
    RepositoryRegistryDocument, REPO_REGISTRY_VERSION,
};
pub use sessions::{
    RuntimeSessionEntry, RuntimeSessionRegistry, RuntimeSessionRegistryDocument,
    RUNTIME_SESSIONS_VERSION,
};

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited_ms}ms waiting for lock {path}")]
    Timeout { path: PathBuf, waited_ms: u64 },
    #[error("lock io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("could not acquire registry lock {path} within {waited_ms}ms")]
    LockTimeout { path: PathBuf, waited_ms: u64 },
    #[error("invalid registry {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
    #[error("registry encode failed for {path}: {reason}")]
    Encode { path: PathBuf, reason: String },
    #[error("registry io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RegistryError {
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, RegistryError::LockTimeout { .. })
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, RegistryError::Invalid { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        RegistryError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<LockError> for RegistryError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { path, waited_ms } => RegistryError::LockTimeout { path, waited_ms },
            LockError::Io { path, source } => RegistryError::Io { path, source },
        }
    }
}
