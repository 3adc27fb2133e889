use crate::registry::{LockedRegistry, ReadOptions, RegistryDocument};
use crate::RegistryError;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const REPO_REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryEntry {
    pub path: PathBuf,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryRegistryDocument {
    pub version: u32,
    pub repositories: Vec<RepositoryEntry>,
}

impl Default for RepositoryRegistryDocument {
    fn default() -> Self {
        Self {
            version: REPO_REGISTRY_VERSION,
            repositories: Vec::new(),
        }
    }
}

impl RegistryDocument for RepositoryRegistryDocument {
    const SCHEMA_VERSION: u32 = REPO_REGISTRY_VERSION;

    fn version(&self) -> u32 {
        self.version
    }

    fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::BTreeSet::new();
        for entry in &self.repositories {
            if entry.path.as_os_str().is_empty() {
                return Err("repository entry has empty path".to_string());
            }
            if !entry.path.is_absolute() {
                return Err(format!(
                    "repository path is not absolute: {}",
                    entry.path.display()
                ));
            }
            if chrono::DateTime::parse_from_rfc3339(&entry.created_at).is_err() {
                return Err(format!(
                    "repository {} has invalid createdAt '{}'",
                    entry.path.display(),
                    entry.created_at
                ));
            }
            if !seen.insert(entry.path.clone()) {
                return Err(format!(
                    "duplicate repository entry {}",
                    entry.path.display()
                ));
            }
        }
        Ok(())
    }

    fn normalize(&mut self) {
        self.repositories.sort_by(|a, b| a.path.cmp(&b.path));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub added: bool,
    pub entry: RepositoryEntry,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub removed: bool,
    pub entry: Option<RepositoryEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub normalize: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryListing {
    pub entries: Vec<RepositoryEntry>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub entries: Vec<RepositoryEntry>,
    pub changed: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RepositoryRegistry {
    inner: LockedRegistry<RepositoryRegistryDocument>,
}

impl RepositoryRegistry {
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

    pub fn register(
        &self,
        path: &Path,
        label: Option<&str>,
    ) -> Result<RegisterOutcome, RegistryError> {
        let normalized = normalize_repo_path(path).map_err(|err| RegistryError::io(path, err))?;
        let label = label
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        self.inner.mutate(|doc| {
            let (entries, warnings) = dedupe_repository_entries(std::mem::take(&mut doc.repositories));
            doc.repositories = entries;

            if let Some(existing) = doc
                .repositories
                .iter()
                .find(|entry| entry.path == normalized)
            {
                return Ok(RegisterOutcome {
                    added: false,
                    entry: existing.clone(),
                    warnings,
                });
            }

            let entry = RepositoryEntry {
                path: normalized.clone(),
                created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                label,
            };
            doc.repositories.push(entry.clone());
            Ok(RegisterOutcome {
                added: true,
                entry,
                warnings,
            })
        })
    }

    /// Removes every entry that normalizes to `path`.
    pub fn remove(&self, path: &Path) -> Result<RemoveOutcome, RegistryError> {
        let normalized = normalize_repo_path(path).map_err(|err| RegistryError::io(path, err))?;
        self.inner.mutate(|doc| {
            let mut removed = None;
            doc.repositories.retain(|entry| {
                if normalize_or_keep(&entry.path) == normalized {
                    if removed.is_none() {
                        removed = Some(entry.clone());
                    }
                    false
                } else {
                    true
                }
            });
            Ok(RemoveOutcome {
                removed: removed.is_some(),
                entry: removed,
            })
        })
    }

    pub fn list(&self, options: ListOptions) -> Result<RepositoryListing, RegistryError> {
        let doc = self.inner.read(ReadOptions::allow_missing())?;
        if !options.normalize {
            return Ok(RepositoryListing {
                entries: doc.repositories,
                warnings: Vec::new(),
            });
        }
        let (entries, warnings) = dedupe_repository_entries(doc.repositories);
        Ok(RepositoryListing { entries, warnings })
    }

    pub fn find(&self, path: &Path) -> Result<Option<RepositoryEntry>, RegistryError> {
        let normalized = normalize_repo_path(path).map_err(|err| RegistryError::io(path, err))?;
        let listing = self.list(ListOptions { normalize: true })?;
        Ok(listing
            .entries
            .into_iter()
            .find(|entry| entry.path == normalized))
    }

    /// Rewrites the registry with normalized, deduplicated paths.
    pub fn refresh(&self) -> Result<RefreshOutcome, RegistryError> {
        self.inner.mutate(|doc| {
            let mut before = doc.repositories.clone();
            before.sort_by(|a, b| a.path.cmp(&b.path));
            let (entries, warnings) = dedupe_repository_entries(std::mem::take(&mut doc.repositories));
            doc.repositories = entries.clone();
            Ok(RefreshOutcome {
                changed: before != entries,
                entries,
                warnings,
            })
        })
    }
}

/// Normalizes every entry path and collapses aliases. The first entry seen
/// for a path wins; it adopts a later alias's label only when it has none.
/// Conflicting labels keep the winner's and produce a warning.
pub fn dedupe_repository_entries(
    entries: Vec<RepositoryEntry>,
) -> (Vec<RepositoryEntry>, Vec<String>) {
    let mut by_path: BTreeMap<PathBuf, RepositoryEntry> = BTreeMap::new();
    let mut warnings = Vec::new();

    for mut entry in entries {
        entry.path = normalize_or_keep(&entry.path);
        match by_path.get_mut(&entry.path) {
            None => {
                by_path.insert(entry.path.clone(), entry);
            }
            Some(existing) => match (&existing.label, &entry.label) {
                (None, Some(label)) => existing.label = Some(label.clone()),
                (Some(kept), Some(dropped)) if kept != dropped => {
                    let message = format!(
                        "repository {} registered with conflicting labels '{}' and '{}'; keeping '{}'",
                        existing.path.display(),
                        kept,
                        dropped,
                        kept
                    );
                    warn!(event = "repo_label_conflict", path = %existing.path.display(), kept = %kept, dropped = %dropped);
                    warnings.push(message);
                }
                _ => {}
            },
        }
    }

    (by_path.into_values().collect(), warnings)
}

/// Absolute path with symlinks resolved. Paths that do not exist are
/// absolutized lexically so they still compare consistently.
pub fn normalize_repo_path(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    match std::fs::canonicalize(&absolute) {
        Ok(resolved) => Ok(resolved),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(lexical_clean(&absolute)),
        Err(err) => Err(err),
    }
}

fn normalize_or_keep(path: &Path) -> PathBuf {
    normalize_repo_path(path).unwrap_or_else(|_| path.to_path_buf())
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}
