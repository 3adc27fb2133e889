use std::path::{Path, PathBuf};

pub const REPO_REGISTRY_ENV: &str = "PAIRFLOW_REPO_REGISTRY_PATH";
pub const RUNTIME_SESSIONS_ENV: &str = "PAIRFLOW_RUNTIME_SESSIONS_PATH";

const STATE_DIR: &str = ".pairflow";
const REPO_REGISTRY_FILE: &str = "repos.json";
const RUNTIME_SESSIONS_FILE: &str = "runtime/sessions.json";

pub fn default_repo_registry_path() -> PathBuf {
    resolve_registry_path(
        std::env::var(REPO_REGISTRY_ENV).ok(),
        dirs::home_dir(),
        REPO_REGISTRY_FILE,
    )
}

pub fn default_runtime_sessions_path() -> PathBuf {
    resolve_registry_path(
        std::env::var(RUNTIME_SESSIONS_ENV).ok(),
        dirs::home_dir(),
        RUNTIME_SESSIONS_FILE,
    )
}

/// Env override first, then `~/.pairflow/<relative>`, then a path relative to
/// the working directory when no home directory is known.
pub fn resolve_registry_path(
    env_value: Option<String>,
    home: Option<PathBuf>,
    relative: &str,
) -> PathBuf {
    if let Some(value) = env_value {
        if !value.trim().is_empty() {
            return PathBuf::from(value.trim());
        }
    }
    match home {
        Some(home) => home.join(STATE_DIR).join(relative),
        None => PathBuf::from(STATE_DIR).join(relative),
    }
}

pub fn lock_path_for(registry_path: &Path) -> PathBuf {
    let mut raw = registry_path.as_os_str().to_os_string();
    raw.push(".lock");
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins_over_home() {
        let path = resolve_registry_path(
            Some(" /tmp/custom/repos.json ".to_string()),
            Some(PathBuf::from("/home/dev")),
            REPO_REGISTRY_FILE,
        );
        assert_eq!(path, PathBuf::from("/tmp/custom/repos.json"));
    }

    #[test]
    fn blank_env_falls_back_to_home_then_relative() {
        let path = resolve_registry_path(
            Some("  ".to_string()),
            Some(PathBuf::from("/home/dev")),
            RUNTIME_SESSIONS_FILE,
        );
        assert_eq!(
            path,
            PathBuf::from("/home/dev/.pairflow/runtime/sessions.json")
        );

        let path = resolve_registry_path(None, None, REPO_REGISTRY_FILE);
        assert_eq!(path, PathBuf::from(".pairflow/repos.json"));
    }

    #[test]
    fn lock_sidecar_appends_suffix() {
        assert_eq!(
            lock_path_for(Path::new("/data/repos.json")),
            PathBuf::from("/data/repos.json.lock")
        );
    }
}
