use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Filesystem watcher over a changing set of directories. Events only carry
/// a wake-up; the receiver decides when to rescan.
pub struct WatchSet {
    watcher: RecommendedWatcher,
    watched: BTreeSet<PathBuf>,
}

impl WatchSet {
    pub fn new(wake: mpsc::UnboundedSender<()>) -> notify::Result<Self> {
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = wake.send(());
            }
        })?;
        Ok(Self {
            watcher,
            watched: BTreeSet::new(),
        })
    }

    pub fn watched(&self) -> &BTreeSet<PathBuf> {
        &self.watched
    }

    /// Watches every existing target not yet watched and drops watches that
    /// are no longer targeted.
    pub fn sync(&mut self, targets: BTreeSet<PathBuf>) {
        let stale: Vec<PathBuf> = self.watched.difference(&targets).cloned().collect();
        for path in stale {
            if let Err(err) = self.watcher.unwatch(&path) {
                debug!(event = "hub_unwatch_failed", path = %path.display(), error = %err);
            }
            self.watched.remove(&path);
        }

        for path in targets {
            if self.watched.contains(&path) || !path.exists() {
                continue;
            }
            match self.watcher.watch(&path, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    self.watched.insert(path);
                }
                Err(err) => {
                    warn!(event = "hub_watch_failed", path = %path.display(), error = %err);
                }
            }
        }
    }
}
