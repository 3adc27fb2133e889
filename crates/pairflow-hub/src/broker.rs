use crate::snapshot::{BubbleSnapshot, RepoSnapshot, RepoSummary, ScanError, SnapshotSource};
use crate::watch::WatchSet;
use chrono::{DateTime, Utc};
use pairflow_storage::{normalize_repo_path, ListOptions, RepositoryRegistry};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(150);
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub repos: Vec<PathBuf>,
    /// When set, every registered repository is watched as well.
    pub repo_registry_path: Option<PathBuf>,
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub history_limit: usize,
    pub subscriber_capacity: usize,
    pub watch: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            repos: Vec::new(),
            repo_registry_path: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
            history_limit: DEFAULT_HISTORY_LIMIT,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            watch: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("event broker is closed")]
    Closed,
    #[error("event broker already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoView {
    pub summary: RepoSummary,
    pub bubbles: Vec<BubbleSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotView {
    /// Id of the newest event already reflected in this view.
    pub last_event_id: u64,
    pub repos: Vec<RepoView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventKind {
    Snapshot(SnapshotView),
    BubbleUpdated {
        repo_path: PathBuf,
        bubble: BubbleSnapshot,
    },
    BubbleRemoved {
        repo_path: PathBuf,
        bubble_id: String,
    },
    RepoUpdated {
        summary: RepoSummary,
    },
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Snapshot(_) => "snapshot",
            EventKind::BubbleUpdated { .. } => "bubble_updated",
            EventKind::BubbleRemoved { .. } => "bubble_removed",
            EventKind::RepoUpdated { .. } => "repo_updated",
        }
    }

    pub fn repo_path(&self) -> Option<&Path> {
        match self {
            EventKind::Snapshot(_) => None,
            EventKind::BubbleUpdated { repo_path, .. } | EventKind::BubbleRemoved { repo_path, .. } => {
                Some(repo_path)
            }
            EventKind::RepoUpdated { summary } => Some(&summary.repo_path),
        }
    }

    pub fn bubble_id(&self) -> Option<&str> {
        match self {
            EventKind::BubbleUpdated { bubble, .. } => Some(&bubble.bubble_id),
            EventKind::BubbleRemoved { bubble_id, .. } => Some(bubble_id),
            EventKind::Snapshot(_) | EventKind::RepoUpdated { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerEvent {
    pub id: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Which repos and bubble a subscriber cares about. Repo events ignore the
/// bubble part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    repos: Option<BTreeSet<PathBuf>>,
    bubble: Option<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new<I, P>(repos: I, bubble: Option<String>) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let repos: BTreeSet<PathBuf> = repos
            .into_iter()
            .map(|path| normalize_or_keep(path.as_ref()))
            .collect();
        Self {
            repos: (!repos.is_empty()).then_some(repos),
            bubble: bubble.filter(|id| !id.trim().is_empty()),
        }
    }

    pub fn matches_repo(&self, repo: &Path) -> bool {
        self.repos.as_ref().map_or(true, |repos| repos.contains(repo))
    }

    pub fn matches_bubble(&self, bubble_id: &str) -> bool {
        self.bubble.as_deref().map_or(true, |wanted| wanted == bubble_id)
    }

    pub fn matches(&self, kind: &EventKind) -> bool {
        let repo_ok = kind.repo_path().map_or(true, |repo| self.matches_repo(repo));
        let bubble_ok = kind.bubble_id().map_or(true, |id| self.matches_bubble(id));
        repo_ok && bubble_ok
    }
}

fn normalize_or_keep(path: &Path) -> PathBuf {
    normalize_repo_path(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Events for one repo between two scans, in a fixed order: bubble updates
/// by id, then removals, then the repo summary.
pub fn diff_repo(previous: Option<&RepoSnapshot>, next: &RepoSnapshot) -> Vec<EventKind> {
    let repo = &next.summary.repo_path;
    let mut events = Vec::new();
    for (id, bubble) in &next.bubbles {
        let changed = previous
            .and_then(|prev| prev.bubbles.get(id))
            .map_or(true, |old| !old.same_as(bubble));
        if changed {
            events.push(EventKind::BubbleUpdated {
                repo_path: repo.clone(),
                bubble: bubble.clone(),
            });
        }
    }
    if let Some(prev) = previous {
        for id in prev.bubbles.keys() {
            if !next.bubbles.contains_key(id) {
                events.push(EventKind::BubbleRemoved {
                    repo_path: repo.clone(),
                    bubble_id: id.clone(),
                });
            }
        }
    }
    if previous.map_or(true, |prev| prev.summary != next.summary) {
        events.push(EventKind::RepoUpdated {
            summary: next.summary.clone(),
        });
    }
    events
}

#[derive(Debug, Default)]
struct RescanState {
    running: bool,
    pending: bool,
    pending_emit: bool,
}

struct SubscriberSlot {
    filter: EventFilter,
    sender: mpsc::Sender<BrokerEvent>,
}

#[derive(Default)]
struct BrokerState {
    last_event_id: u64,
    history: VecDeque<BrokerEvent>,
    repos: BTreeMap<PathBuf, RepoSnapshot>,
    subscribers: BTreeMap<u64, SubscriberSlot>,
    next_subscriber_id: u64,
    rescan: RescanState,
    watch_targets: BTreeSet<PathBuf>,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
    closed: bool,
}

impl BrokerState {
    fn publish(&mut self, kind: EventKind, history_limit: usize) {
        self.last_event_id += 1;
        let event = BrokerEvent {
            id: self.last_event_id,
            ts: Utc::now(),
            kind,
        };

        let mut dropped = Vec::new();
        for (id, slot) in &self.subscribers {
            if !slot.filter.matches(&event.kind) {
                continue;
            }
            match slot.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Closed(_)) => dropped.push(*id),
                Err(TrySendError::Full(_)) => {
                    warn!(event = "hub_slow_consumer", subscriber_id = *id);
                    dropped.push(*id);
                }
            }
        }
        for id in dropped {
            self.subscribers.remove(&id);
        }

        self.history.push_back(event);
        while self.history.len() > history_limit {
            self.history.pop_front();
        }
    }

    fn replay_covers(&self, last_event_id: u64) -> bool {
        if last_event_id > self.last_event_id {
            return false;
        }
        let oldest = self
            .history
            .front()
            .map(|event| event.id)
            .unwrap_or(self.last_event_id + 1);
        last_event_id + 1 >= oldest
    }

    fn view(&self, filter: &EventFilter) -> SnapshotView {
        let repos = self
            .repos
            .iter()
            .filter(|(path, _)| filter.matches_repo(path))
            .map(|(_, snapshot)| RepoView {
                summary: snapshot.summary.clone(),
                bubbles: snapshot
                    .bubbles
                    .values()
                    .filter(|bubble| filter.matches_bubble(&bubble.bubble_id))
                    .cloned()
                    .collect(),
            })
            .collect();
        SnapshotView {
            last_event_id: self.last_event_id,
            repos,
        }
    }
}

struct BrokerInner {
    config: BrokerConfig,
    configured_repos: BTreeSet<PathBuf>,
    repo_registry: Option<RepositoryRegistry>,
    source: Arc<dyn SnapshotSource>,
    state: Mutex<BrokerState>,
    watcher: Mutex<Option<WatchSet>>,
    busy: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

impl BrokerInner {
    fn lock_state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_watcher(&self) -> MutexGuard<'_, Option<WatchSet>> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Live stream of events for one subscriber. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<BrokerEvent>,
    broker: Weak<BrokerInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `None` once the broker closed or dropped this subscriber.
    pub async fn recv(&mut self) -> Option<BrokerEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BrokerEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn close(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.broker.upgrade() {
            inner.lock_state().subscribers.remove(&self.id);
        }
    }
}

pub struct Attachment {
    /// Present when the stream must start from a fresh snapshot.
    pub snapshot: Option<SnapshotView>,
    pub subscription: Subscription,
}

/// Turns repeated repository scans into an ordered, replayable event stream.
#[derive(Clone)]
pub struct EventBroker {
    inner: Arc<BrokerInner>,
}

impl EventBroker {
    pub fn new(config: BrokerConfig, source: Arc<dyn SnapshotSource>) -> Self {
        let configured_repos = config
            .repos
            .iter()
            .map(|repo| normalize_or_keep(repo))
            .collect();
        let repo_registry = config
            .repo_registry_path
            .as_ref()
            .map(RepositoryRegistry::new);
        let (busy, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(BrokerInner {
                config,
                configured_repos,
                repo_registry,
                source,
                state: Mutex::new(BrokerState::default()),
                watcher: Mutex::new(None),
                busy,
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Baseline scan without events, then the poll timer and, when enabled,
    /// the filesystem watcher.
    pub async fn start(&self) -> Result<(), BrokerError> {
        {
            let mut state = self.inner.lock_state();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            if state.started {
                return Err(BrokerError::AlreadyStarted);
            }
            state.started = true;
        }

        self.request_rescan(false).await;
        if self.inner.config.watch {
            self.start_watcher();
        }
        self.spawn_poll();

        let state = self.inner.lock_state();
        info!(
            event = "hub_broker_started",
            repos = state.repos.len(),
            poll_ms = self.inner.config.poll_interval.as_millis() as u64,
            debounce_ms = self.inner.config.debounce.as_millis() as u64,
            watch = self.inner.config.watch,
        );
        Ok(())
    }

    /// Coalescing rescan. While one runs, further requests collapse into a
    /// single follow-up whose emit flag is the OR of theirs. Returns `false`
    /// once the broker is closed.
    pub async fn request_rescan(&self, emit: bool) -> bool {
        {
            let mut state = self.inner.lock_state();
            if state.closed {
                return false;
            }
            if state.rescan.running {
                state.rescan.pending = true;
                state.rescan.pending_emit |= emit;
                return true;
            }
            state.rescan.running = true;
            self.inner.busy.send_replace(true);
        }

        let mut emit = emit;
        loop {
            self.rescan_once(emit).await;
            let follow_up = {
                let mut state = self.inner.lock_state();
                if state.rescan.pending {
                    let next = state.rescan.pending_emit;
                    state.rescan.pending = false;
                    state.rescan.pending_emit = false;
                    Some(next)
                } else {
                    state.rescan.running = false;
                    self.inner.busy.send_replace(false);
                    None
                }
            };
            match follow_up {
                Some(next) => emit = next,
                None => break,
            }
        }
        true
    }

    async fn rescan_once(&self, emit: bool) {
        let repos = self.resolve_repos().await;
        let mut results = Vec::with_capacity(repos.len());
        let mut targets = BTreeSet::new();
        for repo in &repos {
            let source = self.inner.source.clone();
            let path = repo.clone();
            let joined = tokio::task::spawn_blocking(move || {
                let result = source.scan_repo(&path);
                let watch = source.watch_targets(&path);
                (result, watch)
            })
            .await;
            match joined {
                Ok((result, watch)) => {
                    targets.extend(watch);
                    results.push((repo.clone(), result));
                }
                Err(err) => results.push((
                    repo.clone(),
                    Err(ScanError::Task {
                        path: repo.clone(),
                        reason: err.to_string(),
                    }),
                )),
            }
        }
        if let Some(parent) = self
            .inner
            .config
            .repo_registry_path
            .as_deref()
            .and_then(Path::parent)
        {
            targets.insert(parent.to_path_buf());
        }

        self.apply_scan(&repos, results, emit);
        self.sync_watches(targets);
    }

    async fn resolve_repos(&self) -> BTreeSet<PathBuf> {
        let mut repos = self.inner.configured_repos.clone();
        let Some(registry) = self.inner.repo_registry.clone() else {
            return repos;
        };
        let listed =
            tokio::task::spawn_blocking(move || registry.list(ListOptions { normalize: true }))
                .await;
        let error = match listed {
            Ok(Ok(listing)) => {
                repos.extend(listing.entries.into_iter().map(|entry| entry.path));
                return repos;
            }
            Ok(Err(err)) => err.to_string(),
            Err(err) => err.to_string(),
        };
        // Keep the repos we already know instead of reporting them removed.
        warn!(event = "hub_registry_read_failed", error = %error);
        repos.extend(self.inner.lock_state().repos.keys().cloned());
        repos
    }

    fn apply_scan(
        &self,
        repos: &BTreeSet<PathBuf>,
        results: Vec<(PathBuf, Result<RepoSnapshot, ScanError>)>,
        emit: bool,
    ) {
        let history_limit = self.inner.config.history_limit;
        let mut state = self.inner.lock_state();
        let mut events = Vec::new();

        let gone: Vec<PathBuf> = state
            .repos
            .keys()
            .filter(|path| !repos.contains(*path))
            .cloned()
            .collect();
        for repo in gone {
            if let Some(previous) = state.repos.remove(&repo) {
                info!(event = "hub_repo_removed", repo = %repo.display());
                for bubble_id in previous.bubbles.into_keys() {
                    events.push(EventKind::BubbleRemoved {
                        repo_path: repo.clone(),
                        bubble_id,
                    });
                }
            }
        }

        for (repo, result) in results {
            let next = match result {
                Ok(next) => next,
                Err(err) => {
                    warn!(event = "hub_scan_failed", repo = %repo.display(), error = %err);
                    continue;
                }
            };
            events.extend(diff_repo(state.repos.get(&repo), &next));
            state.repos.insert(repo, next);
        }

        if !emit {
            debug!(event = "hub_rescan_baseline", suppressed = events.len());
            return;
        }
        for kind in events {
            state.publish(kind, history_limit);
        }
    }

    fn sync_watches(&self, targets: BTreeSet<PathBuf>) {
        self.inner.lock_state().watch_targets = targets.clone();
        if let Some(watcher) = self.inner.lock_watcher().as_mut() {
            watcher.sync(targets);
        }
    }

    fn start_watcher(&self) {
        let (wake_tx, mut wake_rx) = mpsc::unbounded_channel();
        let mut set = match WatchSet::new(wake_tx) {
            Ok(set) => set,
            Err(err) => {
                warn!(event = "hub_watch_unavailable", error = %err);
                return;
            }
        };
        let targets = self.inner.lock_state().watch_targets.clone();
        set.sync(targets);
        *self.inner.lock_watcher() = Some(set);

        let broker = self.clone();
        let debounce = self.inner.config.debounce;
        self.spawn_background(move |mut shutdown| async move {
            let mut pending = false;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    woke = wake_rx.recv() => match woke {
                        Some(()) => pending = true,
                        None => break,
                    },
                    _ = tokio::time::sleep(debounce), if pending => {
                        pending = false;
                        broker.request_rescan(true).await;
                    }
                }
            }
        });
    }

    fn spawn_poll(&self) {
        let period = self.inner.config.poll_interval;
        if period.is_zero() {
            warn!(event = "hub_poll_disabled");
            return;
        }
        let broker = self.clone();
        self.spawn_background(move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        broker.request_rescan(true).await;
                    }
                }
            }
        });
    }

    /// Runs `task` until the broker closes; `close()` waits for it to end.
    /// Returns `false` without spawning once the broker is closed.
    pub fn spawn_background<F, Fut>(&self, task: F) -> bool
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.inner.lock_state();
        if state.closed {
            return false;
        }
        let handle = tokio::spawn(task(self.inner.shutdown.subscribe()));
        state.tasks.push(handle);
        true
    }

    /// Replays retained events newer than `last_event_id` that match, then
    /// continues live with no gap or duplicate.
    pub fn subscribe(&self, filter: EventFilter, last_event_id: Option<u64>) -> Subscription {
        let mut state = self.inner.lock_state();
        self.register(&mut state, filter, last_event_id)
    }

    /// Resumes from `last_event_id` when history still covers the gap, and
    /// otherwise pairs a fresh snapshot with a live subscription.
    pub fn attach(&self, filter: EventFilter, last_event_id: Option<u64>) -> Attachment {
        let mut state = self.inner.lock_state();
        match last_event_id {
            Some(id) if state.replay_covers(id) => Attachment {
                snapshot: None,
                subscription: self.register(&mut state, filter, Some(id)),
            },
            _ => {
                let snapshot = state.view(&filter);
                Attachment {
                    snapshot: Some(snapshot),
                    subscription: self.register(&mut state, filter, None),
                }
            }
        }
    }

    fn register(
        &self,
        state: &mut BrokerState,
        filter: EventFilter,
        last_event_id: Option<u64>,
    ) -> Subscription {
        let replay: Vec<BrokerEvent> = match last_event_id {
            Some(after) => state
                .history
                .iter()
                .filter(|event| event.id > after && filter.matches(&event.kind))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        let capacity = self.inner.config.subscriber_capacity.max(1) + replay.len();
        let (sender, receiver) = mpsc::channel(capacity);
        for event in replay {
            let _ = sender.try_send(event);
        }

        state.next_subscriber_id += 1;
        let id = state.next_subscriber_id;
        if !state.closed {
            state.subscribers.insert(id, SubscriberSlot { filter, sender });
        }
        Subscription {
            id,
            receiver,
            broker: Arc::downgrade(&self.inner),
        }
    }

    pub fn replay_covers(&self, last_event_id: u64) -> bool {
        self.inner.lock_state().replay_covers(last_event_id)
    }

    pub fn get_snapshot(&self, filter: &EventFilter) -> SnapshotView {
        self.inner.lock_state().view(filter)
    }

    pub fn last_event_id(&self) -> u64 {
        self.inner.lock_state().last_event_id
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock_state().subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Refuses new rescans, drains the in-flight one with its follow-up,
    /// then stops background tasks and ends every subscription.
    pub async fn close(&self) {
        let mut busy = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            self.inner.busy.subscribe()
        };
        let _ = busy.wait_for(|running| !*running).await;

        self.inner.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut self.inner.lock_state().tasks);
        for task in tasks {
            let _ = task.await;
        }
        self.inner.lock_watcher().take();
        self.inner.lock_state().subscribers.clear();
        info!(event = "hub_broker_closed");
    }
}
