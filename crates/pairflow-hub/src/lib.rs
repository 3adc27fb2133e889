//! Change-notification hub for pairflow bubbles.
//!
//! The broker polls registered repositories, turns fingerprint changes into
//! numbered events and fans them out to subscribers with replay on resume.
//! Filesystem events only bring the next poll forward.

pub mod broker;
pub mod snapshot;
pub mod sse;
pub mod sweep;
pub mod watch;

pub use broker::{
    diff_repo, Attachment, BrokerConfig, BrokerError, BrokerEvent, EventBroker, EventFilter,
    EventKind, RepoView, SnapshotView, Subscription, DEFAULT_DEBOUNCE, DEFAULT_HISTORY_LIMIT,
    DEFAULT_POLL_INTERVAL, DEFAULT_SUBSCRIBER_CAPACITY,
};
pub use snapshot::{
    file_signature, fingerprint, scan_bubble, BubbleSnapshot, FsSnapshotSource, RepoSnapshot,
    RepoSummary, RuntimeSessionHealth, ScanError, SnapshotSource, UNKNOWN_LIFECYCLE,
};
pub use sse::{router, StreamParams, KEEPALIVE_INTERVAL};
pub use sweep::{spawn_reconcile_sweep, sweep_once};
