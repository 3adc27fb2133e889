use pairflow_storage::{
    ListOptions, LockedRegistry, ReadOptions, RegistryDocument, RepositoryRegistry,
    RuntimeSessionEntry, RuntimeSessionRegistry,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Barrier};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct CounterDoc {
    version: u32,
    value: u64,
    history: Vec<u64>,
}

impl Default for CounterDoc {
    fn default() -> Self {
        Self {
            version: 1,
            value: 0,
            history: Vec::new(),
        }
    }
}

impl RegistryDocument for CounterDoc {
    const SCHEMA_VERSION: u32 = 1;

    fn version(&self) -> u32 {
        self.version
    }

    fn validate(&self) -> Result<(), String> {
        if self.history.len() as u64 != self.value {
            return Err(format!(
                "history length {} does not match value {}",
                self.history.len(),
                self.value
            ));
        }
        Ok(())
    }
}

#[test]
fn concurrent_mutations_are_never_interleaved() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("counter.json");
    let workers = 4;
    let per_worker = 25;
    let barrier = Arc::new(Barrier::new(workers));

    let handles = (0..workers)
        .map(|_| {
            let path = path.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                // Separate handles per thread: each opens its own lock file
                // descriptor, as separate processes would.
                let registry: LockedRegistry<CounterDoc> =
                    LockedRegistry::new(&path).with_lock_timeout(Duration::from_secs(30));
                barrier.wait();
                for _ in 0..per_worker {
                    registry
                        .mutate(|doc| {
                            let observed = doc.value;
                            std::thread::sleep(Duration::from_millis(1));
                            doc.value = observed + 1;
                            doc.history.push(observed);
                            Ok(())
                        })
                        .expect("mutate");
                }
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.join().expect("worker");
    }

    let registry: LockedRegistry<CounterDoc> = LockedRegistry::new(&path);
    let doc = registry.read(ReadOptions::default()).expect("read");
    assert_eq!(doc.value, (workers * per_worker) as u64);
    let expected: Vec<u64> = (0..doc.value).collect();
    assert_eq!(doc.history, expected, "each mutation saw the previous result");
}

#[test]
fn readers_never_observe_partial_documents() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sessions.json");
    let writer_registry = RuntimeSessionRegistry::new(&path);
    writer_registry
        .upsert(RuntimeSessionEntry::new("seed", "/r", "/w", "s"))
        .expect("seed");

    let writer = std::thread::spawn(move || {
        for idx in 0..40 {
            writer_registry
                .upsert(RuntimeSessionEntry::new(
                    format!("b{idx}"),
                    "/r",
                    format!("/w/{idx}"),
                    format!("pf-{idx}"),
                ))
                .expect("upsert");
        }
    });

    let reader_registry = RuntimeSessionRegistry::new(&path);
    for _ in 0..200 {
        reader_registry
            .list()
            .expect("reader always sees a complete document");
    }
    writer.join().expect("writer");
    assert_eq!(reader_registry.list().expect("list").len(), 41);
}

#[test]
fn register_repo_then_add_and_remove_runtime_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = dir.path().join("r");
    std::fs::create_dir_all(&repo).expect("repo");

    let repos = RepositoryRegistry::new(dir.path().join("repos.json"));
    let registered = repos.register(&repo, None).expect("register");
    assert!(registered.added);
    assert_eq!(
        repos
            .list(ListOptions::default())
            .expect("list repos")
            .entries
            .len(),
        1
    );

    let sessions = RuntimeSessionRegistry::new(dir.path().join("runtime/sessions.json"));
    sessions
        .upsert(RuntimeSessionEntry::new(
            "b1",
            &registered.entry.path,
            repo.join(".worktrees/b1"),
            "pane-1",
        ))
        .expect("add session");

    let listed = sessions.list().expect("read");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].bubble_id, "b1");
    assert_eq!(listed[0].tmux_session_name, "pane-1");

    assert!(sessions.remove("b1").expect("remove"));
    assert!(sessions.list().expect("read again").is_empty());
    assert!(!sessions.remove("b1").expect("remove again"));
}
