use crate::LockError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Exclusive advisory lock on a sidecar file. The lock is held for as long as
/// the guard lives and released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let io_err = |source: io::Error| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        let started = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Err(err) if is_contended(&err) => {}
                Err(err) => return Err(io_err(err)),
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited_ms: waited.as_millis() as u64,
                });
            }
            std::thread::sleep(LOCK_POLL_INTERVAL.min(timeout - waited));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Runs `f` while holding the lock at `lock_path`.
pub fn with_file_lock<T, E, F>(lock_path: &Path, timeout: Duration, f: F) -> Result<T, E>
where
    E: From<LockError>,
    F: FnOnce() -> Result<T, E>,
{
    let _guard = FileLock::acquire(lock_path, timeout)?;
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_times_out_while_first_is_held() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join("nested/registry.json.lock");

        let held = FileLock::acquire(&lock_path, Duration::from_millis(100)).expect("first");
        assert!(lock_path.exists(), "parent directory and lock file are created");

        let err = FileLock::acquire(&lock_path, Duration::from_millis(60)).unwrap_err();
        match err {
            LockError::Timeout { path, waited_ms } => {
                assert_eq!(path, lock_path);
                assert!(waited_ms >= 60);
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        drop(held);
        FileLock::acquire(&lock_path, Duration::from_millis(100)).expect("reacquire after drop");
    }

    #[test]
    fn with_file_lock_releases_on_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join("registry.json.lock");

        let result: Result<(), LockError> =
            with_file_lock(&lock_path, Duration::from_millis(100), || {
                Err(LockError::Io {
                    path: PathBuf::from("inner"),
                    source: io::Error::new(io::ErrorKind::Other, "boom"),
                })
            });
        assert!(matches!(result, Err(LockError::Io { .. })));

        let value: Result<u32, LockError> =
            with_file_lock(&lock_path, Duration::from_millis(100), || Ok(7));
        assert_eq!(value.expect("lock released after failed closure"), 7);
    }

    #[test]
    fn waiter_acquires_once_holder_releases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join("registry.json.lock");
        let held = FileLock::acquire(&lock_path, Duration::from_millis(100)).expect("first");

        let waiter_path = lock_path.clone();
        let waiter = std::thread::spawn(move || {
            FileLock::acquire(&waiter_path, Duration::from_secs(5)).map(|_| ())
        });

        std::thread::sleep(Duration::from_millis(100));
        drop(held);
        waiter
            .join()
            .expect("join waiter")
            .expect("waiter acquires after release");
    }
}
