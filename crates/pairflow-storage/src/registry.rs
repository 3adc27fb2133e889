use crate::lock::with_file_lock;
use crate::paths::lock_path_for;
use crate::RegistryError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A versioned JSON document persisted as a single file.
///
/// `Default` must produce an empty document at `SCHEMA_VERSION`; it stands in
/// for a missing file when reads allow it.
pub trait RegistryDocument: Serialize + DeserializeOwned + Default {
    const SCHEMA_VERSION: u32;

    fn version(&self) -> u32;

    /// Structural checks beyond what deserialization enforces.
    fn validate(&self) -> Result<(), String>;

    /// Canonical ordering applied before every write.
    fn normalize(&mut self) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub allow_missing: bool,
}

impl ReadOptions {
    pub fn allow_missing() -> Self {
        Self {
            allow_missing: true,
        }
    }
}

/// Load / validate / mutate / atomic-write cycle over one registry file,
/// guarded by `<path>.lock`.
#[derive(Debug, Clone)]
pub struct LockedRegistry<D> {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    _doc: PhantomData<fn() -> D>,
}

impl<D: RegistryDocument> LockedRegistry<D> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            lock_path: lock_path_for(&path),
            path,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            _doc: PhantomData,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Reads without taking the lock. Writers replace the file by rename, so
    /// a concurrent reader sees either the old or the new document.
    pub fn read(&self, options: ReadOptions) -> Result<D, RegistryError> {
        self.load(options).map(|(_, doc)| doc)
    }

    /// Applies `f` to the current document under the lock and writes the
    /// result atomically. An error from `f` (or from validation) aborts
    /// before anything touches the file. When the canonical encoding equals
    /// the bytes already on disk, the write is skipped.
    pub fn mutate<T, F>(&self, f: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut D) -> Result<T, RegistryError>,
    {
        with_file_lock(&self.lock_path, self.lock_timeout, || {
            let (raw, mut doc) = self.load(ReadOptions::allow_missing())?;
            let value = f(&mut doc)?;
            doc.normalize();
            doc.validate().map_err(|reason| self.invalid(reason))?;
            let payload = self.encode(&doc)?;
            if raw.as_deref() != Some(payload.as_str()) {
                write_atomic(&self.path, payload.as_bytes())
                    .map_err(|err| RegistryError::io(&self.path, err))?;
            }
            Ok(value)
        })
    }

    fn load(&self, options: ReadOptions) -> Result<(Option<String>, D), RegistryError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound && options.allow_missing => {
                return Ok((None, D::default()));
            }
            Err(err) => return Err(RegistryError::io(&self.path, err)),
        };

        let doc: D = serde_json::from_str(&raw).map_err(|err| self.invalid(err.to_string()))?;
        if doc.version() != D::SCHEMA_VERSION {
            return Err(self.invalid(format!(
                "unsupported version {}, expected {}",
                doc.version(),
                D::SCHEMA_VERSION
            )));
        }
        doc.validate().map_err(|reason| self.invalid(reason))?;
        Ok((Some(raw), doc))
    }

    fn encode(&self, doc: &D) -> Result<String, RegistryError> {
        let mut payload =
            serde_json::to_string_pretty(doc).map_err(|err| RegistryError::Encode {
                path: self.path.clone(),
                reason: err.to_string(),
            })?;
        payload.push('\n');
        Ok(payload)
    }

    fn invalid(&self, reason: impl Into<String>) -> RegistryError {
        RegistryError::Invalid {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }
}

pub fn write_atomic(path: &Path, payload: &[u8]) -> io::Result<()> {
    write_atomic_with(path, |file| file.write_all(payload))
}

/// Writes through a temp file in the destination directory and renames it
/// over `path`. The rename is the only step a reader can observe; on any
/// failure the temp file is removed and `path` is untouched.
pub fn write_atomic_with<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("registry path has no file name: {}", path.display()),
        )
    })?;
    let temp_path = dir.join(format!(
        ".{}.{}.{}.tmp",
        file_name.to_string_lossy(),
        std::process::id(),
        temp_suffix()
    ));

    let result = write_temp_then_rename(&temp_path, path, write);
    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

fn write_temp_then_rename<F>(temp_path: &Path, path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp_path)?;
    write(&mut file)?;
    file.flush()?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(temp_path, path)
}

fn temp_suffix() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{nanos}-{counter}")
}
