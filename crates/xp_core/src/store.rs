use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unable to access `{}`", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("`{}` does not contain a valid document", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("`{}` changed on disk since it was loaded", .path.display())]
    Conflict { path: PathBuf },
    #[error("lock on `{}` timed out after {waited:?}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("unable to serialize document for `{}`", .path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io_at(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What to do when a document exists but cannot be parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CorruptPolicy {
    #[default]
    Fallback,
    Fail,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WritePolicy {
    #[default]
    RejectStale,
    LastWriterWins,
}

/// Content fingerprint of a document as last seen on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revision(Option<blake3::Hash>);

impl Revision {
    pub fn absent() -> Self {
        Self(None)
    }

    pub fn of(bytes: &[u8]) -> Self {
        Self(Some(blake3::hash(bytes)))
    }

    pub fn is_absent(&self) -> bool {
        self.0.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOrigin {
    Disk,
    Missing,
    /// The file could not be parsed; `backup` is where the broken copy went.
    Recovered { backup: Option<PathBuf> },
}

#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub path: PathBuf,
    pub value: T,
    pub revision: Revision,
    pub origin: LoadOrigin,
    pub loaded_at: DateTime<Utc>,
}

impl<T> Loaded<T> {
    fn new(path: &Path, value: T, revision: Revision, origin: LoadOrigin) -> Self {
        Self {
            path: path.to_path_buf(),
            value,
            revision,
            origin,
            loaded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JsonStore {
    corrupt_policy: CorruptPolicy,
    write_policy: WritePolicy,
    lock_timeout: Duration,
}

impl Default for JsonStore {
    fn default() -> Self {
        Self {
            corrupt_policy: CorruptPolicy::default(),
            write_policy: WritePolicy::default(),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

impl JsonStore {
    pub fn new(corrupt_policy: CorruptPolicy, write_policy: WritePolicy) -> Self {
        Self {
            corrupt_policy,
            write_policy,
            ..Self::default()
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn corrupt_policy(&self) -> CorruptPolicy {
        self.corrupt_policy
    }

    pub fn write_policy(&self) -> WritePolicy {
        self.write_policy
    }

    pub fn load<T: DeserializeOwned>(&self, path: &Path, default: T) -> Result<Loaded<T>, StoreError> {
        let _lock = FileLock::acquire(path, self.lock_timeout)?;

        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "document missing, starting from default");
                return Ok(Loaded::new(
                    path,
                    default,
                    Revision::absent(),
                    LoadOrigin::Missing,
                ));
            }
            Err(err) => return Err(StoreError::io_at(path)(err)),
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Loaded::new(
                path,
                value,
                Revision::of(&bytes),
                LoadOrigin::Disk,
            )),
            Err(source) => match self.corrupt_policy {
                CorruptPolicy::Fail => Err(StoreError::Corrupt {
                    path: path.to_path_buf(),
                    source,
                }),
                CorruptPolicy::Fallback => {
                    tracing::warn!(path = %path.display(), %source, "document is corrupt, falling back to default");
                    let backup = preserve_corrupt(path);
                    let revision = match backup {
                        Some(_) => Revision::absent(),
                        None => Revision::of(&bytes),
                    };
                    Ok(Loaded::new(
                        path,
                        default,
                        revision,
                        LoadOrigin::Recovered { backup },
                    ))
                }
            },
        }
    }

    /// Under [`WritePolicy::RejectStale`] the write fails unless the file still matches `expected`.
    pub fn save<T: Serialize>(
        &self,
        path: &Path,
        value: &T,
        expected: Revision,
    ) -> Result<Revision, StoreError> {
        let mut text = serde_json::to_string_pretty(value).map_err(|source| StoreError::Serialize {
            path: path.to_path_buf(),
            source,
        })?;
        text.push('\n');

        let _lock = FileLock::acquire(path, self.lock_timeout)?;
        if self.write_policy == WritePolicy::RejectStale {
            let current = revision_on_disk(path)?;
            if current != expected {
                tracing::warn!(path = %path.display(), "refusing to overwrite a document changed by another writer");
                return Err(StoreError::Conflict {
                    path: path.to_path_buf(),
                });
            }
        }

        write_atomic(path, text.as_bytes())?;
        tracing::debug!(path = %path.display(), bytes = text.len(), "document saved");
        Ok(Revision::of(text.as_bytes()))
    }
}

fn revision_on_disk(path: &Path) -> Result<Revision, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Revision::of(&bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Revision::absent()),
        Err(err) => Err(StoreError::io_at(path)(err)),
    }
}

fn sibling(path: &Path, name: String) -> PathBuf {
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = sibling(path, format!(".{}.tmp.{}", file_name(path), std::process::id()));
    let written = File::create(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io_at(&tmp)(err));
    }
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io_at(path)(err));
    }
    Ok(())
}

/// Moves an unparsable document aside so a later save cannot destroy it.
fn preserve_corrupt(path: &Path) -> Option<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let backup = sibling(path, format!("{}.corrupt-{}", file_name(path), stamp));
    match fs::rename(path, &backup) {
        Ok(()) => {
            tracing::warn!(path = %path.display(), backup = %backup.display(), "corrupt document preserved");
            Some(backup)
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "unable to preserve corrupt document");
            None
        }
    }
}

/// Exclusive advisory lock on `.<file>.lock` next to a document.
#[derive(Debug)]
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(target: &Path, timeout: Duration) -> Result<Self, StoreError> {
        let path = sibling(target, format!(".{}.lock", file_name(target)));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(StoreError::io_at(parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(StoreError::io_at(&path))?;

        let start = Instant::now();
        loop {
            if FileExt::try_lock_exclusive(&file).is_ok() {
                return Ok(Self { file });
            }
            if start.elapsed() >= timeout {
                return Err(StoreError::LockTimeout {
                    path,
                    waited: start.elapsed(),
                });
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
