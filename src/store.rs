//! Durable document store.
//!
//! Each persisted entity (queue, ledger, completions, recovery state) is one
//! JSON document on disk. A [`Document`] owns the in-memory copy behind an
//! async mutex and a file lock, so every read-modify-write of a given
//! document is serialized through a single writer, across processes too.
//! Writes replace the whole file atomically: temp file in the same
//! directory, fsync, rename.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt as _;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// Well-known document names under the store root.
pub const QUEUE_DOC: &str = "queue.json";
pub const LEDGER_DOC: &str = "processing.json";
pub const COMPLETION_DOC: &str = "completed.json";
pub const RECOVERY_DOC: &str = "recovery.json";

/// A directory of named documents.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load a named document, falling back to `T::default()` if absent or corrupt.
    pub async fn document<T>(&self, name: &str) -> Result<Document<T>>
    where
        T: Serialize + DeserializeOwned + Default + Clone + Send + 'static,
    {
        Document::load(self.root.join(name)).await
    }
}

/// A single persisted document with single-writer access.
///
/// Every access takes an exclusive `flock` on a `<name>.lock` sidecar and
/// re-reads the file, so several processes over one data directory see each
/// other's writes. The in-memory copy only serves reads when the disk cannot
/// be reached.
#[derive(Debug)]
pub struct Document<T> {
    path: PathBuf,
    lock_path: PathBuf,
    state: Mutex<T>,
}

impl<T> Document<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + Send + 'static,
{
    /// Load from `path`.
    ///
    /// A missing file yields the default document. A file that fails to parse
    /// is moved aside as `<name>.corrupt-<timestamp>` and the default is used;
    /// this is logged at error level, never swallowed.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let lock_path = sidecar_lock_path(&path);
        let value = {
            let _lock = lock_exclusive(lock_path.clone()).await?;
            read_document::<T>(&path).await?
        };

        Ok(Self {
            path,
            lock_path,
            state: Mutex::new(value),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a read-only closure against the current document.
    pub async fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let mut guard = self.state.lock().await;
        self.refresh(&mut guard).await;
        f(&guard)
    }

    /// Clone of the current document.
    pub async fn snapshot(&self) -> T {
        self.read(T::clone).await
    }

    /// Mutate the document and persist it as one unit.
    ///
    /// The closure works on a fresh copy read from disk while the file lock
    /// is held. The copy is written back and only then becomes the in-memory
    /// value; if the closure or the write fails, the file is left as it was.
    pub async fn update<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut guard = self.state.lock().await;
        let _lock = lock_exclusive(self.lock_path.clone()).await?;

        let mut next = read_document::<T>(&self.path).await?;
        let result = f(&mut next)?;

        let bytes = serde_json::to_vec_pretty(&next)?;
        write_atomic(self.path.clone(), bytes).await?;

        *guard = next;
        debug!(path = %self.path.display(), "document persisted");
        Ok(result)
    }

    async fn refresh(&self, cached: &mut T) {
        let fresh: Result<T> = async {
            let _lock = lock_exclusive(self.lock_path.clone()).await?;
            read_document::<T>(&self.path).await
        }
        .await;
        match fresh {
            Ok(value) => *cached = value,
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "cannot reload document, serving cached copy"
            ),
        }
    }
}

/// Read and parse a document file. Must be called with the sidecar lock held.
async fn read_document<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match tokio::fs::read(path).await {
        Ok(bytes) => match parse_document::<T>(path, &bytes) {
            Ok(v) => Ok(v),
            Err(e) => {
                let backup = corrupt_backup_path(path);
                error!(
                    path = %path.display(),
                    backup = %backup.display(),
                    error = %e,
                    "document is corrupt, continuing with an empty default"
                );
                tokio::fs::rename(path, &backup).await?;
                Ok(T::default())
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

fn sidecar_lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Block (off the runtime) until the sidecar lock is ours. The lock is
/// released when the returned handle is dropped.
async fn lock_exclusive(lock_path: PathBuf) -> Result<std::fs::File> {
    tokio::task::spawn_blocking(move || -> Result<std::fs::File> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(file)
    })
    .await
    .map_err(|e| Error::Other(format!("document lock task failed: {e}")))?
}

fn parse_document<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::StoreCorruption {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn corrupt_backup_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    path.with_file_name(format!(
        "{name}.corrupt-{}",
        Utc::now().format("%Y%m%dT%H%M%S%.3f")
    ))
}

async fn write_atomic(path: PathBuf, bytes: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| Error::Other(format!("no parent directory for {}", path.display())))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Other(format!("document write task failed: {e}")))?
}
