//! Lock files on the local filesystem.
//!
//! Each key maps to `<dir>/<sha256(key)>.lock`, created with `create_new` so
//! exactly one process wins. The file records the owner token and the lease
//! deadline; files past their lease are broken by the next contender.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{LockBackend, LockHandle};
use crate::error::{GatewayError, GatewayResult};

/// Default directory for lock files.
pub fn default_lock_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("did-gateway")
        .join("locks")
}

/// Contents of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    token: String,
    pid: u32,
    key: String,
    expires_at: DateTime<Utc>,
}

/// Outcome of inspecting an existing lock file.
enum Existing {
    Live,
    Stale(Option<String>),
    Gone,
}

/// Single-host lock backend.
#[derive(Debug, Clone)]
pub struct FileLockBackend {
    dir: PathBuf,
}

impl FileLockBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the lock file for `key`.
    pub fn lock_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{}.lock", hex::encode(digest)))
    }

    async fn try_create(&self, path: &Path, record: &LockRecord) -> std::io::Result<bool> {
        create_exclusive(path, |file| write_record(file, record)).await
    }

    async fn read_record(path: &Path) -> std::io::Result<Option<LockRecord>> {
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes).ok())
    }

    async fn inspect(path: &Path, lease: Duration) -> std::io::Result<Existing> {
        let record = match Self::read_record(path).await {
            Ok(record) => record,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Existing::Gone),
            Err(e) => return Err(e),
        };

        match record {
            Some(record) if record.expires_at <= Utc::now() => {
                Ok(Existing::Stale(Some(record.token)))
            }
            Some(_) => Ok(Existing::Live),
            // Unreadable record: the owner may still be writing it. Use the
            // file age against the lease instead.
            None => {
                let modified = match fs::metadata(path).await {
                    Ok(meta) => meta.modified()?,
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Existing::Gone),
                    Err(e) => return Err(e),
                };
                let age = modified.elapsed().unwrap_or_default();
                if age > lease {
                    Ok(Existing::Stale(None))
                } else {
                    Ok(Existing::Live)
                }
            }
        }
    }

    /// Remove a stale file, unless it was replaced since we read it.
    async fn break_stale(path: &Path, stale_token: Option<&str>) -> std::io::Result<()> {
        if let Some(expected) = stale_token {
            match Self::read_record(path).await {
                Ok(Some(current)) if current.token != expected => return Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e),
                _ => {}
            }
        }
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Create `path` only if it does not exist and fill it with `write`.
///
/// `Ok(false)` if the file already exists. A file that could not be written
/// completely is removed again so it does not block the key for a lease.
async fn create_exclusive<F, Fut>(path: &Path, write: F) -> std::io::Result<bool>
where
    F: FnOnce(fs::File) -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    let file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e),
    };

    if let Err(e) = write(file).await {
        if let Err(cleanup) = fs::remove_file(path).await {
            warn!(path = %path.display(), error = %cleanup, "failed to remove partial lock file");
        }
        return Err(e);
    }
    Ok(true)
}

async fn write_record(mut file: fs::File, record: &LockRecord) -> std::io::Result<()> {
    let body = serde_json::to_vec(record).map_err(std::io::Error::other)?;
    file.write_all(&body).await?;
    file.sync_all().await
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> GatewayError {
    GatewayError::Connection {
        message: format!("lock file {} failed for {}: {}", action, path.display(), e),
    }
}

#[async_trait]
impl LockBackend for FileLockBackend {
    async fn acquire(&self, key: &str, lease: Duration) -> GatewayResult<Option<LockHandle>> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error("directory creation", &self.dir, e))?;

        let path = self.lock_path(key);
        let handle = LockHandle::new(key, lease);
        let record = LockRecord {
            token: handle.token.clone(),
            pid: std::process::id(),
            key: key.to_string(),
            expires_at: handle.expires_at,
        };

        // Second pass only after breaking a stale or vanished file.
        for _ in 0..2 {
            if self
                .try_create(&path, &record)
                .await
                .map_err(|e| io_error("create", &path, e))?
            {
                return Ok(Some(handle));
            }

            match Self::inspect(&path, lease)
                .await
                .map_err(|e| io_error("read", &path, e))?
            {
                Existing::Live => return Ok(None),
                Existing::Gone => continue,
                Existing::Stale(token) => {
                    debug!(path = %path.display(), "breaking stale lock file");
                    Self::break_stale(&path, token.as_deref())
                        .await
                        .map_err(|e| io_error("removal", &path, e))?;
                }
            }
        }

        Ok(None)
    }

    async fn release(&self, handle: &LockHandle) -> GatewayResult<bool> {
        let path = self.lock_path(&handle.key);
        let record = match Self::read_record(&path).await {
            Ok(record) => record,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_error("read", &path, e)),
        };

        match record {
            Some(record) if record.token == handle.token => {
                match fs::remove_file(&path).await {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(io_error("removal", &path, e)),
                }
            }
            _ => {
                warn!(path = %path.display(), "lock file is owned by another holder, leaving it");
                Ok(false)
            }
        }
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_failed_write_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.lock");

        let err = create_exclusive(&path, |_file| async {
            Err::<(), _>(std::io::Error::other("disk full"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert!(!path.exists());

        // Nothing left behind, so the next creation wins.
        assert!(create_exclusive(&path, |_file| async { Ok(()) }).await.unwrap());
        assert!(!create_exclusive(&path, |_file| async { Ok(()) }).await.unwrap());
    }

    #[tokio::test]
    async fn test_exclusive_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileLockBackend::new(dir.path());

        let first = backend.acquire("k1", LEASE).await.unwrap();
        assert!(first.is_some());
        assert!(backend.acquire("k1", LEASE).await.unwrap().is_none());

        // Different key, different file.
        assert!(backend.acquire("k2", LEASE).await.unwrap().is_some());

        assert!(backend.release(&first.unwrap()).await.unwrap());
        assert!(backend.acquire("k1", LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lock_file_named_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileLockBackend::new(dir.path());
        let path = backend.lock_path("did-gateway:lock:net:did:key:abc");

        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), 64 + ".lock".len());
        assert!(name.ends_with(".lock"));

        backend
            .acquire("did-gateway:lock:net:did:key:abc", LEASE)
            .await
            .unwrap()
            .unwrap();
        let record: LockRecord = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.key, "did-gateway:lock:net:did:key:abc");
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileLockBackend::new(dir.path());

        let stale = backend.acquire("k", Duration::ZERO).await.unwrap().unwrap();
        let fresh = backend.acquire("k", LEASE).await.unwrap();
        assert!(fresh.is_some());

        // The old holder no longer owns the file.
        assert!(!backend.release(&stale).await.unwrap());
        assert!(backend.release(&fresh.unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unparsable_recent_file_is_live() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileLockBackend::new(dir.path());
        std::fs::write(backend.lock_path("k"), b"").unwrap();

        assert!(backend.acquire("k", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileLockBackend::new(dir.path());
        let handle = LockHandle::new("k", LEASE);
        assert!(!backend.release(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_creates_lock_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let backend = FileLockBackend::new(&nested);
        assert!(backend.acquire("k", LEASE).await.unwrap().is_some());
        assert!(nested.is_dir());
    }
}
