//! Distributed locking for concurrent registrations of the same DID.
//!
//! A [`LockManager`] wraps one [`LockBackend`]:
//!
//! - [`FileLockBackend`]: one lock file per key, for processes on one host
//! - [`SharedStoreLockBackend`]: SET-if-absent on a shared store (Redis), for many hosts
//!
//! Acquisition is bounded. When the wait runs out or the backend fails, the
//! manager returns `None` and the caller proceeds unlocked; the gateway then
//! arbitrates duplicates through `ALREADY_REGISTERED`.

pub mod file;
pub mod shared;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};

pub use file::{default_lock_dir, FileLockBackend};
pub use shared::{LockStore, MemoryLockStore, RedisLockStore, SharedStoreLockBackend};

use crate::error::{GatewayError, GatewayResult};
use crate::types::{GatewayConfig, LockStrategy};
use crate::validate::truncate;

/// Prefix of every lock key.
pub const LOCK_KEY_PREFIX: &str = "did-gateway:lock";

/// First acquisition backoff.
const INITIAL_BACKOFF: Duration = Duration::from_millis(25);

/// Acquisition backoff cap.
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Lock key for a (network, DID) pair.
pub fn lock_key(network: &str, did: &str) -> String {
    format!("{}:{}:{}", LOCK_KEY_PREFIX, network, did)
}

/// Exclusive ownership of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    /// Random owner token; release only succeeds with it.
    pub token: String,
    /// Lease deadline after which the lock may be broken.
    pub expires_at: DateTime<Utc>,
}

impl LockHandle {
    pub(crate) fn new(key: &str, lease: Duration) -> Self {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            key: key.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Lock backend.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Try once to take `key` for `lease`. `Ok(None)` means it is held elsewhere.
    async fn acquire(&self, key: &str, lease: Duration) -> GatewayResult<Option<LockHandle>>;

    /// Release a handle. Returns `false` if the lock was no longer ours.
    async fn release(&self, handle: &LockHandle) -> GatewayResult<bool>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Bounded-wait lock acquisition over a backend.
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    wait: Duration,
    lease: Duration,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("backend", &self.backend.name())
            .field("wait", &self.wait)
            .field("lease", &self.lease)
            .finish()
    }
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>, wait: Duration, lease: Duration) -> Self {
        Self {
            backend,
            wait,
            lease,
        }
    }

    /// Build the backend selected by `config.lock_strategy`.
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let backend: Arc<dyn LockBackend> = match config.lock_strategy {
            LockStrategy::Local => {
                let dir = config.lock_dir.clone().unwrap_or_else(default_lock_dir);
                Arc::new(FileLockBackend::new(dir))
            }
            LockStrategy::Shared => {
                let url = config.lock_url.as_deref().ok_or_else(|| {
                    GatewayError::config("shared lock strategy requires a lock store URL")
                })?;
                Arc::new(SharedStoreLockBackend::new(RedisLockStore::open(url)?))
            }
        };
        Ok(Self::new(backend, config.lock_wait()?, config.lock_lease()))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Acquire `key`, waiting at most the configured bound.
    ///
    /// Returns `None` on timeout or backend error; both are logged.
    pub async fn acquire(&self, key: &str) -> Option<LockHandle> {
        self.acquire_with_lease(key, self.lease).await
    }

    /// Like [`Self::acquire`], with a lease of at least `min_lease`.
    ///
    /// Callers pass the longest time they may hold the lock, so the lease
    /// cannot run out while the holder is still working.
    pub async fn acquire_with_lease(&self, key: &str, min_lease: Duration) -> Option<LockHandle> {
        let lease = self.lease.max(min_lease);
        let deadline = Instant::now() + self.wait;
        let mut backoff = INITIAL_BACKOFF;
        let mut tries: u32 = 0;

        loop {
            tries += 1;
            match self.backend.acquire(key, lease).await {
                Ok(Some(handle)) => {
                    debug!(
                        key = %truncate(key),
                        tries,
                        backend = self.backend.name(),
                        lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX),
                        "lock acquired"
                    );
                    return Some(handle);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        key = %truncate(key),
                        backend = self.backend.name(),
                        error = %e,
                        "lock backend error, proceeding without lock"
                    );
                    return None;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    key = %truncate(key),
                    backend = self.backend.name(),
                    wait_ms = self.wait.as_millis() as u64,
                    "timed out waiting for lock, proceeding without lock"
                );
                return None;
            }

            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Release a handle, logging rather than failing.
    pub async fn release(&self, handle: LockHandle) {
        match self.backend.release(&handle).await {
            Ok(true) => debug!(key = %truncate(&handle.key), "lock released"),
            Ok(false) => warn!(
                key = %truncate(&handle.key),
                "lock was already expired or taken over at release"
            ),
            Err(e) => warn!(key = %truncate(&handle.key), error = %e, "failed to release lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingBackend;

    #[async_trait]
    impl LockBackend for FailingBackend {
        async fn acquire(&self, _key: &str, _lease: Duration) -> GatewayResult<Option<LockHandle>> {
            Err(GatewayError::Connection {
                message: "store down".into(),
            })
        }

        async fn release(&self, _handle: &LockHandle) -> GatewayResult<bool> {
            Ok(false)
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    /// Busy for the first `busy_for` tries.
    struct BusyBackend {
        busy_for: u32,
        tries: AtomicU32,
    }

    #[async_trait]
    impl LockBackend for BusyBackend {
        async fn acquire(&self, key: &str, lease: Duration) -> GatewayResult<Option<LockHandle>> {
            let n = self.tries.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.busy_for {
                Ok(Some(LockHandle::new(key, lease)))
            } else {
                Ok(None)
            }
        }

        async fn release(&self, _handle: &LockHandle) -> GatewayResult<bool> {
            Ok(true)
        }

        fn name(&self) -> &'static str {
            "busy"
        }
    }

    #[test]
    fn test_lock_key_format() {
        assert_eq!(
            lock_key("mainnet", "did:key:abc"),
            "did-gateway:lock:mainnet:did:key:abc"
        );
    }

    #[test]
    fn test_handle_expiry() {
        let handle = LockHandle::new("k", Duration::from_secs(30));
        assert!(!handle.is_expired());
        let handle = LockHandle::new("k", Duration::ZERO);
        assert!(handle.is_expired());
    }

    #[test]
    fn test_handle_with_unbounded_lease() {
        let handle = LockHandle::new("k", Duration::MAX);
        assert!(!handle.is_expired());
        assert_eq!(handle.expires_at, DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_lease_covers_requested_minimum() {
        let backend = Arc::new(BusyBackend {
            busy_for: 0,
            tries: AtomicU32::new(0),
        });
        let manager = LockManager::new(backend, Duration::from_secs(1), Duration::from_secs(30));

        let long = manager
            .acquire_with_lease("k", Duration::from_secs(120))
            .await
            .unwrap();
        assert!(long.expires_at > Utc::now() + chrono::Duration::seconds(100));

        // The configured lease is a floor.
        let short = manager
            .acquire_with_lease("k", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(short.expires_at > Utc::now() + chrono::Duration::seconds(20));
    }

    #[tokio::test]
    async fn test_backend_error_degrades() {
        let manager = LockManager::new(
            Arc::new(FailingBackend),
            Duration::from_secs(10),
            Duration::from_secs(30),
        );
        assert!(manager.acquire("k").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_busy_lock() {
        let backend = Arc::new(BusyBackend {
            busy_for: 3,
            tries: AtomicU32::new(0),
        });
        let manager = LockManager::new(backend.clone(), Duration::from_secs(10), Duration::from_secs(30));

        let start = Instant::now();
        assert!(manager.acquire("k").await.is_some());
        assert_eq!(backend.tries.load(Ordering::SeqCst), 4);
        // 25 + 50 + 100 ms
        assert_eq!(start.elapsed(), Duration::from_millis(175));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_bounded() {
        let backend = Arc::new(BusyBackend {
            busy_for: u32::MAX,
            tries: AtomicU32::new(0),
        });
        let manager = LockManager::new(backend, Duration::from_secs(3), Duration::from_secs(30));

        let start = Instant::now();
        assert!(manager.acquire("k").await.is_none());
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn test_shared_strategy_requires_url() {
        let mut config = GatewayConfig::new("https://gw.example.com");
        config.lock_strategy = LockStrategy::Shared;
        assert!(matches!(
            LockManager::from_config(&config),
            Err(GatewayError::Config { .. })
        ));
    }

    #[test]
    fn test_local_strategy_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::new("https://gw.example.com").with_lock_dir(dir.path());
        let manager = LockManager::from_config(&config).unwrap();
        assert_eq!(manager.backend_name(), "file");
    }
}
