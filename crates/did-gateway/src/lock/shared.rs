//! Shared-store locks for registrations spread over many hosts.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::OnceCell;

use super::{LockBackend, LockHandle};
use crate::error::{GatewayError, GatewayResult};

/// Atomic set-if-absent and compare-and-delete on a key/value store.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` to `token` with `ttl` unless it exists. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> GatewayResult<bool>;

    /// Delete `key` only if it still holds `token`. Returns whether it was deleted.
    async fn delete_if_matches(&self, key: &str, token: &str) -> GatewayResult<bool>;
}

/// Multi-host lock backend over a [`LockStore`].
#[derive(Debug)]
pub struct SharedStoreLockBackend<S> {
    store: S,
}

impl<S: LockStore> SharedStoreLockBackend<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: LockStore> LockBackend for SharedStoreLockBackend<S> {
    async fn acquire(&self, key: &str, lease: Duration) -> GatewayResult<Option<LockHandle>> {
        let handle = LockHandle::new(key, lease);
        if self.store.set_if_absent(key, &handle.token, lease).await? {
            Ok(Some(handle))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, handle: &LockHandle) -> GatewayResult<bool> {
        self.store.delete_if_matches(&handle.key, &handle.token).await
    }

    fn name(&self) -> &'static str {
        "shared"
    }
}

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed [`LockStore`] (`SET NX PX` plus a compare-and-delete script).
pub struct RedisLockStore {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
    release_script: redis::Script,
}

impl std::fmt::Debug for RedisLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockStore").finish_non_exhaustive()
    }
}

impl RedisLockStore {
    /// Parse the store URL. No connection is made until the first lock.
    pub fn open(url: &str) -> GatewayResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GatewayError::config(format!("invalid lock store URL: {}", e)))?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            release_script: redis::Script::new(COMPARE_AND_DELETE),
        })
    }

    async fn connection(&self) -> GatewayResult<MultiplexedConnection> {
        let conn = self
            .conn
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> GatewayResult<bool> {
        let mut conn = self.connection().await?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_matches(&self, key: &str, token: &str) -> GatewayResult<bool> {
        let mut conn = self.connection().await?;
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }
}

/// Owner token and expiry; `None` when the TTL does not fit an `Instant`.
type Entry = (String, Option<Instant>);

/// In-process [`LockStore`] with TTL expiry.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, Entry>>,
}

fn live(expires: Option<Instant>, now: Instant) -> bool {
    expires.map_or(true, |at| at > now)
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> GatewayResult<bool> {
        let mut entries = self.lock_entries();
        let now = Instant::now();
        if let Some((_, expires)) = entries.get(key) {
            if live(*expires, now) {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (token.to_string(), now.checked_add(ttl)));
        Ok(true)
    }

    async fn delete_if_matches(&self, key: &str, token: &str) -> GatewayResult<bool> {
        let mut entries = self.lock_entries();
        match entries.get(key) {
            Some((held, expires)) if held == token && live(*expires, Instant::now()) => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_shared_backend_exclusive() {
        let backend = SharedStoreLockBackend::new(MemoryLockStore::new());

        let first = backend.acquire("k", LEASE).await.unwrap().unwrap();
        assert!(backend.acquire("k", LEASE).await.unwrap().is_none());

        assert!(backend.release(&first).await.unwrap());
        assert!(backend.acquire("k", LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_checks_token() {
        let backend = SharedStoreLockBackend::new(MemoryLockStore::new());
        let held = backend.acquire("k", LEASE).await.unwrap().unwrap();

        let forged = LockHandle {
            token: "someone-else".into(),
            ..held.clone()
        };
        assert!(!backend.release(&forged).await.unwrap());
        assert!(backend.acquire("k", LEASE).await.unwrap().is_none());
        assert!(backend.release(&held).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entry_can_be_taken() {
        let backend = SharedStoreLockBackend::new(MemoryLockStore::new());
        let old = backend
            .acquire("k", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let new = backend.acquire("k", LEASE).await.unwrap();
        assert!(new.is_some());
        assert!(!backend.release(&old).await.unwrap());
    }

    #[test]
    fn test_redis_open_rejects_bad_url() {
        assert!(matches!(
            RedisLockStore::open("not-a-url"),
            Err(GatewayError::Config { .. })
        ));
        assert!(RedisLockStore::open("redis://127.0.0.1:6379/0").is_ok());
    }
}
