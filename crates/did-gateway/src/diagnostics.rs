//! Rate-limited diagnostics.
//!
//! Repeated failures for the same DID and error kind log one warning per TTL
//! window. The cache tracking signatures is bounded; when full, the signature
//! first seen earliest is evicted. Suppressed repeats never refresh an entry,
//! under either strategy.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::validate::truncate;

/// Default suppression window.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Default number of tracked signatures.
pub const DEFAULT_MAX_ENTRIES: u64 = 100;

enum Strategy {
    #[cfg(feature = "bounded-cache")]
    Bounded(moka::sync::Cache<String, ()>),
    Manual(Mutex<HashMap<String, Instant>>),
}

/// Deduplicates log lines by signature.
pub struct DiagnosticsCache {
    strategy: Strategy,
    ttl: Duration,
    max_entries: u64,
}

impl std::fmt::Debug for DiagnosticsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticsCache")
            .field("strategy", &self.strategy_name())
            .field("ttl", &self.ttl)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

impl Default for DiagnosticsCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl DiagnosticsCache {
    /// Bounded TTL cache when compiled with `bounded-cache`, manual map otherwise.
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        #[cfg(feature = "bounded-cache")]
        {
            let cache = moka::sync::Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .eviction_policy(moka::policy::EvictionPolicy::lru())
                .build();
            Self {
                strategy: Strategy::Bounded(cache),
                ttl,
                max_entries,
            }
        }
        #[cfg(not(feature = "bounded-cache"))]
        {
            Self::manual(ttl, max_entries)
        }
    }

    /// Always use the manually pruned map.
    pub fn manual(ttl: Duration, max_entries: u64) -> Self {
        Self {
            strategy: Strategy::Manual(Mutex::new(HashMap::new())),
            ttl,
            max_entries,
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        match &self.strategy {
            #[cfg(feature = "bounded-cache")]
            Strategy::Bounded(_) => "bounded",
            Strategy::Manual(_) => "manual",
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_entries(&self) -> u64 {
        self.max_entries
    }

    /// Record `signature`; `true` if it was not seen within the TTL.
    pub fn should_emit(&self, signature: &str) -> bool {
        match &self.strategy {
            #[cfg(feature = "bounded-cache")]
            Strategy::Bounded(cache) => {
                // `contains_key` does not count as an access, so LRU order
                // stays insertion order.
                if cache.contains_key(signature) {
                    return false;
                }
                let entry = cache.entry(signature.to_string()).or_insert_with(|| ());
                let fresh = entry.is_fresh();
                if fresh {
                    cache.run_pending_tasks();
                }
                fresh
            }
            Strategy::Manual(map) => self.check_manual(map, signature, Instant::now()),
        }
    }

    /// Check against an explicit clock reading (manual strategy only).
    #[cfg(test)]
    fn should_emit_at(&self, signature: &str, now: Instant) -> bool {
        match &self.strategy {
            #[cfg(feature = "bounded-cache")]
            Strategy::Bounded(_) => self.should_emit(signature),
            Strategy::Manual(map) => self.check_manual(map, signature, now),
        }
    }

    fn check_manual(
        &self,
        map: &Mutex<HashMap<String, Instant>>,
        signature: &str,
        now: Instant,
    ) -> bool {
        if self.max_entries == 0 {
            return true;
        }

        let mut seen = map.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = self.ttl;
        seen.retain(|_, at| now.saturating_duration_since(*at) < ttl);

        if seen.contains_key(signature) {
            return false;
        }

        while seen.len() as u64 >= self.max_entries {
            let oldest = seen
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    seen.remove(&key);
                }
                None => break,
            }
        }

        seen.insert(signature.to_string(), now);
        true
    }

    /// Number of tracked signatures.
    pub fn len(&self) -> u64 {
        match &self.strategy {
            #[cfg(feature = "bounded-cache")]
            Strategy::Bounded(cache) => {
                cache.run_pending_tasks();
                cache.entry_count()
            }
            Strategy::Manual(map) => {
                let seen = map.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                seen.values()
                    .filter(|at| now.saturating_duration_since(**at) < self.ttl)
                    .count() as u64
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Log a warning for `did`/`kind` unless one was logged within the TTL.
    pub fn warn(&self, did: &str, kind: &str, message: &str) -> bool {
        let signature = format!("{}|{}", did, kind);
        if self.should_emit(&signature) {
            warn!(did = %truncate(did), kind, "{}", message);
            true
        } else {
            debug!(did = %truncate(did), kind, "suppressed repeated diagnostic");
            false
        }
    }
}
