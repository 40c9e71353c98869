use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::selection::Selection;
use crate::store::DurableStore;

/// Bumped whenever the shape of a cached value changes; entries written
/// under an older version are discarded on read.
pub const CACHE_SCHEMA_VERSION: u32 = 3;

pub const COUNTS_KEY: &str = "tasks.counts";
pub const META_KEY: &str = "tasks.meta";

/// Cache bucket key for a view's task list, e.g. `tasks.tasks.today`.
pub fn view_bucket_key(selection: &Selection) -> String {
    format!("tasks.tasks.{}", selection.cache_key())
}

/// TTL + schema version for one logical cache. Keeping the pairing in a
/// single value object means every call site for the same cache name agrees
/// on both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub version: u32,
}

/// Logical cache names used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheName {
    Views,
    Counts,
    Meta,
}

impl CacheName {
    pub fn policy(&self) -> CachePolicy {
        // Uniform 60 s TTL for everything this engine caches. UI-only state
        // with day-scale TTLs lives outside this crate.
        match self {
            CacheName::Views | CacheName::Counts | CacheName::Meta => CachePolicy {
                ttl: Duration::seconds(60),
                version: CACHE_SCHEMA_VERSION,
            },
        }
    }
}

/// Persisted envelope around one cached value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheRow {
    pub value: serde_json::Value,
    pub written_at: DateTime<Utc>,
    pub version: u32,
}

/// Versioned key/value cache with write-through to the durable store.
///
/// `get` ignores TTL on purpose: an expired-but-version-valid entry is still
/// servable while a background refresh runs. Staleness is reported separately
/// through [`KvCache::is_stale`].
pub struct KvCache {
    entries: Mutex<HashMap<String, CacheRow>>,
    store: Arc<DurableStore>,
}

impl KvCache {
    /// Hydrates the in-memory map from the durable backend.
    pub fn open(store: Arc<DurableStore>) -> Self {
        let entries = match store.cache_load_all() {
            Ok(rows) => rows.into_iter().collect(),
            Err(err) => {
                debug!("cache hydrate failed, starting empty: {err:#}");
                HashMap::new()
            }
        };
        Self {
            entries: Mutex::new(entries),
            store,
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str, policy: CachePolicy) -> Option<T> {
        let entries = self.entries.lock();
        let row = entries.get(key)?;
        if row.version != policy.version {
            return None;
        }
        serde_json::from_value(row.value.clone()).ok()
    }

    /// True when the entry is absent, version-invalid, or older than the
    /// policy TTL.
    pub fn is_stale(&self, key: &str, policy: CachePolicy) -> bool {
        let entries = self.entries.lock();
        match entries.get(key) {
            Some(row) if row.version == policy.version => {
                Utc::now().signed_duration_since(row.written_at) > policy.ttl
            }
            _ => true,
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T, policy: CachePolicy) {
        let row = CacheRow {
            value: match serde_json::to_value(value) {
                Ok(v) => v,
                Err(err) => {
                    debug!("cache set skipped for {key}: {err}");
                    return;
                }
            },
            written_at: Utc::now(),
            version: policy.version,
        };
        if let Err(err) = self.store.cache_put(key, &row) {
            debug!("cache write-through failed for {key}: {err:#}");
        }
        self.entries.lock().insert(key.to_string(), row);
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.lock().remove(key);
        if let Err(err) = self.store.cache_delete(key) {
            debug!("cache delete failed for {key}: {err:#}");
        }
    }

    /// Wholesale invalidation (logout/reset).
    pub fn clear(&self) {
        self.entries.lock().clear();
        if let Err(err) = self.store.cache_clear() {
            debug!("cache clear failed: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cache() -> KvCache {
        KvCache::open(Arc::new(DurableStore::in_memory()))
    }

    #[test]
    fn set_then_get_round_trips() {
        let cache = cache();
        let policy = CacheName::Views.policy();
        cache.set("tasks.tasks.today", &vec!["a", "b"], policy);
        let got: Option<Vec<String>> = cache.get("tasks.tasks.today", policy);
        assert_eq!(got, Some(vec!["a".to_string(), "b".to_string()]));
        assert!(!cache.is_stale("tasks.tasks.today", policy));
    }

    #[test]
    fn version_mismatch_discards_entry() {
        let cache = cache();
        let old = CachePolicy {
            ttl: Duration::seconds(60),
            version: CACHE_SCHEMA_VERSION - 1,
        };
        cache.set("k", &1u32, old);
        let current = CacheName::Views.policy();
        assert_eq!(cache.get::<u32>("k", current), None);
        assert!(cache.is_stale("k", current));
    }

    #[test]
    fn expired_entry_is_stale_but_still_served() {
        let cache = cache();
        let policy = CacheName::Views.policy();
        cache.set("k", &7u32, policy);
        cache
            .entries
            .lock()
            .get_mut("k")
            .expect("row")
            .written_at = Utc::now() - Duration::seconds(120);

        assert!(cache.is_stale("k", policy));
        assert_eq!(cache.get::<u32>("k", policy), Some(7));
    }

    #[test]
    fn survives_reopen_through_durable_store() {
        let store = Arc::new(DurableStore::in_memory());
        let policy = CacheName::Counts.policy();
        {
            let cache = KvCache::open(store.clone());
            cache.set(COUNTS_KEY, &42u32, policy);
        }
        let reopened = KvCache::open(store);
        assert_eq!(reopened.get::<u32>(COUNTS_KEY, policy), Some(42));
    }

    #[test]
    fn clear_drops_everything() {
        let cache = cache();
        let policy = CacheName::Meta.policy();
        cache.set(META_KEY, &1u32, policy);
        cache.clear();
        assert_eq!(cache.get::<u32>(META_KEY, policy), None);
    }

    #[test]
    fn view_bucket_keys_follow_selection_keys() {
        assert_eq!(view_bucket_key(&Selection::Today), "tasks.tasks.today");
        assert_eq!(
            view_bucket_key(&Selection::search("Big Rocks")),
            "tasks.tasks.search:big rocks"
        );
    }
}
