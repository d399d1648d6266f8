//! In-process and composite [`KvStore`] implementations.
//!
//! The networked and on-disk stores live in `keel-store`; this module holds
//! the pieces the engine itself needs: an in-memory map and the fallback
//! combinator that keeps the job registry writable while the primary cache
//! is unreachable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::AppError;
use crate::traits::KvStore;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

/// In-memory key-value store with optional per-key TTL.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        self.lock().values().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.lock().remove(key);
        Ok(())
    }
}

/// Store that prefers `primary` and degrades to `secondary` on errors.
///
/// Writes go to the primary; a successful primary write evicts the
/// secondary copy, and only a failed one lands in the secondary. A secondary
/// copy is therefore always newer than the primary's, and reads prefer it:
/// a record updated during an outage is not shadowed by the stale primary
/// copy once the primary recovers.
///
/// A read with no secondary copy and a failing primary is an error, not a
/// miss: the record may well exist in the primary.
#[derive(Debug, Clone)]
pub struct FallbackStore<P, S> {
    primary: P,
    secondary: S,
}

impl<P: KvStore, S: KvStore> FallbackStore<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn secondary(&self) -> &S {
        &self.secondary
    }
}

impl<P: KvStore, S: KvStore> KvStore for FallbackStore<P, S> {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let (primary, secondary) = tokio::join!(self.primary.get(key), self.secondary.get(key));

        let secondary = secondary.unwrap_or_else(|e| {
            tracing::warn!(%key, error = %e, "Fallback store read failed");
            None
        });
        match (primary, secondary) {
            (_, Some(newer)) => Ok(Some(newer)),
            (Ok(value), None) => Ok(value),
            (Err(e), None) => {
                tracing::warn!(%key, error = %e, "Primary store read failed with no fallback copy");
                Err(e)
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError> {
        match self.primary.set(key, value, ttl).await {
            Ok(()) => {
                if let Err(e) = self.secondary.delete(key).await {
                    tracing::warn!(%key, error = %e, "Could not evict fallback copy");
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "Primary store write failed, using fallback");
                self.secondary.set(key, value, ttl).await
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let primary = self.primary.delete(key).await;
        let secondary = self.secondary.delete(key).await;
        match (primary, secondary) {
            (Err(p), Err(_)) => Err(p),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FailingStore, SwitchableStore};

    #[tokio::test]
    async fn memory_store_set_get_delete() {
        let store = MemoryStore::new();
        store.set("a", "1", None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));

        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn memory_store_expires_entries() {
        let store = MemoryStore::new();
        store
            .set("short", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn fallback_writes_to_secondary_when_primary_down() {
        let secondary = MemoryStore::new();
        let store = FallbackStore::new(FailingStore::new(), secondary.clone());

        store.set("job:1", "{}", None).await.unwrap();

        assert_eq!(secondary.get("job:1").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(store.get("job:1").await.unwrap().as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn fallback_prefers_primary_and_evicts_stale_copy() {
        let primary = MemoryStore::new();
        let secondary = MemoryStore::new();
        secondary.set("k", "old", None).await.unwrap();

        let store = FallbackStore::new(primary.clone(), secondary.clone());
        store.set("k", "new", None).await.unwrap();

        assert_eq!(primary.get("k").await.unwrap().as_deref(), Some("new"));
        assert_eq!(secondary.get("k").await.unwrap(), None);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn fallback_reads_secondary_on_primary_miss() {
        let secondary = MemoryStore::new();
        secondary.set("k", "written-during-outage", None).await.unwrap();
        let store = FallbackStore::new(MemoryStore::new(), secondary);

        assert_eq!(
            store.get("k").await.unwrap().as_deref(),
            Some("written-during-outage")
        );
    }

    #[tokio::test]
    async fn fallback_copy_outranks_stale_primary_after_recovery() {
        let primary = MemoryStore::new();
        let secondary = MemoryStore::new();
        let flaky = SwitchableStore::new(primary.clone());
        let store = FallbackStore::new(flaky.clone(), secondary.clone());

        store.set("k", "v1", None).await.unwrap();
        flaky.set_down(true);
        store.set("k", "v2", None).await.unwrap();
        flaky.set_down(false);

        assert_eq!(primary.get("k").await.unwrap().as_deref(), Some("v1"));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));

        // The next healthy write supersedes the fallback copy.
        store.set("k", "v3", None).await.unwrap();
        assert!(secondary.is_empty());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v3"));
    }

    #[tokio::test]
    async fn primary_outage_without_fallback_copy_is_an_error() {
        let store = FallbackStore::new(FailingStore::new(), MemoryStore::new());
        let err = store.get("only-in-primary").await.unwrap_err();
        assert!(matches!(err, AppError::StoreError(_)));
    }

    #[tokio::test]
    async fn fallback_delete_succeeds_if_either_side_does() {
        let secondary = MemoryStore::new();
        secondary.set("k", "v", None).await.unwrap();
        let store = FallbackStore::new(FailingStore::new(), secondary.clone());

        store.delete("k").await.unwrap();
        assert!(secondary.is_empty());
    }
}
