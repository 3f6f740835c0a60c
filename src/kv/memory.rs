//! In-process store implementing the KV contract on a concurrent map.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::clock::{SharedClock, SystemClock};

use super::{KvEntry, KvError, KvKey, KvStore};

#[derive(Debug, Clone)]
struct Stored {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

/// In-memory [`KvStore`] suitable for tests and single-node deployments.
///
/// Expired entries are dropped lazily on access.
#[derive(Debug)]
pub struct MemoryKvStore {
    entries: DashMap<KvKey, Stored>,
    clock: SharedClock,
}

impl MemoryKvStore {
    /// Creates an empty store on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Creates an empty store on the given clock.
    #[must_use]
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|ttl| self.clock.now() + TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX))
    }

    fn is_live(&self, stored: &Stored) -> bool {
        stored.expires_at.is_none_or(|at| self.clock.now() < at)
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Value>, KvError> {
        match self.entries.get(key) {
            Some(stored) if self.is_live(&stored) => Ok(Some(stored.value.clone())),
            Some(stored) => {
                drop(stored);
                self.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &KvKey, value: Value, ttl: Option<Duration>) -> Result<(), KvError> {
        self.entries.insert(
            key.clone(),
            Stored {
                value,
                expires_at: self.expiry(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn cas(
        &self,
        key: &KvKey,
        expected: Option<&Value>,
        new: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let expires_at = self.expiry(ttl);
        // The entry guard holds the shard lock, making the compare and the
        // swap one atomic step.
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = if self.is_live(occupied.get()) {
                    Some(&occupied.get().value)
                } else {
                    None
                };
                if current == expected {
                    occupied.insert(Stored {
                        value: new,
                        expires_at,
                    });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(Stored {
                        value: new,
                        expires_at,
                    });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn list(&self, prefix: KvKey) -> BoxStream<'_, Result<KvEntry, KvError>> {
        let matches: Vec<KvEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix) && self.is_live(entry.value()))
            .map(|entry| KvEntry {
                key: entry.key().clone(),
                value: entry.value().value.clone(),
            })
            .collect();
        futures::stream::iter(matches.into_iter().map(Ok)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use futures::TryStreamExt;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let store = MemoryKvStore::new();
        let key = KvKey::new(["a", "b"]);

        assert_eq!(store.get(&key).await.unwrap(), None);
        store.set(&key, json!({"n": 1}), None).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(json!({"n": 1})));
        store.delete(&key).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cas_compares_structurally_with_none_meaning_absent() {
        let store = MemoryKvStore::new();
        let key = KvKey::new(["marker"]);

        // Vacant + expected-present never writes.
        assert!(!store.cas(&key, Some(&json!(true)), json!(1), None).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), None);

        // Vacant + expected-absent writes exactly once.
        assert!(store.cas(&key, None, json!(true), None).await.unwrap());
        assert!(!store.cas(&key, None, json!(false), None).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), Some(json!(true)));

        // Occupied + matching expectation swaps.
        assert!(
            store
                .cas(&key, Some(&json!(true)), json!("done"), None)
                .await
                .unwrap()
        );
        assert_eq!(store.get(&key).await.unwrap(), Some(json!("done")));
    }

    #[tokio::test]
    async fn expired_entries_are_invisible_and_cas_treats_them_as_absent() {
        let clock = ManualClock::starting_at(Utc::now());
        let store = MemoryKvStore::with_clock(Arc::new(clock.clone()));
        let key = KvKey::new(["ephemeral"]);

        store
            .set(&key, json!(1), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(json!(1)));

        clock.advance(Duration::from_secs(61));
        assert_eq!(store.get(&key).await.unwrap(), None);

        store
            .set(&key, json!(2), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(61));
        assert!(store.cas(&key, None, json!(3), None).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), Some(json!(3)));
    }

    #[tokio::test]
    async fn list_filters_by_segment_prefix_and_expiry() {
        let clock = ManualClock::starting_at(Utc::now());
        let store = MemoryKvStore::with_clock(Arc::new(clock.clone()));

        store
            .set(&KvKey::new(["doc", "a"]), json!("a"), None)
            .await
            .unwrap();
        store
            .set(&KvKey::new(["doc", "b"]), json!("b"), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        store.set(&KvKey::new(["doc"]), json!("root"), None).await.unwrap();
        store
            .set(&KvKey::new(["document", "c"]), json!("c"), None)
            .await
            .unwrap();

        clock.advance(Duration::from_secs(6));
        let mut listed: Vec<KvEntry> = store
            .list(KvKey::new(["doc"]))
            .try_collect()
            .await
            .unwrap();
        listed.sort_by(|a, b| a.key.segments().cmp(b.key.segments()));

        let keys: Vec<String> = listed.iter().map(|e| e.key.to_string()).collect();
        // Exact match included, expired "doc/b" gone, "document/c" is not a
        // segment-wise match.
        assert_eq!(keys, ["doc", "doc/a"]);
    }
}
