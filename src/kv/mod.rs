//! Key-value store contract backing idempotency and delivery state.
//!
//! Keys are ordered tuples of string segments; values are structured JSON.
//! The engine owns only this contract — concrete adapters are injected by
//! the host. [`MemoryKvStore`] is the in-process reference implementation.

mod memory;

pub use memory::MemoryKvStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Ordered tuple of string segments addressing one stored value.
///
/// Prefix matching is segment-wise: `["remote-document"]` is a prefix of
/// `["remote-document", "https://…"]` but `["remote"]` is not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey(Vec<String>);

impl KvKey {
    /// Creates a key from its segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// The key's segments in order.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Returns a new key with `segment` appended.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// Whether this key begins with every segment of `prefix`, in order.
    #[must_use]
    pub fn starts_with(&self, prefix: &KvKey) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl std::fmt::Display for KvKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// One entry yielded by a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// The entry's full key.
    pub key: KvKey,
    /// The stored value.
    pub value: Value,
}

/// Errors surfaced by store implementations.
///
/// Transport failures are retriable; implementations must never swallow a
/// failed write.
#[derive(Debug, Error)]
pub enum KvError {
    /// The backing transport failed.
    #[error("store transport failure: {source}")]
    Transport {
        /// The underlying transport error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A value could not be encoded or decoded.
    #[error("store serialization failure: {source}")]
    Serialization {
        /// The underlying codec error.
        #[from]
        source: serde_json::Error,
    },
}

/// Typed, key-tuple addressed store with TTL, compare-and-swap, and
/// segment-wise prefix listing.
#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    /// Reads the value under `key`, if present and unexpired.
    async fn get(&self, key: &KvKey) -> Result<Option<Value>, KvError>;

    /// Writes `value` under `key`, replacing any previous value.
    ///
    /// A `ttl` makes the entry invisible to reads and listings once it
    /// elapses.
    async fn set(&self, key: &KvKey, value: Value, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Removes the value under `key`, if any.
    async fn delete(&self, key: &KvKey) -> Result<(), KvError>;

    /// Writes `new` under `key` only when the current value structurally
    /// equals `expected` (`None` meaning "key absent").
    ///
    /// Returns whether the swap happened; on mismatch nothing is mutated.
    async fn cas(
        &self,
        key: &KvKey,
        expected: Option<&Value>,
        new: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>;

    /// Streams entries whose key begins with `prefix` segment-wise,
    /// including the exact-match entry. Expired entries are filtered;
    /// ordering is unspecified.
    fn list(&self, prefix: KvKey) -> BoxStream<'_, Result<KvEntry, KvError>>;
}

/// Shared store handle.
pub type SharedKvStore = Arc<dyn KvStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matching_is_segment_wise() {
        let key = KvKey::new(["remote-document", "https://remote/actor"]);
        assert!(key.starts_with(&KvKey::new(["remote-document"])));
        assert!(key.starts_with(&key.clone()));
        assert!(!key.starts_with(&KvKey::new(["remote"])));
        assert!(!key.starts_with(&key.child("extra")));
    }

    #[test]
    fn child_appends_a_segment() {
        let key = KvKey::new(["delivery"]).child("https://k").child("42");
        assert_eq!(key.segments(), ["delivery", "https://k", "42"]);
        assert_eq!(key.to_string(), "delivery/https://k/42");
    }
}
