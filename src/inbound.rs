//! Inbound pipeline types.
//!
//! The HTTP-side steps (parse, verify, dedup, enqueue) and the worker-side
//! dispatch run inside the federation facade; this module carries the task
//! envelope, the idempotency-key layout, and listener resolution through
//! the type hierarchy.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::activity::TypeHierarchy;
use crate::kv::KvKey;

/// Idempotency markers live this long.
pub const DEDUP_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Queue task for one accepted inbound activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundTask {
    /// Recipient scope: the inbox owner's identifier, or empty for the
    /// shared inbox.
    pub recipient: String,
    /// The received document.
    pub activity: Value,
    /// Key that authenticated the sender, when verification ran.
    pub signing_key_id: Option<Url>,
    /// Origin of the receiving context, for worker-side context rebuilding.
    pub origin: Url,
    /// Propagated trace baggage.
    #[serde(default)]
    pub trace_context: HashMap<String, String>,
    /// Zero-based dispatch attempt.
    #[serde(default)]
    pub attempt: u32,
}

/// KV key of the idempotency marker for one (recipient, activity) pair.
#[must_use]
pub fn dedup_key(recipient: &str, activity_id: &Url) -> KvKey {
    KvKey::new(["activity-idempotence", recipient, activity_id.as_str()])
}

/// Finds the handler key for an activity type: the type itself, or the
/// nearest ancestor with a registered handler.
#[must_use]
pub fn resolve_listener_type<'a, V>(
    hierarchy: &'a TypeHierarchy,
    handlers: &HashMap<String, V>,
    activity_type: &'a str,
) -> Option<String> {
    hierarchy
        .ancestors(activity_type)
        .into_iter()
        .find(|candidate| handlers.contains_key(*candidate))
        .map(str::to_owned)
}
