//! Outbound delivery pipeline.
//!
//! `send_activity` renders and fans an activity out to one queue task per
//! inbox; [`DeliveryEngine`] executes those tasks — sign, POST, retry with
//! backoff, and escalate to the permanent-failure handler when the attempt
//! budget runs out. Delivery state lives in the KV store so replicas share
//! it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use http::Request;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::Instrument;
use url::Url;

use crate::activity::{Actor, Recipient};
use crate::clock::SharedClock;
use crate::docloader::{DocumentLoader, SharedTransport};
use crate::kv::{KvError, KvKey, SharedKvStore};
use crate::queue::{EnqueueOptions, SharedQueue};
use crate::retry::RetryPolicy;
use crate::sig::{KeyAlgorithm, KeyPair, SignOptions, SignatureProfile, sign_request};

/// Algorithm acceptance memory lives this long per origin.
const ALGORITHM_MEMORY_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// One inbox the fan-out selected.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InboxTarget {
    /// Actors reached through this inbox.
    pub actor_ids: HashSet<Url>,
    /// Whether the inbox is an origin-wide shared inbox.
    pub shared_inbox: bool,
}

/// Computes the inbox set for a recipient list.
///
/// Inboxes are deduplicated globally; with `prefer_shared_inbox`, actors
/// advertising a shared inbox are coalesced onto it, while actors without
/// one (groups included) keep their personal inbox. `exclude_base_uris`
/// removes inboxes whose origin matches any excluded URI. The result is
/// invariant under recipient-order permutation.
#[must_use]
pub fn extract_inboxes(
    actors: &[Actor],
    prefer_shared_inbox: bool,
    exclude_base_uris: &[Url],
) -> HashMap<Url, InboxTarget> {
    let excluded_origins: HashSet<String> = exclude_base_uris
        .iter()
        .map(|uri| uri.origin().ascii_serialization())
        .collect();

    let mut targets: HashMap<Url, InboxTarget> = HashMap::new();
    for actor in actors {
        let (inbox, shared) = match (prefer_shared_inbox, actor.shared_inbox(), actor.inbox()) {
            (true, Some(shared), _) => (shared.clone(), true),
            (_, _, Some(personal)) => (personal.clone(), false),
            (false, Some(shared), None) => (shared.clone(), true),
            _ => {
                tracing::debug!(actor = %actor.id(), "recipient advertises no inbox, skipping");
                continue;
            }
        };
        if excluded_origins.contains(&inbox.origin().ascii_serialization()) {
            continue;
        }
        let target = targets.entry(inbox).or_default();
        target.shared_inbox = target.shared_inbox || shared;
        target.actor_ids.insert(actor.id().clone());
    }
    targets
}

/// Resolves a recipient list to actors: actors pass through, URLs are
/// dereferenced, collections are expanded one level. Unresolvable entries
/// are logged and skipped.
pub async fn resolve_recipients(
    loader: &DocumentLoader,
    recipients: &[Recipient],
) -> Vec<Actor> {
    let mut actors = Vec::new();
    for recipient in recipients {
        match recipient {
            Recipient::Public => {}
            Recipient::Embedded(actor) => actors.push((**actor).clone()),
            Recipient::Reference(url) => match loader.load(url).await {
                Ok(fetched) => collect_actors(loader, fetched.document, &mut actors).await,
                Err(error) => {
                    tracing::warn!(recipient = %url, %error, "failed to resolve recipient");
                }
            },
        }
    }
    actors
}

/// Adds the actors a dereferenced document denotes: the actor itself, or
/// one level of collection items.
async fn collect_actors(loader: &DocumentLoader, document: Value, actors: &mut Vec<Actor>) {
    if let Ok(actor) = Actor::from_document(document.clone()) {
        if actor.inbox().is_some() || actor.shared_inbox().is_some() {
            actors.push(actor);
            return;
        }
    }
    let Some(object) = document.as_object() else {
        return;
    };
    let items = object
        .get("orderedItems")
        .or_else(|| object.get("items"))
        .and_then(Value::as_array);
    let Some(items) = items else { return };
    for item in items {
        match item {
            Value::String(raw) => {
                if let Ok(url) = Url::parse(raw) {
                    match loader.load(&url).await {
                        Ok(fetched) => {
                            if let Ok(actor) = Actor::from_document(fetched.document) {
                                actors.push(actor);
                            }
                        }
                        Err(error) => {
                            tracing::warn!(item = %url, %error, "failed to resolve collection item");
                        }
                    }
                }
            }
            Value::Object(_) => {
                if let Ok(actor) = Actor::from_document(item.clone()) {
                    actors.push(actor);
                }
            }
            _ => {}
        }
    }
}

/// Queue task for one delivery to one inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundTask {
    /// The wire document, blind addressing already stripped.
    pub activity: Value,
    /// The activity's id.
    pub activity_id: Url,
    /// The activity's primary type.
    pub activity_type: String,
    /// Destination inbox.
    pub inbox: Url,
    /// Sender key ids, in declaration order.
    pub keys: Vec<Url>,
    /// Actors reached through this inbox.
    pub actor_ids: Vec<Url>,
    /// Whether the destination is a shared inbox.
    pub shared_inbox: bool,
    /// Origin of the sending context, for worker-side context rebuilding.
    pub origin: Url,
    /// Propagated trace baggage.
    #[serde(default)]
    pub trace_context: HashMap<String, String>,
    /// Zero-based delivery attempt.
    #[serde(default)]
    pub attempt: u32,
}

/// Ordering key serializing deliveries to one (key, inbox) pair.
#[must_use]
pub fn delivery_ordering_key(key_id: &Url, inbox: &Url) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_id.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(inbox.as_str().as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// KV key of the delivery record for one (key, activity, inbox) triple.
fn delivery_record_key(task: &OutboundTask) -> KvKey {
    let key_id = task
        .keys
        .first()
        .map_or_else(|| "-".to_owned(), |key| key.as_str().to_owned());
    KvKey::new([
        "delivery",
        key_id.as_str(),
        task.activity_id.as_str(),
        task.inbox.as_str(),
    ])
}

fn algorithm_memory_key(inbox: &Url) -> KvKey {
    KvKey::new(["server-algorithm", &inbox.origin().ascii_serialization()])
}

/// Delivery record persisted across attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeliveryRecord {
    attempts: u32,
    next_retry: Option<DateTime<Utc>>,
    status: String,
}

/// Called with the exhausted task and the last response body.
pub type OutboundFailureHandler =
    Arc<dyn Fn(OutboundTask, Option<String>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Executes outbound tasks popped from the queue.
pub(crate) struct DeliveryEngine {
    pub transport: SharedTransport,
    pub kv: SharedKvStore,
    pub queue: SharedQueue,
    pub clock: SharedClock,
    pub policy: RetryPolicy,
    pub key_ring: Arc<DashMap<Url, KeyPair>>,
    pub user_agent: String,
    pub ordered_delivery: bool,
    pub failure_handler: Option<OutboundFailureHandler>,
}

impl DeliveryEngine {
    /// Executes one task: sign, POST, and either finish, reschedule, or
    /// escalate.
    ///
    /// Returns `Err` only for infrastructure failures (KV, queue), which
    /// the queue redelivers.
    pub async fn deliver(&self, task: OutboundTask) -> Result<(), DeliveryInfraError> {
        let span = crate::observability::send_activity_span(
            &task.activity_id,
            &task.activity_type,
            &task.inbox,
        );
        async {
            tracing::debug!(
                activity = %serde_json::to_string(&task.activity).unwrap_or_default(),
                "delivering activity",
            );
            let Some(key) = self.select_key(&task).await? else {
                tracing::error!(
                    keys = ?task.keys,
                    "no signing key resolvable for delivery, dropping task",
                );
                self.escalate(task, None).await?;
                return Ok(());
            };

            match self.post(&task, &key).await {
                Ok(()) => {
                    self.kv
                        .set(
                            &algorithm_memory_key(&task.inbox),
                            json!(key.algorithm().cavage_name()),
                            Some(ALGORITHM_MEMORY_TTL),
                        )
                        .await?;
                    self.kv.delete(&delivery_record_key(&task)).await?;
                    Ok(())
                }
                Err(failure) => self.handle_failure(task, failure).await,
            }
        }
        .instrument(span)
        .await
    }

    /// Picks the first key whose algorithm the destination accepted in the
    /// past, else the first key in declaration order.
    async fn select_key(&self, task: &OutboundTask) -> Result<Option<KeyPair>, DeliveryInfraError> {
        let remembered = self
            .kv
            .get(&algorithm_memory_key(&task.inbox))
            .await?
            .and_then(|value| value.as_str().and_then(KeyAlgorithm::from_name));

        let resolve = |key_id: &Url| self.key_ring.get(key_id).map(|entry| entry.value().clone());
        if let Some(algorithm) = remembered {
            for key_id in &task.keys {
                if let Some(pair) = resolve(key_id) {
                    if pair.algorithm() == algorithm {
                        return Ok(Some(pair));
                    }
                }
            }
        }
        Ok(task.keys.iter().find_map(|key_id| resolve(key_id)))
    }

    async fn post(&self, task: &OutboundTask, key: &KeyPair) -> Result<(), DeliveryFailure> {
        let body = serde_json::to_vec(&task.activity).map_err(|source| DeliveryFailure {
            status: None,
            body: Some(source.to_string()),
        })?;
        let mut request = Request::builder()
            .method(http::Method::POST)
            .uri(task.inbox.as_str())
            .header(http::header::CONTENT_TYPE, "application/activity+json")
            .header(http::header::USER_AGENT, &self.user_agent)
            .body(Bytes::from(body))
            .map_err(|source| DeliveryFailure {
                status: None,
                body: Some(source.to_string()),
            })?;

        let profile = match key.algorithm() {
            KeyAlgorithm::RsaSha256 => SignatureProfile::DraftCavage,
            KeyAlgorithm::Ed25519 => SignatureProfile::Rfc9421,
        };
        sign_request(
            &mut request,
            key,
            &SignOptions {
                profile,
                created: Some(self.clock.now()),
            },
        )
        .map_err(|source| DeliveryFailure {
            status: None,
            body: Some(source.to_string()),
        })?;

        match self.transport.execute(request).await {
            Ok(response) if response.status.is_success() => Ok(()),
            Ok(response) => Err(DeliveryFailure {
                status: Some(response.status.as_u16()),
                body: Some(String::from_utf8_lossy(&response.body).into_owned()),
            }),
            Err(error) => Err(DeliveryFailure {
                status: None,
                body: Some(error.to_string()),
            }),
        }
    }

    async fn handle_failure(
        &self,
        task: OutboundTask,
        failure: DeliveryFailure,
    ) -> Result<(), DeliveryInfraError> {
        let attempts_made = task.attempt + 1;
        match self.policy.delay_after(attempts_made) {
            Some(delay) => {
                let next_retry = self.clock.now() + TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
                self.kv
                    .set(
                        &delivery_record_key(&task),
                        serde_json::to_value(DeliveryRecord {
                            attempts: attempts_made,
                            next_retry: Some(next_retry),
                            status: failure
                                .status
                                .map_or_else(|| "transport-error".to_owned(), |s| s.to_string()),
                        })
                        .map_err(KvError::from)?,
                        None,
                    )
                    .await?;
                tracing::warn!(
                    inbox = %task.inbox,
                    status = ?failure.status,
                    attempt = attempts_made,
                    retry_in = ?delay,
                    "delivery failed, rescheduling",
                );
                let retry = OutboundTask {
                    attempt: attempts_made,
                    ..task
                };
                let ordering_key = self.ordering_key(&retry);
                self.queue
                    .enqueue(
                        serde_json::to_value(crate::worker::TaskEnvelope::Outbound(retry))
                            .map_err(KvError::from)?,
                        EnqueueOptions {
                            delay: Some(delay),
                            ordering_key,
                        },
                    )
                    .await?;
                Ok(())
            }
            None => {
                tracing::error!(
                    inbox = %task.inbox,
                    status = ?failure.status,
                    attempts = attempts_made,
                    "delivery attempts exhausted",
                );
                self.escalate(task, failure.body).await
            }
        }
    }

    async fn escalate(
        &self,
        task: OutboundTask,
        last_body: Option<String>,
    ) -> Result<(), DeliveryInfraError> {
        self.kv.delete(&delivery_record_key(&task)).await?;
        if let Some(handler) = &self.failure_handler {
            handler(task, last_body).await;
        }
        Ok(())
    }

    /// The ordering key for a task, when serialization is enabled.
    pub fn ordering_key(&self, task: &OutboundTask) -> Option<String> {
        if !self.ordered_delivery {
            return None;
        }
        task.keys
            .first()
            .map(|key_id| delivery_ordering_key(key_id, &task.inbox))
    }
}

/// One failed exchange with the destination.
#[derive(Debug, Clone)]
struct DeliveryFailure {
    status: Option<u16>,
    body: Option<String>,
}

/// Infrastructure failure while executing a task; surfaces to the queue
/// for redelivery.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryInfraError {
    /// The KV store failed.
    #[error(transparent)]
    Kv(#[from] KvError),

    /// The queue failed.
    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn actor(id: &str, inbox: Option<&str>, shared: Option<&str>) -> Actor {
        let mut document = json!({
            "id": id,
            "type": "Person",
        });
        if let Some(inbox) = inbox {
            document["inbox"] = json!(inbox);
        }
        if let Some(shared) = shared {
            document["endpoints"] = json!({"sharedInbox": shared});
        }
        Actor::from_document(document).unwrap()
    }

    #[test]
    fn coalesces_same_origin_actors_onto_the_shared_inbox() {
        let actors = vec![
            actor(
                "https://a.example/users/alice",
                Some("https://a.example/users/alice/inbox"),
                Some("https://a.example/inbox"),
            ),
            actor(
                "https://a.example/users/bob",
                Some("https://a.example/users/bob/inbox"),
                Some("https://a.example/inbox"),
            ),
            actor(
                "https://b.example/users/carol",
                Some("https://b.example/users/carol/inbox"),
                None,
            ),
        ];

        let inboxes = extract_inboxes(&actors, true, &[]);
        assert_eq!(inboxes.len(), 2);

        let shared = &inboxes[&Url::parse("https://a.example/inbox").unwrap()];
        assert!(shared.shared_inbox);
        assert_eq!(shared.actor_ids.len(), 2);

        let personal = &inboxes[&Url::parse("https://b.example/users/carol/inbox").unwrap()];
        assert!(!personal.shared_inbox);
        assert_eq!(personal.actor_ids.len(), 1);
    }

    #[test]
    fn without_coalescing_each_actor_keeps_its_inbox() {
        let actors = vec![
            actor(
                "https://a.example/users/alice",
                Some("https://a.example/users/alice/inbox"),
                Some("https://a.example/inbox"),
            ),
            actor(
                "https://a.example/users/bob",
                Some("https://a.example/users/bob/inbox"),
                Some("https://a.example/inbox"),
            ),
        ];
        let inboxes = extract_inboxes(&actors, false, &[]);
        assert_eq!(inboxes.len(), 2);
        assert!(inboxes.values().all(|target| !target.shared_inbox));
    }

    #[test]
    fn excluded_base_uris_remove_matching_origins() {
        let actors = vec![
            actor(
                "https://a.example/users/alice",
                Some("https://a.example/users/alice/inbox"),
                None,
            ),
            actor(
                "https://b.example/users/carol",
                Some("https://b.example/users/carol/inbox"),
                None,
            ),
        ];
        let excluded = vec![Url::parse("https://a.example/").unwrap()];
        let inboxes = extract_inboxes(&actors, true, &excluded);
        assert_eq!(inboxes.len(), 1);
        assert!(
            inboxes.contains_key(&Url::parse("https://b.example/users/carol/inbox").unwrap())
        );
    }

    #[test]
    fn extraction_is_order_invariant() {
        let mut actors = vec![
            actor(
                "https://a.example/users/alice",
                Some("https://a.example/users/alice/inbox"),
                Some("https://a.example/inbox"),
            ),
            actor(
                "https://a.example/users/bob",
                Some("https://a.example/users/bob/inbox"),
                Some("https://a.example/inbox"),
            ),
            actor(
                "https://b.example/users/carol",
                Some("https://b.example/users/carol/inbox"),
                None,
            ),
        ];
        let forward = extract_inboxes(&actors, true, &[]);
        actors.reverse();
        let backward = extract_inboxes(&actors, true, &[]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn ordering_key_is_stable_and_pair_specific() {
        let key_id = Url::parse("https://a.example/users/alice#main").unwrap();
        let inbox = Url::parse("https://b.example/inbox").unwrap();
        let first = delivery_ordering_key(&key_id, &inbox);
        assert_eq!(first, delivery_ordering_key(&key_id, &inbox));
        assert_ne!(
            first,
            delivery_ordering_key(&key_id, &Url::parse("https://c.example/inbox").unwrap())
        );
        assert_eq!(first.len(), 16);
    }
}
