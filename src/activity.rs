//! Activity and actor views over opaque JSON-LD documents.
//!
//! The engine never models the full vocabulary; it extracts the handful of
//! fields the pipelines need (`id`, `type`, `actor`, addressing, inboxes,
//! keys) and carries the original document untouched. Listener dispatch
//! resolves sub-types through [`TypeHierarchy`].

use std::collections::HashMap;

use serde_json::{Map, Value, json};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// The well-known public addressing collection.
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Errors raised while extracting engine-relevant fields from a document.
#[derive(Debug, Error)]
pub enum ActivityError {
    /// The document is not a JSON object.
    #[error("document must be a JSON object")]
    NotAnObject,

    /// The document carries no `type`.
    #[error("document is missing a type")]
    MissingType,

    /// The document carries no usable `id` where one is required.
    #[error("document is missing an id")]
    MissingId,

    /// A URI-valued field failed to parse.
    #[error("invalid {field} URI: {value:?}")]
    InvalidUri {
        /// The JSON-LD field name.
        field: &'static str,
        /// The rejected text.
        value: String,
    },
}

/// One recipient extracted from an addressing field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// URL of an actor or collection, to be dereferenced at send time.
    Reference(Url),
    /// Actor object embedded directly in the addressing field.
    Embedded(Box<Actor>),
    /// The public collection; it has no inbox and is skipped by delivery.
    Public,
}

/// Engine view of an activity document.
#[derive(Debug, Clone)]
pub struct Activity {
    document: Value,
    id: Option<Url>,
    types: Vec<String>,
    actor: Option<Url>,
    object_id: Option<Url>,
}

impl Activity {
    /// Extracts the engine-relevant fields from `document`.
    ///
    /// # Errors
    ///
    /// Returns [`ActivityError`] when the document is not an object, lists
    /// no type, or carries malformed URIs in extracted fields.
    pub fn from_document(document: Value) -> Result<Self, ActivityError> {
        let object = document.as_object().ok_or(ActivityError::NotAnObject)?;

        let types = string_values(object.get("type"));
        if types.is_empty() {
            return Err(ActivityError::MissingType);
        }
        let id = object
            .get("id")
            .and_then(Value::as_str)
            .map(|raw| parse_uri("id", raw))
            .transpose()?;
        let actor = first_reference(object.get("actor"), "actor")?;
        let object_id = first_reference(object.get("object"), "object")?;

        Ok(Self {
            document,
            id,
            types,
            actor,
            object_id,
        })
    }

    /// The activity's `id`, the idempotency key for both pipelines.
    #[must_use]
    pub fn id(&self) -> Option<&Url> {
        self.id.as_ref()
    }

    /// Assigns a generated `urn:uuid:` id when the document has none, and
    /// returns the id.
    pub fn ensure_id(&mut self) -> &Url {
        if self.id.is_none() {
            let generated = Url::parse(&format!("urn:uuid:{}", Uuid::new_v4()))
                .expect("generated urn is a valid URI");
            if let Some(object) = self.document.as_object_mut() {
                object.insert("id".into(), json!(generated.as_str()));
            }
            self.id = Some(generated);
        }
        self.id.as_ref().expect("id just ensured")
    }

    /// The primary (first-listed) type name.
    #[must_use]
    pub fn primary_type(&self) -> &str {
        &self.types[0]
    }

    /// All listed type names.
    #[must_use]
    pub fn types(&self) -> &[String] {
        &self.types
    }

    /// The `actor` reference, if present.
    #[must_use]
    pub fn actor(&self) -> Option<&Url> {
        self.actor.as_ref()
    }

    /// The `object` reference, if present.
    #[must_use]
    pub fn object_id(&self) -> Option<&Url> {
        self.object_id.as_ref()
    }

    /// The underlying document.
    #[must_use]
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Recipients across `to`, `cc`, `bto`, `bcc`, and `audience`,
    /// deduplicated in order of first appearance.
    #[must_use]
    pub fn recipients(&self) -> Vec<Recipient> {
        let Some(object) = self.document.as_object() else {
            return Vec::new();
        };
        let mut seen = Vec::new();
        for field in ["to", "cc", "bto", "bcc", "audience"] {
            for recipient in recipient_entries(object.get(field)) {
                if !seen.contains(&recipient) {
                    seen.push(recipient);
                }
            }
        }
        seen
    }

    /// The document with blind addressing (`bto`, `bcc`) removed, as it
    /// must appear on the wire.
    #[must_use]
    pub fn for_delivery(&self) -> Value {
        let mut document = self.document.clone();
        if let Some(object) = document.as_object_mut() {
            object.remove("bto");
            object.remove("bcc");
        }
        document
    }

    /// Canonical serialization: JSON with lexicographically ordered keys.
    #[must_use]
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(&self.document).expect("JSON value serializes")
    }
}

/// One `publicKey`-style entry published by an actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorKey {
    /// The key id URI.
    pub id: Url,
    /// The actor claiming ownership, when stated on the key.
    pub owner: Option<Url>,
    /// PEM-encoded material (`publicKeyPem`).
    pub pem: Option<String>,
    /// Multibase-encoded material (`publicKeyMultibase`).
    pub multibase: Option<String>,
}

/// Engine view of an actor document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    document: Value,
    id: Url,
    types: Vec<String>,
    inbox: Option<Url>,
    shared_inbox: Option<Url>,
    keys: Vec<ActorKey>,
    assertion_methods: Vec<Url>,
    followers: Option<Url>,
}

impl Actor {
    /// Extracts the engine-relevant fields from an actor document.
    ///
    /// # Errors
    ///
    /// Returns [`ActivityError`] when the document is not an object, lacks
    /// an `id` or `type`, or carries malformed URIs.
    pub fn from_document(document: Value) -> Result<Self, ActivityError> {
        let object = document.as_object().ok_or(ActivityError::NotAnObject)?;

        let id = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or(ActivityError::MissingId)
            .and_then(|raw| parse_uri("id", raw))?;
        let types = string_values(object.get("type"));
        if types.is_empty() {
            return Err(ActivityError::MissingType);
        }
        let inbox = object
            .get("inbox")
            .and_then(Value::as_str)
            .map(|raw| parse_uri("inbox", raw))
            .transpose()?;
        let shared_inbox = object
            .get("endpoints")
            .and_then(Value::as_object)
            .and_then(|endpoints| endpoints.get("sharedInbox"))
            .and_then(Value::as_str)
            .map(|raw| parse_uri("sharedInbox", raw))
            .transpose()?;
        let followers = object
            .get("followers")
            .and_then(Value::as_str)
            .map(|raw| parse_uri("followers", raw))
            .transpose()?;

        let mut keys = Vec::new();
        for entry in value_entries(object.get("publicKey")) {
            if let Some(key) = actor_key(entry) {
                keys.push(key);
            }
        }
        let mut assertion_methods = Vec::new();
        for entry in value_entries(object.get("assertionMethod")) {
            match entry {
                Value::String(raw) => {
                    if let Ok(url) = Url::parse(raw) {
                        assertion_methods.push(url);
                    }
                }
                Value::Object(map) => {
                    if let Some(key) = actor_key(entry) {
                        assertion_methods.push(key.id.clone());
                        keys.push(key);
                    } else if let Some(url) =
                        map.get("id").and_then(Value::as_str).and_then(|s| Url::parse(s).ok())
                    {
                        assertion_methods.push(url);
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            document,
            id,
            types,
            inbox,
            shared_inbox,
            keys,
            assertion_methods,
            followers,
        })
    }

    /// The actor's `id`.
    #[must_use]
    pub fn id(&self) -> &Url {
        &self.id
    }

    /// All listed type names.
    #[must_use]
    pub fn types(&self) -> &[String] {
        &self.types
    }

    /// The personal inbox.
    #[must_use]
    pub fn inbox(&self) -> Option<&Url> {
        self.inbox.as_ref()
    }

    /// The origin-wide shared inbox, when advertised.
    #[must_use]
    pub fn shared_inbox(&self) -> Option<&Url> {
        self.shared_inbox.as_ref()
    }

    /// The followers collection URL, when advertised.
    #[must_use]
    pub fn followers(&self) -> Option<&Url> {
        self.followers.as_ref()
    }

    /// Published key entries, `publicKey` and key-shaped `assertionMethod`
    /// forms combined.
    #[must_use]
    pub fn keys(&self) -> &[ActorKey] {
        &self.keys
    }

    /// `assertionMethod` references by id.
    #[must_use]
    pub fn assertion_methods(&self) -> &[Url] {
        &self.assertion_methods
    }

    /// The underlying document.
    #[must_use]
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Whether `key_id` is one of this actor's published keys.
    #[must_use]
    pub fn owns_key(&self, key_id: &Url) -> bool {
        self.keys.iter().any(|key| &key.id == key_id)
            || self.assertion_methods.iter().any(|id| id == key_id)
    }
}

fn actor_key(entry: &Value) -> Option<ActorKey> {
    let map = entry.as_object()?;
    let id = map.get("id").and_then(Value::as_str)?;
    let id = Url::parse(id).ok()?;
    let owner = map
        .get("owner")
        .or_else(|| map.get("controller"))
        .and_then(Value::as_str)
        .and_then(|raw| Url::parse(raw).ok());
    let pem = map
        .get("publicKeyPem")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let multibase = map
        .get("publicKeyMultibase")
        .and_then(Value::as_str)
        .map(str::to_owned);
    if pem.is_none() && multibase.is_none() {
        return None;
    }
    Some(ActorKey {
        id,
        owner,
        pem,
        multibase,
    })
}

fn parse_uri(field: &'static str, raw: &str) -> Result<Url, ActivityError> {
    Url::parse(raw).map_err(|_| ActivityError::InvalidUri {
        field,
        value: raw.to_owned(),
    })
}

fn string_values(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    }
}

fn value_entries(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(single) => vec![single],
        None => Vec::new(),
    }
}

fn first_reference(
    value: Option<&Value>,
    field: &'static str,
) -> Result<Option<Url>, ActivityError> {
    let entries = value_entries(value);
    for entry in entries {
        match entry {
            Value::String(raw) => return parse_uri(field, raw).map(Some),
            Value::Object(map) => {
                if let Some(raw) = map.get("id").and_then(Value::as_str) {
                    return parse_uri(field, raw).map(Some);
                }
            }
            _ => {}
        }
    }
    Ok(None)
}

fn recipient_entries(value: Option<&Value>) -> Vec<Recipient> {
    let mut recipients = Vec::new();
    for entry in value_entries(value) {
        match entry {
            Value::String(raw) => {
                if raw == PUBLIC_COLLECTION || raw == "as:Public" || raw == "Public" {
                    recipients.push(Recipient::Public);
                } else if let Ok(url) = Url::parse(raw) {
                    recipients.push(Recipient::Reference(url));
                }
            }
            Value::Object(map) => {
                if map.contains_key("inbox") {
                    if let Ok(actor) = Actor::from_document(entry.clone()) {
                        recipients.push(Recipient::Embedded(Box::new(actor)));
                        continue;
                    }
                }
                if let Some(url) = map
                    .get("id")
                    .and_then(Value::as_str)
                    .and_then(|raw| Url::parse(raw).ok())
                {
                    recipients.push(Recipient::Reference(url));
                }
            }
            _ => {}
        }
    }
    recipients
}

/// Single-parent class hierarchy for listener lookup.
///
/// Listener resolution walks a type's ancestor chain until a registered
/// handler is found, so a listener on `Activity` also receives `Create`.
#[derive(Debug, Clone)]
pub struct TypeHierarchy {
    parents: HashMap<String, String>,
}

impl TypeHierarchy {
    /// The Activity Streams 2.0 core hierarchy.
    #[must_use]
    pub fn activity_streams() -> Self {
        let pairs: &[(&str, &str)] = &[
            ("Activity", "Object"),
            ("IntransitiveActivity", "Activity"),
            ("Accept", "Activity"),
            ("TentativeAccept", "Accept"),
            ("Add", "Activity"),
            ("Announce", "Activity"),
            ("Arrive", "IntransitiveActivity"),
            ("Create", "Activity"),
            ("Delete", "Activity"),
            ("Dislike", "Activity"),
            ("Flag", "Activity"),
            ("Follow", "Activity"),
            ("Ignore", "Activity"),
            ("Block", "Ignore"),
            ("Offer", "Activity"),
            ("Invite", "Offer"),
            ("Join", "Activity"),
            ("Leave", "Activity"),
            ("Like", "Activity"),
            ("Listen", "Activity"),
            ("Move", "Activity"),
            ("Question", "IntransitiveActivity"),
            ("Read", "Activity"),
            ("Reject", "Activity"),
            ("TentativeReject", "Reject"),
            ("Remove", "Activity"),
            ("Travel", "IntransitiveActivity"),
            ("Undo", "Activity"),
            ("Update", "Activity"),
            ("View", "Activity"),
            ("Application", "Object"),
            ("Group", "Object"),
            ("Organization", "Object"),
            ("Person", "Object"),
            ("Service", "Object"),
            ("Collection", "Object"),
            ("OrderedCollection", "Collection"),
            ("CollectionPage", "Collection"),
            ("OrderedCollectionPage", "OrderedCollection"),
        ];
        Self {
            parents: pairs
                .iter()
                .map(|(child, parent)| ((*child).to_owned(), (*parent).to_owned()))
                .collect(),
        }
    }

    /// Registers an extension type under an existing parent.
    pub fn register(&mut self, child: impl Into<String>, parent: impl Into<String>) {
        self.parents.insert(child.into(), parent.into());
    }

    /// The ancestor chain starting at `type_name` itself.
    #[must_use]
    pub fn ancestors<'a>(&'a self, type_name: &'a str) -> Vec<&'a str> {
        let mut chain = vec![type_name];
        let mut current = type_name;
        // Depth cap guards against cyclic extension registrations.
        for _ in 0..32 {
            match self.parents.get(current) {
                Some(parent) => {
                    current = parent;
                    chain.push(current);
                }
                None => break,
            }
        }
        chain
    }

    /// Whether `type_name` equals `ancestor` or derives from it.
    #[must_use]
    pub fn is_subtype(&self, type_name: &str, ancestor: &str) -> bool {
        self.ancestors(type_name).contains(&ancestor)
    }
}

/// Renders an ordered collection document from items.
#[must_use]
pub fn ordered_collection(id: &Url, items: Vec<Value>, total_items: Option<u64>) -> Value {
    let mut object = Map::new();
    object.insert(
        "@context".into(),
        json!("https://www.w3.org/ns/activitystreams"),
    );
    object.insert("id".into(), json!(id.as_str()));
    object.insert("type".into(), json!("OrderedCollection"));
    object.insert(
        "totalItems".into(),
        json!(total_items.unwrap_or(items.len() as u64)),
    );
    object.insert("orderedItems".into(), json!(items));
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_engine_fields_from_an_activity() {
        let activity = Activity::from_document(json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": "https://example.com/create/1",
            "type": "Create",
            "actor": "https://example.com/users/alice",
            "object": {"id": "https://example.com/notes/1", "type": "Note"},
            "to": ["https://remote.example/users/bob"],
            "cc": "https://www.w3.org/ns/activitystreams#Public",
        }))
        .unwrap();

        assert_eq!(activity.id().unwrap().as_str(), "https://example.com/create/1");
        assert_eq!(activity.primary_type(), "Create");
        assert_eq!(
            activity.actor().unwrap().as_str(),
            "https://example.com/users/alice"
        );
        assert_eq!(
            activity.object_id().unwrap().as_str(),
            "https://example.com/notes/1"
        );
        assert_eq!(
            activity.recipients(),
            vec![
                Recipient::Reference(Url::parse("https://remote.example/users/bob").unwrap()),
                Recipient::Public,
            ]
        );
    }

    #[test]
    fn rejects_documents_without_a_type() {
        assert!(matches!(
            Activity::from_document(json!({"id": "https://x.example/1"})),
            Err(ActivityError::MissingType)
        ));
        assert!(matches!(
            Activity::from_document(json!([1, 2])),
            Err(ActivityError::NotAnObject)
        ));
    }

    #[test]
    fn ensure_id_generates_a_urn_once() {
        let mut activity =
            Activity::from_document(json!({"type": "Like", "actor": "https://a.example/u/x"}))
                .unwrap();
        assert!(activity.id().is_none());
        let generated = activity.ensure_id().clone();
        assert!(generated.as_str().starts_with("urn:uuid:"));
        assert_eq!(activity.ensure_id(), &generated);
        assert_eq!(
            activity.document()["id"].as_str().unwrap(),
            generated.as_str()
        );
    }

    #[test]
    fn delivery_document_drops_blind_addressing() {
        let activity = Activity::from_document(json!({
            "id": "https://example.com/create/2",
            "type": "Create",
            "to": ["https://remote.example/users/bob"],
            "bto": ["https://remote.example/users/hidden"],
            "bcc": ["https://remote.example/users/secret"],
        }))
        .unwrap();

        let wire = activity.for_delivery();
        assert!(wire.get("bto").is_none());
        assert!(wire.get("bcc").is_none());
        assert!(wire.get("to").is_some());
        // Blind recipients still count for inbox computation.
        assert_eq!(activity.recipients().len(), 3);
    }

    #[test]
    fn canonical_json_orders_keys() {
        let activity = Activity::from_document(json!({
            "type": "Like",
            "id": "https://example.com/like/1",
            "actor": "https://example.com/users/alice",
        }))
        .unwrap();
        assert_eq!(
            activity.canonical_json(),
            r#"{"actor":"https://example.com/users/alice","id":"https://example.com/like/1","type":"Like"}"#
        );
    }

    #[test]
    fn extracts_actor_inboxes_and_keys() {
        let actor = Actor::from_document(json!({
            "id": "https://example.com/users/alice",
            "type": "Person",
            "inbox": "https://example.com/users/alice/inbox",
            "followers": "https://example.com/users/alice/followers",
            "endpoints": {"sharedInbox": "https://example.com/inbox"},
            "publicKey": {
                "id": "https://example.com/users/alice#main-key",
                "owner": "https://example.com/users/alice",
                "publicKeyPem": "-----BEGIN PUBLIC KEY-----\nAA==\n-----END PUBLIC KEY-----",
            },
            "assertionMethod": [{
                "id": "https://example.com/users/alice#ed-key",
                "controller": "https://example.com/users/alice",
                "publicKeyMultibase": "u6MkpXo",
            }],
        }))
        .unwrap();

        assert_eq!(
            actor.inbox().unwrap().as_str(),
            "https://example.com/users/alice/inbox"
        );
        assert_eq!(actor.shared_inbox().unwrap().as_str(), "https://example.com/inbox");
        assert_eq!(actor.keys().len(), 2);
        assert!(actor.owns_key(&Url::parse("https://example.com/users/alice#main-key").unwrap()));
        assert!(actor.owns_key(&Url::parse("https://example.com/users/alice#ed-key").unwrap()));
        assert!(!actor.owns_key(&Url::parse("https://example.com/users/bob#key").unwrap()));
    }

    #[test]
    fn subtype_resolution_walks_the_ancestor_chain() {
        let hierarchy = TypeHierarchy::activity_streams();
        assert_eq!(
            hierarchy.ancestors("TentativeAccept"),
            vec!["TentativeAccept", "Accept", "Activity", "Object"]
        );
        assert!(hierarchy.is_subtype("Invite", "Offer"));
        assert!(hierarchy.is_subtype("Invite", "Activity"));
        assert!(!hierarchy.is_subtype("Offer", "Invite"));
        assert_eq!(hierarchy.ancestors("CustomThing"), vec!["CustomThing"]);
    }

    #[test]
    fn extension_types_join_the_hierarchy() {
        let mut hierarchy = TypeHierarchy::activity_streams();
        hierarchy.register("EmojiReact", "Like");
        assert!(hierarchy.is_subtype("EmojiReact", "Activity"));
    }
}
