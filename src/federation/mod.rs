//! Federation facade: dispatcher registries, per-request contexts, and the
//! single HTTP entrypoint.
//!
//! Hosts configure a [`FederationBuilder`] — each dispatcher kind is
//! enumerated exactly once on the builder — then drive everything through
//! [`Federation::fetch`] for HTTP and [`Context`] for outbound calls.

mod builder;
mod context;
mod facade;

pub use builder::{FederationBuilder, FederationDeps, InboxListeners};
pub use context::{Context, Recipients, SendOptions, Sender};
pub use facade::{FallbackHandler, Federation, FetchOptions};

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::activity::Activity;
use crate::inbound::InboundTask;
use crate::outbound::OutboundFailureHandler;

/// Error a dispatcher or listener may surface.
pub type DispatchError = Box<dyn std::error::Error + Send + Sync>;

/// Produces the actor document for an identifier, or `None` when the
/// account does not exist.
pub type ActorDispatcher<T> = Arc<
    dyn Fn(Context<T>, String) -> BoxFuture<'static, Result<Option<Value>, DispatchError>>
        + Send
        + Sync,
>;

/// Produces an object document from the route variables.
pub type ObjectDispatcher<T> = Arc<
    dyn Fn(
            Context<T>,
            HashMap<String, String>,
        ) -> BoxFuture<'static, Result<Option<Value>, DispatchError>>
        + Send
        + Sync,
>;

/// Items and count backing a collection endpoint.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    /// The (page of) items.
    pub items: Vec<Value>,
    /// Total item count, when cheaper than `items.len()`.
    pub total_items: Option<u64>,
}

/// Produces a collection for the route variables, or `None` when the
/// owner does not exist.
pub type CollectionDispatcher<T> = Arc<
    dyn Fn(
            Context<T>,
            HashMap<String, String>,
        ) -> BoxFuture<'static, Result<Option<Collection>, DispatchError>>
        + Send
        + Sync,
>;

/// Handles one inbound activity for a recipient.
pub type InboxListener<T> = Arc<
    dyn Fn(Context<T>, Activity) -> BoxFuture<'static, Result<(), DispatchError>> + Send + Sync,
>;

/// Software and usage statistics rendered at `/nodeinfo/2.1`.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Software name (lowercase, no spaces).
    pub software_name: String,
    /// Software version.
    pub software_version: String,
    /// Total registered users, when known.
    pub total_users: Option<u64>,
    /// Local post count, when known.
    pub local_posts: Option<u64>,
}

impl NodeInfo {
    /// Renders the NodeInfo 2.1 document.
    #[must_use]
    pub fn to_document(&self) -> Value {
        serde_json::json!({
            "version": "2.1",
            "software": {
                "name": self.software_name,
                "version": self.software_version,
            },
            "protocols": ["activitypub"],
            "services": {"inbound": [], "outbound": []},
            "openRegistrations": false,
            "usage": {
                "users": {"total": self.total_users.unwrap_or(0)},
                "localPosts": self.local_posts.unwrap_or(0),
            },
            "metadata": {},
        })
    }
}

/// Produces the instance's node info.
pub type NodeInfoDispatcher<T> =
    Arc<dyn Fn(Context<T>) -> BoxFuture<'static, Result<NodeInfo, DispatchError>> + Send + Sync>;

/// One extra link contributed to a WebFinger response.
#[derive(Debug, Clone)]
pub struct WebFingerLink {
    /// Link relation.
    pub rel: String,
    /// Media type, when any.
    pub media_type: Option<String>,
    /// Target, when any.
    pub href: Option<String>,
}

impl WebFingerLink {
    fn to_document(&self) -> Value {
        let mut object = serde_json::Map::new();
        object.insert("rel".into(), serde_json::json!(self.rel));
        if let Some(media_type) = &self.media_type {
            object.insert("type".into(), serde_json::json!(media_type));
        }
        if let Some(href) = &self.href {
            object.insert("href".into(), serde_json::json!(href));
        }
        Value::Object(object)
    }
}

/// Produces extra WebFinger links for an identifier.
pub type WebFingerLinksDispatcher<T> = Arc<
    dyn Fn(Context<T>, String) -> BoxFuture<'static, Result<Vec<WebFingerLink>, DispatchError>>
        + Send
        + Sync,
>;

/// Called when inbound dispatch attempts are exhausted, with the task and
/// the terminal failure description.
pub type InboundFailureHandler =
    Arc<dyn Fn(InboundTask, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Route names the facade registers on the router.
pub(crate) mod route {
    pub const ACTOR: &str = "actor";
    pub const INBOX: &str = "inbox";
    pub const SHARED_INBOX: &str = "sharedInbox";
    pub const OUTBOX: &str = "outbox";
    pub const FOLLOWING: &str = "following";
    pub const FOLLOWERS: &str = "followers";
    pub const LIKED: &str = "liked";
    pub const FEATURED: &str = "featured";
    pub const FEATURED_TAGS: &str = "featuredTags";
    pub const WEBFINGER: &str = "webfinger";
    pub const NODEINFO_DISCOVERY: &str = "nodeinfoDiscovery";
    pub const NODEINFO: &str = "nodeinfo";
    /// Object routes are named `object:{typeName}`.
    pub const OBJECT_PREFIX: &str = "object:";
    /// Custom collection routes are named `collection:{name}`.
    pub const COLLECTION_PREFIX: &str = "collection:";
}

/// A registered custom collection endpoint.
pub(crate) struct CollectionEntry<T> {
    pub dispatcher: CollectionDispatcher<T>,
    /// Rendered as `OrderedCollection` when set, `Collection` otherwise.
    pub ordered: bool,
}

/// Everything the builder registers, owned by the facade afterwards.
pub(crate) struct Registries<T> {
    pub actor: Option<ActorDispatcher<T>>,
    pub objects: HashMap<String, ObjectDispatcher<T>>,
    pub inbox_collection: Option<CollectionDispatcher<T>>,
    pub outbox: Option<CollectionDispatcher<T>>,
    pub following: Option<CollectionDispatcher<T>>,
    pub followers: Option<CollectionDispatcher<T>>,
    pub liked: Option<CollectionDispatcher<T>>,
    pub featured: Option<CollectionDispatcher<T>>,
    pub featured_tags: Option<CollectionDispatcher<T>>,
    pub collections: HashMap<String, CollectionEntry<T>>,
    pub inbox_listeners: HashMap<String, InboxListener<T>>,
    pub node_info: Option<NodeInfoDispatcher<T>>,
    pub webfinger_links: Option<WebFingerLinksDispatcher<T>>,
    pub outbox_failure: Option<OutboundFailureHandler>,
    pub inbox_failure: Option<InboundFailureHandler>,
}

impl<T> Default for Registries<T> {
    fn default() -> Self {
        Self {
            actor: None,
            objects: HashMap::new(),
            inbox_collection: None,
            outbox: None,
            following: None,
            followers: None,
            liked: None,
            featured: None,
            featured_tags: None,
            collections: HashMap::new(),
            inbox_listeners: HashMap::new(),
            node_info: None,
            webfinger_links: None,
            outbox_failure: None,
            inbox_failure: None,
        }
    }
}
