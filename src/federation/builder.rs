//! Builder assembling a [`Federation`] instance.
//!
//! Every dispatcher kind appears exactly once as a builder method; route
//! templates are validated at registration time so malformed templates are
//! caught before the server is up.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::activity::{Activity, TypeHierarchy};
use crate::clock::{SharedClock, SystemClock};
use crate::config::FederationConfig;
use crate::docloader::{DocumentLoader, HttpTransport, SharedTransport};
use crate::error::FederationError;
use crate::inbound::InboundTask;
use crate::kv::SharedKvStore;
use crate::observability::Observer;
use crate::outbound::OutboundTask;
use crate::queue::SharedQueue;
use crate::routes::Router;
use crate::sig::SharedKeyCodec;

use super::facade::{Federation, FederationInner};
use super::{
    Collection, CollectionEntry, Context, DispatchError, InboxListener, NodeInfo, Registries,
    WebFingerLink, route,
};

/// External collaborators injected into the facade.
pub struct FederationDeps {
    /// Store for idempotency, caches, and delivery state.
    pub kv: SharedKvStore,
    /// Queue backing both pipelines.
    pub queue: SharedQueue,
    /// Codec turning published key material into verifiers.
    pub codec: SharedKeyCodec,
    /// HTTP transport; defaults to the reqwest-backed one.
    pub transport: Option<SharedTransport>,
    /// Time source; defaults to the system clock.
    pub clock: Option<SharedClock>,
}

/// Typed collection of inbox listeners, one per activity type.
///
/// Dispatch resolves sub-types: a listener on `"Activity"` receives every
/// activity without a more specific listener.
pub struct InboxListeners<T> {
    pub(crate) handlers: HashMap<String, InboxListener<T>>,
}

impl<T> Default for InboxListeners<T> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<T> InboxListeners<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty listener set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for `type_name` (replacing any previous one).
    #[must_use]
    pub fn on<F, Fut>(mut self, type_name: &str, listener: F) -> Self
    where
        F: Fn(Context<T>, Activity) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        self.handlers.insert(
            type_name.to_owned(),
            Arc::new(move |context, activity| Box::pin(listener(context, activity))),
        );
        self
    }
}

/// Assembles a [`Federation`].
pub struct FederationBuilder<T> {
    config: FederationConfig,
    router: Router,
    registries: Registries<T>,
    hierarchy: TypeHierarchy,
    observers: Vec<Arc<dyn Observer<T>>>,
}

impl<T> FederationBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Starts a builder with the given configuration.
    #[must_use]
    pub fn new(config: FederationConfig) -> Self {
        let router = if config.trailing_slash_insensitive {
            Router::trailing_slash_insensitive()
        } else {
            Router::new()
        };
        Self {
            config,
            router,
            registries: Registries::default(),
            hierarchy: TypeHierarchy::activity_streams(),
            observers: Vec::new(),
        }
    }

    /// Registers the actor dispatcher at `template`, which must bind
    /// `{identifier}`.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] on malformed templates or a template
    /// without the `identifier` variable.
    pub fn set_actor_dispatcher<F, Fut>(
        mut self,
        template: &str,
        dispatcher: F,
    ) -> Result<Self, FederationError>
    where
        F: Fn(Context<T>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, DispatchError>> + Send + 'static,
    {
        let variables = self.router.add(template, route::ACTOR)?;
        if !variables.contains("identifier") {
            return Err(FederationError::Registration {
                reason: format!("actor template {template:?} does not bind {{identifier}}"),
            });
        }
        self.registries.actor = Some(Arc::new(move |context, identifier| {
            Box::pin(dispatcher(context, identifier))
        }));
        Ok(self)
    }

    /// Registers an object dispatcher for `type_name` at `template`.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] on malformed templates.
    pub fn set_object_dispatcher<F, Fut>(
        mut self,
        type_name: &str,
        template: &str,
        dispatcher: F,
    ) -> Result<Self, FederationError>
    where
        F: Fn(Context<T>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, DispatchError>> + Send + 'static,
    {
        let name = format!("{}{type_name}", route::OBJECT_PREFIX);
        self.router.add(template, &name)?;
        self.registries.objects.insert(
            type_name.to_owned(),
            Arc::new(move |context, variables| Box::pin(dispatcher(context, variables))),
        );
        Ok(self)
    }

    /// Registers the inbox listeners and their routes: the per-actor inbox
    /// template (binding `{identifier}`) and optionally the shared inbox.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] on malformed templates or a per-actor
    /// template without the `identifier` variable.
    pub fn set_inbox_listeners(
        mut self,
        inbox_template: &str,
        shared_inbox_template: Option<&str>,
        listeners: InboxListeners<T>,
    ) -> Result<Self, FederationError> {
        let variables = self.router.add(inbox_template, route::INBOX)?;
        if !variables.contains("identifier") {
            return Err(FederationError::Registration {
                reason: format!("inbox template {inbox_template:?} does not bind {{identifier}}"),
            });
        }
        if let Some(shared) = shared_inbox_template {
            self.router.add(shared, route::SHARED_INBOX)?;
        }
        self.registries.inbox_listeners = listeners.handlers;
        Ok(self)
    }

    /// Registers the inbox collection dispatcher (GET on the inbox route).
    #[must_use]
    pub fn set_inbox_dispatcher<F, Fut>(mut self, dispatcher: F) -> Self
    where
        F: Fn(Context<T>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Collection>, DispatchError>> + Send + 'static,
    {
        self.registries.inbox_collection = Some(Arc::new(move |context, variables| {
            Box::pin(dispatcher(context, variables))
        }));
        self
    }

    /// Registers the outbox dispatcher at `template`.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] on malformed templates.
    pub fn set_outbox_dispatcher<F, Fut>(
        self,
        template: &str,
        dispatcher: F,
    ) -> Result<Self, FederationError>
    where
        F: Fn(Context<T>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Collection>, DispatchError>> + Send + 'static,
    {
        self.set_standard_collection(route::OUTBOX, template, dispatcher)
    }

    /// Registers the following dispatcher at `template`.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] on malformed templates.
    pub fn set_following_dispatcher<F, Fut>(
        self,
        template: &str,
        dispatcher: F,
    ) -> Result<Self, FederationError>
    where
        F: Fn(Context<T>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Collection>, DispatchError>> + Send + 'static,
    {
        self.set_standard_collection(route::FOLLOWING, template, dispatcher)
    }

    /// Registers the followers dispatcher at `template`. Besides serving
    /// GETs, it feeds follower-collection fan-out for `send_activity`.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] on malformed templates.
    pub fn set_followers_dispatcher<F, Fut>(
        self,
        template: &str,
        dispatcher: F,
    ) -> Result<Self, FederationError>
    where
        F: Fn(Context<T>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Collection>, DispatchError>> + Send + 'static,
    {
        self.set_standard_collection(route::FOLLOWERS, template, dispatcher)
    }

    /// Registers the liked dispatcher at `template`.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] on malformed templates.
    pub fn set_liked_dispatcher<F, Fut>(
        self,
        template: &str,
        dispatcher: F,
    ) -> Result<Self, FederationError>
    where
        F: Fn(Context<T>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Collection>, DispatchError>> + Send + 'static,
    {
        self.set_standard_collection(route::LIKED, template, dispatcher)
    }

    /// Registers the featured dispatcher at `template`.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] on malformed templates.
    pub fn set_featured_dispatcher<F, Fut>(
        self,
        template: &str,
        dispatcher: F,
    ) -> Result<Self, FederationError>
    where
        F: Fn(Context<T>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Collection>, DispatchError>> + Send + 'static,
    {
        self.set_standard_collection(route::FEATURED, template, dispatcher)
    }

    /// Registers the featured-tags dispatcher at `template`.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] on malformed templates.
    pub fn set_featured_tags_dispatcher<F, Fut>(
        self,
        template: &str,
        dispatcher: F,
    ) -> Result<Self, FederationError>
    where
        F: Fn(Context<T>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Collection>, DispatchError>> + Send + 'static,
    {
        self.set_standard_collection(route::FEATURED_TAGS, template, dispatcher)
    }

    /// Registers a custom unordered collection endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] on malformed templates.
    pub fn set_collection_dispatcher<F, Fut>(
        self,
        name: &str,
        template: &str,
        dispatcher: F,
    ) -> Result<Self, FederationError>
    where
        F: Fn(Context<T>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Collection>, DispatchError>> + Send + 'static,
    {
        self.set_custom_collection(name, template, dispatcher, false)
    }

    /// Registers a custom ordered collection endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] on malformed templates.
    pub fn set_ordered_collection_dispatcher<F, Fut>(
        self,
        name: &str,
        template: &str,
        dispatcher: F,
    ) -> Result<Self, FederationError>
    where
        F: Fn(Context<T>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Collection>, DispatchError>> + Send + 'static,
    {
        self.set_custom_collection(name, template, dispatcher, true)
    }

    /// Registers the node-info dispatcher and its well-known routes.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] when the well-known routes cannot be
    /// registered.
    pub fn set_node_info_dispatcher<F, Fut>(
        mut self,
        dispatcher: F,
    ) -> Result<Self, FederationError>
    where
        F: Fn(Context<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NodeInfo, DispatchError>> + Send + 'static,
    {
        self.router
            .add("/.well-known/nodeinfo", route::NODEINFO_DISCOVERY)?;
        self.router.add("/nodeinfo/2.1", route::NODEINFO)?;
        self.registries.node_info =
            Some(Arc::new(move |context| Box::pin(dispatcher(context))));
        Ok(self)
    }

    /// Registers the WebFinger extra-links dispatcher.
    #[must_use]
    pub fn set_webfinger_links_dispatcher<F, Fut>(mut self, dispatcher: F) -> Self
    where
        F: Fn(Context<T>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<WebFingerLink>, DispatchError>> + Send + 'static,
    {
        self.registries.webfinger_links = Some(Arc::new(move |context, identifier| {
            Box::pin(dispatcher(context, identifier))
        }));
        self
    }

    /// Registers the handler called when outbound delivery attempts are
    /// exhausted.
    #[must_use]
    pub fn set_outbox_permanent_failure_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(OutboundTask, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.registries.outbox_failure = Some(Arc::new(move |task, body| {
            Box::pin(handler(task, body))
        }));
        self
    }

    /// Registers the handler called when inbound dispatch attempts are
    /// exhausted.
    #[must_use]
    pub fn set_inbox_permanent_failure_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(InboundTask, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.registries.inbox_failure = Some(Arc::new(move |task, reason| {
            Box::pin(handler(task, reason))
        }));
        self
    }

    /// Adds an observer; more can be added on the facade later.
    #[must_use]
    pub fn add_observer(mut self, observer: Arc<dyn Observer<T>>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Adds an extension activity type under an existing parent so listener
    /// resolution can walk through it.
    #[must_use]
    pub fn register_activity_type(mut self, child: &str, parent: &str) -> Self {
        self.hierarchy.register(child, parent);
        self
    }

    /// Finishes the facade with its injected collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] when the well-known WebFinger route
    /// cannot be registered.
    pub fn build(mut self, deps: FederationDeps) -> Result<Federation<T>, FederationError> {
        self.router.add("/.well-known/webfinger", route::WEBFINGER)?;

        let transport = deps
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new(&self.config.user_agent)));
        let clock = deps.clock.unwrap_or_else(SystemClock::shared);
        let loader = DocumentLoader::builder(Arc::clone(&deps.kv))
            .transport(Arc::clone(&transport))
            .user_agent(self.config.user_agent.clone())
            .allow_private_address(self.config.allow_private_address)
            .build();

        Ok(Federation::from_inner(FederationInner {
            config: self.config,
            router: self.router,
            registries: self.registries,
            hierarchy: self.hierarchy,
            kv: deps.kv,
            queue: deps.queue,
            codec: deps.codec,
            transport,
            clock,
            loader,
            key_ring: Arc::new(DashMap::new()),
            observers: std::sync::RwLock::new(self.observers),
        }))
    }

    fn set_standard_collection<F, Fut>(
        mut self,
        route_name: &str,
        template: &str,
        dispatcher: F,
    ) -> Result<Self, FederationError>
    where
        F: Fn(Context<T>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Collection>, DispatchError>> + Send + 'static,
    {
        self.router.add(template, route_name)?;
        let boxed: super::CollectionDispatcher<T> = Arc::new(move |context, variables| {
            Box::pin(dispatcher(context, variables))
        });
        let slot = match route_name {
            route::OUTBOX => &mut self.registries.outbox,
            route::FOLLOWING => &mut self.registries.following,
            route::FOLLOWERS => &mut self.registries.followers,
            route::LIKED => &mut self.registries.liked,
            route::FEATURED => &mut self.registries.featured,
            route::FEATURED_TAGS => &mut self.registries.featured_tags,
            _ => unreachable!("standard collection route names are fixed"),
        };
        *slot = Some(boxed);
        Ok(self)
    }

    fn set_custom_collection<F, Fut>(
        mut self,
        name: &str,
        template: &str,
        dispatcher: F,
        ordered: bool,
    ) -> Result<Self, FederationError>
    where
        F: Fn(Context<T>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Collection>, DispatchError>> + Send + 'static,
    {
        let route_name = format!("{}{name}", route::COLLECTION_PREFIX);
        self.router.add(template, &route_name)?;
        self.registries.collections.insert(
            name.to_owned(),
            CollectionEntry {
                dispatcher: Arc::new(move |context, variables| {
                    Box::pin(dispatcher(context, variables))
                }),
                ordered,
            },
        );
        Ok(self)
    }
}
