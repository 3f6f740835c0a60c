//! The federation facade: the single HTTP entrypoint and the engine
//! driving both pipelines.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use http::{Method, Request, Response, StatusCode};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::activity::{Activity, Actor, Recipient, TypeHierarchy, ordered_collection};
use crate::clock::SharedClock;
use crate::config::FederationConfig;
use crate::docloader::{DocumentLoader, SharedTransport};
use crate::error::FederationError;
use crate::inbound::{DEDUP_TTL, InboundTask, dedup_key, resolve_listener_type};
use crate::kv::SharedKvStore;
use crate::observability::{self, Observer};
use crate::outbound::{
    DeliveryEngine, OutboundTask, delivery_ordering_key, extract_inboxes, resolve_recipients,
};
use crate::queue::{EnqueueOptions, SharedQueue};
use crate::routes::{RouteMatch, Router};
use crate::sig::{SharedKeyCodec, VerifyOptions, verify_document_proof, verify_key_ownership,
    verify_request};
use crate::worker::TaskEnvelope;

use super::context::{Context, Recipients, SendOptions, Sender};
use super::{Collection, Registries, route};

/// Media type served for ActivityPub documents.
const ACTIVITY_JSON: &str = "application/activity+json";

/// Host fallback invoked for unmatched or unacceptable requests.
pub type FallbackHandler =
    Arc<dyn Fn() -> BoxFuture<'static, Response<Bytes>> + Send + Sync>;

/// Options accepted by [`Federation::fetch`].
pub struct FetchOptions<T> {
    /// Per-request host data.
    pub context_data: T,
    /// Invoked when no route matches; defaults to a plain 404.
    pub on_not_found: Option<FallbackHandler>,
    /// Invoked when a route matches but the Accept header rules out
    /// JSON-LD. A non-404 response from the handler is returned as-is;
    /// otherwise the engine answers 406.
    pub on_not_acceptable: Option<FallbackHandler>,
}

impl<T> FetchOptions<T> {
    /// Options with both fallbacks defaulted.
    #[must_use]
    pub fn new(context_data: T) -> Self {
        Self {
            context_data,
            on_not_found: None,
            on_not_acceptable: None,
        }
    }
}

pub(crate) struct FederationInner<T> {
    pub config: FederationConfig,
    pub router: Router,
    pub registries: Registries<T>,
    pub hierarchy: TypeHierarchy,
    pub kv: SharedKvStore,
    pub queue: SharedQueue,
    pub codec: SharedKeyCodec,
    pub transport: SharedTransport,
    pub clock: SharedClock,
    pub loader: DocumentLoader,
    pub key_ring: Arc<DashMap<Url, crate::sig::KeyPair>>,
    pub observers: RwLock<Vec<Arc<dyn Observer<T>>>>,
}

/// The federation facade.
///
/// Cheap to clone; all clones share one engine.
pub struct Federation<T> {
    inner: Arc<FederationInner<T>>,
}

impl<T> Clone for Federation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Federation<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn from_inner(inner: FederationInner<T>) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn router(&self) -> &Router {
        &self.inner.router
    }

    pub(crate) fn loader(&self) -> &DocumentLoader {
        &self.inner.loader
    }

    pub(crate) fn queue(&self) -> SharedQueue {
        Arc::clone(&self.inner.queue)
    }

    /// Creates a context for `origin` carrying `data`.
    #[must_use]
    pub fn create_context(&self, origin: Url, data: T) -> Context<T> {
        Context {
            federation: self.clone(),
            origin,
            data,
        }
    }

    /// Appends an observer to the facade's observer list.
    pub fn add_observer(&self, observer: Arc<dyn Observer<T>>) {
        self.inner
            .observers
            .write()
            .expect("observer list poisoned")
            .push(observer);
    }

    /// Attaches the configured number of workers to the queue and runs
    /// them until `cancel` fires; resolves after in-flight work drains.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] when the queue fails.
    pub async fn start_queue(&self, data: T, cancel: CancellationToken) -> Result<(), FederationError> {
        crate::worker::run_workers(
            self.clone(),
            data,
            self.inner.config.worker_count.as_usize(),
            cancel,
        )
        .await
        .map_err(FederationError::from)
    }

    /// Executes one queued task envelope immediately, for hosts that run
    /// their own workers.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] on infrastructure failures (store,
    /// queue); task-level delivery failures are rescheduled instead.
    pub async fn process_queued_task(
        &self,
        data: T,
        envelope: TaskEnvelope,
    ) -> Result<(), FederationError> {
        match envelope {
            TaskEnvelope::Outbound(task) => {
                self.delivery_engine().deliver(task).await.map_err(Into::into)
            }
            TaskEnvelope::Inbound(task) => self.process_inbound(data, task).await,
        }
    }

    /// The single HTTP entrypoint: routes, negotiates, and dispatches.
    pub async fn fetch(&self, request: Request<Bytes>, options: FetchOptions<T>) -> Response<Bytes> {
        let Some(origin) = request_origin(&request) else {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid-request",
                "request carries no usable origin",
                None,
            );
        };
        let context = self.create_context(origin, options.context_data.clone());

        let path = request.uri().path().to_owned();
        let Some(matched) = self.inner.router.route(&path) else {
            return not_found(&options).await;
        };

        let get = request.method() == Method::GET;
        let post = request.method() == Method::POST;
        match matched.name.as_str() {
            route::WEBFINGER if get => self.handle_webfinger(&context, &request).await,
            route::NODEINFO_DISCOVERY if get => self.handle_nodeinfo_discovery(&context),
            route::NODEINFO if get => self.handle_nodeinfo(&context).await,
            route::INBOX | route::SHARED_INBOX if post => {
                self.handle_inbox_post(&context, &request, &matched).await
            }
            _ if get => {
                if !accepts_json_ld(&request) {
                    return not_acceptable(&options).await;
                }
                self.handle_get_dispatch(&context, &request, &matched, &options)
                    .await
            }
            _ => error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "method-not-allowed",
                "this endpoint does not support the request method",
                None,
            ),
        }
    }

    async fn handle_get_dispatch(
        &self,
        context: &Context<T>,
        request: &Request<Bytes>,
        matched: &RouteMatch,
        options: &FetchOptions<T>,
    ) -> Response<Bytes> {
        match matched.name.as_str() {
            route::ACTOR => self.handle_actor(context, matched, options).await,
            route::INBOX => {
                match &self.inner.registries.inbox_collection {
                    Some(dispatcher) => {
                        self.render_collection(
                            context,
                            request,
                            dispatcher.clone(),
                            matched.variables.clone(),
                            true,
                            options,
                        )
                        .await
                    }
                    None => error_response(
                        StatusCode::METHOD_NOT_ALLOWED,
                        "method-not-allowed",
                        "the inbox accepts POST only",
                        None,
                    ),
                }
            }
            name if name.starts_with(route::OBJECT_PREFIX) => {
                let type_name = &name[route::OBJECT_PREFIX.len()..];
                let Some(dispatcher) = self.inner.registries.objects.get(type_name).cloned()
                else {
                    return not_found(options).await;
                };
                match dispatcher(context.clone(), matched.variables.clone()).await {
                    Ok(Some(document)) => json_response(StatusCode::OK, &document, ACTIVITY_JSON),
                    Ok(None) => not_found(options).await,
                    Err(error) => internal_error("object dispatcher failed", &error),
                }
            }
            name if name.starts_with(route::COLLECTION_PREFIX) => {
                let collection_name = &name[route::COLLECTION_PREFIX.len()..];
                let Some(entry) = self.inner.registries.collections.get(collection_name) else {
                    return not_found(options).await;
                };
                let dispatcher = entry.dispatcher.clone();
                let ordered = entry.ordered;
                self.render_collection(
                    context,
                    request,
                    dispatcher,
                    matched.variables.clone(),
                    ordered,
                    options,
                )
                .await
            }
            name => {
                let dispatcher = match name {
                    route::OUTBOX => self.inner.registries.outbox.clone(),
                    route::FOLLOWING => self.inner.registries.following.clone(),
                    route::FOLLOWERS => self.inner.registries.followers.clone(),
                    route::LIKED => self.inner.registries.liked.clone(),
                    route::FEATURED => self.inner.registries.featured.clone(),
                    route::FEATURED_TAGS => self.inner.registries.featured_tags.clone(),
                    _ => None,
                };
                match dispatcher {
                    Some(dispatcher) => {
                        self.render_collection(
                            context,
                            request,
                            dispatcher,
                            matched.variables.clone(),
                            true,
                            options,
                        )
                        .await
                    }
                    None => not_found(options).await,
                }
            }
        }
    }

    async fn handle_actor(
        &self,
        context: &Context<T>,
        matched: &RouteMatch,
        options: &FetchOptions<T>,
    ) -> Response<Bytes> {
        let Some(dispatcher) = self.inner.registries.actor.clone() else {
            return not_found(options).await;
        };
        let identifier = matched
            .variables
            .get("identifier")
            .cloned()
            .unwrap_or_default();
        match dispatcher(context.clone(), identifier.clone()).await {
            Ok(Some(document)) => {
                // The dispatcher must produce the id this route derives for
                // the identifier; a mismatch federates inconsistent ids and
                // is a programmer error.
                if let Ok(expected) = context.actor_uri(&identifier) {
                    let actual = document.get("id").and_then(Value::as_str);
                    if actual != Some(expected.as_str()) {
                        tracing::error!(
                            identifier = %identifier,
                            expected = %expected,
                            actual = ?actual,
                            "actor dispatcher produced a mismatched actor id",
                        );
                    }
                }
                json_response(StatusCode::OK, &document, ACTIVITY_JSON)
            }
            Ok(None) => not_found(options).await,
            Err(error) => internal_error("actor dispatcher failed", &error),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn render_collection(
        &self,
        context: &Context<T>,
        request: &Request<Bytes>,
        dispatcher: super::CollectionDispatcher<T>,
        variables: HashMap<String, String>,
        ordered: bool,
        options: &FetchOptions<T>,
    ) -> Response<Bytes> {
        match dispatcher(context.clone(), variables).await {
            Ok(Some(collection)) => {
                let id = context
                    .origin()
                    .join(request.uri().path())
                    .unwrap_or_else(|_| context.origin().clone());
                let mut document = ordered_collection(&id, collection.items, collection.total_items);
                if !ordered {
                    if let Some(object) = document.as_object_mut() {
                        object.insert("type".into(), json!("Collection"));
                        if let Some(items) = object.remove("orderedItems") {
                            object.insert("items".into(), items);
                        }
                    }
                }
                json_response(StatusCode::OK, &document, ACTIVITY_JSON)
            }
            Ok(None) => not_found(options).await,
            Err(error) => internal_error("collection dispatcher failed", &error),
        }
    }

    async fn handle_nodeinfo(&self, context: &Context<T>) -> Response<Bytes> {
        let Some(dispatcher) = self.inner.registries.node_info.clone() else {
            return error_response(
                StatusCode::NOT_FOUND,
                "not-found",
                "node info is not configured",
                None,
            );
        };
        match dispatcher(context.clone()).await {
            Ok(info) => json_response(StatusCode::OK, &info.to_document(), "application/json"),
            Err(error) => internal_error("node info dispatcher failed", &error),
        }
    }

    fn handle_nodeinfo_discovery(&self, context: &Context<T>) -> Response<Bytes> {
        let href = context
            .origin()
            .join("/nodeinfo/2.1")
            .map(|url| url.to_string())
            .unwrap_or_default();
        let document = json!({
            "links": [{
                "rel": "http://nodeinfo.diaspora.software/ns/schema/2.1",
                "href": href,
            }],
        });
        json_response(StatusCode::OK, &document, "application/json")
    }

    async fn handle_webfinger(
        &self,
        context: &Context<T>,
        request: &Request<Bytes>,
    ) -> Response<Bytes> {
        let resource = request.uri().query().and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(name, _)| name == "resource")
                .map(|(_, value)| value.into_owned())
        });
        let Some(resource) = resource else {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid-request",
                "webfinger requires a resource parameter",
                None,
            );
        };

        let Some(identifier) = self.webfinger_identifier(context, &resource) else {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid-request",
                "unsupported webfinger resource",
                None,
            );
        };
        let Some(dispatcher) = self.inner.registries.actor.clone() else {
            return error_response(StatusCode::NOT_FOUND, "not-found", "no such account", None);
        };
        match dispatcher(context.clone(), identifier.clone()).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return error_response(StatusCode::NOT_FOUND, "not-found", "no such account", None);
            }
            Err(error) => return internal_error("actor dispatcher failed", &error),
        }

        let Ok(actor_uri) = context.actor_uri(&identifier) else {
            return error_response(
                StatusCode::NOT_FOUND,
                "not-found",
                "actor route is not configured",
                None,
            );
        };
        let mut links = vec![json!({
            "rel": "self",
            "type": ACTIVITY_JSON,
            "href": actor_uri.as_str(),
        })];
        if let Some(extra) = self.inner.registries.webfinger_links.clone() {
            match extra(context.clone(), identifier.clone()).await {
                Ok(extra_links) => {
                    links.extend(extra_links.iter().map(super::WebFingerLink::to_document));
                }
                Err(error) => {
                    tracing::warn!(%error, "webfinger links dispatcher failed");
                }
            }
        }
        let host = context.origin().host_str().unwrap_or_default();
        let document = json!({
            "subject": format!("acct:{identifier}@{host}"),
            "aliases": [actor_uri.as_str()],
            "links": links,
        });
        json_response(StatusCode::OK, &document, "application/jrd+json")
    }

    fn webfinger_identifier(&self, context: &Context<T>, resource: &str) -> Option<String> {
        if let Some(account) = resource.strip_prefix("acct:") {
            let (identifier, host) = account.split_once('@')?;
            if Some(host) != context.origin().host_str() {
                return None;
            }
            return Some(identifier.to_owned());
        }
        let url = Url::parse(resource).ok()?;
        if url.origin() != context.origin().origin() {
            return None;
        }
        let matched = self.inner.router.route(url.path())?;
        if matched.name != route::ACTOR {
            return None;
        }
        matched.variables.get("identifier").cloned()
    }

    /// Inbound steps 1–5: parse, authenticate, deduplicate, enqueue.
    async fn handle_inbox_post(
        &self,
        context: &Context<T>,
        request: &Request<Bytes>,
        matched: &RouteMatch,
    ) -> Response<Bytes> {
        let document: Value = match serde_json::from_slice(request.body()) {
            Ok(document) => document,
            Err(source) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid-activity",
                    &format!("request body is not valid JSON: {source}"),
                    None,
                );
            }
        };
        let activity = match Activity::from_document(document.clone()) {
            Ok(activity) => activity,
            Err(source) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid-activity",
                    &source.to_string(),
                    None,
                );
            }
        };
        let Some(activity_id) = activity.id().cloned() else {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid-activity",
                "activity carries no id",
                None,
            );
        };

        let recipient = matched
            .variables
            .get("identifier")
            .cloned()
            .unwrap_or_default();
        if !recipient.is_empty() {
            if let Some(dispatcher) = self.inner.registries.actor.clone() {
                match dispatcher(context.clone(), recipient.clone()).await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        return error_response(
                            StatusCode::NOT_FOUND,
                            "not-found",
                            "no such inbox",
                            Some(&activity_id),
                        );
                    }
                    Err(error) => return internal_error("actor dispatcher failed", &error),
                }
            }
        }

        let mut signing_key_id = None;
        if self.inner.config.skip_signature_verification {
            tracing::debug!("signature verification skipped by configuration");
        } else {
            let verify_options = VerifyOptions {
                loader: &self.inner.loader,
                kv: self.inner.kv.as_ref(),
                codec: self.inner.codec.as_ref(),
                profiles: None,
                current_time: self.inner.clock.now(),
                time_window: self.inner.config.time_window,
            };
            let key = match verify_request(request, &verify_options).await {
                Ok(Some(key)) => Some(key),
                Ok(None) => None,
                Err(error) => {
                    tracing::debug!(%error, "HTTP signature rejected, trying document proof");
                    None
                }
            };
            let key = match key {
                Some(key) => Some(key),
                None => match verify_document_proof(&document, &verify_options).await {
                    Ok(found) => found,
                    Err(error) => {
                        tracing::debug!(%error, "document proof rejected");
                        None
                    }
                },
            };
            let Some(key) = key else {
                return error_response(
                    StatusCode::UNAUTHORIZED,
                    "authentication-failed",
                    "no verifiable signature or integrity proof",
                    Some(&activity_id),
                );
            };
            let Some(actor_id) = activity.actor() else {
                return error_response(
                    StatusCode::UNAUTHORIZED,
                    "authentication-failed",
                    "activity names no actor to authenticate",
                    Some(&activity_id),
                );
            };
            match verify_key_ownership(actor_id, &key, &self.inner.loader).await {
                Ok(_) => signing_key_id = Some(key.id),
                Err(error) => {
                    return error_response(
                        StatusCode::UNAUTHORIZED,
                        "authentication-failed",
                        &error.to_string(),
                        Some(&activity_id),
                    );
                }
            }
        }

        let marker_key = dedup_key(&recipient, &activity_id);
        match self.inner.kv.get(&marker_key).await {
            Ok(Some(_)) => return accepted(&activity_id),
            Ok(None) => {}
            Err(error) => return infra_error(&error, Some(&activity_id)),
        }
        match self
            .inner
            .kv
            .cas(&marker_key, None, json!(true), Some(DEDUP_TTL))
            .await
        {
            // Another replica accepted this activity first.
            Ok(false) => return accepted(&activity_id),
            Ok(true) => {}
            Err(error) => return infra_error(&error, Some(&activity_id)),
        }

        let task = InboundTask {
            recipient,
            activity: document,
            signing_key_id,
            origin: context.origin().clone(),
            trace_context: HashMap::new(),
            attempt: 0,
        };
        let payload = match serde_json::to_value(TaskEnvelope::Inbound(task)) {
            Ok(payload) => payload,
            Err(error) => return infra_error(&error, Some(&activity_id)),
        };
        if let Err(error) = self
            .inner
            .queue
            .enqueue(payload, EnqueueOptions::default())
            .await
        {
            return infra_error(&error, Some(&activity_id));
        }
        accepted(&activity_id)
    }

    /// Inbound steps 6–7: listener dispatch with retry and observer
    /// fan-out, executed by a queue worker.
    async fn process_inbound(&self, data: T, task: InboundTask) -> Result<(), FederationError> {
        let activity = match Activity::from_document(task.activity.clone()) {
            Ok(activity) => activity,
            Err(error) => {
                tracing::error!(%error, "queued inbound document no longer parses, dropping");
                return Ok(());
            }
        };
        let activity_id = activity
            .id()
            .cloned()
            .unwrap_or_else(|| task.origin.clone());
        let span =
            observability::receive_activity_span(&activity_id, activity.primary_type());
        let _entered = span.enter();

        let listener_key = activity.types().iter().find_map(|type_name| {
            resolve_listener_type(
                &self.inner.hierarchy,
                &self.inner.registries.inbox_listeners,
                type_name,
            )
        });
        let Some(listener_key) = listener_key else {
            tracing::debug!(
                activity_type = activity.primary_type(),
                "no inbox listener for activity type",
            );
            return Ok(());
        };
        let listener = self.inner.registries.inbox_listeners[&listener_key].clone();

        let context = self.create_context(task.origin.clone(), data);
        drop(_entered);
        match listener(context.clone(), activity.clone()).await {
            Ok(()) => {
                if task.attempt == 0 {
                    let observers = self
                        .inner
                        .observers
                        .read()
                        .expect("observer list poisoned")
                        .clone();
                    observability::notify_inbound(&observers, &context, &activity).await;
                }
                Ok(())
            }
            Err(error) => {
                let attempts_made = task.attempt + 1;
                match self.inner.config.inbox_retry_policy.delay_after(attempts_made) {
                    Some(delay) => {
                        tracing::warn!(
                            activity_id = %activity_id,
                            attempt = attempts_made,
                            retry_in = ?delay,
                            %error,
                            "inbox listener failed, rescheduling",
                        );
                        let retry = InboundTask {
                            attempt: attempts_made,
                            ..task
                        };
                        self.inner
                            .queue
                            .enqueue(
                                serde_json::to_value(TaskEnvelope::Inbound(retry))
                                    .map_err(crate::kv::KvError::from)?,
                                EnqueueOptions {
                                    delay: Some(delay),
                                    ordering_key: None,
                                },
                            )
                            .await?;
                        Ok(())
                    }
                    None => {
                        tracing::error!(
                            activity_id = %activity_id,
                            attempts = attempts_made,
                            %error,
                            "inbox dispatch attempts exhausted",
                        );
                        if let Some(handler) = self.inner.registries.inbox_failure.clone() {
                            handler(task, error.to_string()).await;
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    pub(crate) async fn send_activity(
        &self,
        context: &Context<T>,
        sender: &Sender,
        recipients: Recipients,
        activity: Value,
        options: SendOptions,
    ) -> Result<(), FederationError> {
        let mut activity = Activity::from_document(activity)?;
        activity.ensure_id();
        let wire = activity.for_delivery();
        self.fan_out(context, sender, recipients, &activity, wire, options)
            .await
    }

    pub(crate) async fn forward_activity(
        &self,
        context: &Context<T>,
        sender: &Sender,
        recipients: Recipients,
        document: Value,
        options: SendOptions,
    ) -> Result<(), FederationError> {
        // Forwarding re-delivers the received document verbatim so any
        // embedded integrity proof stays valid.
        let activity = Activity::from_document(document.clone())?;
        if activity.id().is_none() {
            return Err(FederationError::Registration {
                reason: "cannot forward an activity without an id".into(),
            });
        }
        self.fan_out(context, sender, recipients, &activity, document, options)
            .await
    }

    async fn fan_out(
        &self,
        context: &Context<T>,
        sender: &Sender,
        recipients: Recipients,
        activity: &Activity,
        wire: Value,
        options: SendOptions,
    ) -> Result<(), FederationError> {
        if sender.key_pairs.is_empty() {
            return Err(FederationError::Registration {
                reason: "sender carries no key pairs".into(),
            });
        }
        let activity_id = activity
            .id()
            .cloned()
            .expect("activity id ensured by callers");

        let recipient_list = match recipients {
            Recipients::List(list) => list,
            Recipients::Followers { identifier } => {
                self.followers_recipients(context, &identifier).await?
            }
        };
        let actors = resolve_recipients(&self.inner.loader, &recipient_list).await;
        let prefer = options
            .prefer_shared_inbox
            .unwrap_or(self.inner.config.prefer_shared_inbox);
        let inboxes = extract_inboxes(&actors, prefer, &options.exclude_base_uris);

        for pair in &sender.key_pairs {
            self.inner.key_ring.insert(pair.key_id.clone(), pair.clone());
        }
        let key_ids: Vec<Url> = sender.key_pairs.iter().map(|pair| pair.key_id.clone()).collect();
        let ordered = options
            .ordered_delivery
            .unwrap_or(self.inner.config.ordered_delivery);

        let observers = self
            .inner
            .observers
            .read()
            .expect("observer list poisoned")
            .clone();
        for (inbox, target) in inboxes {
            let mut actor_ids: Vec<Url> = target.actor_ids.into_iter().collect();
            actor_ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            let task = OutboundTask {
                activity: wire.clone(),
                activity_id: activity_id.clone(),
                activity_type: activity.primary_type().to_owned(),
                inbox: inbox.clone(),
                keys: key_ids.clone(),
                actor_ids,
                shared_inbox: target.shared_inbox,
                origin: context.origin().clone(),
                trace_context: HashMap::new(),
                attempt: 0,
            };
            let ordering_key = if ordered {
                key_ids
                    .first()
                    .map(|key_id| delivery_ordering_key(key_id, &inbox))
            } else {
                None
            };
            tracing::debug!(inbox = %inbox, activity_id = %activity_id, "enqueueing delivery");
            self.inner
                .queue
                .enqueue(
                    serde_json::to_value(TaskEnvelope::Outbound(task))
                        .map_err(crate::kv::KvError::from)?,
                    EnqueueOptions {
                        delay: None,
                        ordering_key,
                    },
                )
                .await?;
            observability::notify_outbound(&observers, context, activity).await;
        }
        Ok(())
    }

    async fn followers_recipients(
        &self,
        context: &Context<T>,
        identifier: &str,
    ) -> Result<Vec<Recipient>, FederationError> {
        let Some(dispatcher) = self.inner.registries.followers.clone() else {
            return Err(FederationError::MissingDispatcher { kind: "followers" });
        };
        let mut variables = HashMap::new();
        variables.insert("identifier".to_owned(), identifier.to_owned());
        let collection: Option<Collection> = dispatcher(context.clone(), variables)
            .await
            .map_err(|source| FederationError::Dispatch { source })?;
        let Some(collection) = collection else {
            return Ok(Vec::new());
        };

        let mut recipients = Vec::new();
        for item in collection.items {
            match item {
                Value::String(raw) => {
                    if let Ok(url) = Url::parse(&raw) {
                        recipients.push(Recipient::Reference(url));
                    }
                }
                Value::Object(ref map) => {
                    if map.contains_key("inbox") {
                        if let Ok(actor) = Actor::from_document(item.clone()) {
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
        Ok(recipients)
    }

    pub(crate) fn delivery_engine(&self) -> DeliveryEngine {
        DeliveryEngine {
            transport: Arc::clone(&self.inner.transport),
            kv: Arc::clone(&self.inner.kv),
            queue: Arc::clone(&self.inner.queue),
            clock: Arc::clone(&self.inner.clock),
            policy: self.inner.config.outbox_retry_policy.clone(),
            key_ring: Arc::clone(&self.inner.key_ring),
            user_agent: self.inner.config.user_agent.clone(),
            ordered_delivery: self.inner.config.ordered_delivery,
            failure_handler: self.inner.registries.outbox_failure.clone(),
        }
    }
}

async fn not_found<T>(options: &FetchOptions<T>) -> Response<Bytes> {
    match &options.on_not_found {
        Some(handler) => handler().await,
        None => error_response(StatusCode::NOT_FOUND, "not-found", "no such resource", None),
    }
}

async fn not_acceptable<T>(options: &FetchOptions<T>) -> Response<Bytes> {
    if let Some(handler) = &options.on_not_acceptable {
        let response = handler().await;
        // The host may serve its own representation; a 404 from the host
        // means it has nothing either, so the protocol answer stands.
        if response.status() != StatusCode::NOT_FOUND {
            return response;
        }
    }
    error_response(
        StatusCode::NOT_ACCEPTABLE,
        "not-acceptable",
        "this endpoint serves ActivityStreams documents",
        None,
    )
}

fn accepted(activity_id: &Url) -> Response<Bytes> {
    json_response(
        StatusCode::ACCEPTED,
        &json!({"status": "accepted", "activityId": activity_id.as_str()}),
        "application/json",
    )
}

fn infra_error(error: &dyn std::fmt::Display, activity_id: Option<&Url>) -> Response<Bytes> {
    tracing::error!(%error, "inbox processing infrastructure failure");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal-error",
        "temporary processing failure",
        activity_id,
    )
}

fn internal_error(context_message: &str, error: &super::DispatchError) -> Response<Bytes> {
    tracing::error!(%error, "{context_message}");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal-error",
        context_message,
        None,
    )
}

fn json_response(status: StatusCode, document: &Value, content_type: &str) -> Response<Bytes> {
    let body = serde_json::to_vec(document).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, content_type)
        .body(Bytes::from(body))
        .expect("static response parts are valid")
}

fn error_response(
    status: StatusCode,
    kind: &str,
    reason: &str,
    activity_id: Option<&Url>,
) -> Response<Bytes> {
    let mut body = json!({"error": kind, "reason": reason});
    if let Some(id) = activity_id {
        body["activityId"] = json!(id.as_str());
    }
    json_response(status, &body, "application/json")
}

fn accepts_json_ld(request: &Request<Bytes>) -> bool {
    let Some(accept) = request
        .headers()
        .get(http::header::ACCEPT)
        .and_then(|value| value.to_str().ok())
    else {
        return true;
    };
    accept.split(',').any(|item| {
        let essence = item.split(';').next().unwrap_or_default().trim();
        matches!(
            essence,
            "application/activity+json"
                | "application/ld+json"
                | "application/json"
                | "application/*"
                | "*/*"
        )
    })
}

fn request_origin(request: &Request<Bytes>) -> Option<Url> {
    let uri = request.uri();
    if let (Some(scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) {
        return Url::parse(&format!("{scheme}://{authority}")).ok();
    }
    let host = request
        .headers()
        .get(http::header::HOST)
        .and_then(|value| value.to_str().ok())?;
    Url::parse(&format!("https://{host}")).ok()
}
