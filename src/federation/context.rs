//! Per-request context handed to dispatchers and listeners.
//!
//! A context carries the request origin, the host's data, and the handles
//! a dispatcher needs: URI construction through the router, the document
//! loader, and the outbound entry points.

use std::collections::HashMap;

use serde_json::Value;
use url::Url;

use crate::activity::Recipient;
use crate::docloader::DocumentLoader;
use crate::error::FederationError;
use crate::sig::KeyPair;

use super::facade::Federation;
use super::route;

/// Signing identity for an outbound send: the sender's key pairs in
/// declaration order. The first key's id doubles as the delivery-record
/// owner.
#[derive(Debug, Clone)]
pub struct Sender {
    /// Key pairs, first is preferred.
    pub key_pairs: Vec<KeyPair>,
}

impl Sender {
    /// A sender signing with the given pairs.
    #[must_use]
    pub fn new(key_pairs: Vec<KeyPair>) -> Self {
        Self { key_pairs }
    }
}

/// Recipient selector for an outbound send.
pub enum Recipients {
    /// An explicit recipient list.
    List(Vec<Recipient>),
    /// Every follower of the identified local actor, via the followers
    /// dispatcher.
    Followers {
        /// The local actor whose followers receive the activity.
        identifier: String,
    },
}

/// Options accepted by [`Context::send_activity`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Overrides the configured shared-inbox preference.
    pub prefer_shared_inbox: Option<bool>,
    /// Skip inboxes whose origin matches any of these URIs.
    pub exclude_base_uris: Vec<Url>,
    /// Overrides the configured per-(key, inbox) delivery serialization.
    pub ordered_delivery: Option<bool>,
}

/// Per-request context.
pub struct Context<T> {
    pub(crate) federation: Federation<T>,
    pub(crate) origin: Url,
    pub(crate) data: T,
}

impl<T> Clone for Context<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            federation: self.federation.clone(),
            origin: self.origin.clone(),
            data: self.data.clone(),
        }
    }
}

impl<T> Context<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The host application's per-request data.
    #[must_use]
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Origin this context serves, e.g. `https://example.com`.
    #[must_use]
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// The document loader.
    #[must_use]
    pub fn loader(&self) -> &DocumentLoader {
        self.federation.loader()
    }

    /// URI of the actor with `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] when no actor dispatcher is registered.
    pub fn actor_uri(&self, identifier: &str) -> Result<Url, FederationError> {
        self.build_uri(route::ACTOR, &[("identifier", identifier)])
    }

    /// URI of an object endpoint registered for `type_name`.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] when the route is missing or a variable
    /// has no value.
    pub fn object_uri(
        &self,
        type_name: &str,
        variables: &HashMap<String, String>,
    ) -> Result<Url, FederationError> {
        let name = format!("{}{type_name}", route::OBJECT_PREFIX);
        let path = self.federation.router().build(&name, variables)?;
        self.join(&path)
    }

    /// URI of an inbox: the identified actor's, or the shared inbox.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] when the corresponding route is missing.
    pub fn inbox_uri(&self, identifier: Option<&str>) -> Result<Url, FederationError> {
        match identifier {
            Some(identifier) => self.build_uri(route::INBOX, &[("identifier", identifier)]),
            None => self.build_uri(route::SHARED_INBOX, &[]),
        }
    }

    /// URI of the identified actor's outbox.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] when the route is missing.
    pub fn outbox_uri(&self, identifier: &str) -> Result<Url, FederationError> {
        self.build_uri(route::OUTBOX, &[("identifier", identifier)])
    }

    /// URI of the identified actor's following collection.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] when the route is missing.
    pub fn following_uri(&self, identifier: &str) -> Result<Url, FederationError> {
        self.build_uri(route::FOLLOWING, &[("identifier", identifier)])
    }

    /// URI of the identified actor's followers collection.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] when the route is missing.
    pub fn followers_uri(&self, identifier: &str) -> Result<Url, FederationError> {
        self.build_uri(route::FOLLOWERS, &[("identifier", identifier)])
    }

    /// URI of the identified actor's liked collection.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] when the route is missing.
    pub fn liked_uri(&self, identifier: &str) -> Result<Url, FederationError> {
        self.build_uri(route::LIKED, &[("identifier", identifier)])
    }

    /// URI of the identified actor's featured collection.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] when the route is missing.
    pub fn featured_uri(&self, identifier: &str) -> Result<Url, FederationError> {
        self.build_uri(route::FEATURED, &[("identifier", identifier)])
    }

    /// URI of the identified actor's featured-tags collection.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] when the route is missing.
    pub fn featured_tags_uri(&self, identifier: &str) -> Result<Url, FederationError> {
        self.build_uri(route::FEATURED_TAGS, &[("identifier", identifier)])
    }

    /// URI of a custom collection endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] when the route is missing or a variable
    /// has no value.
    pub fn collection_uri(
        &self,
        name: &str,
        variables: &HashMap<String, String>,
    ) -> Result<Url, FederationError> {
        let route_name = format!("{}{name}", route::COLLECTION_PREFIX);
        let path = self.federation.router().build(&route_name, variables)?;
        self.join(&path)
    }

    /// Fans `activity` out to the recipients' inboxes: renders, resolves
    /// inboxes, and enqueues one signed delivery per inbox.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] on malformed activities and on queue or
    /// store failures; individual delivery failures are retried in the
    /// background instead.
    pub async fn send_activity(
        &self,
        sender: &Sender,
        recipients: Recipients,
        activity: Value,
        options: SendOptions,
    ) -> Result<(), FederationError> {
        self.federation
            .send_activity(self, sender, recipients, activity, options)
            .await
    }

    /// Re-delivers a received document verbatim — original proof intact —
    /// to the recipients' inboxes with the forwarder's signature.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError`] on malformed documents and on queue or
    /// store failures.
    pub async fn forward_activity(
        &self,
        sender: &Sender,
        recipients: Recipients,
        document: Value,
        options: SendOptions,
    ) -> Result<(), FederationError> {
        self.federation
            .forward_activity(self, sender, recipients, document, options)
            .await
    }

    fn build_uri(&self, route_name: &str, pairs: &[(&str, &str)]) -> Result<Url, FederationError> {
        let variables: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        let path = self.federation.router().build(route_name, &variables)?;
        self.join(&path)
    }

    fn join(&self, path: &str) -> Result<Url, FederationError> {
        self.origin
            .join(path)
            .map_err(|_| FederationError::Registration {
                reason: format!("origin {} cannot address path {path:?}", self.origin),
            })
    }
}
