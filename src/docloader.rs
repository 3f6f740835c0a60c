//! Remote JSON-LD document loading.
//!
//! [`DocumentLoader`] fetches actor descriptors and other JSON-LD documents
//! with content negotiation, caches them in the KV store, and collapses
//! concurrent fetches of one URL into a single upstream request. The
//! authenticated mode signs outgoing GETs with a key pair so that servers
//! requiring authorized fetch respond.
//!
//! HTTP itself sits behind the [`Transport`] seam; production uses the
//! reqwest-backed [`HttpTransport`], tests use
//! [`test_transport::StubTransport`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use url::{Host, Url};

use crate::kv::{KvError, KvKey, SharedKvStore};
use crate::sig::{KeyPair, SignOptions, sign_request};

/// Cached remote documents live this long before a refetch.
pub const DOCUMENT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Media types sent in the Accept header and honored in responses.
const ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Errors raised while loading remote documents.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// The transport failed before a response arrived; retriable.
    #[error("fetch of {url} failed: {reason}")]
    Transport {
        /// The requested URL.
        url: Url,
        /// The transport's failure description.
        reason: String,
    },

    /// The remote answered with a non-success status.
    #[error("{url} responded with status {status}")]
    UpstreamStatus {
        /// The requested URL.
        url: Url,
        /// The response status.
        status: u16,
    },

    /// The remote answered with a media type outside the JSON-LD family.
    #[error("{url} returned unsupported content type {content_type:?}")]
    UnsupportedContentType {
        /// The requested URL.
        url: Url,
        /// The offending media type.
        content_type: String,
    },

    /// The response body is not valid JSON.
    #[error("{url} did not return valid JSON: {source}")]
    InvalidJson {
        /// The requested URL.
        url: Url,
        /// The parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// The URL points into a private address range.
    #[error("refusing to fetch private address {url}")]
    PrivateAddress {
        /// The refused URL.
        url: Url,
    },

    /// The request could not be signed.
    #[error("could not sign fetch of {url}: {reason}")]
    Signing {
        /// The requested URL.
        url: Url,
        /// Why signing failed.
        reason: String,
    },

    /// The KV cache failed.
    #[error(transparent)]
    Kv(#[from] KvError),
}

/// A loaded remote document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDocument {
    /// Final URL after redirects.
    pub document_url: Url,
    /// Out-of-band context URL, when one was advertised.
    pub context_url: Option<Url>,
    /// The document body.
    pub document: Value,
}

/// Response produced by a [`Transport`].
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// Response status.
    pub status: StatusCode,
    /// Final URL after redirects.
    pub final_url: Url,
    /// The `Content-Type` header, if any.
    pub content_type: Option<String>,
    /// Response body.
    pub body: Bytes,
}

/// Executes HTTP exchanges for the loader and the outbound pipeline.
///
/// Implementations return `Ok` for any response the remote produced,
/// including error statuses; `Err` means the exchange itself failed.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Executes one request.
    async fn execute(&self, request: Request<Bytes>) -> Result<TransportResponse, LoaderError>;
}

/// Shared transport handle.
pub type SharedTransport = Arc<dyn Transport>;

/// Production transport on a pooled reqwest client with a bounded redirect
/// chain.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Maximum redirects followed per fetch.
    pub const MAX_REDIRECTS: usize = 5;

    /// Creates a transport identifying itself as `user_agent`.
    #[must_use]
    pub fn new(user_agent: &str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(Self::MAX_REDIRECTS))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("HTTP client initialization");
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: Request<Bytes>) -> Result<TransportResponse, LoaderError> {
        let url = Url::parse(&request.uri().to_string()).map_err(|_| LoaderError::Transport {
            url: Url::parse("data:,").expect("literal URL"),
            reason: format!("request URI is not absolute: {}", request.uri()),
        })?;
        let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
            .map_err(|_| LoaderError::Transport {
                url: url.clone(),
                reason: format!("unsupported method {}", request.method()),
            })?;

        let mut builder = self.client.request(method, url.clone());
        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }
        let response = builder
            .body(request.into_body())
            .send()
            .await
            .map_err(|source| LoaderError::Transport {
                url: url.clone(),
                reason: source.to_string(),
            })?;

        let status = response.status();
        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await.map_err(|source| LoaderError::Transport {
            url: url.clone(),
            reason: source.to_string(),
        })?;

        Ok(TransportResponse {
            status,
            final_url,
            content_type,
            body,
        })
    }
}

/// Fetches and caches remote JSON-LD documents.
#[derive(Debug)]
pub struct DocumentLoader {
    kv: SharedKvStore,
    transport: SharedTransport,
    key: Option<KeyPair>,
    user_agent: String,
    allow_private_address: bool,
    cache_ttl: Duration,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Configures a [`DocumentLoader`].
#[derive(Debug)]
pub struct DocumentLoaderBuilder {
    kv: SharedKvStore,
    transport: Option<SharedTransport>,
    key: Option<KeyPair>,
    user_agent: String,
    allow_private_address: bool,
    cache_ttl: Duration,
}

impl DocumentLoaderBuilder {
    /// Uses `transport` instead of the reqwest-backed default.
    #[must_use]
    pub fn transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Signs outgoing GETs with `key` (authenticated mode).
    #[must_use]
    pub fn key(mut self, key: KeyPair) -> Self {
        self.key = Some(key);
        self
    }

    /// Overrides the User-Agent string.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Permits fetching private address ranges. Off by default.
    #[must_use]
    pub fn allow_private_address(mut self, allow: bool) -> Self {
        self.allow_private_address = allow;
        self
    }

    /// Overrides the cache TTL.
    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Finishes the loader.
    #[must_use]
    pub fn build(self) -> DocumentLoader {
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new(&self.user_agent)));
        DocumentLoader {
            kv: self.kv,
            transport,
            key: self.key,
            user_agent: self.user_agent,
            allow_private_address: self.allow_private_address,
            cache_ttl: self.cache_ttl,
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl DocumentLoader {
    /// Starts configuring a loader over `kv`.
    #[must_use]
    pub fn builder(kv: SharedKvStore) -> DocumentLoaderBuilder {
        DocumentLoaderBuilder {
            kv,
            transport: None,
            key: None,
            user_agent: concat!("weft/", env!("CARGO_PKG_VERSION")).to_owned(),
            allow_private_address: false,
            cache_ttl: DOCUMENT_CACHE_TTL,
        }
    }

    /// Anonymous loader: GETs carry no signature.
    #[must_use]
    pub fn anonymous(kv: SharedKvStore) -> Self {
        Self::builder(kv).build()
    }

    /// Authenticated loader: GETs are signed with `key`.
    #[must_use]
    pub fn authenticated(kv: SharedKvStore, key: KeyPair) -> Self {
        Self::builder(kv).key(key).build()
    }

    /// The transport this loader fetches through.
    #[must_use]
    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// Loads `url`, serving from cache when possible.
    ///
    /// Concurrent loads of one URL collapse to a single upstream fetch; the
    /// losers read the winner's cached result.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError`] on private addresses, transport failures,
    /// non-success statuses, unsupported media types, and invalid JSON.
    pub async fn load(&self, url: &Url) -> Result<RemoteDocument, LoaderError> {
        if !self.allow_private_address && is_private_host(url) {
            return Err(LoaderError::PrivateAddress { url: url.clone() });
        }
        if let Some(cached) = self.cached(url).await? {
            return Ok(cached);
        }

        let flight = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(
                inflight
                    .entry(url.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _permit = flight.lock().await;

        // Another flight may have landed while this one waited.
        if let Some(cached) = self.cached(url).await? {
            return Ok(cached);
        }

        let result = self.fetch(url).await;
        if let Ok(document) = &result {
            self.kv
                .set(
                    &cache_key(url),
                    serde_json::to_value(document).map_err(KvError::from)?,
                    Some(self.cache_ttl),
                )
                .await?;
        }
        self.inflight.lock().await.remove(url.as_str());
        result
    }

    async fn cached(&self, url: &Url) -> Result<Option<RemoteDocument>, LoaderError> {
        match self.kv.get(&cache_key(url)).await? {
            Some(value) => Ok(serde_json::from_value(value).ok()),
            None => Ok(None),
        }
    }

    async fn fetch(&self, url: &Url) -> Result<RemoteDocument, LoaderError> {
        let mut request = Request::builder()
            .method(http::Method::GET)
            .uri(url.as_str())
            .header(http::header::ACCEPT, ACCEPT)
            .header(http::header::USER_AGENT, &self.user_agent)
            .body(Bytes::new())
            .map_err(|source| LoaderError::Transport {
                url: url.clone(),
                reason: source.to_string(),
            })?;
        if let Some(key) = &self.key {
            sign_request(&mut request, key, &SignOptions::default()).map_err(|source| {
                LoaderError::Signing {
                    url: url.clone(),
                    reason: source.to_string(),
                }
            })?;
        }

        let response = self.transport.execute(request).await?;
        if !response.status.is_success() {
            return Err(LoaderError::UpstreamStatus {
                url: url.clone(),
                status: response.status.as_u16(),
            });
        }
        let content_type = response.content_type.clone().unwrap_or_default();
        if !is_json_ld_media_type(&content_type) {
            return Err(LoaderError::UnsupportedContentType {
                url: url.clone(),
                content_type,
            });
        }
        let document: Value =
            serde_json::from_slice(&response.body).map_err(|source| LoaderError::InvalidJson {
                url: url.clone(),
                source,
            })?;
        Ok(RemoteDocument {
            document_url: response.final_url,
            context_url: None,
            document,
        })
    }
}

fn cache_key(url: &Url) -> KvKey {
    KvKey::new(["remote-document", url.as_str()])
}

fn is_json_ld_media_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    matches!(
        essence.as_str(),
        "application/activity+json" | "application/ld+json" | "application/json"
    ) || essence.ends_with("+json")
}

fn is_private_host(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => {
            ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
        }
        Some(Host::Ipv6(ip)) => {
            ip.is_loopback()
                || ip.is_unspecified()
                // fc00::/7 unique-local, fe80::/10 link-local
                || (ip.segments()[0] & 0xfe00) == 0xfc00
                || (ip.segments()[0] & 0xffc0) == 0xfe80
        }
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.');
            domain == "localhost" || domain.ends_with(".localhost")
        }
        None => true,
    }
}

/// Scriptable transport for test suites.
pub mod test_transport {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use dashmap::DashMap;
    use http::{Request, StatusCode};
    use serde_json::Value;
    use url::Url;

    use super::{LoaderError, Transport, TransportResponse};

    /// A POST the stub received, kept for assertions.
    #[derive(Debug, Clone)]
    pub struct RecordedPost {
        /// Destination URL.
        pub url: Url,
        /// Request headers as sent.
        pub headers: http::HeaderMap,
        /// Request body as sent.
        pub body: Bytes,
    }

    type PostResponder = Box<dyn Fn(&RecordedPost) -> (StatusCode, Bytes) + Send + Sync>;

    /// In-memory [`Transport`]: GETs serve scripted documents, POSTs are
    /// recorded and answered by a configurable responder (202 by default).
    #[derive(Default)]
    pub struct StubTransport {
        documents: DashMap<String, Value>,
        posts: Mutex<Vec<RecordedPost>>,
        responder: Mutex<Option<PostResponder>>,
    }

    impl std::fmt::Debug for StubTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("StubTransport")
                .field("documents", &self.documents.len())
                .finish_non_exhaustive()
        }
    }

    impl StubTransport {
        /// Creates an empty stub.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Scripts the document served for GETs of `url`.
        pub fn insert(&self, url: &str, document: Value) {
            self.documents.insert(url.to_owned(), document);
        }

        /// Removes a scripted document, making later GETs 404.
        pub fn remove(&self, url: &str) {
            self.documents.remove(url);
        }

        /// Overrides the POST responder.
        pub fn respond_to_posts<F>(&self, responder: F)
        where
            F: Fn(&RecordedPost) -> (StatusCode, Bytes) + Send + Sync + 'static,
        {
            *self.responder.lock().expect("responder mutex poisoned") = Some(Box::new(responder));
        }

        /// All POSTs received so far.
        #[must_use]
        pub fn recorded_posts(&self) -> Vec<RecordedPost> {
            self.posts.lock().expect("post mutex poisoned").clone()
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn execute(&self, request: Request<Bytes>) -> Result<TransportResponse, LoaderError> {
            let url =
                Url::parse(&request.uri().to_string()).map_err(|_| LoaderError::Transport {
                    url: Url::parse("data:,").expect("literal URL"),
                    reason: format!("stub requires absolute URIs, got {}", request.uri()),
                })?;

            if request.method() == http::Method::GET {
                return match self.documents.get(url.as_str()) {
                    Some(document) => Ok(TransportResponse {
                        status: StatusCode::OK,
                        final_url: url,
                        content_type: Some("application/activity+json".into()),
                        body: Bytes::from(serde_json::to_vec(document.value()).expect("JSON")),
                    }),
                    None => Ok(TransportResponse {
                        status: StatusCode::NOT_FOUND,
                        final_url: url,
                        content_type: None,
                        body: Bytes::new(),
                    }),
                };
            }

            let recorded = RecordedPost {
                url: url.clone(),
                headers: request.headers().clone(),
                body: request.body().clone(),
            };
            let (status, body) = self
                .responder
                .lock()
                .expect("responder mutex poisoned")
                .as_ref()
                .map_or((StatusCode::ACCEPTED, Bytes::new()), |responder| {
                    responder(&recorded)
                });
            self.posts
                .lock()
                .expect("post mutex poisoned")
                .push(recorded);
            Ok(TransportResponse {
                status,
                final_url: url,
                content_type: None,
                body,
            })
        }
    }
}
