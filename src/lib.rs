//! # Weft — a federation runtime for ActivityPub-style servers
//!
//! Weft is the server-side machinery one operator needs to receive,
//! authenticate, dispatch, queue, sign, and deliver signed JSON-LD
//! activities on behalf of a host application. The host registers
//! dispatchers and inbox listeners on a [`FederationBuilder`], injects a
//! key-value store, a message queue, and a key codec, and drives
//! everything through [`Federation::fetch`] plus a per-request
//! [`federation::Context`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//! use weft::federation::{FederationBuilder, FederationDeps, InboxListeners};
//! use weft::kv::MemoryKvStore;
//! use weft::queue::InProcessQueue;
//! use weft::sig::test_utils::TestKeyCodec;
//! use weft::{FederationConfig, server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     server::init_tracing();
//!     let federation = FederationBuilder::<()>::new(FederationConfig::development())
//!         .set_actor_dispatcher("/users/{identifier}", |context, identifier| async move {
//!             Ok(Some(json!({
//!                 "@context": "https://www.w3.org/ns/activitystreams",
//!                 "id": context.actor_uri(&identifier)?.as_str(),
//!                 "type": "Person",
//!                 "preferredUsername": identifier,
//!                 "inbox": context.inbox_uri(Some(&identifier))?.as_str(),
//!             })))
//!         })?
//!         .set_inbox_listeners(
//!             "/users/{identifier}/inbox",
//!             Some("/inbox"),
//!             InboxListeners::new().on("Follow", |_context, activity| async move {
//!                 tracing::info!(actor = ?activity.actor(), "new follower");
//!                 Ok(())
//!             }),
//!         )?
//!         .build(FederationDeps {
//!             kv: Arc::new(MemoryKvStore::new()),
//!             queue: Arc::new(InProcessQueue::new()),
//!             codec: Arc::new(TestKeyCodec),
//!             transport: None,
//!             clock: None,
//!         })?;
//!
//!     let cancel = CancellationToken::new();
//!     server::serve(federation, (), ([0, 0, 0, 0], 8080).into(), cancel).await?;
//!     Ok(())
//! }
//! ```

pub mod activity;
pub mod clock;
pub mod config;
pub mod docloader;
pub mod domain_types;
pub mod error;
pub mod federation;
pub mod inbound;
pub mod kv;
pub mod observability;
pub mod outbound;
pub mod queue;
pub mod retry;
pub mod routes;
pub mod server;
pub mod sig;
pub mod worker;

pub use config::FederationConfig;
pub use error::FederationError;
pub use federation::{Federation, FederationBuilder};
