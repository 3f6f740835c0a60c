//! Shared fixture for the integration suites: a federation wired to the
//! in-memory store, the in-process queue, and a scriptable transport.

// Each integration binary uses a different slice of this fixture.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::Request;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use url::Url;

use weft::FederationConfig;
use weft::docloader::test_transport::StubTransport;
use weft::federation::{Federation, FederationBuilder, FederationDeps, InboxListeners};
use weft::kv::MemoryKvStore;
use weft::queue::InProcessQueue;
use weft::sig::test_utils::TestKeyCodec;

/// Origin the fixture serves.
pub const ORIGIN: &str = "https://home.example";

pub struct Harness {
    pub federation: Federation<()>,
    pub kv: Arc<MemoryKvStore>,
    pub queue: Arc<InProcessQueue>,
    pub transport: Arc<StubTransport>,
    /// `(activity_type, activity_id)` per listener invocation.
    pub seen: Arc<Mutex<Vec<(String, String)>>>,
}

/// Builds the standard fixture: actor `alice` and `bob`, inbox listeners
/// for `Create` and `Follow`, followers/outbox dispatchers, node info and
/// WebFinger links.
pub fn harness(config: FederationConfig) -> Harness {
    harness_with(config, |builder| Ok(builder))
}

/// Like [`harness`], with a hook to customize the builder.
pub fn harness_with(
    config: FederationConfig,
    customize: impl FnOnce(
        FederationBuilder<()>,
    ) -> Result<FederationBuilder<()>, weft::FederationError>,
) -> Harness {
    let kv = Arc::new(MemoryKvStore::new());
    let queue = Arc::new(InProcessQueue::new());
    let transport = Arc::new(StubTransport::new());
    let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));

    let record = |seen: &Arc<Mutex<Vec<(String, String)>>>, type_name: &'static str| {
        let seen = Arc::clone(seen);
        move |_context: weft::federation::Context<()>, activity: weft::activity::Activity| {
            let seen = Arc::clone(&seen);
            let entry = (
                type_name.to_owned(),
                activity.id().map(Url::as_str).unwrap_or_default().to_owned(),
            );
            async move {
                seen.lock().unwrap().push(entry);
                Ok::<(), weft::federation::DispatchError>(())
            }
        }
    };

    let builder = FederationBuilder::<()>::new(config)
        .set_actor_dispatcher("/users/{identifier}", |context, identifier| async move {
            if identifier != "alice" && identifier != "bob" {
                return Ok(None);
            }
            let id = context.actor_uri(&identifier)?;
            Ok(Some(json!({
                "@context": "https://www.w3.org/ns/activitystreams",
                "id": id.as_str(),
                "type": "Person",
                "preferredUsername": identifier,
                "inbox": context.inbox_uri(Some(&identifier))?.as_str(),
                "outbox": context.outbox_uri(&identifier)?.as_str(),
                "followers": context.followers_uri(&identifier)?.as_str(),
            })))
        })
        .expect("actor dispatcher registers")
        .set_inbox_listeners(
            "/users/{identifier}/inbox",
            Some("/inbox"),
            InboxListeners::new()
                .on("Create", record(&seen, "Create"))
                .on("Follow", record(&seen, "Follow")),
        )
        .expect("inbox listeners register")
        .set_outbox_dispatcher("/users/{identifier}/outbox", |_context, _vars| async move {
            Ok(Some(weft::federation::Collection {
                items: vec![],
                total_items: Some(0),
            }))
        })
        .expect("outbox dispatcher registers")
        .set_followers_dispatcher(
            "/users/{identifier}/followers",
            |_context, vars| async move {
                if vars.get("identifier").map(String::as_str) != Some("alice") {
                    return Ok(None);
                }
                Ok(Some(weft::federation::Collection {
                    items: vec![json!("https://faraway.example/users/carol")],
                    total_items: Some(1),
                }))
            },
        )
        .expect("followers dispatcher registers")
        .set_node_info_dispatcher(|_context| async move {
            Ok(weft::federation::NodeInfo {
                software_name: "weft-test".into(),
                software_version: "0.1.0".into(),
                total_users: Some(2),
                local_posts: Some(7),
            })
        })
        .expect("node info dispatcher registers")
        .set_webfinger_links_dispatcher(|_context, identifier| async move {
            Ok(vec![weft::federation::WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".into(),
                media_type: Some("text/html".into()),
                href: Some(format!("{ORIGIN}/@{identifier}")),
            }])
        });

    let builder = customize(builder).expect("custom registrations succeed");

    let federation = builder
        .build(FederationDeps {
            kv: Arc::clone(&kv) as _,
            queue: Arc::clone(&queue) as _,
            codec: Arc::new(TestKeyCodec),
            transport: Some(Arc::clone(&transport) as _),
            clock: None,
        })
        .expect("federation builds");

    Harness {
        federation,
        kv,
        queue,
        transport,
        seen,
    }
}

/// Builds an absolute request against the fixture origin.
pub fn request(method: &str, path: &str, accept: Option<&str>, body: Option<&Value>) -> Request<Bytes> {
    let mut builder = Request::builder()
        .method(method)
        .uri(format!("{ORIGIN}{path}"));
    if let Some(accept) = accept {
        builder = builder.header(http::header::ACCEPT, accept);
    }
    let bytes = match body {
        Some(value) => {
            builder = builder.header(http::header::CONTENT_TYPE, "application/activity+json");
            Bytes::from(serde_json::to_vec(value).unwrap())
        }
        None => Bytes::new(),
    };
    builder.body(bytes).unwrap()
}

/// Scripts a remote actor document on the stub transport.
pub fn seed_remote_actor(
    transport: &StubTransport,
    id: &str,
    inbox: &str,
    shared_inbox: Option<&str>,
) {
    let mut document = json!({
        "id": id,
        "type": "Person",
        "inbox": inbox,
    });
    if let Some(shared) = shared_inbox {
        document["endpoints"] = json!({"sharedInbox": shared});
    }
    transport.insert(id, document);
}

/// Runs the queue workers for `duration`, then cancels and drains.
pub async fn run_workers_for(harness: &Harness, duration: Duration) {
    let cancel = CancellationToken::new();
    let worker = {
        let federation = harness.federation.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { federation.start_queue((), cancel).await })
    };
    tokio::time::sleep(duration).await;
    cancel.cancel();
    worker
        .await
        .expect("worker task joins")
        .expect("workers stop cleanly");
}

/// Parses a response body as JSON.
pub fn body_json(response: &http::Response<Bytes>) -> Value {
    serde_json::from_slice(response.body()).expect("response body is JSON")
}
