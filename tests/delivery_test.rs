//! Outbound pipeline tests: fan-out, signing, retry exhaustion, and key
//! selection, all over the scriptable transport.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http::{Request, StatusCode};
use serde_json::{Value, json};
use url::Url;

use common::{ORIGIN, harness, harness_with, run_workers_for, seed_remote_actor};
use weft::FederationConfig;
use weft::docloader::DocumentLoader;
use weft::docloader::test_transport::StubTransport;
use weft::federation::{Recipients, SendOptions, Sender};
use weft::kv::{KvKey, KvStore, MemoryKvStore};
use weft::retry::RetryPolicy;
use weft::activity::Recipient;
use weft::sig::test_utils::{TestKeyCodec, test_key_pair};
use weft::sig::{DEFAULT_TIME_WINDOW, KeyAlgorithm, VerifyOptions, verify_request};

fn alice_sender() -> Sender {
    Sender::new(vec![test_key_pair(
        &format!("{ORIGIN}/users/alice#main"),
        KeyAlgorithm::RsaSha256,
        b"alice-rsa-seed",
    )])
}

fn note_activity(id: &str) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": id,
        "type": "Create",
        "actor": format!("{ORIGIN}/users/alice"),
        "object": {"type": "Note", "content": "hello fediverse"},
    })
}

fn reference(url: &str) -> Recipient {
    Recipient::Reference(Url::parse(url).unwrap())
}

#[tokio::test(flavor = "multi_thread")]
async fn shared_inbox_coalesces_same_origin_recipients() {
    let h = harness(FederationConfig::testing());
    seed_remote_actor(
        &h.transport,
        "https://a.example/users/alice2",
        "https://a.example/users/alice2/inbox",
        Some("https://a.example/inbox"),
    );
    seed_remote_actor(
        &h.transport,
        "https://a.example/users/bob2",
        "https://a.example/users/bob2/inbox",
        Some("https://a.example/inbox"),
    );
    seed_remote_actor(
        &h.transport,
        "https://b.example/users/carol",
        "https://b.example/users/carol/inbox",
        None,
    );

    let context = h
        .federation
        .create_context(Url::parse(ORIGIN).unwrap(), ());
    context
        .send_activity(
            &alice_sender(),
            Recipients::List(vec![
                reference("https://a.example/users/alice2"),
                reference("https://a.example/users/bob2"),
                reference("https://b.example/users/carol"),
            ]),
            note_activity("https://home.example/create/10"),
            SendOptions {
                prefer_shared_inbox: Some(true),
                ..SendOptions::default()
            },
        )
        .await
        .unwrap();

    run_workers_for(&h, Duration::from_millis(400)).await;

    let mut destinations: Vec<String> = h
        .transport
        .recorded_posts()
        .iter()
        .map(|post| post.url.to_string())
        .collect();
    destinations.sort();
    assert_eq!(
        destinations,
        vec![
            "https://a.example/inbox".to_owned(),
            "https://b.example/users/carol/inbox".to_owned(),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn delivered_posts_carry_a_verifiable_signature() {
    let h = harness(FederationConfig::testing());
    seed_remote_actor(
        &h.transport,
        "https://b.example/users/carol",
        "https://b.example/users/carol/inbox",
        None,
    );

    let sender = alice_sender();
    let context = h
        .federation
        .create_context(Url::parse(ORIGIN).unwrap(), ());
    context
        .send_activity(
            &sender,
            Recipients::List(vec![reference("https://b.example/users/carol")]),
            note_activity("https://home.example/create/11"),
            SendOptions::default(),
        )
        .await
        .unwrap();
    run_workers_for(&h, Duration::from_millis(400)).await;

    let posts = h.transport.recorded_posts();
    assert_eq!(posts.len(), 1);
    let post = &posts[0];
    assert_eq!(
        post.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/activity+json")
    );

    // Replay the recorded POST through the verifier.
    let mut rebuilt = Request::builder()
        .method("POST")
        .uri(post.url.as_str());
    for (name, value) in &post.headers {
        rebuilt = rebuilt.header(name, value);
    }
    let rebuilt = rebuilt.body(post.body.clone()).unwrap();

    let key_stub = StubTransport::new();
    let key_pair = &sender.key_pairs[0];
    key_stub.insert(
        key_pair.key_id.as_str(),
        json!({
            "id": key_pair.key_id.as_str(),
            "owner": format!("{ORIGIN}/users/alice"),
            "publicKeyPem": key_pair.material.pem,
        }),
    );
    let kv = Arc::new(MemoryKvStore::new());
    let loader = DocumentLoader::builder(Arc::clone(&kv) as _)
        .transport(Arc::new(key_stub))
        .build();
    let verified = verify_request(
        &rebuilt,
        &VerifyOptions {
            loader: &loader,
            kv: kv.as_ref(),
            codec: &TestKeyCodec,
            profiles: None,
            current_time: Utc::now(),
            time_window: DEFAULT_TIME_WINDOW,
        },
    )
    .await
    .unwrap()
    .expect("delivery is signed");
    assert_eq!(verified.id, key_pair.key_id);

    let body: Value = serde_json::from_slice(&post.body).unwrap();
    assert_eq!(body["id"], json!("https://home.example/create/11"));
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_reach_the_permanent_failure_handler() {
    let mut config = FederationConfig::testing();
    config.outbox_retry_policy = RetryPolicy {
        initial: Duration::from_millis(20),
        cap: Duration::from_millis(100),
        max_attempts: weft::domain_types::MaxAttempts::try_new(3).unwrap(),
        ..RetryPolicy::outbound_default()
    };

    let captured: Arc<Mutex<Option<(u32, Option<String>)>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&captured);
    let h = harness_with(config, move |builder| {
        Ok(builder.set_outbox_permanent_failure_handler(move |task, body| {
            let sink = Arc::clone(&sink);
            async move {
                *sink.lock().unwrap() = Some((task.attempt, body));
            }
        }))
    });
    seed_remote_actor(
        &h.transport,
        "https://b.example/users/carol",
        "https://b.example/users/carol/inbox",
        None,
    );
    h.transport.respond_to_posts(|_post| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Bytes::from_static(b"stub exploded"),
        )
    });

    let sender = alice_sender();
    let context = h
        .federation
        .create_context(Url::parse(ORIGIN).unwrap(), ());
    context
        .send_activity(
            &sender,
            Recipients::List(vec![reference("https://b.example/users/carol")]),
            note_activity("https://home.example/create/12"),
            SendOptions::default(),
        )
        .await
        .unwrap();

    run_workers_for(&h, Duration::from_secs(2)).await;

    assert_eq!(h.transport.recorded_posts().len(), 3, "one post per attempt");
    let (attempt, body) = captured.lock().unwrap().clone().expect("handler called");
    assert_eq!(attempt, 2, "zero-based attempt counter of the final try");
    assert_eq!(body.as_deref(), Some("stub exploded"));

    // The delivery record is removed on terminal failure.
    let record_key = KvKey::new([
        "delivery",
        &format!("{ORIGIN}/users/alice#main"),
        "https://home.example/create/12",
        "https://b.example/users/carol/inbox",
    ]);
    assert_eq!(h.kv.get(&record_key).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn key_selection_prefers_the_algorithm_the_origin_accepted_before() {
    let h = harness(FederationConfig::testing());
    seed_remote_actor(
        &h.transport,
        "https://b.example/users/carol",
        "https://b.example/users/carol/inbox",
        None,
    );
    // The destination origin accepted Ed25519 in the past.
    h.kv
        .set(
            &KvKey::new(["server-algorithm", "https://b.example"]),
            json!("ed25519"),
            None,
        )
        .await
        .unwrap();

    let sender = Sender::new(vec![
        test_key_pair(
            &format!("{ORIGIN}/users/alice#main"),
            KeyAlgorithm::RsaSha256,
            b"alice-rsa-seed",
        ),
        test_key_pair(
            &format!("{ORIGIN}/users/alice#ed"),
            KeyAlgorithm::Ed25519,
            b"alice-ed-seed",
        ),
    ]);
    let context = h
        .federation
        .create_context(Url::parse(ORIGIN).unwrap(), ());
    context
        .send_activity(
            &sender,
            Recipients::List(vec![reference("https://b.example/users/carol")]),
            note_activity("https://home.example/create/13"),
            SendOptions::default(),
        )
        .await
        .unwrap();
    run_workers_for(&h, Duration::from_millis(400)).await;

    let posts = h.transport.recorded_posts();
    assert_eq!(posts.len(), 1);
    // The Ed25519 key signs under RFC 9421, so the request carries
    // Signature-Input rather than a bare cavage Signature header.
    assert!(posts[0].headers.contains_key("signature-input"));
}

#[tokio::test(flavor = "multi_thread")]
async fn follower_collection_fan_out_uses_the_followers_dispatcher() {
    let h = harness(FederationConfig::testing());
    seed_remote_actor(
        &h.transport,
        "https://faraway.example/users/carol",
        "https://faraway.example/users/carol/inbox",
        None,
    );

    let context = h
        .federation
        .create_context(Url::parse(ORIGIN).unwrap(), ());
    context
        .send_activity(
            &alice_sender(),
            Recipients::Followers {
                identifier: "alice".into(),
            },
            note_activity("https://home.example/create/14"),
            SendOptions::default(),
        )
        .await
        .unwrap();
    run_workers_for(&h, Duration::from_millis(400)).await;

    let posts = h.transport.recorded_posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(
        posts[0].url.as_str(),
        "https://faraway.example/users/carol/inbox"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn blind_recipients_are_stripped_from_the_wire_document() {
    let h = harness(FederationConfig::testing());
    seed_remote_actor(
        &h.transport,
        "https://b.example/users/carol",
        "https://b.example/users/carol/inbox",
        None,
    );

    let mut activity = note_activity("https://home.example/create/15");
    activity["bcc"] = json!(["https://b.example/users/carol"]);

    let context = h
        .federation
        .create_context(Url::parse(ORIGIN).unwrap(), ());
    context
        .send_activity(
            &alice_sender(),
            Recipients::List(vec![reference("https://b.example/users/carol")]),
            activity,
            SendOptions::default(),
        )
        .await
        .unwrap();
    run_workers_for(&h, Duration::from_millis(400)).await;

    let posts = h.transport.recorded_posts();
    assert_eq!(posts.len(), 1);
    let wire: Value = serde_json::from_slice(&posts[0].body).unwrap();
    assert!(wire.get("bcc").is_none());
}
