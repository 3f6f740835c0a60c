//! Ordering-key safety through the whole outbound path: deliveries to one
//! (key, inbox) pair are serialized, and the per-key lock is released
//! exactly once per dispatch so the stream never stalls.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use serde_json::json;
use url::Url;

use common::{ORIGIN, harness, run_workers_for, seed_remote_actor};
use weft::FederationConfig;
use weft::activity::Recipient;
use weft::domain_types::WorkerCount;
use weft::federation::{Recipients, SendOptions, Sender};
use weft::sig::test_utils::test_key_pair;
use weft::sig::KeyAlgorithm;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ordered_delivery_admits_one_in_flight_post_per_key_inbox_pair() {
    let mut config = FederationConfig::testing();
    config.ordered_delivery = true;
    config.worker_count = WorkerCount::try_new(3).unwrap();
    let h = harness(config);
    seed_remote_actor(
        &h.transport,
        "https://b.example/users/carol",
        "https://b.example/users/carol/inbox",
        None,
    );

    let in_flight = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    {
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        h.transport.respond_to_posts(move |_post| {
            let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(current, Ordering::SeqCst);
            // Hold the exchange open long enough for overlap to show.
            std::thread::sleep(Duration::from_millis(40));
            in_flight.fetch_sub(1, Ordering::SeqCst);
            (StatusCode::ACCEPTED, Bytes::new())
        });
    }

    let sender = Sender::new(vec![test_key_pair(
        &format!("{ORIGIN}/users/alice#main"),
        KeyAlgorithm::RsaSha256,
        b"alice-rsa-seed",
    )]);
    let context = h
        .federation
        .create_context(Url::parse(ORIGIN).unwrap(), ());
    for n in 0..3 {
        context
            .send_activity(
                &sender,
                Recipients::List(vec![Recipient::Reference(
                    Url::parse("https://b.example/users/carol").unwrap(),
                )]),
                json!({
                    "id": format!("https://home.example/create/order-{n}"),
                    "type": "Create",
                    "actor": format!("{ORIGIN}/users/alice"),
                    "object": {"type": "Note", "content": format!("note {n}")},
                }),
                SendOptions::default(),
            )
            .await
            .unwrap();
    }

    run_workers_for(&h, Duration::from_secs(1)).await;

    // Every delivery completed: the advisory hold was released once per
    // dispatch, so later messages with the same key were admitted.
    assert_eq!(h.transport.recorded_posts().len(), 3);
    // And never more than one exchange was open at a time.
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unordered_delivery_imposes_no_serialization() {
    let mut config = FederationConfig::testing();
    config.ordered_delivery = false;
    config.worker_count = WorkerCount::try_new(3).unwrap();
    let h = harness(config);
    for n in 0..3 {
        seed_remote_actor(
            &h.transport,
            &format!("https://b{n}.example/users/u"),
            &format!("https://b{n}.example/users/u/inbox"),
            None,
        );
    }
    h.transport.respond_to_posts(move |_post| {
        std::thread::sleep(Duration::from_millis(30));
        (StatusCode::ACCEPTED, Bytes::new())
    });

    let sender = Sender::new(vec![test_key_pair(
        &format!("{ORIGIN}/users/alice#main"),
        KeyAlgorithm::RsaSha256,
        b"alice-rsa-seed",
    )]);
    let context = h
        .federation
        .create_context(Url::parse(ORIGIN).unwrap(), ());
    context
        .send_activity(
            &sender,
            Recipients::List(
                (0..3)
                    .map(|n| {
                        Recipient::Reference(
                            Url::parse(&format!("https://b{n}.example/users/u")).unwrap(),
                        )
                    })
                    .collect(),
            ),
            json!({
                "id": "https://home.example/create/burst",
                "type": "Create",
                "actor": format!("{ORIGIN}/users/alice"),
                "object": {"type": "Note"},
            }),
            SendOptions::default(),
        )
        .await
        .unwrap();

    run_workers_for(&h, Duration::from_secs(1)).await;
    // All three distinct inboxes were reached; no cross-inbox ordering
    // constraint applies.
    assert_eq!(h.transport.recorded_posts().len(), 3);
}
