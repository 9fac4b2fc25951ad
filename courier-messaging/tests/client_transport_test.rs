// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::time::Duration;

use nostr_relay_builder::prelude::*;

use courier_messaging::{EventQuery, NostrClientTransport, RelayTransport};

#[tokio::test]
async fn test_publish_and_fetch_through_mock_relay() {
    let mock_relay = MockRelay::run().await.expect("Failed to start mock relay");
    let relay = mock_relay.url().to_string();

    let transport = NostrClientTransport::connect(std::slice::from_ref(&relay))
        .await
        .expect("Failed to connect");

    let keys = Keys::generate();
    let event = EventBuilder::text_note("over the wire")
        .sign_with_keys(&keys)
        .unwrap();

    let ack = transport.publish(&relay, &event).await.unwrap();
    assert!(ack.is_success());

    let found = transport
        .fetch(
            std::slice::from_ref(&relay),
            &EventQuery::new().author(keys.public_key()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, event.id);

    transport.disconnect().await;
}

#[tokio::test]
#[ignore] // Timing-sensitive against a live socket - run with: cargo test -- --ignored
async fn test_subscription_receives_new_events() {
    let mock_relay = MockRelay::run().await.expect("Failed to start mock relay");
    let relay = mock_relay.url().to_string();
    let relays = vec![relay.clone()];

    let transport = NostrClientTransport::connect(&relays).await.unwrap();
    let keys = Keys::generate();
    let mut stream = transport
        .subscribe(&relays, EventQuery::new().author(keys.public_key()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let event = EventBuilder::text_note("live").sign_with_keys(&keys).unwrap();
    transport.publish(&relay, &event).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("no event within 5s")
        .expect("stream closed");
    assert_eq!(received.id, event.id);
}
