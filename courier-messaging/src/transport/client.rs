// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{debug, warn};

use courier_core::{CourierError, Result};

use super::{EventQuery, EventStream, RelayAck, RelayTransport};

const SEEN_CACHE: usize = 2048;

/// [`RelayTransport`] over a nostr-sdk relay pool. Events are signed before
/// they reach the transport, so the client carries no signer.
#[derive(Clone)]
pub struct NostrClientTransport {
    client: Client,
}

impl NostrClientTransport {
    pub async fn connect(relays: &[String]) -> Result<Self> {
        let client = Client::default();
        for relay in relays {
            client
                .add_relay(relay.as_str())
                .await
                .map_err(|e| CourierError::transport(e.to_string()))?;
        }
        client.connect().await;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }

    async fn ensure_relays(&self, relays: &[String]) -> Result<()> {
        let mut added = false;
        for relay in relays {
            added |= self
                .client
                .add_relay(relay.as_str())
                .await
                .map_err(|e| CourierError::transport(e.to_string()))?;
        }
        if added {
            self.client.connect().await;
        }
        Ok(())
    }
}

fn is_duplicate(message: &str) -> bool {
    message.to_ascii_lowercase().starts_with("duplicate")
}

#[async_trait]
impl RelayTransport for NostrClientTransport {
    async fn publish(&self, relay: &str, event: &Event) -> Result<RelayAck> {
        self.ensure_relays(&[relay.to_string()]).await?;

        let output = match self.client.send_event_to([relay], event).await {
            Ok(output) => output,
            Err(e) if is_duplicate(&e.to_string()) => return Ok(RelayAck::Duplicate),
            Err(e) => return Err(CourierError::transport(e.to_string())),
        };

        if !output.success.is_empty() {
            return Ok(RelayAck::Accepted);
        }

        match output.failed.into_values().next() {
            Some(message) if is_duplicate(&message) => Ok(RelayAck::Duplicate),
            Some(message) => Ok(RelayAck::Rejected(message)),
            None => Err(CourierError::transport(format!("{relay}: no response"))),
        }
    }

    async fn fetch(
        &self,
        relays: &[String],
        query: &EventQuery,
        timeout: Duration,
    ) -> Result<Vec<Event>> {
        self.ensure_relays(relays).await?;

        let events = self
            .client
            .fetch_events_from(relays.iter().map(String::as_str), query.to_filter(), timeout)
            .await
            .map_err(|e| CourierError::transport(e.to_string()))?;

        let mut found: Vec<Event> = events.into_iter().filter(|e| query.matches(e)).collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn subscribe(&self, relays: &[String], query: EventQuery) -> Result<EventStream> {
        self.ensure_relays(relays).await?;

        // Take the receiver before subscribing so nothing is missed between
        // REQ and the first poll.
        let mut notifications = self.client.notifications();
        let output = self
            .client
            .subscribe_to(relays.iter().map(String::as_str), query.to_filter(), None)
            .await
            .map_err(|e| CourierError::transport(e.to_string()))?;
        let subscription_id = output.val;

        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        tokio::spawn(async move {
            let mut seen: HashSet<EventId> = HashSet::new();
            let mut order: VecDeque<EventId> = VecDeque::new();

            loop {
                match notifications.recv().await {
                    Ok(RelayPoolNotification::Event {
                        subscription_id: sid,
                        event,
                        ..
                    }) if sid == subscription_id => {
                        if !query.matches(&event) || !seen.insert(event.id) {
                            continue;
                        }
                        order.push_back(event.id);
                        if order.len() > SEEN_CACHE {
                            if let Some(old) = order.pop_front() {
                                seen.remove(&old);
                            }
                        }
                        if tx.send(*event).is_err() {
                            break;
                        }
                    }
                    Ok(RelayPoolNotification::Shutdown) => break,
                    Ok(_) => {
                        if tx.is_closed() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "subscription lagged behind relay pool");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            client.unsubscribe(&subscription_id).await;
            debug!(subscription = %subscription_id, "subscription closed");
        });

        Ok(EventStream::new(rx))
    }
}
