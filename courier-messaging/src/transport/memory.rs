// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process relay network for tests and offline hosts.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use courier_core::{relay::normalize_relay_url, CourierError, Result};

use super::{EventQuery, EventStream, RelayAck, RelayTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayBehavior {
    Online,
    /// Connection refused.
    Offline,
    /// Connected but refuses every event.
    Rejecting,
    /// Connected but never answers.
    Stalled,
}

#[derive(Default)]
struct MemoryRelay {
    events: Vec<Event>,
    ids: HashSet<EventId>,
    behavior: Option<RelayBehavior>,
}

impl MemoryRelay {
    fn behavior(&self) -> RelayBehavior {
        self.behavior.unwrap_or(RelayBehavior::Online)
    }
}

struct Subscriber {
    relays: HashSet<String>,
    query: EventQuery,
    seen: HashSet<EventId>,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct NetworkState {
    relays: HashMap<String, MemoryRelay>,
    subscribers: Vec<Subscriber>,
}

/// Shared handle to a set of simulated relays. Clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryRelayNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryRelayNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relays(urls: &[String]) -> Self {
        let network = Self::new();
        for url in urls {
            network.add_relay(url);
        }
        network
    }

    pub fn add_relay(&self, url: &str) {
        self.state
            .lock()
            .relays
            .entry(normalize_relay_url(url))
            .or_default();
    }

    pub fn set_behavior(&self, url: &str, behavior: RelayBehavior) {
        let mut state = self.state.lock();
        let relay = state.relays.entry(normalize_relay_url(url)).or_default();
        relay.behavior = Some(behavior);
    }

    /// Events stored on `url`, oldest first.
    pub fn events_on(&self, url: &str) -> Vec<Event> {
        self.state
            .lock()
            .relays
            .get(&normalize_relay_url(url))
            .map(|r| r.events.clone())
            .unwrap_or_default()
    }

    pub fn total_events(&self) -> usize {
        self.state.lock().relays.values().map(|r| r.events.len()).sum()
    }

    fn behavior_of(&self, url: &str) -> Option<RelayBehavior> {
        self.state
            .lock()
            .relays
            .get(&normalize_relay_url(url))
            .map(MemoryRelay::behavior)
    }
}

#[async_trait]
impl RelayTransport for MemoryRelayNetwork {
    async fn publish(&self, relay: &str, event: &Event) -> Result<RelayAck> {
        let url = normalize_relay_url(relay);
        match self.behavior_of(&url) {
            None | Some(RelayBehavior::Offline) => {
                return Err(CourierError::transport(format!("{url}: connection refused")));
            }
            Some(RelayBehavior::Stalled) => {
                std::future::pending::<()>().await;
            }
            Some(RelayBehavior::Rejecting) => {
                return Ok(RelayAck::Rejected("blocked: not accepting events".into()));
            }
            Some(RelayBehavior::Online) => {}
        }

        if event.verify().is_err() {
            return Ok(RelayAck::Rejected("invalid: bad signature".into()));
        }

        let mut state = self.state.lock();
        let Some(stored) = state.relays.get_mut(&url) else {
            return Err(CourierError::transport(format!("{url}: connection refused")));
        };

        if !stored.ids.insert(event.id) {
            return Ok(RelayAck::Duplicate);
        }
        stored.events.push(event.clone());

        state.subscribers.retain_mut(|sub| {
            if sub.relays.contains(&url) && sub.query.matches(event) && sub.seen.insert(event.id) {
                return sub.tx.send(event.clone()).is_ok();
            }
            !sub.tx.is_closed()
        });

        Ok(RelayAck::Accepted)
    }

    async fn fetch(
        &self,
        relays: &[String],
        query: &EventQuery,
        _timeout: Duration,
    ) -> Result<Vec<Event>> {
        let urls: Vec<String> = relays.iter().map(|r| normalize_relay_url(r)).collect();

        if urls
            .iter()
            .any(|u| self.behavior_of(u) == Some(RelayBehavior::Stalled))
        {
            std::future::pending::<()>().await;
        }

        let state = self.state.lock();
        let mut seen = HashSet::new();
        let mut found: Vec<Event> = urls
            .iter()
            .filter_map(|u| state.relays.get(u))
            .filter(|r| r.behavior() == RelayBehavior::Online)
            .flat_map(|r| r.events.iter())
            .filter(|e| query.matches(e))
            .filter(|e| seen.insert(e.id))
            .cloned()
            .collect();

        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn subscribe(&self, relays: &[String], query: EventQuery) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let relays: HashSet<String> = relays.iter().map(|r| normalize_relay_url(r)).collect();

        self.state.lock().subscribers.push(Subscriber {
            relays,
            query,
            seen: HashSet::new(),
            tx,
        });
        Ok(EventStream::new(rx))
    }
}
