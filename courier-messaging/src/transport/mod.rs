// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Relay transport seam.
//!
//! Everything above this module talks to relays through [`RelayTransport`],
//! so the directory, bridge and threshold coordinator run unchanged against
//! live relays ([`NostrClientTransport`]) or the in-process
//! [`MemoryRelayNetwork`].
mod client;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use tokio::sync::mpsc;

use courier_core::Result;

pub use client::NostrClientTransport;
pub use memory::{MemoryRelayNetwork, RelayBehavior};

/// Outcome of publishing one event to one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAck {
    Accepted,
    /// The relay already had the event. Counts as delivered.
    Duplicate,
    Rejected(String),
}

impl RelayAck {
    pub fn is_success(&self) -> bool {
        matches!(self, RelayAck::Accepted | RelayAck::Duplicate)
    }
}

/// Transport-neutral event filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    pub kinds: Vec<Kind>,
    pub authors: Vec<PublicKey>,
    /// Matches events carrying a `p` tag for any of these keys.
    pub recipients: Vec<PublicKey>,
    /// Single-letter tag constraints, all of which must hold.
    pub tags: Vec<(char, String)>,
    pub since: Option<Timestamp>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: Kind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn author(mut self, author: PublicKey) -> Self {
        self.authors.push(author);
        self
    }

    pub fn recipient(mut self, recipient: PublicKey) -> Self {
        self.recipients.push(recipient);
        self
    }

    pub fn tag(mut self, letter: char, value: impl Into<String>) -> Self {
        self.tags.push((letter, value.into()));
        self
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey) {
            return false;
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if !self.recipients.is_empty() {
            let wanted: Vec<String> = self.recipients.iter().map(|pk| pk.to_hex()).collect();
            if !tag_values(event, "p").any(|v| wanted.iter().any(|w| w == v)) {
                return false;
            }
        }
        self.tags.iter().all(|(letter, value)| {
            let name = letter.to_string();
            let matched = tag_values(event, &name).any(|v| v == value);
            matched
        })
    }

    pub fn to_filter(&self) -> Filter {
        let mut filter = Filter::new();
        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds.clone());
        }
        if !self.authors.is_empty() {
            filter = filter.authors(self.authors.clone());
        }
        if !self.recipients.is_empty() {
            filter = filter.pubkeys(self.recipients.clone());
        }
        for (letter, value) in &self.tags {
            if let Ok(tag) = SingleLetterTag::from_char(*letter) {
                filter = filter.custom_tag(tag, value.clone());
            }
        }
        if let Some(since) = self.since {
            filter = filter.since(since);
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        filter
    }
}

/// Second element of every tag named `name`.
pub fn tag_values<'a>(event: &'a Event, name: &'a str) -> impl Iterator<Item = &'a String> + 'a {
    event.tags.iter().filter_map(move |tag| {
        let parts = tag.as_slice();
        match parts {
            [first, value, ..] if first == name => Some(value),
            _ => None,
        }
    })
}

/// Live events matching a subscription. Dropping the stream ends it.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    pub fn new(rx: mpsc::UnboundedReceiver<Event>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Publish to a single relay. Transport failures are `Err`; a relay
    /// that answered but refused the event is `Ok(RelayAck::Rejected)`.
    async fn publish(&self, relay: &str, event: &Event) -> Result<RelayAck>;

    /// One-shot query across `relays`, deduplicated by event id.
    async fn fetch(&self, relays: &[String], query: &EventQuery, timeout: Duration)
        -> Result<Vec<Event>>;

    async fn subscribe(&self, relays: &[String], query: EventQuery) -> Result<EventStream>;
}
