// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Inbox relay discovery and publish fan-out.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use courier_core::relay::{
    merge_relays, sanitize_relays, select_geohash_relays, GeoRelay, TrustTier, MAX_INBOX_RELAYS,
};
use courier_core::{CourierError, Result, Timeouts};

use crate::envelope::parse_inbox_relays;
use crate::transport::{EventQuery, RelayAck, RelayTransport};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct DirectoryConfig {
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub discovery_timeout: Duration,
    pub publish_timeout: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self::from(&Timeouts::default())
    }
}

impl From<&Timeouts> for DirectoryConfig {
    fn from(timeouts: &Timeouts) -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            discovery_timeout: timeouts.discovery(),
            publish_timeout: timeouts.publish(),
        }
    }
}

/// Where an event should go. Explicit `relays` override discovery.
#[derive(Debug, Clone, Default)]
pub struct PublishRoute {
    pub relays: Option<Vec<String>>,
    pub recipients: Vec<PublicKey>,
    pub sender: Option<PublicKey>,
}

impl PublishRoute {
    pub fn to_relays(relays: Vec<String>) -> Self {
        Self {
            relays: Some(relays),
            ..Self::default()
        }
    }

    pub fn to_recipient(sender: PublicKey, recipient: PublicKey) -> Self {
        Self {
            relays: None,
            recipients: vec![recipient],
            sender: Some(sender),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub accepted: Vec<String>,
    pub duplicate: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl PublishReport {
    pub fn attempted(&self) -> usize {
        self.accepted.len() + self.duplicate.len() + self.failed.len()
    }

    pub fn delivered(&self) -> usize {
        self.accepted.len() + self.duplicate.len()
    }
}

struct CacheEntry {
    relays: Vec<String>,
    expires_at: Instant,
}

pub struct RelayDirectory {
    transport: Arc<dyn RelayTransport>,
    defaults: Vec<String>,
    cache: Mutex<HashMap<PublicKey, CacheEntry>>,
    config: DirectoryConfig,
}

impl RelayDirectory {
    pub fn new(transport: Arc<dyn RelayTransport>, defaults: Vec<String>) -> Self {
        Self::with_config(transport, defaults, DirectoryConfig::default())
    }

    pub fn with_config(
        transport: Arc<dyn RelayTransport>,
        defaults: Vec<String>,
        config: DirectoryConfig,
    ) -> Self {
        Self {
            transport,
            defaults: merge_relays([defaults.as_slice()]),
            cache: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn defaults(&self) -> &[String] {
        &self.defaults
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn RelayTransport> {
        &self.transport
    }

    /// Inbox relays advertised by `pubkey`. Never waits longer than the
    /// discovery timeout; a timeout or missing advertisement yields an empty
    /// list.
    #[instrument(skip(self), fields(pubkey = %pubkey))]
    pub async fn resolve_inbox(&self, pubkey: &PublicKey) -> Vec<String> {
        if let Some(relays) = self.cached(pubkey) {
            debug!("inbox cache hit");
            return relays;
        }

        match self.discover(pubkey).await {
            Ok(relays) => {
                if !relays.is_empty() {
                    self.remember(*pubkey, relays.clone());
                }
                relays
            }
            Err(e) => {
                debug!(error = %e, "inbox discovery gave up");
                Vec::new()
            }
        }
    }

    /// Seed the cache, e.g. after publishing our own advertisement.
    pub fn remember(&self, pubkey: PublicKey, relays: Vec<String>) {
        let relays = sanitize_relays(&relays, MAX_INBOX_RELAYS);
        if relays.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut cache = self.cache.lock();
        cache.retain(|_, entry| entry.expires_at > now);
        if cache.len() >= self.config.cache_capacity && !cache.contains_key(&pubkey) {
            let oldest = cache
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(pk, _)| *pk);
            if let Some(pk) = oldest {
                cache.remove(&pk);
            }
        }
        cache.insert(
            pubkey,
            CacheEntry {
                relays,
                expires_at: now + self.config.cache_ttl,
            },
        );
    }

    pub fn invalidate(&self, pubkey: &PublicKey) {
        self.cache.lock().remove(pubkey);
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().len()
    }

    fn cached(&self, pubkey: &PublicKey) -> Option<Vec<String>> {
        let mut cache = self.cache.lock();
        let entry = cache.get(pubkey)?;
        if entry.expires_at <= Instant::now() {
            cache.remove(pubkey);
            return None;
        }
        Some(entry.relays.clone())
    }

    async fn discover(&self, pubkey: &PublicKey) -> Result<Vec<String>> {
        let query = EventQuery::new()
            .kind(Kind::InboxRelays)
            .author(*pubkey)
            .limit(1);
        let bound = self.config.discovery_timeout;

        let events = tokio::time::timeout(bound, self.transport.fetch(&self.defaults, &query, bound))
            .await
            .map_err(|_| CourierError::RelayDiscoveryTimeout(bound))??;

        Ok(events
            .into_iter()
            .filter(|e| e.pubkey == *pubkey && e.verify().is_ok())
            .max_by_key(|e| e.created_at)
            .map(|e| parse_inbox_relays(&e))
            .unwrap_or_default())
    }

    /// Relays `route` resolves to, deduplicated, in priority order.
    pub async fn targets(&self, route: &PublishRoute) -> Vec<String> {
        if let Some(explicit) = &route.relays {
            return sanitize_relays(explicit, usize::MAX);
        }

        let mut lists: Vec<Vec<String>> = Vec::with_capacity(route.recipients.len() + 2);
        for recipient in &route.recipients {
            lists.push(self.resolve_inbox(recipient).await);
        }
        if let Some(sender) = &route.sender {
            lists.push(self.resolve_inbox(sender).await);
        }
        lists.push(self.defaults.clone());

        merge_relays(lists.iter().map(Vec::as_slice))
    }

    /// Publish to every target relay concurrently. Succeeds when at least
    /// one relay accepts the event or already has it.
    #[instrument(skip(self, event, route), fields(event = %event.id, kind = event.kind.as_u16()))]
    pub async fn publish(&self, event: &Event, route: &PublishRoute) -> Result<PublishReport> {
        let targets = self.targets(route).await;
        if targets.is_empty() {
            return Err(CourierError::RelayPublishFailed { attempted: 0 });
        }

        let bound = self.config.publish_timeout;
        let mut tasks = JoinSet::new();
        for relay in targets {
            let transport = Arc::clone(&self.transport);
            let event = event.clone();
            tasks.spawn(async move {
                let outcome = tokio::time::timeout(bound, transport.publish(&relay, &event)).await;
                (relay, outcome)
            });
        }

        let mut report = PublishReport::default();
        while let Some(joined) = tasks.join_next().await {
            let (relay, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "publish task failed");
                    continue;
                }
            };
            match outcome {
                Ok(Ok(RelayAck::Accepted)) => report.accepted.push(relay),
                Ok(Ok(RelayAck::Duplicate)) => report.duplicate.push(relay),
                Ok(Ok(RelayAck::Rejected(reason))) => report.failed.push((relay, reason)),
                Ok(Err(e)) => report.failed.push((relay, e.to_string())),
                Err(_) => report.failed.push((relay, format!("timed out after {bound:?}"))),
            }
        }

        for (relay, reason) in &report.failed {
            debug!(relay = %relay, reason = %reason, "relay did not take event");
        }

        if report.delivered() == 0 {
            warn!(attempted = report.attempted(), "publish failed on every relay");
            return Err(CourierError::RelayPublishFailed {
                attempted: report.attempted(),
            });
        }

        info!(
            delivered = report.delivered(),
            attempted = report.attempted(),
            "event published"
        );
        Ok(report)
    }

    /// Deterministic relay subset for a geohash cell.
    pub fn geohash_relays(
        &self,
        geohash: &str,
        candidates: &[GeoRelay],
        count: usize,
        min_tier: Option<TrustTier>,
    ) -> Vec<String> {
        select_geohash_relays(geohash, candidates, count, min_tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryRelayNetwork, RelayBehavior};

    const D1: &str = "wss://d1.example.com/";
    const D2: &str = "wss://d2.example.com/";
    const INBOX: &str = "wss://inbox.example.com/";

    fn inbox_event(keys: &Keys, relays: &[&str], at: u64) -> Event {
        let tags = relays
            .iter()
            .map(|r| Tag::custom(TagKind::custom("relay"), [r.to_string()]));
        EventBuilder::new(Kind::InboxRelays, "")
            .tags(tags)
            .custom_created_at(Timestamp::from(at))
            .sign_with_keys(keys)
            .unwrap()
    }

    fn setup() -> (MemoryRelayNetwork, RelayDirectory) {
        let net = MemoryRelayNetwork::with_relays(&[D1.into(), D2.into(), INBOX.into()]);
        let dir = RelayDirectory::new(Arc::new(net.clone()), vec![D1.into(), D2.into()]);
        (net, dir)
    }

    #[tokio::test]
    async fn test_resolve_latest_advertisement_and_cache() {
        let (net, dir) = setup();
        let keys = Keys::generate();
        net.publish(D1, &inbox_event(&keys, &["wss://old.example.com"], 1_000))
            .await
            .unwrap();
        net.publish(D2, &inbox_event(&keys, &[INBOX], 2_000))
            .await
            .unwrap();

        assert_eq!(dir.resolve_inbox(&keys.public_key()).await, vec![INBOX]);
        assert_eq!(dir.cached_entries(), 1);

        // Served from cache even when discovery would now fail.
        net.set_behavior(D1, RelayBehavior::Offline);
        net.set_behavior(D2, RelayBehavior::Offline);
        assert_eq!(dir.resolve_inbox(&keys.public_key()).await, vec![INBOX]);
    }

    #[tokio::test]
    async fn test_missing_advertisement_not_cached() {
        let (_net, dir) = setup();
        let keys = Keys::generate();
        assert!(dir.resolve_inbox(&keys.public_key()).await.is_empty());
        assert_eq!(dir.cached_entries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_entry_expires() {
        let (_net, dir) = setup();
        let pk = Keys::generate().public_key();
        dir.remember(pk, vec![INBOX.into()]);
        assert!(dir.cached(&pk).is_some());

        tokio::time::advance(DEFAULT_CACHE_TTL + Duration::from_secs(1)).await;
        assert!(dir.cached(&pk).is_none());
    }

    #[tokio::test]
    async fn test_cache_capacity_evicts_oldest() {
        let net = MemoryRelayNetwork::new();
        let config = DirectoryConfig {
            cache_capacity: 2,
            ..DirectoryConfig::default()
        };
        let dir = RelayDirectory::with_config(Arc::new(net), vec![D1.into()], config);

        let first = Keys::generate().public_key();
        dir.remember(first, vec![INBOX.into()]);
        tokio::time::sleep(Duration::from_millis(2)).await;
        dir.remember(Keys::generate().public_key(), vec![INBOX.into()]);
        dir.remember(Keys::generate().public_key(), vec![INBOX.into()]);

        assert_eq!(dir.cached_entries(), 2);
        assert!(dir.cached(&first).is_none());
    }

    #[tokio::test]
    async fn test_targets_union_in_order() {
        let (net, dir) = setup();
        let sender = Keys::generate();
        let recipient = Keys::generate();
        net.publish(D1, &inbox_event(&recipient, &[INBOX, D2], 1_000))
            .await
            .unwrap();

        let targets = dir
            .targets(&PublishRoute::to_recipient(
                sender.public_key(),
                recipient.public_key(),
            ))
            .await;
        assert_eq!(targets, vec![INBOX, D2, D1]);
    }

    #[tokio::test]
    async fn test_explicit_relays_override_discovery() {
        let (_net, dir) = setup();
        let targets = dir
            .targets(&PublishRoute::to_relays(vec![
                INBOX.into(),
                "wss://INBOX.example.com".into(),
                "http://bad.example.com".into(),
            ]))
            .await;
        assert_eq!(targets, vec![INBOX]);
    }

    #[tokio::test]
    async fn test_publish_partial_failure_reported() {
        let (net, dir) = setup();
        net.set_behavior(D2, RelayBehavior::Rejecting);
        let event = EventBuilder::text_note("x")
            .sign_with_keys(&Keys::generate())
            .unwrap();

        let report = dir.publish(&event, &PublishRoute::default()).await.unwrap();
        assert_eq!(report.accepted, vec![D1]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.attempted(), 2);
    }
}
