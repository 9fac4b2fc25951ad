// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::sync::Arc;

use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use tracing::{debug, info};

use courier_core::keys::identity_hash;
use courier_core::rate_limit::{KeyedRateLimiter, RateLimitConfig};
use courier_core::{CourierConfig, CourierError, Result};

use crate::directory::{DirectoryConfig, PublishReport, PublishRoute, RelayDirectory};
use crate::envelope::{EnvelopeEngine, MessageEnvelope, OpenedEnvelope};
use crate::signer::{Action, EncryptionScheme, SignerRegistry};
use crate::transport::{EventQuery, RelayTransport};

const ACTION_DIRECT: &str = "message.direct";
const ACTION_GIFT_WRAP: &str = "message.gift_wrap";
const ACTION_ADVERTISE: &str = "inbox.advertise";
const ACTION_PUBLISH: &str = "event.publish";

/// A built envelope and where it landed.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: MessageEnvelope,
    pub report: PublishReport,
}

/// Builds envelopes with the selected signer and publishes them through the
/// relay directory. Sends are rate limited per sender identity.
pub struct Messenger {
    engine: EnvelopeEngine,
    directory: Arc<RelayDirectory>,
    limiter: Mutex<KeyedRateLimiter>,
}

impl Messenger {
    pub fn new(registry: Arc<SignerRegistry>, directory: Arc<RelayDirectory>) -> Self {
        Self {
            engine: EnvelopeEngine::new(registry),
            directory,
            limiter: Mutex::new(KeyedRateLimiter::new(RateLimitConfig::default())),
        }
    }

    pub fn from_config(
        config: &CourierConfig,
        registry: Arc<SignerRegistry>,
        transport: Arc<dyn RelayTransport>,
    ) -> Self {
        let directory = RelayDirectory::with_config(
            transport,
            config.default_relays(),
            DirectoryConfig::from(&config.timeouts),
        );
        Self::new(registry, Arc::new(directory)).with_rate_limit(config.rate_limit())
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.limiter = Mutex::new(KeyedRateLimiter::new(config));
        self
    }

    pub fn engine(&self) -> &EnvelopeEngine {
        &self.engine
    }

    pub fn directory(&self) -> &Arc<RelayDirectory> {
        &self.directory
    }

    async fn sender(&self, action: &str) -> Result<PublicKey> {
        let signer = self.engine.registry().select(Action::SignEvent).await?;
        let sender = signer.public_key().await?;
        self.limiter
            .lock()
            .check_and_record(action, &identity_hash(&sender.to_bytes()))?;
        Ok(sender)
    }

    pub async fn send_direct_message(
        &self,
        recipient: &PublicKey,
        text: &str,
        scheme: EncryptionScheme,
    ) -> Result<Delivery> {
        let sender = self.sender(ACTION_DIRECT).await?;
        let envelope = self.engine.direct_message(recipient, text, scheme).await?;
        let report = self
            .directory
            .publish(envelope.event(), &PublishRoute::to_recipient(sender, *recipient))
            .await?;
        info!(recipient = %recipient, delivered = report.delivered(), "direct message sent");
        Ok(Delivery { envelope, report })
    }

    pub async fn send_gift_wrap(&self, recipient: &PublicKey, text: &str) -> Result<Delivery> {
        let sender = self.sender(ACTION_GIFT_WRAP).await?;
        let envelope = self.engine.gift_wrap(recipient, text).await?;
        let report = self
            .directory
            .publish(envelope.event(), &PublishRoute::to_recipient(sender, *recipient))
            .await?;
        info!(recipient = %recipient, delivered = report.delivered(), "gift wrap sent");
        Ok(Delivery { envelope, report })
    }

    /// Publish our kind 10050 to the default relays and the advertised
    /// relays, then seed the directory cache with it.
    pub async fn advertise_inbox(&self, relays: &[String]) -> Result<Delivery> {
        let sender = self.sender(ACTION_ADVERTISE).await?;
        let envelope = self.engine.inbox_advertisement(relays).await?;
        let advertised = crate::envelope::parse_inbox_relays(envelope.event());

        let mut targets = advertised.clone();
        targets.extend(self.directory.defaults().iter().cloned());
        let report = self
            .directory
            .publish(envelope.event(), &PublishRoute::to_relays(targets))
            .await?;

        self.directory.remember(sender, advertised);
        Ok(Delivery { envelope, report })
    }

    pub async fn publish_signed(&self, builder: EventBuilder) -> Result<Delivery> {
        let sender = self.sender(ACTION_PUBLISH).await?;
        let envelope = self.engine.signed_event(builder).await?;
        let route = PublishRoute {
            sender: Some(sender),
            ..PublishRoute::default()
        };
        let report = self.directory.publish(envelope.event(), &route).await?;
        Ok(Delivery { envelope, report })
    }

    /// Fetch and open direct messages and gift wraps addressed to the
    /// selected signer. Envelopes that fail to open are skipped.
    pub async fn receive(&self, since: Option<Timestamp>) -> Result<Vec<OpenedEnvelope>> {
        let signer = self.engine.registry().select(Action::SignEvent).await?;
        let own = signer.public_key().await?;

        let relays = self
            .directory
            .targets(&PublishRoute {
                sender: Some(own),
                ..PublishRoute::default()
            })
            .await;

        let mut query = EventQuery::new()
            .kind(Kind::EncryptedDirectMessage)
            .kind(Kind::GiftWrap)
            .recipient(own);
        if let Some(since) = since {
            query = query.since(since);
        }

        let bound = self.directory.config().discovery_timeout;
        let events = tokio::time::timeout(
            bound,
            self.directory.transport().fetch(&relays, &query, bound),
        )
        .await
        .map_err(|_| CourierError::RequestTimeout("inbox fetch".into()))??;

        let mut opened = Vec::with_capacity(events.len());
        for event in events {
            let id = event.id;
            match self.engine.open(&MessageEnvelope::classify(event)).await {
                Ok(envelope) => opened.push(envelope),
                Err(e) => debug!(event = %id, error = %e, "skipping unreadable envelope"),
            }
        }
        Ok(opened)
    }
}
