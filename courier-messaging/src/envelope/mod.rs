// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Envelope construction and opening.
//!
//! Envelope shapes leaving this module: plain signed events, kind 4
//! direct messages, NIP-59 gift wraps, kind 10050 inbox advertisements and
//! NIP-44 control messages of custom kinds. Each has a matching open
//! routine in [`EnvelopeEngine::open`].
mod gift_wrap;

use std::sync::Arc;

use nostr_sdk::prelude::*;
use tracing::{debug, instrument};

use courier_core::relay::{sanitize_relays, MAX_INBOX_RELAYS};
use courier_core::{CourierError, Result};

use crate::signer::{Action, EncryptionScheme, SealRequest, SignerBackend, SignerRegistry};
use crate::transport::tag_values;

pub use gift_wrap::{Rumor, KIND_CHAT_MESSAGE, KIND_GROUP_TEMPLATE, TIMESTAMP_TWEAK_RANGE};

const RELAY_TAG: &str = "relay";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEnvelope {
    SignedEvent(Event),
    DirectEncrypted(Event),
    SealedGiftWrap(Event),
    InboxAdvertisement(Event),
    /// Custom-kind protocol message, NIP-44 encrypted to one recipient.
    Control(Event),
}

impl MessageEnvelope {
    pub fn event(&self) -> &Event {
        match self {
            MessageEnvelope::SignedEvent(e)
            | MessageEnvelope::DirectEncrypted(e)
            | MessageEnvelope::SealedGiftWrap(e)
            | MessageEnvelope::InboxAdvertisement(e)
            | MessageEnvelope::Control(e) => e,
        }
    }

    pub fn into_event(self) -> Event {
        match self {
            MessageEnvelope::SignedEvent(e)
            | MessageEnvelope::DirectEncrypted(e)
            | MessageEnvelope::SealedGiftWrap(e)
            | MessageEnvelope::InboxAdvertisement(e)
            | MessageEnvelope::Control(e) => e,
        }
    }

    /// Classify a received event by kind.
    pub fn classify(event: Event) -> Self {
        match event.kind {
            Kind::EncryptedDirectMessage => MessageEnvelope::DirectEncrypted(event),
            Kind::GiftWrap => MessageEnvelope::SealedGiftWrap(event),
            Kind::InboxRelays => MessageEnvelope::InboxAdvertisement(event),
            _ => MessageEnvelope::SignedEvent(event),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenedEnvelope {
    Signed(Event),
    Direct {
        sender: PublicKey,
        plaintext: String,
    },
    GiftWrap(Rumor),
    Inbox {
        author: PublicKey,
        relays: Vec<String>,
    },
    Control {
        sender: PublicKey,
        kind: Kind,
        plaintext: String,
    },
}

/// Builds envelopes with whichever signer the registry selects.
pub struct EnvelopeEngine {
    registry: Arc<SignerRegistry>,
}

impl EnvelopeEngine {
    pub fn new(registry: Arc<SignerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SignerRegistry> {
        &self.registry
    }

    async fn signer(&self) -> Result<Arc<dyn SignerBackend>> {
        self.registry.select(Action::SignEvent).await
    }

    /// Public key envelopes are currently signed with.
    pub async fn author(&self) -> Result<PublicKey> {
        self.signer().await?.public_key().await
    }

    /// Sign `builder` with the selected signer and check the result before
    /// handing it out.
    #[instrument(skip_all)]
    pub async fn signed_event(&self, builder: EventBuilder) -> Result<MessageEnvelope> {
        let signer = self.signer().await?;
        let event = sign_verified(signer.as_ref(), builder).await?;
        Ok(MessageEnvelope::SignedEvent(event))
    }

    pub async fn profile(&self, metadata: &Metadata) -> Result<MessageEnvelope> {
        self.signed_event(EventBuilder::metadata(metadata)).await
    }

    /// Kind 4 message to `recipient`, encrypted with `scheme`.
    #[instrument(skip(self, plaintext), fields(recipient = %recipient))]
    pub async fn direct_message(
        &self,
        recipient: &PublicKey,
        plaintext: &str,
        scheme: EncryptionScheme,
    ) -> Result<MessageEnvelope> {
        let signer = self.signer().await?;
        let expected = signer.public_key().await?;
        let event = signer
            .seal_encrypted(SealRequest {
                recipient: *recipient,
                scheme,
                plaintext: plaintext.to_string(),
                kind: Kind::EncryptedDirectMessage,
                tags: vec![Tag::public_key(*recipient)],
                created_at: Timestamp::now(),
            })
            .await?;
        check_signed(&event, &expected)?;
        Ok(MessageEnvelope::DirectEncrypted(event))
    }

    /// Kind 14 chat message sealed and gift wrapped for `recipient`.
    pub async fn gift_wrap(&self, recipient: &PublicKey, text: &str) -> Result<MessageEnvelope> {
        self.gift_wrap_kind(recipient, Kind::from(KIND_CHAT_MESSAGE), text, Vec::new())
            .await
    }

    /// Gift wrap a rumor of kind 14 or 15 with additional rumor tags.
    #[instrument(skip(self, content, extra_tags), fields(recipient = %recipient))]
    pub async fn gift_wrap_kind(
        &self,
        recipient: &PublicKey,
        kind: Kind,
        content: &str,
        extra_tags: Vec<Tag>,
    ) -> Result<MessageEnvelope> {
        let signer = self.signer().await?;
        let sender = signer.public_key().await?;
        let rumor = gift_wrap::build_rumor(sender, recipient, kind, content, extra_tags)?;
        let wrap = gift_wrap::seal_and_wrap(signer.as_ref(), recipient, &rumor).await?;
        debug!(wrap = %wrap.id, one_time = %wrap.pubkey, "gift wrap built");
        Ok(MessageEnvelope::SealedGiftWrap(wrap))
    }

    /// Kind 10050 listing at most [`MAX_INBOX_RELAYS`] valid, distinct relays.
    pub async fn inbox_advertisement(&self, relays: &[String]) -> Result<MessageEnvelope> {
        let relays = sanitize_relays(relays, MAX_INBOX_RELAYS);
        if relays.is_empty() {
            return Err(CourierError::invalid_input("no valid inbox relays"));
        }
        let tags = relays
            .iter()
            .map(|url| Tag::custom(TagKind::custom(RELAY_TAG), [url.clone()]));
        let signer = self.signer().await?;
        let event = sign_verified(
            signer.as_ref(),
            EventBuilder::new(Kind::InboxRelays, "").tags(tags),
        )
        .await?;
        Ok(MessageEnvelope::InboxAdvertisement(event))
    }

    /// NIP-44 encrypted message of a custom `kind` for `recipient`, used by
    /// the relay-borne coordination protocols.
    #[instrument(skip(self, payload, extra_tags), fields(recipient = %recipient, kind = kind.as_u16()))]
    pub async fn control_message(
        &self,
        recipient: &PublicKey,
        kind: Kind,
        payload: &str,
        extra_tags: Vec<Tag>,
    ) -> Result<MessageEnvelope> {
        let signer = self.signer().await?;
        let expected = signer.public_key().await?;
        let mut tags = vec![Tag::public_key(*recipient)];
        tags.extend(extra_tags);
        let event = signer
            .seal_encrypted(SealRequest {
                recipient: *recipient,
                scheme: EncryptionScheme::Nip44,
                plaintext: payload.to_string(),
                kind,
                tags,
                created_at: Timestamp::now(),
            })
            .await?;
        check_signed(&event, &expected)?;
        Ok(MessageEnvelope::Control(event))
    }

    /// Decrypt a control message addressed to the selected signer.
    pub async fn open_control(&self, event: &Event) -> Result<String> {
        if event.verify().is_err() {
            return Err(CourierError::EnvelopeOpenFailed);
        }
        let signer = self.signer().await?;
        signer
            .nip44_decrypt(&event.pubkey, &event.content)
            .await
            .map_err(open_failure)
    }

    pub async fn open(&self, envelope: &MessageEnvelope) -> Result<OpenedEnvelope> {
        match envelope {
            MessageEnvelope::SignedEvent(event) => {
                event
                    .verify()
                    .map_err(|e| CourierError::SignatureVerificationFailed(e.to_string()))?;
                Ok(OpenedEnvelope::Signed(event.clone()))
            }
            MessageEnvelope::DirectEncrypted(event) => {
                let plaintext = self.open_direct_message(event).await?;
                Ok(OpenedEnvelope::Direct {
                    sender: event.pubkey,
                    plaintext,
                })
            }
            MessageEnvelope::SealedGiftWrap(event) => {
                Ok(OpenedEnvelope::GiftWrap(self.open_gift_wrap(event).await?))
            }
            MessageEnvelope::InboxAdvertisement(event) => {
                event
                    .verify()
                    .map_err(|e| CourierError::SignatureVerificationFailed(e.to_string()))?;
                Ok(OpenedEnvelope::Inbox {
                    author: event.pubkey,
                    relays: parse_inbox_relays(event),
                })
            }
            MessageEnvelope::Control(event) => Ok(OpenedEnvelope::Control {
                sender: event.pubkey,
                kind: event.kind,
                plaintext: self.open_control(event).await?,
            }),
        }
    }

    /// Decrypt a kind 4 message sent to or by the selected signer.
    pub async fn open_direct_message(&self, event: &Event) -> Result<String> {
        let signer = self.signer().await?;
        open_direct_message_with(signer.as_ref(), event).await
    }

    pub async fn open_gift_wrap(&self, wrap: &Event) -> Result<Rumor> {
        let signer = self.signer().await?;
        gift_wrap::unwrap(signer.as_ref(), wrap).await
    }
}

/// Open a gift wrap with an explicit recipient signer.
pub async fn open_gift_wrap_with(signer: &dyn SignerBackend, wrap: &Event) -> Result<Rumor> {
    gift_wrap::unwrap(signer, wrap).await
}

pub async fn open_direct_message_with(signer: &dyn SignerBackend, event: &Event) -> Result<String> {
    if event.kind != Kind::EncryptedDirectMessage || event.verify().is_err() {
        return Err(CourierError::EnvelopeOpenFailed);
    }
    let own = signer.public_key().await?;
    let peer = if event.pubkey == own {
        tag_values(event, "p")
            .next()
            .and_then(|hex| PublicKey::from_hex(hex).ok())
            .ok_or(CourierError::EnvelopeOpenFailed)?
    } else {
        event.pubkey
    };
    signer
        .decrypt(detect_scheme(&event.content), &peer, &event.content)
        .await
        .map_err(open_failure)
}

/// Errors the user must act on (reauthenticate, register a signer) pass
/// through; everything else reads as an undecryptable envelope.
pub(crate) fn open_failure(err: CourierError) -> CourierError {
    if err.requires_reauth()
        || matches!(
            err,
            CourierError::RecursionLimitExceeded(_) | CourierError::NoEligibleSigner(_)
        )
    {
        err
    } else {
        CourierError::EnvelopeOpenFailed
    }
}

/// NIP-04 payloads carry an `?iv=` suffix; everything else is NIP-44.
pub fn detect_scheme(content: &str) -> EncryptionScheme {
    if content.contains("?iv=") {
        EncryptionScheme::Nip04
    } else {
        EncryptionScheme::Nip44
    }
}

/// Relays listed in a kind 10050 event, validated and capped.
pub fn parse_inbox_relays(event: &Event) -> Vec<String> {
    if event.kind != Kind::InboxRelays {
        return Vec::new();
    }
    let urls: Vec<String> = tag_values(event, RELAY_TAG).cloned().collect();
    sanitize_relays(&urls, MAX_INBOX_RELAYS)
}

async fn sign_verified(signer: &dyn SignerBackend, builder: EventBuilder) -> Result<Event> {
    let author = signer.public_key().await?;
    let mut unsigned = builder.build(author);
    unsigned.ensure_id();
    let expected_id = unsigned.id;

    let event = signer.sign_event(unsigned).await?;
    check_signed(&event, &author)?;
    if expected_id.is_some_and(|id| id != event.id) {
        return Err(CourierError::SignatureVerificationFailed(
            "event id changed during signing".into(),
        ));
    }
    Ok(event)
}

fn check_signed(event: &Event, author: &PublicKey) -> Result<()> {
    event
        .verify()
        .map_err(|e| CourierError::SignatureVerificationFailed(e.to_string()))?;
    if event.pubkey != *author {
        return Err(CourierError::SignatureVerificationFailed(format!(
            "expected author {author}, got {}",
            event.pubkey
        )));
    }
    Ok(())
}
