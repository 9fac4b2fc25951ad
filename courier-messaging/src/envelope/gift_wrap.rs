// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! rumor (14/15, unsigned) -> seal (13, sender) -> wrap (1059, one-time key)
use std::ops::Range;

use nostr_sdk::prelude::*;
use tracing::debug;

use courier_core::{CourierError, Result};

use super::open_failure;
use crate::signer::{EncryptionScheme, SealRequest, SignerBackend};

/// Seals and wraps are backdated by up to two days.
pub const TIMESTAMP_TWEAK_RANGE: Range<u64> = 0..2 * 24 * 60 * 60;

pub const KIND_CHAT_MESSAGE: u16 = 14;
pub const KIND_GROUP_TEMPLATE: u16 = 15;

/// Decrypted gift-wrap contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rumor {
    pub sender: PublicKey,
    pub kind: Kind,
    pub content: String,
    pub tags: Vec<Tag>,
    pub created_at: Timestamp,
}

pub(crate) fn is_rumor_kind(kind: Kind) -> bool {
    matches!(kind.as_u16(), KIND_CHAT_MESSAGE | KIND_GROUP_TEMPLATE)
}

pub(crate) fn build_rumor(
    sender: PublicKey,
    recipient: &PublicKey,
    kind: Kind,
    content: &str,
    extra_tags: Vec<Tag>,
) -> Result<UnsignedEvent> {
    if !is_rumor_kind(kind) {
        return Err(CourierError::invalid_input(format!(
            "kind {} cannot be gift wrapped",
            kind.as_u16()
        )));
    }
    let mut rumor = EventBuilder::new(kind, content)
        .tag(Tag::public_key(*recipient))
        .tags(extra_tags)
        .build(sender);
    rumor.ensure_id();
    Ok(rumor)
}

pub(crate) async fn seal_and_wrap(
    signer: &dyn SignerBackend,
    recipient: &PublicKey,
    rumor: &UnsignedEvent,
) -> Result<Event> {
    let seal = signer
        .seal_encrypted(SealRequest {
            recipient: *recipient,
            scheme: EncryptionScheme::Nip44,
            plaintext: rumor.as_json(),
            kind: Kind::Seal,
            tags: Vec::new(),
            created_at: Timestamp::tweaked(TIMESTAMP_TWEAK_RANGE),
        })
        .await?;

    if seal.verify().is_err() || seal.pubkey != rumor.pubkey {
        return Err(CourierError::SignatureVerificationFailed(
            "seal signed by unexpected key".into(),
        ));
    }

    let one_time = Keys::generate();
    let content = nip44::encrypt(
        one_time.secret_key(),
        recipient,
        seal.as_json(),
        nip44::Version::V2,
    )
    .map_err(|e| CourierError::crypto(e.to_string()))?;

    EventBuilder::new(Kind::GiftWrap, content)
        .tag(Tag::public_key(*recipient))
        .custom_created_at(Timestamp::tweaked(TIMESTAMP_TWEAK_RANGE))
        .sign_with_keys(&one_time)
        .map_err(|e| CourierError::crypto(e.to_string()))
}

/// Reverse [`seal_and_wrap`] with the recipient's signer. Session and
/// selection errors from the signer surface unchanged; any other failure in
/// either layer is reported as [`CourierError::EnvelopeOpenFailed`].
pub(crate) async fn unwrap(signer: &dyn SignerBackend, wrap: &Event) -> Result<Rumor> {
    try_unwrap(signer, wrap).await.map_err(|err| {
        debug!(wrap = %wrap.id, error = %err, "gift wrap rejected");
        open_failure(err)
    })
}

async fn try_unwrap(signer: &dyn SignerBackend, wrap: &Event) -> Result<Rumor> {
    if wrap.kind != Kind::GiftWrap {
        return Err(CourierError::crypto("not a gift wrap"));
    }
    wrap.verify()
        .map_err(|_| CourierError::crypto("wrap signature"))?;

    let unsealed = signer.unseal(wrap).await?;
    let rumor = UnsignedEvent::from_json(unsealed.rumor_json)
        .map_err(|_| CourierError::crypto("rumor json"))?;

    if rumor.pubkey != unsealed.seal_author {
        return Err(CourierError::crypto("rumor author differs from seal author"));
    }
    if !is_rumor_kind(rumor.kind) {
        return Err(CourierError::crypto("unexpected rumor kind"));
    }

    Ok(Rumor {
        sender: rumor.pubkey,
        kind: rumor.kind,
        content: rumor.content,
        tags: rumor.tags.to_vec(),
        created_at: rumor.created_at,
    })
}
