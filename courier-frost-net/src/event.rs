// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use nostr_sdk::prelude::*;

use crate::error::{FrostNetError, Result};
use crate::protocol::*;

pub(crate) const TIMESTAMP_TWEAK_RANGE: std::ops::Range<u64> = 0..5;

/// Cleartext routing tags. The payload itself is always encrypted.
pub fn routing_tags(msg: &GuardianMessage) -> Vec<Tag> {
    let mut tags = Vec::with_capacity(3);
    if let Some(session_id) = msg.session_id() {
        tags.push(Tag::custom(
            TagKind::custom("s"),
            [hex::encode(session_id)],
        ));
    }
    if let Some(request_id) = msg.request_id() {
        tags.push(Tag::identifier(request_id));
    }
    tags.push(Tag::custom(TagKind::custom("t"), [msg.message_type()]));
    tags
}

/// Builds guardian-side events signed with the guardian's own keys.
pub struct GuardianEventBuilder;

impl GuardianEventBuilder {
    pub fn build(keys: &Keys, recipient: &PublicKey, msg: &GuardianMessage) -> Result<Event> {
        let content = msg.to_json()?;
        let encrypted = nip44::encrypt(keys.secret_key(), recipient, &content, nip44::Version::V2)
            .map_err(|e| FrostNetError::Crypto(e.to_string()))?;

        EventBuilder::new(Kind::Custom(msg.kind()), encrypted)
            .custom_created_at(Timestamp::tweaked(TIMESTAMP_TWEAK_RANGE))
            .tag(Tag::public_key(*recipient))
            .tags(routing_tags(msg))
            .sign_with_keys(keys)
            .map_err(|e| FrostNetError::Nostr(e.to_string()))
    }

    /// Verify, decrypt and parse an event addressed to `keys`.
    pub fn decode(keys: &Keys, event: &Event) -> Result<GuardianMessage> {
        check_envelope(event)?;
        let plaintext = nip44::decrypt(keys.secret_key(), &event.pubkey, &event.content)
            .map_err(|e| FrostNetError::Crypto(format!("decrypt: {e}")))?;
        parse_payload(event, &plaintext)
    }
}

pub(crate) fn is_guardian_kind(kind: Kind) -> bool {
    let kind = kind.as_u16();
    kind == THRESHOLD_EVENT_KIND || kind == APPROVAL_EVENT_KIND
}

pub(crate) fn check_envelope(event: &Event) -> Result<()> {
    if !is_guardian_kind(event.kind) {
        return Err(FrostNetError::protocol(format!(
            "unexpected kind {}",
            event.kind.as_u16()
        )));
    }
    if event.content.len() > MAX_MESSAGE_SIZE * 2 {
        return Err(FrostNetError::protocol("message too large"));
    }
    event
        .verify()
        .map_err(|e| FrostNetError::Nostr(format!("bad event: {e}")))
}

/// Parse decrypted content and make sure it travelled on the right kind.
pub(crate) fn parse_payload(event: &Event, plaintext: &str) -> Result<GuardianMessage> {
    if plaintext.len() > MAX_MESSAGE_SIZE {
        return Err(FrostNetError::protocol("message too large"));
    }
    let msg = GuardianMessage::from_json(plaintext)?;
    if msg.kind() != event.kind.as_u16() {
        return Err(FrostNetError::protocol(format!(
            "{} sent on kind {}",
            msg.message_type(),
            event.kind.as_u16()
        )));
    }
    msg.validate().map_err(FrostNetError::Protocol)?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> GuardianMessage {
        GuardianMessage::ApprovalResponse(ApprovalResponsePayload {
            request_id: "req-1".into(),
            approved: true,
            reason: None,
        })
    }

    #[test]
    fn test_build_and_decode() {
        let guardian = Keys::generate();
        let coordinator = Keys::generate();

        let event = GuardianEventBuilder::build(&guardian, &coordinator.public_key(), &response())
            .unwrap();
        assert_eq!(event.kind, Kind::Custom(APPROVAL_EVENT_KIND));
        assert_eq!(event.tags.identifier(), Some("req-1"));

        let decoded = GuardianEventBuilder::decode(&coordinator, &event).unwrap();
        assert_eq!(decoded.request_id(), Some("req-1"));

        // Only the addressee can read it.
        assert!(GuardianEventBuilder::decode(&Keys::generate(), &event).is_err());
    }

    #[test]
    fn test_session_tag_present() {
        let keys = Keys::generate();
        let msg = GuardianMessage::Commitment(CommitmentPayload {
            session_id: [9u8; 32],
            share_index: 2,
            commitment: vec![1, 2, 3],
        });
        let event = GuardianEventBuilder::build(&keys, &Keys::generate().public_key(), &msg).unwrap();
        assert_eq!(event.kind, Kind::Custom(THRESHOLD_EVENT_KIND));
        let session_hex = hex::encode([9u8; 32]);
        assert!(event
            .tags
            .iter()
            .any(|t| t.as_slice() == ["s".to_string(), session_hex.clone()]));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let sender = Keys::generate();
        let receiver = Keys::generate();
        let content = nip44::encrypt(
            sender.secret_key(),
            &receiver.public_key(),
            response().to_json().unwrap(),
            nip44::Version::V2,
        )
        .unwrap();
        let event = EventBuilder::new(Kind::Custom(THRESHOLD_EVENT_KIND), content)
            .tag(Tag::public_key(receiver.public_key()))
            .sign_with_keys(&sender)
            .unwrap();
        assert!(GuardianEventBuilder::decode(&receiver, &event).is_err());
    }
}
