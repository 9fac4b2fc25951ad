// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::sync::Arc;

use async_trait::async_trait;
use nostr_sdk::prelude::*;

use courier_core::{CourierError, Custodian, Result, SessionStatus};

use super::{
    parse_seal, Capabilities, EncryptionScheme, SealRequest, SignerBackend, SignerDescriptor,
    SignerKind, SignerStatus, StatusProbe, Unsealed,
};

/// Signer backed by one custodian session. Every key use goes through
/// [`Custodian::use_once`] and is charged against the session quota.
pub struct SessionSigner {
    custodian: Arc<Custodian>,
    session_id: String,
    pubkey: PublicKey,
}

impl SessionSigner {
    pub fn new(custodian: Arc<Custodian>, session_id: impl Into<String>) -> Result<Self> {
        let session_id = session_id.into();
        let pk_bytes = custodian.public_key(&session_id)?;
        let pubkey = PublicKey::from_slice(&pk_bytes).map_err(|e| CourierError::crypto(e.to_string()))?;
        Ok(Self {
            custodian,
            session_id,
            pubkey,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

fn keys_from(secret: &[u8; 32]) -> Result<Keys> {
    let sk = SecretKey::from_slice(secret).map_err(|_| CourierError::InvalidSecretKey)?;
    Ok(Keys::new(sk))
}

fn sign_with(secret: &[u8; 32], unsigned: UnsignedEvent) -> Result<Event> {
    let keys = keys_from(secret)?;
    if unsigned.pubkey != keys.public_key() {
        return Err(CourierError::invalid_input(
            "event author does not match session key",
        ));
    }
    unsigned
        .sign_with_keys(&keys)
        .map_err(|e| CourierError::crypto(e.to_string()))
}

fn encrypt_with(
    secret: &[u8; 32],
    scheme: EncryptionScheme,
    peer: &PublicKey,
    plaintext: &str,
) -> Result<String> {
    let keys = keys_from(secret)?;
    match scheme {
        EncryptionScheme::Nip44 => {
            nip44::encrypt(keys.secret_key(), peer, plaintext, nip44::Version::V2)
                .map_err(|e| CourierError::crypto(e.to_string()))
        }
        EncryptionScheme::Nip04 => nip04::encrypt(keys.secret_key(), peer, plaintext)
            .map_err(|e| CourierError::crypto(e.to_string())),
    }
}

fn decrypt_with(
    secret: &[u8; 32],
    scheme: EncryptionScheme,
    peer: &PublicKey,
    ciphertext: &str,
) -> Result<String> {
    let keys = keys_from(secret)?;
    match scheme {
        EncryptionScheme::Nip44 => nip44::decrypt(keys.secret_key(), peer, ciphertext)
            .map_err(|e| CourierError::crypto(e.to_string())),
        EncryptionScheme::Nip04 => nip04::decrypt(keys.secret_key(), peer, ciphertext)
            .map_err(|e| CourierError::crypto(e.to_string())),
    }
}

#[async_trait]
impl SignerBackend for SessionSigner {
    fn descriptor(&self) -> SignerDescriptor {
        SignerDescriptor::new(
            format!("custodian:{}", self.session_id),
            SignerKind::Custodian,
            Capabilities::EVENT,
        )
    }

    async fn status(&self, _probe: &StatusProbe<'_>) -> Result<SignerStatus> {
        Ok(match self.custodian.status(&self.session_id) {
            SessionStatus::Active { .. } => SignerStatus::Available,
            // Still routable so the caller gets the precise session error.
            SessionStatus::Exhausted | SessionStatus::Expired => SignerStatus::Locked,
            SessionStatus::NotFound => SignerStatus::Unavailable,
        })
    }

    async fn public_key(&self) -> Result<PublicKey> {
        Ok(self.pubkey)
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event> {
        self.custodian
            .use_once(&self.session_id, |sk| sign_with(sk, unsigned))
    }

    async fn nip44_encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String> {
        self.custodian.use_once(&self.session_id, |sk| {
            encrypt_with(sk, EncryptionScheme::Nip44, peer, plaintext)
        })
    }

    async fn nip44_decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String> {
        self.custodian.use_once(&self.session_id, |sk| {
            decrypt_with(sk, EncryptionScheme::Nip44, peer, ciphertext)
        })
    }

    async fn nip04_encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String> {
        self.custodian.use_once(&self.session_id, |sk| {
            encrypt_with(sk, EncryptionScheme::Nip04, peer, plaintext)
        })
    }

    async fn nip04_decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String> {
        self.custodian.use_once(&self.session_id, |sk| {
            decrypt_with(sk, EncryptionScheme::Nip04, peer, ciphertext)
        })
    }

    async fn seal_encrypted(&self, request: SealRequest) -> Result<Event> {
        let pubkey = self.pubkey;
        self.custodian.use_once(&self.session_id, move |sk| {
            let content = encrypt_with(sk, request.scheme, &request.recipient, &request.plaintext)?;
            let unsigned = EventBuilder::new(request.kind, content)
                .tags(request.tags)
                .custom_created_at(request.created_at)
                .build(pubkey);
            sign_with(sk, unsigned)
        })
    }

    async fn unseal(&self, wrap: &Event) -> Result<Unsealed> {
        self.custodian.use_once(&self.session_id, |sk| {
            let seal_json = decrypt_with(sk, EncryptionScheme::Nip44, &wrap.pubkey, &wrap.content)?;
            let seal = parse_seal(&seal_json)?;
            let rumor_json = decrypt_with(sk, EncryptionScheme::Nip44, &seal.pubkey, &seal.content)?;
            Ok(Unsealed {
                seal_author: seal.pubkey,
                rumor_json,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::SessionOptions;

    fn signer_with(options: SessionOptions) -> (SessionSigner, Keys) {
        let keys = Keys::generate();
        let custodian = Arc::new(Custodian::new());
        let mut secret = keys.secret_key().to_secret_bytes();
        let id = custodian.create_session(&mut secret, options).unwrap();
        (SessionSigner::new(custodian, id).unwrap(), keys)
    }

    #[tokio::test]
    async fn test_sign_event_charges_session() {
        let (signer, keys) = signer_with(SessionOptions::default().with_max_operations(1));
        let unsigned = EventBuilder::text_note("one").build(keys.public_key());

        let event = signer.sign_event(unsigned).await.unwrap();
        assert!(event.verify().is_ok());
        assert_eq!(event.pubkey, keys.public_key());

        let again = EventBuilder::text_note("two").build(keys.public_key());
        assert!(matches!(
            signer.sign_event(again).await,
            Err(CourierError::OperationLimitReached { .. })
        ));
    }

    #[tokio::test]
    async fn test_foreign_author_rejected() {
        let (signer, _) = signer_with(SessionOptions::default());
        let unsigned = EventBuilder::text_note("x").build(Keys::generate().public_key());
        assert!(signer.sign_event(unsigned).await.is_err());
    }

    #[tokio::test]
    async fn test_seal_uses_single_operation() {
        let (signer, _) = signer_with(SessionOptions::default().with_max_operations(1));
        let peer = Keys::generate();

        let event = signer
            .seal_encrypted(SealRequest {
                recipient: peer.public_key(),
                scheme: EncryptionScheme::Nip44,
                plaintext: "sealed".into(),
                kind: Kind::EncryptedDirectMessage,
                tags: vec![Tag::public_key(peer.public_key())],
                created_at: Timestamp::now(),
            })
            .await
            .unwrap();

        let plain = nip44::decrypt(peer.secret_key(), &event.pubkey, &event.content).unwrap();
        assert_eq!(plain, "sealed");
    }

    #[tokio::test]
    async fn test_unseal_uses_single_operation() {
        let (signer, keys) = signer_with(SessionOptions::default().with_max_operations(1));
        let sender = Keys::generate();

        let rumor = EventBuilder::new(Kind::from(14), "inner").build(sender.public_key());
        let seal_content = nip44::encrypt(
            sender.secret_key(),
            &keys.public_key(),
            rumor.as_json(),
            nip44::Version::V2,
        )
        .unwrap();
        let seal = EventBuilder::new(Kind::Seal, seal_content)
            .sign_with_keys(&sender)
            .unwrap();
        let one_time = Keys::generate();
        let wrap_content = nip44::encrypt(
            one_time.secret_key(),
            &keys.public_key(),
            seal.as_json(),
            nip44::Version::V2,
        )
        .unwrap();
        let wrap = EventBuilder::new(Kind::GiftWrap, wrap_content)
            .sign_with_keys(&one_time)
            .unwrap();

        let unsealed = signer.unseal(&wrap).await.unwrap();
        assert_eq!(unsealed.seal_author, sender.public_key());
        assert!(unsealed.rumor_json.contains("inner"));

        assert!(matches!(
            signer.unseal(&wrap).await,
            Err(CourierError::OperationLimitReached { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_unseal_not_charged() {
        let (signer, keys) = signer_with(SessionOptions::default().with_max_operations(1));
        let junk = EventBuilder::new(Kind::GiftWrap, "not ciphertext")
            .sign_with_keys(&Keys::generate())
            .unwrap();
        assert!(matches!(
            signer.unseal(&junk).await,
            Err(CourierError::Crypto(_))
        ));

        let unsigned = EventBuilder::text_note("still allowed").build(keys.public_key());
        assert!(signer.sign_event(unsigned).await.is_ok());
    }

    #[tokio::test]
    async fn test_nip04_roundtrip() {
        let (signer, keys) = signer_with(SessionOptions::default());
        let peer = Keys::generate();

        let ct = signer.nip04_encrypt(&peer.public_key(), "legacy").await.unwrap();
        let pt = nip04::decrypt(peer.secret_key(), &keys.public_key(), &ct).unwrap();
        assert_eq!(pt, "legacy");
        assert_eq!(
            signer.nip04_decrypt(&peer.public_key(), &ct).await.unwrap(),
            "legacy"
        );
    }
}
