// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Signer backends and the registry that picks one per action.
mod registry;
mod session;

use async_trait::async_trait;
use bitflags::bitflags;
use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use courier_core::{CourierError, FeatureFlags, Result};

pub use registry::{SignerRegistry, StatusProbe, MAX_SELECTION_DEPTH};
pub use session::SessionSigner;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Capabilities: u8 {
        const EVENT = 0b0000_0001;
        const PAYMENT = 0b0000_0010;
        const THRESHOLD = 0b0000_0100;
    }
}

/// Closed set of adapter kinds the registry knows how to rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerKind {
    /// In-memory session held by the key custodian.
    Custodian,
    /// Browser extension signer.
    Extension,
    /// Remote companion app paired over relays.
    CompanionApp,
    HardwareToken,
    Threshold,
}

impl SignerKind {
    pub fn enabled(&self, flags: &FeatureFlags) -> bool {
        match self {
            SignerKind::Custodian => true,
            SignerKind::Extension => flags.extension_signer,
            SignerKind::CompanionApp => flags.companion_app,
            SignerKind::HardwareToken => flags.hardware_token,
            SignerKind::Threshold => flags.threshold_signing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerStatus {
    Unavailable,
    Locked,
    Available,
    Connected,
    Error,
}

impl SignerStatus {
    /// Lower is better. `None` means the signer must not be selected.
    pub fn rank(&self) -> Option<u8> {
        match self {
            SignerStatus::Connected => Some(0),
            SignerStatus::Available => Some(1),
            SignerStatus::Locked => Some(2),
            SignerStatus::Unavailable | SignerStatus::Error => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Web,
    Desktop,
    Mobile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    SignEvent,
    Payment,
    ThresholdSign,
}

impl Action {
    pub fn required(&self) -> Capabilities {
        match self {
            Action::SignEvent => Capabilities::EVENT,
            Action::Payment => Capabilities::PAYMENT,
            Action::ThresholdSign => Capabilities::THRESHOLD,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::SignEvent => "event signing",
            Action::Payment => "payment",
            Action::ThresholdSign => "threshold signing",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerDescriptor {
    pub id: String,
    pub kind: SignerKind,
    pub capabilities: Capabilities,
}

impl SignerDescriptor {
    pub fn new(id: impl Into<String>, kind: SignerKind, capabilities: Capabilities) -> Self {
        Self {
            id: id.into(),
            kind,
            capabilities,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionScheme {
    /// NIP-44 v2: ECDH + HKDF + ChaCha20 with HMAC.
    #[default]
    Nip44,
    /// NIP-04, kept for peers that predate NIP-44.
    Nip04,
}

/// Everything needed to encrypt a payload for `recipient` and sign the
/// event that carries it.
#[derive(Debug, Clone)]
pub struct SealRequest {
    pub recipient: PublicKey,
    pub scheme: EncryptionScheme,
    pub plaintext: String,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub created_at: Timestamp,
}

/// Inner layers of a NIP-59 gift wrap after both decryptions.
#[derive(Debug, Clone)]
pub struct Unsealed {
    /// Verified author of the kind 13 seal.
    pub seal_author: PublicKey,
    pub rumor_json: String,
}

/// Parse and verify the kind 13 seal carried by a gift wrap.
pub(crate) fn parse_seal(json: &str) -> Result<Event> {
    let seal = Event::from_json(json).map_err(|_| CourierError::crypto("seal json"))?;
    if seal.kind != Kind::Seal {
        return Err(CourierError::crypto("not a seal"));
    }
    seal.verify()
        .map_err(|_| CourierError::crypto("seal signature"))?;
    Ok(seal)
}

#[async_trait]
pub trait SignerBackend: Send + Sync {
    fn descriptor(&self) -> SignerDescriptor;

    fn supports_platform(&self, _platform: Platform) -> bool {
        true
    }

    /// Current availability. May consult the registry through `probe`;
    /// nested selections are depth-limited.
    async fn status(&self, probe: &StatusProbe<'_>) -> Result<SignerStatus>;

    async fn public_key(&self) -> Result<PublicKey>;

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event>;

    async fn nip44_encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String>;

    async fn nip44_decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String>;

    async fn nip04_encrypt(&self, _peer: &PublicKey, _plaintext: &str) -> Result<String> {
        Err(CourierError::Unsupported("nip04_encrypt".into()))
    }

    async fn nip04_decrypt(&self, _peer: &PublicKey, _ciphertext: &str) -> Result<String> {
        Err(CourierError::Unsupported("nip04_decrypt".into()))
    }

    async fn encrypt(
        &self,
        scheme: EncryptionScheme,
        peer: &PublicKey,
        plaintext: &str,
    ) -> Result<String> {
        match scheme {
            EncryptionScheme::Nip44 => self.nip44_encrypt(peer, plaintext).await,
            EncryptionScheme::Nip04 => self.nip04_encrypt(peer, plaintext).await,
        }
    }

    async fn decrypt(
        &self,
        scheme: EncryptionScheme,
        peer: &PublicKey,
        ciphertext: &str,
    ) -> Result<String> {
        match scheme {
            EncryptionScheme::Nip44 => self.nip44_decrypt(peer, ciphertext).await,
            EncryptionScheme::Nip04 => self.nip04_decrypt(peer, ciphertext).await,
        }
    }

    /// Encrypt `request.plaintext` for the recipient and sign the carrying
    /// event. Backends that meter key use override this to do both under
    /// one charge.
    async fn seal_encrypted(&self, request: SealRequest) -> Result<Event> {
        let content = self
            .encrypt(request.scheme, &request.recipient, &request.plaintext)
            .await?;
        let pubkey = self.public_key().await?;
        let unsigned = EventBuilder::new(request.kind, content)
            .tags(request.tags)
            .custom_created_at(request.created_at)
            .build(pubkey);
        self.sign_event(unsigned).await
    }

    /// Decrypt the wrap and seal layers of `wrap`. Metered backends override
    /// this to charge both decryptions as one operation.
    async fn unseal(&self, wrap: &Event) -> Result<Unsealed> {
        let seal_json = self.nip44_decrypt(&wrap.pubkey, &wrap.content).await?;
        let seal = parse_seal(&seal_json)?;
        let rumor_json = self.nip44_decrypt(&seal.pubkey, &seal.content).await?;
        Ok(Unsealed {
            seal_author: seal.pubkey,
            rumor_json,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ranking() {
        assert!(SignerStatus::Connected.rank() < SignerStatus::Available.rank());
        assert!(SignerStatus::Available.rank() < SignerStatus::Locked.rank());
        assert_eq!(SignerStatus::Error.rank(), None);
        assert_eq!(SignerStatus::Unavailable.rank(), None);
    }

    #[test]
    fn test_feature_gates() {
        let flags = FeatureFlags {
            extension_signer: false,
            companion_app: true,
            hardware_token: false,
            threshold_signing: false,
        };
        assert!(SignerKind::Custodian.enabled(&flags));
        assert!(!SignerKind::Extension.enabled(&flags));
        assert!(SignerKind::CompanionApp.enabled(&flags));
    }

    #[test]
    fn test_action_capabilities() {
        let caps = Capabilities::EVENT | Capabilities::THRESHOLD;
        assert!(caps.contains(Action::SignEvent.required()));
        assert!(caps.contains(Action::ThresholdSign.required()));
        assert!(!caps.contains(Action::Payment.required()));
    }
}
