// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::sync::Arc;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use serde_json::json;
use tokio::sync::OnceCell;

use courier_core::{CourierError, Result};
use courier_messaging::{
    Capabilities, Platform, SignerBackend, SignerDescriptor, SignerKind, SignerStatus,
    StatusProbe,
};

use crate::bridge::{PairingState, RemoteSignerBridge};
use crate::types::{
    METHOD_GET_PUBLIC_KEY, METHOD_NIP04_DECRYPT, METHOD_NIP04_ENCRYPT, METHOD_NIP44_DECRYPT,
    METHOD_NIP44_ENCRYPT, METHOD_PING, METHOD_SIGN_EVENT,
};

/// A paired companion app exposed to the signer registry.
pub struct RemoteSigner {
    bridge: Arc<RemoteSignerBridge>,
    user_pubkey: OnceCell<PublicKey>,
}

impl RemoteSigner {
    pub fn new(bridge: Arc<RemoteSignerBridge>) -> Self {
        Self {
            bridge,
            user_pubkey: OnceCell::new(),
        }
    }

    pub fn bridge(&self) -> &Arc<RemoteSignerBridge> {
        &self.bridge
    }

    pub async fn ping(&self) -> Result<bool> {
        Ok(self.bridge.request(METHOD_PING, vec![]).await? == "pong")
    }
}

#[async_trait]
impl SignerBackend for RemoteSigner {
    fn descriptor(&self) -> SignerDescriptor {
        SignerDescriptor::new(
            format!("companion:{}", self.bridge.client_pubkey().to_hex()),
            SignerKind::CompanionApp,
            Capabilities::EVENT,
        )
    }

    fn supports_platform(&self, platform: Platform) -> bool {
        matches!(platform, Platform::Web | Platform::Desktop)
    }

    async fn status(&self, _probe: &StatusProbe<'_>) -> Result<SignerStatus> {
        Ok(match self.bridge.state() {
            PairingState::Paired => SignerStatus::Connected,
            PairingState::AwaitingConnect => SignerStatus::Locked,
            PairingState::Unpaired | PairingState::Cleared => SignerStatus::Unavailable,
        })
    }

    /// The user's key as reported by the signer, which may differ from the
    /// signer's transport key.
    async fn public_key(&self) -> Result<PublicKey> {
        self.user_pubkey
            .get_or_try_init(|| async {
                let hex = self.bridge.request(METHOD_GET_PUBLIC_KEY, vec![]).await?;
                PublicKey::from_hex(hex.trim())
                    .map_err(|e| CourierError::Remote(format!("bad public key: {e}")))
            })
            .await
            .copied()
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event> {
        let template = json!({
            "kind": unsigned.kind.as_u16(),
            "content": unsigned.content,
            "tags": unsigned.tags.iter().map(|t| t.as_slice().to_vec()).collect::<Vec<_>>(),
            "created_at": unsigned.created_at.as_u64(),
        });
        let signed = self
            .bridge
            .request(METHOD_SIGN_EVENT, vec![template.to_string()])
            .await?;
        let event = Event::from_json(signed)
            .map_err(|e| CourierError::Remote(format!("bad signed event: {e}")))?;
        event
            .verify()
            .map_err(|e| CourierError::SignatureVerificationFailed(e.to_string()))?;
        if event.pubkey != unsigned.pubkey {
            return Err(CourierError::SignatureVerificationFailed(
                "remote signer used a different key".into(),
            ));
        }
        Ok(event)
    }

    async fn nip44_encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String> {
        self.bridge
            .request(METHOD_NIP44_ENCRYPT, vec![peer.to_hex(), plaintext.to_string()])
            .await
    }

    async fn nip44_decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String> {
        self.bridge
            .request(METHOD_NIP44_DECRYPT, vec![peer.to_hex(), ciphertext.to_string()])
            .await
    }

    async fn nip04_encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String> {
        self.bridge
            .request(METHOD_NIP04_ENCRYPT, vec![peer.to_hex(), plaintext.to_string()])
            .await
    }

    async fn nip04_decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String> {
        self.bridge
            .request(METHOD_NIP04_DECRYPT, vec![peer.to_hex(), ciphertext.to_string()])
            .await
    }
}
