// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::sync::Arc;

use async_trait::async_trait;
use nostr_sdk::prelude::*;

use courier_core::{CourierError, Result};
use courier_messaging::{
    Capabilities, SignerBackend, SignerDescriptor, SignerKind, SignerStatus, StatusProbe,
};

use crate::coordinator::ThresholdCoordinator;
use crate::error::FrostNetError;

impl From<FrostNetError> for CourierError {
    fn from(e: FrostNetError) -> Self {
        match e {
            FrostNetError::ThresholdNotMet { needed, got, .. } => {
                CourierError::ThresholdNotMet { needed, got }
            }
            FrostNetError::Core(inner) => inner,
            other => CourierError::Crypto(other.to_string()),
        }
    }
}

/// Registry adapter that signs as a guardian family's group key.
pub struct ThresholdSigner {
    coordinator: Arc<ThresholdCoordinator>,
}

impl ThresholdSigner {
    pub fn new(coordinator: Arc<ThresholdCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<ThresholdCoordinator> {
        &self.coordinator
    }
}

#[async_trait]
impl SignerBackend for ThresholdSigner {
    fn descriptor(&self) -> SignerDescriptor {
        SignerDescriptor::new(
            format!("threshold:{}", self.coordinator.family().family_id),
            SignerKind::Threshold,
            Capabilities::THRESHOLD,
        )
    }

    async fn status(&self, _probe: &StatusProbe<'_>) -> Result<SignerStatus> {
        Ok(if self.coordinator.is_listening() {
            SignerStatus::Connected
        } else {
            SignerStatus::Available
        })
    }

    async fn public_key(&self) -> Result<PublicKey> {
        Ok(self.coordinator.family().group_public_key()?)
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event> {
        Ok(self.coordinator.sign_event(unsigned).await?)
    }

    async fn nip44_encrypt(&self, _peer: &PublicKey, _plaintext: &str) -> Result<String> {
        Err(CourierError::Unsupported("nip44_encrypt with a threshold key".into()))
    }

    async fn nip44_decrypt(&self, _peer: &PublicKey, _ciphertext: &str) -> Result<String> {
        Err(CourierError::Unsupported("nip44_decrypt with a threshold key".into()))
    }
}
