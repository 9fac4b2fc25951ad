// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Guardian families and trusted-dealer share generation.

#![forbid(unsafe_code)]

use frost::keys::{IdentifierList, KeyPackage, PublicKeyPackage};
use frost::rand_core::OsRng;
use frost::Identifier;
use frost_secp256k1_tr as frost;
use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{FrostNetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdConfig {
    pub threshold: u16,
    pub total_shares: u16,
}

impl ThresholdConfig {
    pub fn new(threshold: u16, total_shares: u16) -> Result<Self> {
        if threshold < 2 {
            return Err(FrostNetError::crypto("Threshold must be at least 2"));
        }
        if total_shares < threshold {
            return Err(FrostNetError::crypto("Total shares must be >= threshold"));
        }
        if total_shares > 255 {
            return Err(FrostNetError::crypto("Maximum 255 shares supported"));
        }
        Ok(Self {
            threshold,
            total_shares,
        })
    }

    pub fn two_of_three() -> Self {
        Self {
            threshold: 2,
            total_shares: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianInfo {
    pub pubkey: PublicKey,
    pub share_index: u16,
}

/// Public description of a guardian group. Safe to persist and share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianFamily {
    pub family_id: String,
    #[serde(with = "::hex::serde")]
    pub group_pubkey: [u8; 32],
    #[serde(with = "::hex::serde")]
    pub pubkey_package: Vec<u8>,
    pub threshold: u16,
    pub guardians: Vec<GuardianInfo>,
}

impl GuardianFamily {
    pub fn public_key_package(&self) -> Result<PublicKeyPackage> {
        PublicKeyPackage::deserialize(&self.pubkey_package)
            .map_err(|e| FrostNetError::Crypto(format!("Invalid public key package: {e}")))
    }

    /// Group key as a Nostr public key (x-only).
    pub fn group_public_key(&self) -> Result<PublicKey> {
        PublicKey::from_slice(&self.group_pubkey)
            .map_err(|e| FrostNetError::Crypto(format!("Invalid group key: {e}")))
    }

    pub fn guardian_by_pubkey(&self, pubkey: &PublicKey) -> Option<&GuardianInfo> {
        self.guardians.iter().find(|g| g.pubkey == *pubkey)
    }

    pub fn guardian_by_index(&self, share_index: u16) -> Option<&GuardianInfo> {
        self.guardians.iter().find(|g| g.share_index == share_index)
    }

    pub fn share_indices(&self) -> Vec<u16> {
        self.guardians.iter().map(|g| g.share_index).collect()
    }
}

/// One guardian's secret signing material.
#[derive(Clone)]
pub struct GuardianShare {
    pub share_index: u16,
    key_package: KeyPackage,
}

impl GuardianShare {
    pub fn new(share_index: u16, key_package: KeyPackage) -> Self {
        Self {
            share_index,
            key_package,
        }
    }

    pub fn key_package(&self) -> &KeyPackage {
        &self.key_package
    }

    pub fn identifier(&self) -> Result<Identifier> {
        Identifier::try_from(self.share_index)
            .map_err(|e| FrostNetError::Crypto(format!("Invalid identifier: {e}")))
    }
}

impl std::fmt::Debug for GuardianShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardianShare")
            .field("share_index", &self.share_index)
            .finish_non_exhaustive()
    }
}

/// **Testing and bootstrap only.** The dealer sees the full group secret
/// while splitting it; families holding real funds or identities should be
/// created with distributed key generation instead.
pub struct TrustedDealer {
    config: ThresholdConfig,
}

impl TrustedDealer {
    pub fn new(config: ThresholdConfig) -> Self {
        Self { config }
    }

    /// Split a fresh group key across `guardians`, assigning share indices
    /// 1..=n in the given order.
    pub fn generate(
        &self,
        family_id: &str,
        guardians: &[PublicKey],
    ) -> Result<(GuardianFamily, Vec<GuardianShare>)> {
        if guardians.len() != self.config.total_shares as usize {
            return Err(FrostNetError::crypto(format!(
                "Expected {} guardians, got {}",
                self.config.total_shares,
                guardians.len()
            )));
        }

        let (mut shares, pubkey_pkg) = frost::keys::generate_with_dealer(
            self.config.total_shares,
            self.config.threshold,
            IdentifierList::Default,
            OsRng,
        )
        .map_err(|e| FrostNetError::Crypto(format!("Key generation failed: {e}")))?;

        let mut infos = Vec::with_capacity(guardians.len());
        let mut packages = Vec::with_capacity(guardians.len());
        for (share_index, pubkey) in (1..=self.config.total_shares).zip(guardians) {
            let id = Identifier::try_from(share_index)
                .map_err(|e| FrostNetError::Crypto(format!("Invalid identifier: {e}")))?;
            let secret_share = shares
                .remove(&id)
                .ok_or_else(|| FrostNetError::crypto("Dealer returned too few shares"))?;
            let key_package = KeyPackage::try_from(secret_share)
                .map_err(|e| FrostNetError::Crypto(format!("KeyPackage conversion failed: {e}")))?;

            infos.push(GuardianInfo {
                pubkey: *pubkey,
                share_index,
            });
            packages.push(GuardianShare::new(share_index, key_package));
        }

        let family = GuardianFamily {
            family_id: family_id.to_string(),
            group_pubkey: extract_group_pubkey(&pubkey_pkg)?,
            pubkey_package: pubkey_pkg
                .serialize()
                .map_err(|e| FrostNetError::Crypto(format!("Serialize package: {e}")))?,
            threshold: self.config.threshold,
            guardians: infos,
        };
        Ok((family, packages))
    }
}

pub(crate) fn extract_group_pubkey(pubkey_pkg: &PublicKeyPackage) -> Result<[u8; 32]> {
    let serialized = pubkey_pkg
        .verifying_key()
        .serialize()
        .map_err(|e| FrostNetError::Crypto(format!("Failed to serialize verifying key: {e}")))?;
    let bytes = serialized.as_slice();

    let mut pubkey = [0u8; 32];
    match bytes.len() {
        33 => pubkey.copy_from_slice(&bytes[1..33]),
        32 => pubkey.copy_from_slice(bytes),
        n => {
            return Err(FrostNetError::Crypto(format!(
                "Invalid group pubkey length: expected 32 or 33, got {n}"
            )))
        }
    }
    Ok(pubkey)
}
