// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Canonical JSON for signed challenges.
//!
//! Bytes are produced so that any two implementations agree:
//!
//! - object keys sorted by UTF-8 byte order, recursively
//! - timestamps as ISO-8601 UTC with millisecond precision (`...T12:00:00.000Z`)
//! - absent optional fields written as explicit `null`
//! - no insignificant whitespace, UTF-8 output
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{CourierError, Result};
use crate::keys;

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn serialize_timestamp<S>(ts: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_timestamp(ts))
}

pub fn serialize_opt_timestamp<S>(
    ts: &Option<DateTime<Utc>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match ts {
        Some(ts) => serializer.serialize_str(&format_timestamp(ts)),
        None => serializer.serialize_none(),
    }
}

fn sort_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, sort_value(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}

/// Canonical UTF-8 bytes of any serializable value.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    let sorted = sort_value(value);
    Ok(serde_json::to_vec(&sorted)?)
}

/// A server-issued challenge a key holder signs to prove control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub purpose: String,
    pub identity: String,
    pub nonce: String,
    #[serde(serialize_with = "serialize_timestamp")]
    pub issued_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_opt_timestamp")]
    pub expires_at: Option<DateTime<Utc>>,
    pub audience: Option<String>,
}

impl Challenge {
    pub fn new(purpose: &str, identity: &str, nonce: &str) -> Self {
        Self {
            purpose: purpose.to_string(),
            identity: identity.to_string(),
            nonce: nonce.to_string(),
            issued_at: Utc::now(),
            expires_at: None,
            audience: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_audience(mut self, audience: &str) -> Self {
        self.audience = Some(audience.to_string());
        self
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        to_canonical_bytes(self)
    }

    pub fn digest(&self) -> Result<[u8; 32]> {
        Ok(Sha256::digest(self.canonical_bytes()?).into())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

/// Sign the challenge digest with a custodied secret. Intended to run
/// inside [`crate::custodian::Custodian::use_once`].
pub fn sign_challenge(secret: &[u8; 32], challenge: &Challenge) -> Result<[u8; 64]> {
    keys::schnorr_sign(secret, &challenge.digest()?)
}

pub fn verify_challenge(pubkey: &[u8; 32], challenge: &Challenge, signature: &[u8; 64]) -> Result<()> {
    if challenge.is_expired_at(Utc::now()) {
        return Err(CourierError::SignatureVerificationFailed(
            "challenge expired".into(),
        ));
    }
    keys::schnorr_verify(pubkey, &challenge.digest()?, signature)
}
