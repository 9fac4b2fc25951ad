// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Two-round signing traffic between coordinator and guardians.
pub const THRESHOLD_EVENT_KIND: u16 = 24243;
/// Guardian approval requests and responses. Addressable by `d` tag.
pub const APPROVAL_EVENT_KIND: u16 = 30455;
pub const PROTOCOL_VERSION: u8 = 1;

pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;
pub const MAX_PARTICIPANTS: usize = 255;

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuardianMessage {
    ApprovalRequest(ApprovalRequestPayload),
    ApprovalResponse(ApprovalResponsePayload),
    CommitmentRequest(CommitmentRequestPayload),
    Commitment(CommitmentPayload),
    SigningPackage(SigningPackagePayload),
    SignatureShare(SignatureSharePayload),
    SigningComplete(SigningCompletePayload),
    Error(ErrorPayload),
}

impl GuardianMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            GuardianMessage::ApprovalRequest(_) => "approval_request",
            GuardianMessage::ApprovalResponse(_) => "approval_response",
            GuardianMessage::CommitmentRequest(_) => "commitment_request",
            GuardianMessage::Commitment(_) => "commitment",
            GuardianMessage::SigningPackage(_) => "signing_package",
            GuardianMessage::SignatureShare(_) => "signature_share",
            GuardianMessage::SigningComplete(_) => "signing_complete",
            GuardianMessage::Error(_) => "error",
        }
    }

    /// Event kind carrying this message.
    pub fn kind(&self) -> u16 {
        match self {
            GuardianMessage::ApprovalRequest(_) | GuardianMessage::ApprovalResponse(_) => {
                APPROVAL_EVENT_KIND
            }
            _ => THRESHOLD_EVENT_KIND,
        }
    }

    pub fn session_id(&self) -> Option<&[u8; 32]> {
        match self {
            GuardianMessage::CommitmentRequest(p) => Some(&p.session_id),
            GuardianMessage::Commitment(p) => Some(&p.session_id),
            GuardianMessage::SigningPackage(p) => Some(&p.session_id),
            GuardianMessage::SignatureShare(p) => Some(&p.session_id),
            GuardianMessage::SigningComplete(p) => Some(&p.session_id),
            GuardianMessage::Error(p) => p.session_id.as_ref(),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            GuardianMessage::ApprovalRequest(p) => Some(&p.request_id),
            GuardianMessage::ApprovalResponse(p) => Some(&p.request_id),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Structural checks that do not need session state.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            GuardianMessage::CommitmentRequest(p) => {
                if p.threshold == 0 || p.participants.len() < p.threshold as usize {
                    return Err("threshold exceeds participants".into());
                }
                if p.participants.len() > MAX_PARTICIPANTS || p.participants.contains(&0) {
                    return Err("invalid participant list".into());
                }
            }
            GuardianMessage::Commitment(p) if p.share_index == 0 => {
                return Err("share index must be non-zero".into());
            }
            GuardianMessage::SignatureShare(p) if p.share_index == 0 => {
                return Err("share index must be non-zero".into());
            }
            GuardianMessage::SigningPackage(p) => {
                if p.commitments.is_empty() || p.commitments.len() > MAX_PARTICIPANTS {
                    return Err("invalid commitment set".into());
                }
                if p.commitments.iter().any(|c| c.share_index == 0) {
                    return Err("share index must be non-zero".into());
                }
            }
            GuardianMessage::ApprovalRequest(p) if p.request_id.is_empty() => {
                return Err("missing request id".into());
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ApprovalRequestPayload {
    pub version: u8,
    pub request_id: String,
    pub group_id: String,
    pub content: String,
    pub message_type: String,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ApprovalResponsePayload {
    pub request_id: String,
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CommitmentRequestPayload {
    pub version: u8,
    #[serde(with = "hex_array")]
    pub session_id: [u8; 32],
    pub family_id: String,
    #[serde(with = "hex_array")]
    pub group_pubkey: [u8; 32],
    #[serde(with = "hex_array")]
    pub message_hash: [u8; 32],
    pub threshold: u16,
    pub participants: Vec<u16>,
    pub expires_at: u64,
}

impl CommitmentRequestPayload {
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CommitmentPayload {
    #[serde(with = "hex_array")]
    pub session_id: [u8; 32],
    pub share_index: u16,
    #[serde(with = "hex_vec")]
    pub commitment: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CommitmentEntry {
    pub share_index: u16,
    #[serde(with = "hex_vec")]
    pub commitment: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SigningPackagePayload {
    #[serde(with = "hex_array")]
    pub session_id: [u8; 32],
    #[serde(with = "hex_array")]
    pub message_hash: [u8; 32],
    pub commitments: Vec<CommitmentEntry>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SignatureSharePayload {
    #[serde(with = "hex_array")]
    pub session_id: [u8; 32],
    pub share_index: u16,
    #[serde(with = "hex_vec")]
    pub signature_share: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SigningCompletePayload {
    #[serde(with = "hex_array")]
    pub session_id: [u8; 32],
    #[serde(with = "hex_array")]
    pub signature: [u8; 64],
    #[serde(with = "hex_array")]
    pub message_hash: [u8; 32],
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorPayload {
    #[serde(
        default,
        with = "hex_array_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<[u8; 32]>,
    pub code: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(session_id: Option<[u8; 32]>, code: &str, message: impl Into<String>) -> Self {
        Self {
            session_id,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {N} bytes")))
    }
}

mod hex_array_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(opt: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match opt {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        opt.map(|s| {
            let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
            bytes
                .try_into()
                .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
        })
        .transpose()
    }
}

mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
