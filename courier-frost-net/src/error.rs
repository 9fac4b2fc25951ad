// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use courier_core::CourierError;
use thiserror::Error;

use crate::approval::ApprovalStatus;

#[derive(Error, Debug)]
pub enum FrostNetError {
    #[error("Threshold not met in round {round}: need {needed}, got {got}")]
    ThresholdNotMet { round: u8, needed: usize, got: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Replay detected: {0}")]
    ReplayDetected(String),

    #[error("Nonce already consumed for session: {0}")]
    NonceConsumed(String),

    #[error("Unknown guardian: {0}")]
    UnknownGuardian(String),

    #[error("Approval request not found: {0}")]
    ApprovalNotFound(String),

    #[error("Approval request {id} is closed ({status:?})")]
    ApprovalClosed { id: String, status: ApprovalStatus },

    #[error("Nostr error: {0}")]
    Nostr(String),

    #[error(transparent)]
    Core(#[from] CourierError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FrostNetError {
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Terminal for the current round; a new session is the only retry.
    pub fn is_quorum_failure(&self) -> bool {
        matches!(self, Self::ThresholdNotMet { .. })
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::ThresholdNotMet { .. } => {
                "Not enough guardians responded. Ask them to come online and start again."
            }
            Self::ApprovalClosed { .. } | Self::ApprovalNotFound(_) => {
                "This approval request is no longer open."
            }
            Self::ReplayDetected(_) | Self::NonceConsumed(_) => {
                "This signing request was already used. Start a new one."
            }
            Self::Core(e) => e.user_message(),
            _ => "Threshold signing failed. Retry, or use a different signer.",
        }
    }
}

pub type Result<T> = std::result::Result<T, FrostNetError>;
