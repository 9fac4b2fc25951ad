// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CourierError {
    #[error("Signing session expired: {0}")]
    SessionExpired(String),

    #[error("Operation limit reached for session {session_id} ({max} operations)")]
    OperationLimitReached { session_id: String, max: u32 },

    #[error("Signing session not found: {0}")]
    SessionNotFound(String),

    #[error("Signer selection exceeded depth {0}")]
    RecursionLimitExceeded(u8),

    #[error("No eligible signer for {0}")]
    NoEligibleSigner(String),

    #[error("Signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    #[error("Envelope could not be opened")]
    EnvelopeOpenFailed,

    #[error("Publish failed on all {attempted} relays")]
    RelayPublishFailed { attempted: usize },

    #[error("Relay discovery timed out after {0:?}")]
    RelayDiscoveryTimeout(Duration),

    #[error("Pairing secret mismatch")]
    PairingSecretMismatch,

    #[error("Request timed out: {0}")]
    RequestTimeout(String),

    #[error("Threshold not met: need {needed}, got {got}")]
    ThresholdNotMet { needed: usize, got: usize },

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },

    #[error("Too many signing sessions (max {0})")]
    SessionLimitReached(usize),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid secret key")]
    InvalidSecretKey,

    #[error("Invalid nsec format")]
    InvalidNsec,

    #[error("Invalid npub format")]
    InvalidNpub,

    #[error("Invalid relay URL {url}: {reason}")]
    InvalidRelayUrl { url: String, reason: String },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Remote signer error: {0}")]
    Remote(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config directory not found")]
    ConfigDirNotFound,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CourierError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// True when the caller has to authenticate again before retrying.
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            Self::SessionExpired(_)
                | Self::OperationLimitReached { .. }
                | Self::SessionNotFound(_)
        )
    }

    /// True when the same call may succeed later without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RelayPublishFailed { .. }
                | Self::RelayDiscoveryTimeout(_)
                | Self::RequestTimeout(_)
                | Self::RateLimitExceeded { .. }
                | Self::Transport(_)
        )
    }

    /// Message safe to show to an end user. Never includes key material,
    /// relay responses or peer-provided text.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::SessionExpired(_) | Self::SessionNotFound(_) => {
                "Your signing session ended. Sign in again to continue."
            }
            Self::OperationLimitReached { .. } => {
                "This signing session has been used up. Sign in again to continue."
            }
            Self::RecursionLimitExceeded(_) | Self::NoEligibleSigner(_) => {
                "No signer is available. Connect a signer or sign in with your key."
            }
            Self::SignatureVerificationFailed(_) => {
                "The signer returned an invalid signature. Try a different signer."
            }
            Self::EnvelopeOpenFailed => "This message could not be decrypted.",
            Self::RelayPublishFailed { .. } => {
                "No relay accepted the message. Check your connection and retry."
            }
            Self::RelayDiscoveryTimeout(_) => "Relay lookup timed out. Retry shortly.",
            Self::PairingSecretMismatch => {
                "Pairing failed. Scan a fresh connection code and try again."
            }
            Self::RequestTimeout(_) => {
                "The remote signer did not answer in time. Check the signer app and retry."
            }
            Self::ThresholdNotMet { .. } => {
                "Not enough guardians responded. Ask them to come online and start again."
            }
            Self::RateLimitExceeded { .. } => "Too many attempts. Wait a moment and retry.",
            Self::SessionLimitReached(_) => "Too many active sessions. Sign out elsewhere first.",
            Self::Unsupported(_) => "This signer cannot perform that operation.",
            Self::Remote(_) => "The remote signer refused the request.",
            Self::InvalidSecretKey | Self::InvalidNsec => "That private key is not valid.",
            Self::InvalidNpub => "That public key is not valid.",
            Self::InvalidRelayUrl { .. } => "A relay address is not valid.",
            Self::InvalidInput(_) => "The request was not valid.",
            Self::Config(_) | Self::ConfigDirNotFound => "Configuration could not be loaded.",
            Self::Transport(_) => "Network error. Check your connection and retry.",
            Self::Crypto(_) | Self::Storage(_) | Self::Json(_) | Self::Io(_) => {
                "Internal error. Retry, or use a different signer."
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, CourierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_details() {
        let err = CourierError::Remote("nsec1secretstuff".into());
        assert!(!err.user_message().contains("nsec1"));

        let err = CourierError::Crypto("bad point 02abcdef".into());
        assert!(!err.user_message().contains("02abcdef"));
    }

    #[test]
    fn test_reauth_classification() {
        assert!(CourierError::SessionExpired("s".into()).requires_reauth());
        assert!(CourierError::OperationLimitReached {
            session_id: "s".into(),
            max: 1
        }
        .requires_reauth());
        assert!(!CourierError::EnvelopeOpenFailed.requires_reauth());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CourierError::RateLimitExceeded {
            retry_after: Duration::from_secs(3)
        }
        .is_retryable());
        assert!(CourierError::RelayPublishFailed { attempted: 4 }.is_retryable());
        assert!(!CourierError::PairingSecretMismatch.is_retryable());
        assert!(!CourierError::ThresholdNotMet { needed: 2, got: 1 }.is_retryable());
    }
}
