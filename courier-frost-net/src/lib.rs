// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Guardian approvals and FROST threshold signing over Nostr relays.
//!
//! A guardian family shares one BIP-340 group key split t-of-n. The
//! [`ThresholdCoordinator`] drives two signing rounds over encrypted relay
//! messages; each guardian runs a [`GuardianNode`] that answers them. The
//! same transport carries approval requests, tracked per guardian by
//! [`ApprovalBook`].
//!
//! Quorum failures are final for a session: a new signing call starts a new
//! session with fresh nonces.

#![forbid(unsafe_code)]

pub mod approval;
pub mod coordinator;
pub mod dealer;
pub mod error;
pub mod event;
pub mod guardian;
pub mod protocol;
pub mod session;
pub mod signer;

pub use approval::{ApprovalBook, ApprovalOutcome, ApprovalStatus, GuardianApprovalRequest};
pub use coordinator::{CoordinatorConfig, ThresholdCoordinator};
pub use dealer::{GuardianFamily, GuardianInfo, GuardianShare, ThresholdConfig, TrustedDealer};
pub use error::{FrostNetError, Result};
pub use event::GuardianEventBuilder;
pub use guardian::{AutoApprove, GuardianNode, GuardianPolicy};
pub use protocol::{GuardianMessage, APPROVAL_EVENT_KIND, THRESHOLD_EVENT_KIND};
pub use session::{FrostSigningSession, SessionManager, SessionState};
pub use signer::ThresholdSigner;
