// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Courier messaging - signer selection, envelopes and relay routing
//!
//! ```text
//! Messenger
//!   ├─ EnvelopeEngine ── SignerRegistry ── SignerBackend (custodian, companion app, ...)
//!   └─ RelayDirectory ── RelayTransport (nostr-sdk client | in-memory network)
//! ```

#![forbid(unsafe_code)]

pub mod directory;
pub mod envelope;
pub mod messenger;
pub mod signer;
pub mod transport;

pub use directory::{DirectoryConfig, PublishReport, PublishRoute, RelayDirectory};
pub use envelope::{EnvelopeEngine, MessageEnvelope, OpenedEnvelope, Rumor};
pub use messenger::{Delivery, Messenger};
pub use signer::{
    Action, Capabilities, EncryptionScheme, Platform, SealRequest, SessionSigner, SignerBackend,
    SignerDescriptor, SignerKind, SignerRegistry, SignerStatus, StatusProbe, Unsealed,
};
pub use transport::{
    EventQuery, EventStream, MemoryRelayNetwork, NostrClientTransport, RelayAck, RelayBehavior,
    RelayTransport,
};
