// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

pub mod bridge;
pub mod remote;
pub mod types;
pub mod uri;

pub use bridge::{BridgeConfig, PairingState, RemoteSignerBridge, DEFAULT_REQUEST_TIMEOUT};
pub use remote::RemoteSigner;
pub use types::{Nip46Message, Nip46Request, Nip46Response};
pub use uri::{generate_pairing_secret, BunkerUri, NostrConnectUri};
