// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Courier Core - key custody and shared primitives
//!
//! - [`custodian`]: time- and count-limited signing sessions over a secret
//!   that never leaves the custodian except inside a scoped callback
//! - [`rate_limit`]: sliding-window limits per (action, identity hash)
//! - [`relay`]: relay URL rules, deduplication and geohash relay selection
//! - [`canonical`]: canonical challenge bytes for proof-of-control signatures
//! - [`store`]: key-value persistence seam for host-owned storage
//! - [`config`] and [`logging`]: TOML configuration and tracing setup

#![forbid(unsafe_code)]

pub mod canonical;
pub mod config;
pub mod custodian;
pub mod error;
pub mod keys;
pub mod logging;
pub mod rate_limit;
pub mod relay;
pub mod store;

pub use config::{CourierConfig, FeatureFlags, LogLevel, Timeouts};
pub use custodian::{Custodian, SessionInfo, SessionOptions, SessionStatus};
pub use error::{CourierError, Result};
pub use store::{KeyValueStore, MemoryStore};
