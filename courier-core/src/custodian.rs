// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Key custodian: time- and count-limited signing sessions.
//!
//! The raw secret lives in a [`SecretBox`] inside the custodian and is only
//! reachable through [`Custodian::use_once`], which hands a zeroizing copy to
//! a callback for the duration of one operation.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CourierError, Result};
use crate::keys;
use crate::rate_limit::{KeyedRateLimiter, RateLimitConfig};
use crate::store::{self, KeyValueStore};

/// Maximum number of concurrently held signing sessions.
pub const MAX_SESSIONS: usize = 64;

/// How many ended session ids are remembered so late callers get
/// `SessionExpired` instead of `SessionNotFound`.
const MAX_ENDED_HISTORY: usize = 1024;

const SESSION_KEY_PREFIX: &str = "custodian/session/";
const CREATE_ACTION: &str = "session.create";

pub const DEFAULT_SESSION_DURATION: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub duration: Duration,
    pub max_operations: Option<u32>,
    pub single_use: bool,
    /// Session ends with the hosting scope (tab, window, process).
    pub browser_lifetime: bool,
}

impl SessionOptions {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            max_operations: None,
            single_use: false,
            browser_lifetime: false,
        }
    }

    pub fn with_max_operations(mut self, max: u32) -> Self {
        self.max_operations = Some(max);
        self
    }

    pub fn single_use(mut self) -> Self {
        self.single_use = true;
        self
    }

    pub fn browser_lifetime(mut self) -> Self {
        self.browser_lifetime = true;
        self
    }

    fn effective_max(&self) -> Option<u32> {
        if self.single_use {
            Some(self.max_operations.map_or(1, |m| m.min(1)))
        } else {
            self.max_operations
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_DURATION)
    }
}

/// Public metadata for a signing session. Never carries key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(with = "hex_pubkey")]
    pub pubkey: [u8; 32],
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub max_operations: Option<u32>,
    pub operation_count: u32,
    pub single_use: bool,
    pub browser_lifetime: bool,
}

impl SessionInfo {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_operations(&self) -> Option<u32> {
        self.max_operations
            .map(|max| max.saturating_sub(self.operation_count))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Active {
        expires_at: DateTime<Utc>,
        remaining_operations: Option<u32>,
    },
    Exhausted,
    Expired,
    NotFound,
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Active { .. })
    }
}

struct SigningSession {
    info: SessionInfo,
    secret: SecretBox<[u8; 32]>,
    /// Operations reserved by in-progress callbacks.
    reserved: u32,
}

impl SigningSession {
    fn is_exhausted(&self) -> bool {
        self.info
            .max_operations
            .is_some_and(|max| self.info.operation_count + self.reserved >= max)
    }
}

#[derive(Default)]
struct SessionTable {
    live: HashMap<String, SigningSession>,
    ended: HashSet<String>,
    ended_order: VecDeque<String>,
}

impl SessionTable {
    fn end(&mut self, session_id: &str) -> Option<SigningSession> {
        let removed = self.live.remove(session_id);
        if removed.is_some() && self.ended.insert(session_id.to_string()) {
            self.ended_order.push_back(session_id.to_string());
            while self.ended_order.len() > MAX_ENDED_HISTORY {
                if let Some(oldest) = self.ended_order.pop_front() {
                    self.ended.remove(&oldest);
                }
            }
        }
        removed
    }

    fn missing_error(&self, session_id: &str) -> CourierError {
        if self.ended.contains(session_id) {
            CourierError::SessionExpired(session_id.to_string())
        } else {
            CourierError::SessionNotFound(session_id.to_string())
        }
    }
}

pub struct Custodian {
    sessions: Mutex<SessionTable>,
    limiter: Mutex<KeyedRateLimiter>,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl Custodian {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(SessionTable::default()),
            limiter: Mutex::new(KeyedRateLimiter::default()),
            store: None,
        }
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.limiter = Mutex::new(KeyedRateLimiter::new(config));
        self
    }

    /// Mirror session metadata into `store` so the host can list sessions.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Take ownership of `secret` and open a session for it. The source
    /// buffer is zeroed whether or not the call succeeds.
    pub fn create_session(&self, secret: &mut [u8; 32], options: SessionOptions) -> Result<String> {
        let pubkey = match keys::public_key_for(secret) {
            Ok(pk) => pk,
            Err(e) => {
                secret.zeroize();
                return Err(e);
            }
        };

        let identity = keys::identity_hash(&pubkey);
        if let Err(e) = self.limiter.lock().check_and_record(CREATE_ACTION, &identity) {
            secret.zeroize();
            return Err(e);
        }

        let duration = chrono::Duration::from_std(options.duration)
            .map_err(|_| CourierError::invalid_input("session duration out of range"));
        let duration = match duration {
            Ok(d) => d,
            Err(e) => {
                secret.zeroize();
                return Err(e);
            }
        };

        let now = Utc::now();
        let session_id = uuid::Uuid::new_v4().to_string();
        let info = SessionInfo {
            session_id: session_id.clone(),
            pubkey,
            created_at: now,
            expires_at: now + duration,
            max_operations: options.effective_max(),
            operation_count: 0,
            single_use: options.single_use,
            browser_lifetime: options.browser_lifetime,
        };

        let session = SigningSession {
            info: info.clone(),
            secret: SecretBox::new(Box::new(*secret)),
            reserved: 0,
        };
        secret.zeroize();

        {
            let mut table = self.sessions.lock();
            if table.live.len() >= MAX_SESSIONS {
                Self::purge_locked(&mut table, now);
            }
            if table.live.len() >= MAX_SESSIONS {
                return Err(CourierError::SessionLimitReached(MAX_SESSIONS));
            }
            table.live.insert(session_id.clone(), session);
        }

        self.persist(&info);
        info!(
            session_id = %session_id,
            identity = %hex::encode(&identity[..8]),
            single_use = options.single_use,
            browser_lifetime = options.browser_lifetime,
            "signing session created"
        );
        Ok(session_id)
    }

    /// Run `f` with the session's secret. Expiry and quota are checked
    /// before `f` runs; a session is only charged when `f` succeeds.
    pub fn use_once<T, F>(&self, session_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&[u8; 32]) -> Result<T>,
    {
        let secret = self.reserve(session_id)?;
        let result = f(&secret);
        drop(secret);
        self.settle(session_id, result.is_ok());
        result
    }

    fn reserve(&self, session_id: &str) -> Result<Zeroizing<[u8; 32]>> {
        let mut table = self.sessions.lock();
        let now = Utc::now();

        let Some(session) = table.live.get_mut(session_id) else {
            return Err(table.missing_error(session_id));
        };

        if session.info.is_expired_at(now) {
            table.end(session_id);
            drop(table);
            self.forget(session_id);
            debug!(session_id, "signing session expired");
            return Err(CourierError::SessionExpired(session_id.to_string()));
        }

        if session.is_exhausted() {
            return Err(CourierError::OperationLimitReached {
                session_id: session_id.to_string(),
                max: session.info.max_operations.unwrap_or(0),
            });
        }

        session.reserved += 1;
        Ok(Zeroizing::new(*session.secret.expose_secret()))
    }

    fn settle(&self, session_id: &str, succeeded: bool) {
        let mut table = self.sessions.lock();
        let Some(session) = table.live.get_mut(session_id) else {
            return;
        };

        session.reserved = session.reserved.saturating_sub(1);
        if succeeded {
            session.info.operation_count += 1;
        }

        if session.info.single_use {
            table.end(session_id);
            drop(table);
            self.forget(session_id);
            debug!(session_id, "single-use session destroyed");
            return;
        }

        let info = session.info.clone();
        drop(table);
        if succeeded {
            self.persist(&info);
        }
    }

    pub fn status(&self, session_id: &str) -> SessionStatus {
        let table = self.sessions.lock();
        match table.live.get(session_id) {
            Some(s) if s.info.is_expired_at(Utc::now()) => SessionStatus::Expired,
            Some(s) if s.is_exhausted() => SessionStatus::Exhausted,
            Some(s) => SessionStatus::Active {
                expires_at: s.info.expires_at,
                remaining_operations: s.info.remaining_operations(),
            },
            None if table.ended.contains(session_id) => SessionStatus::Expired,
            None => SessionStatus::NotFound,
        }
    }

    pub fn info(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions
            .lock()
            .live
            .get(session_id)
            .map(|s| s.info.clone())
    }

    /// Public key of a live session. Does not count as an operation.
    pub fn public_key(&self, session_id: &str) -> Result<[u8; 32]> {
        let table = self.sessions.lock();
        table
            .live
            .get(session_id)
            .map(|s| s.info.pubkey)
            .ok_or_else(|| table.missing_error(session_id))
    }

    pub fn destroy(&self, session_id: &str) -> bool {
        let removed = self.sessions.lock().end(session_id).is_some();
        if removed {
            self.forget(session_id);
            info!(session_id, "signing session destroyed");
        }
        removed
    }

    /// End every session tied to the hosting scope.
    pub fn end_scope(&self) -> usize {
        self.end_where(|s| s.info.browser_lifetime)
    }

    pub fn logout(&self) -> usize {
        self.end_where(|_| true)
    }

    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        self.end_where(|s| s.info.is_expired_at(now))
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().live.len()
    }

    fn end_where(&self, predicate: impl Fn(&SigningSession) -> bool) -> usize {
        let ended: Vec<String> = {
            let mut table = self.sessions.lock();
            let ids: Vec<String> = table
                .live
                .iter()
                .filter(|(_, s)| predicate(s))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                table.end(id);
            }
            ids
        };

        for id in &ended {
            self.forget(id);
        }
        if !ended.is_empty() {
            info!(count = ended.len(), "signing sessions ended");
        }
        ended.len()
    }

    fn purge_locked(table: &mut SessionTable, now: DateTime<Utc>) {
        let expired: Vec<String> = table
            .live
            .iter()
            .filter(|(_, s)| s.info.is_expired_at(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            table.end(&id);
        }
    }

    fn persist(&self, info: &SessionInfo) {
        if let Some(store) = &self.store {
            let key = format!("{SESSION_KEY_PREFIX}{}", info.session_id);
            if let Err(e) = store::put_json(store.as_ref(), &key, info) {
                warn!(session_id = %info.session_id, error = %e, "failed to persist session metadata");
            }
        }
    }

    fn forget(&self, session_id: &str) {
        if let Some(store) = &self.store {
            let key = format!("{SESSION_KEY_PREFIX}{session_id}");
            if let Err(e) = store.delete(&key) {
                warn!(session_id, error = %e, "failed to remove session metadata");
            }
        }
    }
}

impl Default for Custodian {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Custodian {
    fn drop(&mut self) {
        self.sessions.get_mut().live.clear();
    }
}

mod hex_pubkey {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn secret() -> [u8; 32] {
        *keys::generate_secret().unwrap()
    }

    #[test]
    fn test_max_operations_enforced() {
        let custodian = Custodian::new();
        let mut sk = secret();
        let id = custodian
            .create_session(&mut sk, SessionOptions::default().with_max_operations(3))
            .unwrap();
        assert_eq!(sk, [0u8; 32]);

        for _ in 0..3 {
            custodian.use_once(&id, |_| Ok(())).unwrap();
        }

        let mut invoked = false;
        let result = custodian.use_once(&id, |_| {
            invoked = true;
            Ok(())
        });
        assert!(matches!(
            result,
            Err(CourierError::OperationLimitReached { max: 3, .. })
        ));
        assert!(!invoked);
        assert_eq!(custodian.status(&id), SessionStatus::Exhausted);
    }

    #[test]
    fn test_single_use_destroyed_after_callback() {
        let custodian = Custodian::new();
        let mut sk = secret();
        let id = custodian
            .create_session(&mut sk, SessionOptions::default().single_use())
            .unwrap();

        custodian.use_once(&id, |_| Ok(())).unwrap();
        assert!(matches!(
            custodian.use_once(&id, |_| Ok(())),
            Err(CourierError::SessionExpired(_))
        ));
        assert_eq!(custodian.active_sessions(), 0);
    }

    #[test]
    fn test_single_use_destroyed_on_failure() {
        let custodian = Custodian::new();
        let mut sk = secret();
        let id = custodian
            .create_session(&mut sk, SessionOptions::default().single_use())
            .unwrap();

        let result: Result<()> =
            custodian.use_once(&id, |_| Err(CourierError::crypto("callback failed")));
        assert!(result.is_err());
        assert_eq!(custodian.status(&id), SessionStatus::Expired);
    }

    #[test]
    fn test_failed_callback_not_charged() {
        let custodian = Custodian::new();
        let mut sk = secret();
        let id = custodian
            .create_session(&mut sk, SessionOptions::default().with_max_operations(1))
            .unwrap();

        let _: Result<()> = custodian.use_once(&id, |_| Err(CourierError::crypto("nope")));
        custodian.use_once(&id, |_| Ok(())).unwrap();
    }

    #[test]
    fn test_expired_session_never_invokes_callback() {
        let custodian = Custodian::new();
        let mut sk = secret();
        let id = custodian
            .create_session(&mut sk, SessionOptions::new(Duration::ZERO))
            .unwrap();

        let mut invoked = false;
        let result = custodian.use_once(&id, |_| {
            invoked = true;
            Ok(())
        });
        assert!(matches!(result, Err(CourierError::SessionExpired(_))));
        assert!(!invoked);
    }

    #[test]
    fn test_callback_sees_session_secret() {
        let custodian = Custodian::new();
        let original = secret();
        let expected_pk = keys::public_key_for(&original).unwrap();
        let mut sk = original;
        let id = custodian
            .create_session(&mut sk, SessionOptions::default())
            .unwrap();

        let pk = custodian.use_once(&id, keys::public_key_for).unwrap();
        assert_eq!(pk, expected_pk);
        assert_eq!(custodian.public_key(&id).unwrap(), expected_pk);
    }

    #[test]
    fn test_unknown_session() {
        let custodian = Custodian::new();
        assert!(matches!(
            custodian.use_once("missing", |_| Ok(())),
            Err(CourierError::SessionNotFound(_))
        ));
        assert_eq!(custodian.status("missing"), SessionStatus::NotFound);
    }

    #[test]
    fn test_end_scope_only_ends_browser_sessions() {
        let custodian = Custodian::new();
        let mut a = secret();
        let mut b = secret();
        let scoped = custodian
            .create_session(&mut a, SessionOptions::default().browser_lifetime())
            .unwrap();
        let durable = custodian
            .create_session(&mut b, SessionOptions::default())
            .unwrap();

        assert_eq!(custodian.end_scope(), 1);
        assert_eq!(custodian.status(&scoped), SessionStatus::Expired);
        assert!(custodian.status(&durable).is_active());

        assert_eq!(custodian.logout(), 1);
        assert_eq!(custodian.active_sessions(), 0);
    }

    #[test]
    fn test_invalid_secret_rejected_and_zeroed() {
        let custodian = Custodian::new();
        let mut sk = [0u8; 32];
        assert!(matches!(
            custodian.create_session(&mut sk, SessionOptions::default()),
            Err(CourierError::InvalidSecretKey)
        ));
    }

    #[test]
    fn test_create_is_rate_limited() {
        let custodian = Custodian::new().with_rate_limit(RateLimitConfig::new(2, 10, 10));
        let base = secret();

        for _ in 0..2 {
            let mut sk = base;
            custodian
                .create_session(&mut sk, SessionOptions::default())
                .unwrap();
        }

        let mut sk = base;
        assert!(matches!(
            custodian.create_session(&mut sk, SessionOptions::default()),
            Err(CourierError::RateLimitExceeded { .. })
        ));
        assert_eq!(sk, [0u8; 32]);
    }

    #[test]
    fn test_metadata_persisted_without_secret() {
        let store = Arc::new(MemoryStore::new());
        let custodian = Custodian::new().with_store(store.clone());
        let original = secret();
        let mut sk = original;
        let id = custodian
            .create_session(&mut sk, SessionOptions::default().with_max_operations(2))
            .unwrap();
        custodian.use_once(&id, |_| Ok(())).unwrap();

        let key = format!("{SESSION_KEY_PREFIX}{id}");
        let raw = store.get(&key).unwrap().unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(!text.contains(&hex::encode(original)));

        let info: SessionInfo = store::get_json(store.as_ref(), &key).unwrap().unwrap();
        assert_eq!(info.operation_count, 1);

        custodian.destroy(&id);
        assert!(store.is_empty());
    }
}
