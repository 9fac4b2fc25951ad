// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sliding-window rate limiting keyed by action and identity hash.
use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CourierError, Result};

/// Upper bound on tracked (action, identity) pairs.
pub const MAX_TRACKED_KEYS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub max_per_minute: u32,
    pub max_per_hour: u32,
    pub max_per_day: u32,
}

impl RateLimitConfig {
    pub fn new(per_minute: u32, per_hour: u32, per_day: u32) -> Self {
        Self {
            max_per_minute: per_minute,
            max_per_hour: per_hour,
            max_per_day: per_day,
        }
    }

    pub fn permissive() -> Self {
        Self::new(60, 1000, 10000)
    }

    pub fn conservative() -> Self {
        Self::new(10, 100, 1000)
    }

    pub fn strict() -> Self {
        Self::new(5, 50, 500)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::permissive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitStatus {
    Allowed {
        remaining_minute: u32,
        remaining_hour: u32,
        remaining_day: u32,
    },
    Exceeded {
        window: &'static str,
        limit: u32,
        current: u32,
        retry_after: std::time::Duration,
    },
}

impl RateLimitStatus {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitStatus::Allowed { .. })
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            RateLimitStatus::Allowed { .. } => Ok(()),
            RateLimitStatus::Exceeded { retry_after, .. } => {
                Err(CourierError::RateLimitExceeded { retry_after })
            }
        }
    }
}

/// Sliding-window counter for a single key.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    requests: VecDeque<DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            requests: VecDeque::new(),
        }
    }

    pub fn check_at(&self, now: DateTime<Utc>) -> RateLimitStatus {
        let windows = [
            ("minute", Duration::minutes(1), self.config.max_per_minute),
            ("hour", Duration::hours(1), self.config.max_per_hour),
            ("day", Duration::days(1), self.config.max_per_day),
        ];

        let mut remaining = [0u32; 3];
        for (slot, (window, span, limit)) in windows.into_iter().enumerate() {
            let cutoff = now - span;
            let in_window: Vec<&DateTime<Utc>> =
                self.requests.iter().filter(|t| **t > cutoff).collect();
            let current = in_window.len() as u32;

            if current >= limit {
                // The window frees a slot once its oldest entry ages out.
                let oldest = in_window.first().map(|t| **t).unwrap_or(now);
                let free_at = oldest + span;
                let retry_after = (free_at - now)
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                return RateLimitStatus::Exceeded {
                    window,
                    limit,
                    current,
                    retry_after,
                };
            }
            remaining[slot] = limit - current;
        }

        RateLimitStatus::Allowed {
            remaining_minute: remaining[0],
            remaining_hour: remaining[1],
            remaining_day: remaining[2],
        }
    }

    pub fn record_at(&mut self, timestamp: DateTime<Utc>) {
        self.requests.push_back(timestamp);
        self.cleanup_at(timestamp);
    }

    pub fn check_and_record_at(&mut self, timestamp: DateTime<Utc>) -> RateLimitStatus {
        let status = self.check_at(timestamp);
        if status.is_allowed() {
            self.record_at(timestamp);
        }
        status
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        self.requests
            .back()
            .copied()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn cleanup_at(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(1);
        while let Some(front) = self.requests.front() {
            if *front <= cutoff {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LimitKey {
    action: String,
    identity: [u8; 32],
}

/// Rate limiter over many (action, identity-hash) pairs sharing one config.
///
/// A rejected check records nothing, so repeated rejected calls do not
/// extend the wait.
#[derive(Debug)]
pub struct KeyedRateLimiter {
    config: RateLimitConfig,
    limiters: HashMap<LimitKey, RateLimiter>,
}

impl KeyedRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            limiters: HashMap::new(),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    pub fn check_and_record(&mut self, action: &str, identity: &[u8; 32]) -> Result<()> {
        self.check_and_record_at(action, identity, Utc::now())
    }

    pub fn check_and_record_at(
        &mut self,
        action: &str,
        identity: &[u8; 32],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let key = LimitKey {
            action: action.to_string(),
            identity: *identity,
        };

        if let Some(limiter) = self.limiters.get_mut(&key) {
            return limiter.check_and_record_at(now).into_result();
        }

        if self.limiters.len() >= MAX_TRACKED_KEYS {
            self.evict(now);
        }

        let mut limiter = RateLimiter::new(self.config);
        let status = limiter.check_and_record_at(now);
        self.limiters.insert(key, limiter);
        status.into_result()
    }

    pub fn tracked(&self) -> usize {
        self.limiters.len()
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(1);
        self.limiters.retain(|_, l| l.last_used() > cutoff);

        if self.limiters.len() >= MAX_TRACKED_KEYS {
            if let Some(oldest) = self
                .limiters
                .iter()
                .min_by_key(|(_, l)| l.last_used())
                .map(|(k, _)| k.clone())
            {
                self.limiters.remove(&oldest);
            }
        }
    }
}

impl Default for KeyedRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
