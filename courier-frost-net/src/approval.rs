// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Guardian approval requests, persisted through the host's key-value store.
//!
//! A request fans out to one record per guardian, all sharing the request
//! id. Each record moves from `pending` to `approved` or `rejected` exactly
//! once; a pending record past its expiry reads as `expired` and can no
//! longer change.
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use nostr_sdk::prelude::PublicKey;
use serde::{Deserialize, Serialize};
use tracing::debug;

use courier_core::store::{get_json, put_json, query_json};
use courier_core::KeyValueStore;

use crate::error::{FrostNetError, Result};

pub const APPROVAL_TTL_HOURS: i64 = 24;
const KEY_PREFIX: &str = "guardian_approval/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianApprovalRequest {
    pub id: String,
    pub group_id: String,
    pub requester_pubkey: PublicKey,
    pub guardian_pubkey: PublicKey,
    pub content: String,
    pub message_type: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ApprovalStatus,
}

impl GuardianApprovalRequest {
    /// Status with expiry applied.
    pub fn status_at(&self, now: DateTime<Utc>) -> ApprovalStatus {
        if self.status == ApprovalStatus::Pending && now >= self.expires_at {
            ApprovalStatus::Expired
        } else {
            self.status
        }
    }
}

/// Combined view of all guardian records for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Pending { approved: usize, needed: usize },
    Approved,
    Rejected,
    Expired,
}

impl ApprovalOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalOutcome::Pending { .. })
    }
}

/// Everything needed to open a new request.
#[derive(Debug, Clone)]
pub struct NewApproval<'a> {
    pub group_id: &'a str,
    pub requester: PublicKey,
    pub content: &'a str,
    pub message_type: &'a str,
}

pub struct ApprovalBook {
    store: Arc<dyn KeyValueStore>,
}

impl ApprovalBook {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(request_id: &str, guardian: &PublicKey) -> String {
        format!("{KEY_PREFIX}{request_id}/{}", guardian.to_hex())
    }

    /// Persist a pending record for each guardian. Returns the records.
    pub fn create(
        &self,
        request_id: &str,
        request: &NewApproval<'_>,
        guardians: &[PublicKey],
        now: DateTime<Utc>,
    ) -> Result<Vec<GuardianApprovalRequest>> {
        if guardians.is_empty() {
            return Err(FrostNetError::protocol("approval needs at least one guardian"));
        }
        if !self.records(request_id)?.is_empty() {
            return Err(FrostNetError::protocol(format!(
                "approval {request_id} already exists"
            )));
        }

        let expires_at = now + ChronoDuration::hours(APPROVAL_TTL_HOURS);
        let mut records = Vec::with_capacity(guardians.len());
        for guardian in guardians {
            let record = GuardianApprovalRequest {
                id: request_id.to_string(),
                group_id: request.group_id.to_string(),
                requester_pubkey: request.requester,
                guardian_pubkey: *guardian,
                content: request.content.to_string(),
                message_type: request.message_type.to_string(),
                created_at: now,
                expires_at,
                status: ApprovalStatus::Pending,
            };
            put_json(self.store.as_ref(), &Self::key(request_id, guardian), &record)?;
            records.push(record);
        }
        debug!(request_id, guardians = records.len(), "approval request stored");
        Ok(records)
    }

    pub fn records(&self, request_id: &str) -> Result<Vec<GuardianApprovalRequest>> {
        let prefix = format!("{KEY_PREFIX}{request_id}/");
        Ok(query_json(self.store.as_ref(), &prefix)?)
    }

    pub fn get(
        &self,
        request_id: &str,
        guardian: &PublicKey,
    ) -> Result<Option<GuardianApprovalRequest>> {
        Ok(get_json(self.store.as_ref(), &Self::key(request_id, guardian))?)
    }

    /// Apply a guardian's answer. Terminal records never change again.
    pub fn record_response(
        &self,
        request_id: &str,
        guardian: &PublicKey,
        approved: bool,
        now: DateTime<Utc>,
    ) -> Result<GuardianApprovalRequest> {
        let key = Self::key(request_id, guardian);
        let mut record: GuardianApprovalRequest = get_json(self.store.as_ref(), &key)?
            .ok_or_else(|| FrostNetError::ApprovalNotFound(request_id.to_string()))?;

        let status = record.status_at(now);
        if status.is_terminal() {
            if status == ApprovalStatus::Expired && record.status != status {
                record.status = status;
                put_json(self.store.as_ref(), &key, &record)?;
            }
            return Err(FrostNetError::ApprovalClosed {
                id: request_id.to_string(),
                status,
            });
        }

        record.status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        put_json(self.store.as_ref(), &key, &record)?;
        debug!(request_id, guardian = %guardian, status = ?record.status, "approval answered");
        Ok(record)
    }

    /// Approved once `threshold` guardians approve; rejected as soon as
    /// that is no longer reachable; expired when time runs out first.
    pub fn outcome(
        &self,
        request_id: &str,
        threshold: usize,
        now: DateTime<Utc>,
    ) -> Result<ApprovalOutcome> {
        let records = self.records(request_id)?;
        if records.is_empty() {
            return Err(FrostNetError::ApprovalNotFound(request_id.to_string()));
        }
        let count = |wanted: ApprovalStatus| {
            records
                .iter()
                .filter(|r| r.status_at(now) == wanted)
                .count()
        };
        let approved = count(ApprovalStatus::Approved);
        let pending = count(ApprovalStatus::Pending);
        let needed = threshold.max(1);

        Ok(if approved >= needed {
            ApprovalOutcome::Approved
        } else if approved + pending >= needed {
            ApprovalOutcome::Pending { approved, needed }
        } else if count(ApprovalStatus::Expired) > 0 {
            ApprovalOutcome::Expired
        } else {
            ApprovalOutcome::Rejected
        })
    }

    /// Persist `expired` on overdue pending records. Returns how many changed.
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize> {
        let all: Vec<GuardianApprovalRequest> = query_json(self.store.as_ref(), KEY_PREFIX)?;
        let mut changed = 0;
        for mut record in all {
            if record.status == ApprovalStatus::Pending && now >= record.expires_at {
                record.status = ApprovalStatus::Expired;
                put_json(
                    self.store.as_ref(),
                    &Self::key(&record.id, &record.guardian_pubkey),
                    &record,
                )?;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::MemoryStore;
    use nostr_sdk::prelude::Keys;

    fn setup(n: usize) -> (ApprovalBook, Vec<PublicKey>, NewApproval<'static>) {
        let book = ApprovalBook::new(Arc::new(MemoryStore::new()));
        let guardians = (0..n).map(|_| Keys::generate().public_key()).collect();
        let request = NewApproval {
            group_id: "group-1",
            requester: Keys::generate().public_key(),
            content: "add member",
            message_type: "membership",
        };
        (book, guardians, request)
    }

    #[test]
    fn test_create_pending_with_24h_expiry() {
        let (book, guardians, request) = setup(3);
        let now = Utc::now();
        let records = book.create("req-1", &request, &guardians, now).unwrap();

        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.status == ApprovalStatus::Pending));
        assert_eq!(records[0].expires_at - records[0].created_at, ChronoDuration::hours(24));
        assert_eq!(book.records("req-1").unwrap().len(), 3);
        assert!(book.create("req-1", &request, &guardians, now).is_err());
    }

    #[test]
    fn test_quorum_outcome() {
        let (book, guardians, request) = setup(3);
        let now = Utc::now();
        book.create("req-2", &request, &guardians, now).unwrap();

        assert_eq!(
            book.outcome("req-2", 2, now).unwrap(),
            ApprovalOutcome::Pending {
                approved: 0,
                needed: 2
            }
        );
        book.record_response("req-2", &guardians[0], true, now).unwrap();
        book.record_response("req-2", &guardians[1], true, now).unwrap();
        assert_eq!(book.outcome("req-2", 2, now).unwrap(), ApprovalOutcome::Approved);
    }

    #[test]
    fn test_rejection_when_quorum_unreachable() {
        let (book, guardians, request) = setup(3);
        let now = Utc::now();
        book.create("req-3", &request, &guardians, now).unwrap();

        book.record_response("req-3", &guardians[0], false, now).unwrap();
        assert!(!book.outcome("req-3", 2, now).unwrap().is_terminal());
        book.record_response("req-3", &guardians[1], false, now).unwrap();
        assert_eq!(book.outcome("req-3", 2, now).unwrap(), ApprovalOutcome::Rejected);
    }

    #[test]
    fn test_terminal_records_do_not_change() {
        let (book, guardians, request) = setup(2);
        let now = Utc::now();
        book.create("req-4", &request, &guardians, now).unwrap();

        book.record_response("req-4", &guardians[0], true, now).unwrap();
        assert!(matches!(
            book.record_response("req-4", &guardians[0], false, now),
            Err(FrostNetError::ApprovalClosed {
                status: ApprovalStatus::Approved,
                ..
            })
        ));
        assert!(matches!(
            book.record_response("missing", &guardians[0], true, now),
            Err(FrostNetError::ApprovalNotFound(_))
        ));
    }

    #[test]
    fn test_expiry_is_terminal() {
        let (book, guardians, request) = setup(2);
        let now = Utc::now();
        book.create("req-5", &request, &guardians, now).unwrap();
        let later = now + ChronoDuration::hours(24);

        assert_eq!(book.outcome("req-5", 2, later).unwrap(), ApprovalOutcome::Expired);
        assert!(matches!(
            book.record_response("req-5", &guardians[0], true, later),
            Err(FrostNetError::ApprovalClosed {
                status: ApprovalStatus::Expired,
                ..
            })
        ));
        assert_eq!(
            book.get("req-5", &guardians[0]).unwrap().unwrap().status,
            ApprovalStatus::Expired
        );
        assert_eq!(book.expire_overdue(later).unwrap(), 1);
        assert_eq!(book.expire_overdue(later).unwrap(), 0);
    }
}
