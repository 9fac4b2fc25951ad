// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::Utc;
use nostr_sdk::prelude::*;
use proptest::prelude::*;

use courier_core::MemoryStore;
use courier_frost_net::approval::NewApproval;
use courier_frost_net::protocol::{CommitmentRequestPayload, GuardianMessage, PROTOCOL_VERSION};
use courier_frost_net::{ApprovalBook, ApprovalOutcome, ThresholdConfig};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Answers applied in any order settle the same way: approved once the
    /// threshold is reached, rejected once it no longer can be.
    #[test]
    fn test_approval_outcome_follows_counts(
        answers in prop::collection::vec(prop::option::of(any::<bool>()), 2..7),
        threshold in 1usize..7,
    ) {
        let threshold = threshold.min(answers.len());
        let book = ApprovalBook::new(Arc::new(MemoryStore::new()));
        let guardians: Vec<PublicKey> = answers.iter().map(|_| Keys::generate().public_key()).collect();
        let now = Utc::now();
        book.create(
            "req",
            &NewApproval {
                group_id: "g",
                requester: Keys::generate().public_key(),
                content: "c",
                message_type: "m",
            },
            &guardians,
            now,
        )
        .unwrap();

        for (guardian, answer) in guardians.iter().zip(&answers) {
            if let Some(approved) = answer {
                book.record_response("req", guardian, *approved, now).unwrap();
            }
        }

        let approved = answers.iter().filter(|a| **a == Some(true)).count();
        let pending = answers.iter().filter(|a| a.is_none()).count();
        let outcome = book.outcome("req", threshold, now).unwrap();

        if approved >= threshold {
            prop_assert_eq!(outcome, ApprovalOutcome::Approved);
        } else if approved + pending >= threshold {
            prop_assert_eq!(outcome, ApprovalOutcome::Pending { approved, needed: threshold });
        } else {
            prop_assert_eq!(outcome, ApprovalOutcome::Rejected);
        }
    }

    #[test]
    fn test_threshold_config_bounds(threshold in 0u16..300, total in 0u16..300) {
        let valid = threshold >= 2 && total >= threshold && total <= 255;
        prop_assert_eq!(ThresholdConfig::new(threshold, total).is_ok(), valid);
    }

    #[test]
    fn test_commitment_request_validation(
        threshold in 0u16..6,
        participants in prop::collection::vec(0u16..6, 0..6),
    ) {
        let msg = GuardianMessage::CommitmentRequest(CommitmentRequestPayload {
            version: PROTOCOL_VERSION,
            session_id: [1u8; 32],
            family_id: "f".into(),
            group_pubkey: [2u8; 32],
            message_hash: [3u8; 32],
            threshold,
            participants: participants.clone(),
            expires_at: 0,
        });
        let valid = threshold > 0
            && participants.len() >= threshold as usize
            && !participants.contains(&0);
        prop_assert_eq!(msg.validate().is_ok(), valid);

        let parsed = GuardianMessage::from_json(&msg.to_json().unwrap()).unwrap();
        prop_assert_eq!(parsed.session_id(), Some(&[1u8; 32]));
    }
}
