// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;

use frost_secp256k1_tr::{
    keys::PublicKeyPackage, round1::SigningCommitments, round2::SignatureShare, Identifier,
    SigningPackage,
};
use rand::RngCore;
use tokio::time::Instant;

use crate::error::{FrostNetError, Result};

const MAX_COMPLETED_HISTORY: usize = 1000;
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingCommitments,
    AwaitingShares,
    Complete,
    Failed,
    Expired,
}

pub fn new_session_id() -> [u8; 32] {
    let mut id = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut id);
    id
}

fn identifier(share_index: u16) -> Result<Identifier> {
    if share_index == 0 {
        return Err(FrostNetError::protocol("Invalid share_index: must be non-zero"));
    }
    Identifier::try_from(share_index)
        .map_err(|e| FrostNetError::Crypto(format!("Invalid identifier: {e}")))
}

/// Coordinator-side state for one two-round signing attempt.
pub struct FrostSigningSession {
    session_id: [u8; 32],
    family_id: String,
    message_hash: [u8; 32],
    threshold: u16,
    participants: Vec<u16>,
    state: SessionState,
    created_at: Instant,
    timeout: Duration,
    commitments: BTreeMap<Identifier, SigningCommitments>,
    committed: Vec<u16>,
    signers: Vec<u16>,
    partials: BTreeMap<Identifier, SignatureShare>,
    aggregated: Option<[u8; 64]>,
}

impl FrostSigningSession {
    pub fn new(
        session_id: [u8; 32],
        family_id: impl Into<String>,
        message_hash: [u8; 32],
        threshold: u16,
        participants: Vec<u16>,
    ) -> Self {
        Self {
            session_id,
            family_id: family_id.into(),
            message_hash,
            threshold,
            participants,
            state: SessionState::AwaitingCommitments,
            created_at: Instant::now(),
            timeout: DEFAULT_SESSION_TIMEOUT,
            commitments: BTreeMap::new(),
            committed: Vec::new(),
            signers: Vec::new(),
            partials: BTreeMap::new(),
            aggregated: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn session_id(&self) -> &[u8; 32] {
        &self.session_id
    }

    pub fn family_id(&self) -> &str {
        &self.family_id
    }

    pub fn message_hash(&self) -> &[u8; 32] {
        &self.message_hash
    }

    pub fn threshold(&self) -> u16 {
        self.threshold
    }

    pub fn participants(&self) -> &[u16] {
        &self.participants
    }

    pub fn is_participant(&self, share_index: u16) -> bool {
        self.participants.contains(&share_index)
    }

    pub fn state(&self) -> SessionState {
        if self.created_at.elapsed() > self.timeout
            && !matches!(self.state, SessionState::Complete | SessionState::Failed)
        {
            return SessionState::Expired;
        }
        self.state
    }

    pub fn is_expired(&self) -> bool {
        self.state() == SessionState::Expired
    }

    pub fn fail(&mut self) {
        if self.state != SessionState::Complete {
            self.state = SessionState::Failed;
        }
    }

    pub fn add_commitment(&mut self, share_index: u16, commitment: SigningCommitments) -> Result<()> {
        let id = identifier(share_index)?;
        if self.state != SessionState::AwaitingCommitments {
            return Err(FrostNetError::Session("Not accepting commitments".into()));
        }
        if !self.is_participant(share_index) {
            return Err(FrostNetError::Session(format!(
                "Share {share_index} not a participant"
            )));
        }
        if self.commitments.contains_key(&id) {
            return Err(FrostNetError::Session("Duplicate commitment".into()));
        }
        self.commitments.insert(id, commitment);
        self.committed.push(share_index);
        Ok(())
    }

    pub fn commitment_count(&self) -> usize {
        self.commitments.len()
    }

    pub fn has_commitment_quorum(&self) -> bool {
        self.commitments.len() >= self.threshold as usize
    }

    /// Close round 1 with the first `threshold` committers, in arrival
    /// order. Later commitments are dropped.
    pub fn begin_round_two(&mut self) -> Result<&[u16]> {
        if self.state != SessionState::AwaitingCommitments {
            return Err(FrostNetError::Session("Round 2 already started".into()));
        }
        if !self.has_commitment_quorum() {
            return Err(FrostNetError::ThresholdNotMet {
                round: 1,
                needed: self.threshold as usize,
                got: self.commitments.len(),
            });
        }

        let chosen: Vec<u16> = self
            .committed
            .iter()
            .copied()
            .take(self.threshold as usize)
            .collect();
        let keep: BTreeSet<Identifier> = chosen
            .iter()
            .map(|i| identifier(*i))
            .collect::<Result<_>>()?;
        self.commitments.retain(|id, _| keep.contains(id));
        self.signers = chosen;
        self.state = SessionState::AwaitingShares;
        Ok(&self.signers)
    }

    /// Guardians asked for a partial signature in round 2.
    pub fn signers(&self) -> &[u16] {
        &self.signers
    }

    pub fn commitments(&self) -> &BTreeMap<Identifier, SigningCommitments> {
        &self.commitments
    }

    pub fn signing_package(&self) -> Result<SigningPackage> {
        if self.state == SessionState::AwaitingCommitments {
            return Err(FrostNetError::Session("Round 1 still open".into()));
        }
        Ok(SigningPackage::new(self.commitments.clone(), &self.message_hash))
    }

    pub fn add_partial(&mut self, share_index: u16, share: SignatureShare) -> Result<()> {
        let id = identifier(share_index)?;
        if self.state != SessionState::AwaitingShares {
            return Err(FrostNetError::Session("Not accepting shares".into()));
        }
        if !self.signers.contains(&share_index) {
            return Err(FrostNetError::Session(format!(
                "Share {share_index} was not asked to sign"
            )));
        }
        if self.partials.contains_key(&id) {
            return Err(FrostNetError::Session("Duplicate signature share".into()));
        }
        self.partials.insert(id, share);
        Ok(())
    }

    pub fn partial_count(&self) -> usize {
        self.partials.len()
    }

    pub fn has_partial_quorum(&self) -> bool {
        self.partials.len() >= self.threshold as usize
    }

    /// Aggregate the partials and verify the result against the group key.
    /// Any bad partial fails the whole session.
    pub fn try_aggregate(&mut self, pubkey_pkg: &PublicKeyPackage) -> Result<Option<[u8; 64]>> {
        if !self.has_partial_quorum() {
            return Ok(None);
        }
        let signing_package = self.signing_package()?;

        let signature =
            match frost_secp256k1_tr::aggregate(&signing_package, &self.partials, pubkey_pkg) {
                Ok(signature) => signature,
                Err(e) => {
                    self.state = SessionState::Failed;
                    return Err(FrostNetError::Crypto(format!("Aggregation failed: {e}")));
                }
            };

        if let Err(e) = pubkey_pkg
            .verifying_key()
            .verify(&self.message_hash, &signature)
        {
            self.state = SessionState::Failed;
            return Err(FrostNetError::Crypto(format!(
                "Aggregate does not verify against group key: {e}"
            )));
        }

        let serialized = signature
            .serialize()
            .map_err(|e| FrostNetError::Crypto(format!("Serialize signature: {e}")))?;
        let bytes: [u8; 64] = serialized
            .as_slice()
            .try_into()
            .map_err(|_| FrostNetError::crypto("Invalid signature length"))?;

        self.aggregated = Some(bytes);
        self.state = SessionState::Complete;
        Ok(Some(bytes))
    }

    pub fn aggregated_signature(&self) -> Option<&[u8; 64]> {
        self.aggregated.as_ref()
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Active coordinator sessions plus a bounded history of finished ids, so
/// a session id is never signed under twice.
pub struct SessionManager {
    active: HashMap<[u8; 32], FrostSigningSession>,
    completed: HashSet<[u8; 32]>,
    completed_order: VecDeque<[u8; 32]>,
    session_timeout: Duration,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            active: HashMap::new(),
            completed: HashSet::new(),
            completed_order: VecDeque::new(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn create_session(
        &mut self,
        session_id: [u8; 32],
        family_id: &str,
        message_hash: [u8; 32],
        threshold: u16,
        participants: Vec<u16>,
    ) -> Result<&mut FrostSigningSession> {
        if self.completed.contains(&session_id) {
            return Err(FrostNetError::ReplayDetected(hex::encode(session_id)));
        }
        if self.active.get(&session_id).is_some_and(|s| !s.is_expired()) {
            return Err(FrostNetError::Session("Session already active".into()));
        }

        let session =
            FrostSigningSession::new(session_id, family_id, message_hash, threshold, participants)
                .with_timeout(self.session_timeout);
        self.active.insert(session_id, session);
        self.active
            .get_mut(&session_id)
            .ok_or_else(|| FrostNetError::SessionNotFound(hex::encode(session_id)))
    }

    pub fn get(&self, session_id: &[u8; 32]) -> Option<&FrostSigningSession> {
        self.active.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &[u8; 32]) -> Option<&mut FrostSigningSession> {
        self.active.get_mut(session_id)
    }

    /// Retire a session whatever its outcome. The id can never be reused.
    pub fn finish(&mut self, session_id: &[u8; 32]) -> Option<FrostSigningSession> {
        let session = self.active.remove(session_id);
        if self.completed.insert(*session_id) {
            self.completed_order.push_back(*session_id);
        }
        while self.completed.len() > MAX_COMPLETED_HISTORY {
            match self.completed_order.pop_front() {
                Some(oldest) => {
                    self.completed.remove(&oldest);
                }
                None => break,
            }
        }
        session
    }

    pub fn cleanup_expired(&mut self) -> usize {
        let before = self.active.len();
        self.active.retain(|_, session| !session.is_expired());
        before - self.active.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_replay(&self, session_id: &[u8; 32]) -> bool {
        self.completed.contains(session_id)
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
