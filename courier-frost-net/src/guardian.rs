// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Guardian responder: answers approval requests and takes part in
//! two-round signing for its family.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use frost_secp256k1_tr::rand_core::OsRng;
use frost_secp256k1_tr::round1::{SigningCommitments, SigningNonces};
use frost_secp256k1_tr::{Identifier, SigningPackage};
use nostr_sdk::prelude::*;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use courier_messaging::{EventQuery, EventStream, PublishRoute, RelayDirectory};

use crate::dealer::{GuardianFamily, GuardianShare};
use crate::error::{FrostNetError, Result};
use crate::event::GuardianEventBuilder;
use crate::protocol::*;

const SUBSCRIPTION_LOOKBACK: Duration = Duration::from_secs(10);
const MAX_CONSUMED_HISTORY: usize = 10_000;

/// Decides what this guardian agrees to.
pub trait GuardianPolicy: Send + Sync {
    fn approve(&self, _request: &ApprovalRequestPayload) -> bool {
        true
    }

    fn allow_signing(&self, _request: &CommitmentRequestPayload) -> bool {
        true
    }
}

/// Approves and signs everything addressed to the family.
pub struct AutoApprove;

impl GuardianPolicy for AutoApprove {}

struct PendingNonce {
    nonces: SigningNonces,
    commitment: SigningCommitments,
    message_hash: [u8; 32],
    coordinator: PublicKey,
}

#[derive(Default)]
struct NonceLedger {
    pending: HashMap<[u8; 32], PendingNonce>,
    consumed: HashSet<[u8; 32]>,
    consumed_order: VecDeque<[u8; 32]>,
}

impl NonceLedger {
    fn consume(&mut self, session_id: [u8; 32]) {
        self.pending.remove(&session_id);
        if self.consumed.insert(session_id) {
            self.consumed_order.push_back(session_id);
        }
        while self.consumed.len() > MAX_CONSUMED_HISTORY {
            match self.consumed_order.pop_front() {
                Some(oldest) => {
                    self.consumed.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

struct Inner {
    keys: Keys,
    share: GuardianShare,
    family: GuardianFamily,
    directory: Arc<RelayDirectory>,
    relays: Vec<String>,
    policy: RwLock<Arc<dyn GuardianPolicy>>,
    ledger: Mutex<NonceLedger>,
}

pub struct GuardianNode {
    inner: Arc<Inner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl GuardianNode {
    pub fn new(
        keys: Keys,
        share: GuardianShare,
        family: GuardianFamily,
        directory: Arc<RelayDirectory>,
        relays: Vec<String>,
    ) -> Result<Self> {
        let listed = family
            .guardian_by_index(share.share_index)
            .ok_or_else(|| FrostNetError::UnknownGuardian(share.share_index.to_string()))?;
        if listed.pubkey != keys.public_key() {
            return Err(FrostNetError::UnknownGuardian(keys.public_key().to_hex()));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                keys,
                share,
                family,
                directory,
                relays,
                policy: RwLock::new(Arc::new(AutoApprove)),
                ledger: Mutex::new(NonceLedger::default()),
            }),
            listener: Mutex::new(None),
        })
    }

    pub fn set_policy(&self, policy: Arc<dyn GuardianPolicy>) {
        *self.inner.policy.write() = policy;
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.keys.public_key()
    }

    pub fn share_index(&self) -> u16 {
        self.inner.share.share_index
    }

    pub fn pending_sessions(&self) -> usize {
        self.inner.ledger.lock().pending.len()
    }

    pub fn is_consumed(&self, session_id: &[u8; 32]) -> bool {
        self.inner.ledger.lock().consumed.contains(session_id)
    }

    /// Subscribe to messages addressed to this guardian and answer them in
    /// the background until [`GuardianNode::stop`] or drop.
    pub async fn start(&self) -> Result<()> {
        if self.listener.lock().is_some() {
            return Ok(());
        }
        let query = EventQuery::new()
            .kind(Kind::Custom(THRESHOLD_EVENT_KIND))
            .kind(Kind::Custom(APPROVAL_EVENT_KIND))
            .recipient(self.public_key())
            .since(Timestamp::now() - SUBSCRIPTION_LOOKBACK);
        let stream = self
            .inner
            .directory
            .transport()
            .subscribe(&self.inner.relays, query)
            .await?;

        let inner = Arc::clone(&self.inner);
        *self.listener.lock() = Some(tokio::spawn(run(inner, stream)));
        info!(share_index = self.share_index(), "guardian listening");
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }

    /// Process one inbound event. Exposed for hosts that run their own
    /// subscription loop.
    pub async fn handle_event(&self, event: &Event) -> Result<()> {
        handle_event(&self.inner, event).await
    }
}

impl Drop for GuardianNode {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(inner: Arc<Inner>, mut stream: EventStream) {
    while let Some(event) = stream.next().await {
        if let Err(e) = handle_event(&inner, &event).await {
            debug!(from = %event.pubkey, error = %e, "guardian message rejected");
        }
    }
    debug!("guardian subscription closed");
}

async fn handle_event(inner: &Inner, event: &Event) -> Result<()> {
    let msg = GuardianEventBuilder::decode(&inner.keys, event)?;
    let reply = match msg {
        GuardianMessage::ApprovalRequest(request) => Some(answer_approval(inner, request)),
        GuardianMessage::CommitmentRequest(request) => {
            commit(inner, event.pubkey, request).map_err(|e| declined(inner, None, e))?
        }
        GuardianMessage::SigningPackage(package) => {
            let session_id = package.session_id;
            Some(sign(inner, event.pubkey, package).map_err(|e| declined(inner, Some(session_id), e))?)
        }
        GuardianMessage::SigningComplete(done) => {
            finish(inner, event.pubkey, &done);
            None
        }
        other => {
            debug!(message_type = other.message_type(), "ignoring message");
            None
        }
    };

    if let Some(reply) = reply {
        send(inner, &event.pubkey, &reply).await?;
    }
    Ok(())
}

fn declined(inner: &Inner, session_id: Option<[u8; 32]>, error: FrostNetError) -> FrostNetError {
    warn!(
        share_index = inner.share.share_index,
        session_id = session_id.map(hex::encode).unwrap_or_default(),
        error = %error,
        "declining request"
    );
    error
}

async fn send(inner: &Inner, to: &PublicKey, msg: &GuardianMessage) -> Result<()> {
    let event = GuardianEventBuilder::build(&inner.keys, to, msg)?;
    inner
        .directory
        .publish(&event, &PublishRoute::to_relays(inner.relays.clone()))
        .await?;
    debug!(to = %to, message_type = msg.message_type(), "guardian reply sent");
    Ok(())
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn answer_approval(inner: &Inner, request: ApprovalRequestPayload) -> GuardianMessage {
    let expired = request.expires_at <= chrono::Utc::now().timestamp();
    let approved = !expired && inner.policy.read().clone().approve(&request);
    info!(
        request_id = %request.request_id,
        group_id = %request.group_id,
        approved,
        "approval request answered"
    );
    GuardianMessage::ApprovalResponse(ApprovalResponsePayload {
        request_id: request.request_id,
        approved,
        reason: expired.then(|| "expired".to_string()),
    })
}

/// Round 1: produce a fresh commitment, or resend the one already made for
/// this session to the same coordinator.
fn commit(
    inner: &Inner,
    coordinator: PublicKey,
    request: CommitmentRequestPayload,
) -> Result<Option<GuardianMessage>> {
    let family = &inner.family;
    if request.family_id != family.family_id || request.group_pubkey != family.group_pubkey {
        return Ok(None);
    }
    let own = inner.share.share_index;
    if !request.participants.contains(&own) {
        return Ok(None);
    }
    if request.threshold != family.threshold {
        return Err(FrostNetError::protocol(format!(
            "threshold {} does not match family threshold {}",
            request.threshold, family.threshold
        )));
    }
    if request.is_expired(now_secs()) {
        return Err(FrostNetError::Session("commitment request expired".into()));
    }

    let mut ledger = inner.ledger.lock();
    if ledger.consumed.contains(&request.session_id) {
        return Err(FrostNetError::NonceConsumed(hex::encode(request.session_id)));
    }

    let commitment = match ledger.pending.get(&request.session_id) {
        Some(existing) if existing.coordinator == coordinator => {
            if existing.message_hash != request.message_hash {
                return Err(FrostNetError::Session("session parameters mismatch".into()));
            }
            debug!(session_id = %hex::encode(request.session_id), "resending commitment");
            existing.commitment
        }
        Some(_) => {
            return Err(FrostNetError::Session("session owned by another coordinator".into()));
        }
        None => {
            if !inner.policy.read().clone().allow_signing(&request) {
                return Err(FrostNetError::Session("signing declined by policy".into()));
            }
            let (nonces, commitment) = frost_secp256k1_tr::round1::commit(
                inner.share.key_package().signing_share(),
                &mut OsRng,
            );
            ledger.pending.insert(
                request.session_id,
                PendingNonce {
                    nonces,
                    commitment,
                    message_hash: request.message_hash,
                    coordinator,
                },
            );
            commitment
        }
    };
    drop(ledger);

    let bytes = commitment
        .serialize()
        .map_err(|e| FrostNetError::Crypto(format!("Serialize commitment: {e}")))?;
    Ok(Some(GuardianMessage::Commitment(CommitmentPayload {
        session_id: request.session_id,
        share_index: own,
        commitment: bytes,
    })))
}

/// Round 2: sign the package with the stored nonces. The nonces are spent
/// whether or not signing succeeds.
fn sign(
    inner: &Inner,
    coordinator: PublicKey,
    package: SigningPackagePayload,
) -> Result<GuardianMessage> {
    let own = inner.share.share_index;
    let pending = {
        let mut ledger = inner.ledger.lock();
        if ledger.consumed.contains(&package.session_id) {
            return Err(FrostNetError::NonceConsumed(hex::encode(package.session_id)));
        }
        match ledger.pending.get(&package.session_id) {
            Some(p) if p.coordinator == coordinator => {}
            Some(_) => {
                return Err(FrostNetError::Session("session owned by another coordinator".into()))
            }
            None => return Err(FrostNetError::SessionNotFound(hex::encode(package.session_id))),
        }
        let pending = ledger.pending.remove(&package.session_id);
        ledger.consume(package.session_id);
        pending.ok_or_else(|| FrostNetError::SessionNotFound(hex::encode(package.session_id)))?
    };

    if pending.message_hash != package.message_hash {
        return Err(FrostNetError::Session("message hash changed between rounds".into()));
    }
    if package.commitments.len() < inner.family.threshold as usize {
        return Err(FrostNetError::ThresholdNotMet {
            round: 2,
            needed: inner.family.threshold as usize,
            got: package.commitments.len(),
        });
    }

    let mut commitments = BTreeMap::new();
    for entry in &package.commitments {
        if inner.family.guardian_by_index(entry.share_index).is_none() {
            return Err(FrostNetError::UnknownGuardian(entry.share_index.to_string()));
        }
        let id = Identifier::try_from(entry.share_index)
            .map_err(|e| FrostNetError::Crypto(format!("Invalid identifier: {e}")))?;
        let commitment = SigningCommitments::deserialize(&entry.commitment)
            .map_err(|e| FrostNetError::Crypto(format!("Invalid commitment: {e}")))?;
        if commitments.insert(id, commitment).is_some() {
            return Err(FrostNetError::protocol("duplicate commitment in package"));
        }
    }

    let own_id = inner.share.identifier()?;
    if commitments.get(&own_id) != Some(&pending.commitment) {
        return Err(FrostNetError::protocol("package does not carry our commitment"));
    }

    let signing_package = SigningPackage::new(commitments, &package.message_hash);
    let share = frost_secp256k1_tr::round2::sign(
        &signing_package,
        &pending.nonces,
        inner.share.key_package(),
    )
    .map_err(|e| FrostNetError::Crypto(format!("Signing failed: {e}")))?;

    info!(session_id = %hex::encode(package.session_id), share_index = own, "partial signature produced");
    Ok(GuardianMessage::SignatureShare(SignatureSharePayload {
        session_id: package.session_id,
        share_index: own,
        signature_share: share.serialize(),
    }))
}

fn finish(inner: &Inner, coordinator: PublicKey, done: &SigningCompletePayload) {
    let mut ledger = inner.ledger.lock();
    let owned = ledger
        .pending
        .get(&done.session_id)
        .is_none_or(|p| p.coordinator == coordinator);
    if owned {
        ledger.consume(done.session_id);
    }
    debug!(session_id = %hex::encode(done.session_id), "signing complete");
}
