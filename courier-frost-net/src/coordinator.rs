// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Coordinator side of guardian signing and approvals.
//!
//! Every control message is signed and NIP-44 encrypted by the registry's
//! event signer through [`EnvelopeEngine::control_message`], so the
//! coordinator never holds a raw key. Round messages from guardians are
//! routed to the signing call that owns the session.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use frost_secp256k1_tr::round1::SigningCommitments;
use frost_secp256k1_tr::round2::SignatureShare;
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use courier_core::{CourierError, KeyValueStore, Timeouts};
use courier_messaging::{
    EnvelopeEngine, EventQuery, EventStream, PublishReport, PublishRoute, RelayDirectory,
};

use crate::approval::{ApprovalBook, ApprovalOutcome, NewApproval, APPROVAL_TTL_HOURS};
use crate::dealer::GuardianFamily;
use crate::error::{FrostNetError, Result};
use crate::event::{parse_payload, check_envelope, routing_tags};
use crate::protocol::*;
use crate::session::{new_session_id, SessionManager};

const SUBSCRIPTION_LOOKBACK: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// How long each signing round waits for guardians.
    pub round_timeout: Duration,
    /// Delay between consecutive sends to different guardians.
    pub pacing: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            round_timeout: Duration::from_secs(30),
            pacing: Duration::from_millis(100),
        }
    }
}

impl From<&Timeouts> for CoordinatorConfig {
    fn from(timeouts: &Timeouts) -> Self {
        Self {
            round_timeout: timeouts.threshold_round(),
            pacing: timeouts.guardian_pacing(),
        }
    }
}

type RoundSender = mpsc::UnboundedSender<(PublicKey, GuardianMessage)>;

struct Shared {
    engine: EnvelopeEngine,
    directory: Arc<RelayDirectory>,
    family: GuardianFamily,
    relays: Vec<String>,
    approvals: ApprovalBook,
    approval_updates: Notify,
    sessions: Mutex<SessionManager>,
    rounds: Mutex<HashMap<[u8; 32], RoundSender>>,
}

pub struct ThresholdCoordinator {
    shared: Arc<Shared>,
    config: CoordinatorConfig,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Retires the session and drops its route however `sign` exits.
struct RoundGuard<'a> {
    shared: &'a Shared,
    session_id: [u8; 32],
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        self.shared.rounds.lock().remove(&self.session_id);
        self.shared.sessions.lock().finish(&self.session_id);
    }
}

impl ThresholdCoordinator {
    pub fn new(
        engine: EnvelopeEngine,
        directory: Arc<RelayDirectory>,
        family: GuardianFamily,
        store: Arc<dyn KeyValueStore>,
        relays: Vec<String>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        let pubkey_pkg = family.public_key_package()?;
        if crate::dealer::extract_group_pubkey(&pubkey_pkg)? != family.group_pubkey {
            return Err(FrostNetError::crypto(
                "Group key does not match public key package",
            ));
        }
        if family.guardians.len() < family.threshold as usize {
            return Err(FrostNetError::ThresholdNotMet {
                round: 0,
                needed: family.threshold as usize,
                got: family.guardians.len(),
            });
        }

        Ok(Self {
            shared: Arc::new(Shared {
                engine,
                directory,
                family,
                relays,
                approvals: ApprovalBook::new(store),
                approval_updates: Notify::new(),
                sessions: Mutex::new(SessionManager::new()),
                rounds: Mutex::new(HashMap::new()),
            }),
            config,
            listener: Mutex::new(None),
        })
    }

    pub fn family(&self) -> &GuardianFamily {
        &self.shared.family
    }

    pub fn engine(&self) -> &EnvelopeEngine {
        &self.shared.engine
    }

    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Subscribe to guardian replies addressed to the current author.
    pub async fn start(&self) -> Result<()> {
        if self.is_listening() {
            return Ok(());
        }
        let author = self.shared.engine.author().await?;
        let query = EventQuery::new()
            .kind(Kind::Custom(THRESHOLD_EVENT_KIND))
            .kind(Kind::Custom(APPROVAL_EVENT_KIND))
            .recipient(author)
            .since(Timestamp::now() - SUBSCRIPTION_LOOKBACK);
        let stream = self
            .shared
            .directory
            .transport()
            .subscribe(&self.shared.relays, query)
            .await?;

        let shared = Arc::clone(&self.shared);
        *self.listener.lock() = Some(tokio::spawn(listen(shared, stream)));
        info!(family = %self.shared.family.family_id, author = %author, "coordinator listening");
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }

    /// Ask every guardian to approve `content`. Returns the request id.
    #[instrument(skip(self, content), fields(family = %self.shared.family.family_id))]
    pub async fn request_approval(
        &self,
        group_id: &str,
        content: &str,
        message_type: &str,
    ) -> Result<String> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let requester = self.shared.engine.author().await?;
        let guardians: Vec<PublicKey> =
            self.shared.family.guardians.iter().map(|g| g.pubkey).collect();

        let now = Utc::now();
        let records = self.shared.approvals.create(
            &request_id,
            &NewApproval {
                group_id,
                requester,
                content,
                message_type,
            },
            &guardians,
            now,
        )?;
        let expires_at = records
            .first()
            .map(|r| r.expires_at)
            .unwrap_or_else(|| now + chrono::Duration::hours(APPROVAL_TTL_HOURS));

        let msg = GuardianMessage::ApprovalRequest(ApprovalRequestPayload {
            version: PROTOCOL_VERSION,
            request_id: request_id.clone(),
            group_id: group_id.to_string(),
            content: content.to_string(),
            message_type: message_type.to_string(),
            created_at: now.timestamp(),
            expires_at: expires_at.timestamp(),
        });

        let mut reached = 0;
        for (i, guardian) in guardians.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.pacing).await;
            }
            match send(&self.shared, guardian, &msg).await {
                Ok(()) => reached += 1,
                Err(e) => warn!(guardian = %guardian, error = %e, "approval request not delivered"),
            }
        }
        if reached == 0 {
            return Err(FrostNetError::Core(CourierError::RelayPublishFailed {
                attempted: guardians.len(),
            }));
        }

        info!(request_id = %request_id, reached, "approval requested");
        Ok(request_id)
    }

    pub fn approval_outcome(&self, request_id: &str) -> Result<ApprovalOutcome> {
        self.shared.approvals.outcome(
            request_id,
            self.shared.family.threshold as usize,
            Utc::now(),
        )
    }

    pub fn approvals(&self) -> &ApprovalBook {
        &self.shared.approvals
    }

    /// Wait until the request settles or `timeout` passes. A request still
    /// pending at the deadline is returned as pending.
    pub async fn wait_for_approval(
        &self,
        request_id: &str,
        timeout: Duration,
    ) -> Result<ApprovalOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.approval_updates.notified();
            let outcome = self.approval_outcome(request_id)?;
            if outcome.is_terminal() {
                return Ok(outcome);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(outcome);
            }
        }
    }

    /// Run both signing rounds over `message_hash` and return the aggregate
    /// BIP-340 signature under the group key.
    #[instrument(skip(self, message_hash), fields(family = %self.shared.family.family_id))]
    pub async fn sign(&self, message_hash: [u8; 32]) -> Result<[u8; 64]> {
        let shared = self.shared.as_ref();
        let family = &shared.family;
        let threshold = family.threshold;
        let participants = family.share_indices();
        let session_id = new_session_id();

        let (tx, mut rx) = mpsc::unbounded_channel();
        shared
            .sessions
            .lock()
            .create_session(session_id, &family.family_id, message_hash, threshold, participants.clone())?;
        shared.rounds.lock().insert(session_id, tx);
        let _guard = RoundGuard { shared, session_id };

        info!(session_id = %hex::encode(session_id), threshold, "starting signing session");

        // Round 1
        let request = GuardianMessage::CommitmentRequest(CommitmentRequestPayload {
            version: PROTOCOL_VERSION,
            session_id,
            family_id: family.family_id.clone(),
            group_pubkey: family.group_pubkey,
            message_hash,
            threshold,
            participants,
            expires_at: (Utc::now().timestamp().max(0) as u64)
                + self.config.round_timeout.as_secs() * 2,
        });
        for (i, guardian) in family.guardians.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.pacing).await;
            }
            if let Err(e) = send(shared, &guardian.pubkey, &request).await {
                warn!(share_index = guardian.share_index, error = %e, "commitment request not delivered");
            }
        }

        let deadline = Instant::now() + self.config.round_timeout;
        loop {
            if self.session_state(&session_id, |s| s.has_commitment_quorum())? {
                break;
            }
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some((sender, GuardianMessage::Commitment(c)))) => {
                    if let Err(e) = self.accept_commitment(&session_id, &sender, &c) {
                        debug!(share_index = c.share_index, error = %e, "commitment dropped");
                    }
                }
                Ok(Some((_, other))) => log_unexpected(&other),
                Ok(None) | Err(_) => break,
            }
        }

        let (signers, entries) = {
            let mut sessions = shared.sessions.lock();
            let session = sessions
                .get_mut(&session_id)
                .ok_or_else(|| FrostNetError::SessionNotFound(hex::encode(session_id)))?;
            let signers = session.begin_round_two().inspect_err(|e| {
                warn!(session_id = %hex::encode(session_id), error = %e, "round 1 failed");
            })?;
            let signers = signers.to_vec();
            let mut entries = Vec::with_capacity(signers.len());
            for share_index in &signers {
                let id = frost_secp256k1_tr::Identifier::try_from(*share_index)
                    .map_err(|e| FrostNetError::Crypto(format!("Invalid identifier: {e}")))?;
                let commitment = session
                    .commitments()
                    .get(&id)
                    .ok_or_else(|| FrostNetError::protocol("missing commitment"))?
                    .serialize()
                    .map_err(|e| FrostNetError::Crypto(format!("Serialize commitment: {e}")))?;
                entries.push(CommitmentEntry {
                    share_index: *share_index,
                    commitment,
                });
            }
            (signers, entries)
        };

        // Round 2
        let package = GuardianMessage::SigningPackage(SigningPackagePayload {
            session_id,
            message_hash,
            commitments: entries,
        });
        for (i, share_index) in signers.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.pacing).await;
            }
            let Some(guardian) = family.guardian_by_index(*share_index) else {
                continue;
            };
            if let Err(e) = send(shared, &guardian.pubkey, &package).await {
                warn!(share_index, error = %e, "signing package not delivered");
            }
        }

        let pubkey_pkg = family.public_key_package()?;
        let deadline = Instant::now() + self.config.round_timeout;
        let signature = loop {
            let aggregated = {
                let mut sessions = shared.sessions.lock();
                let session = sessions
                    .get_mut(&session_id)
                    .ok_or_else(|| FrostNetError::SessionNotFound(hex::encode(session_id)))?;
                session.try_aggregate(&pubkey_pkg)?
            };
            if let Some(signature) = aggregated {
                break signature;
            }
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some((sender, GuardianMessage::SignatureShare(p)))) => {
                    if let Err(e) = self.accept_partial(&session_id, &sender, &p) {
                        debug!(share_index = p.share_index, error = %e, "partial signature dropped");
                    }
                }
                Ok(Some((_, other))) => log_unexpected(&other),
                Ok(None) | Err(_) => {
                    let got = self.session_state(&session_id, |s| s.partial_count())?;
                    warn!(session_id = %hex::encode(session_id), got, "round 2 timed out");
                    return Err(FrostNetError::ThresholdNotMet {
                        round: 2,
                        needed: threshold as usize,
                        got,
                    });
                }
            }
        };

        let complete = GuardianMessage::SigningComplete(SigningCompletePayload {
            session_id,
            signature,
            message_hash,
        });
        for share_index in &signers {
            if let Some(guardian) = family.guardian_by_index(*share_index) {
                if let Err(e) = send(shared, &guardian.pubkey, &complete).await {
                    debug!(share_index, error = %e, "completion notice not delivered");
                }
            }
        }

        info!(session_id = %hex::encode(session_id), "threshold signature aggregated");
        Ok(signature)
    }

    /// Sign an event template as the group key.
    pub async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event> {
        let group = self.shared.family.group_public_key()?;
        let mut template = UnsignedEvent::new(
            group,
            unsigned.created_at,
            unsigned.kind,
            unsigned.tags,
            unsigned.content,
        );
        template.ensure_id();
        let id = template
            .id
            .ok_or_else(|| FrostNetError::crypto("failed to compute event ID"))?;

        let sig_bytes = self.sign(id.to_bytes()).await?;
        let sig = nostr_sdk::secp256k1::schnorr::Signature::from_slice(&sig_bytes)
            .map_err(|e| FrostNetError::Crypto(format!("Invalid signature: {e}")))?;
        let event = Event::new(
            id,
            group,
            template.created_at,
            template.kind,
            template.tags,
            template.content,
            sig,
        );
        event
            .verify()
            .map_err(|e| CourierError::SignatureVerificationFailed(e.to_string()))?;
        Ok(event)
    }

    /// Sign as the group key and publish to the coordinator's relays.
    pub async fn sign_and_publish(&self, builder: EventBuilder) -> Result<(Event, PublishReport)> {
        let group = self.shared.family.group_public_key()?;
        let event = self.sign_event(builder.build(group)).await?;
        let report = self
            .shared
            .directory
            .publish(&event, &PublishRoute::to_relays(self.shared.relays.clone()))
            .await?;
        Ok((event, report))
    }

    fn session_state<T>(
        &self,
        session_id: &[u8; 32],
        f: impl FnOnce(&crate::session::FrostSigningSession) -> T,
    ) -> Result<T> {
        self.shared
            .sessions
            .lock()
            .get(session_id)
            .map(f)
            .ok_or_else(|| FrostNetError::SessionNotFound(hex::encode(session_id)))
    }

    fn accept_commitment(
        &self,
        session_id: &[u8; 32],
        sender: &PublicKey,
        payload: &CommitmentPayload,
    ) -> Result<()> {
        check_sender(&self.shared.family, sender, payload.share_index)?;
        let commitment = SigningCommitments::deserialize(&payload.commitment)
            .map_err(|e| FrostNetError::Crypto(format!("Invalid commitment: {e}")))?;
        let mut sessions = self.shared.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| FrostNetError::SessionNotFound(hex::encode(session_id)))?;
        session.add_commitment(payload.share_index, commitment)?;
        debug!(share_index = payload.share_index, count = session.commitment_count(), "commitment accepted");
        Ok(())
    }

    fn accept_partial(
        &self,
        session_id: &[u8; 32],
        sender: &PublicKey,
        payload: &SignatureSharePayload,
    ) -> Result<()> {
        check_sender(&self.shared.family, sender, payload.share_index)?;
        let share = SignatureShare::deserialize(&payload.signature_share)
            .map_err(|e| FrostNetError::Crypto(format!("Invalid signature share: {e}")))?;
        let mut sessions = self.shared.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| FrostNetError::SessionNotFound(hex::encode(session_id)))?;
        session.add_partial(payload.share_index, share)?;
        debug!(share_index = payload.share_index, count = session.partial_count(), "partial accepted");
        Ok(())
    }
}

impl Drop for ThresholdCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn check_sender(family: &GuardianFamily, sender: &PublicKey, share_index: u16) -> Result<()> {
    match family.guardian_by_index(share_index) {
        Some(g) if g.pubkey == *sender => Ok(()),
        _ => Err(FrostNetError::UnknownGuardian(sender.to_hex())),
    }
}

fn log_unexpected(msg: &GuardianMessage) {
    match msg {
        GuardianMessage::Error(e) => warn!(code = %e.code, message = %e.message, "guardian reported error"),
        other => debug!(message_type = other.message_type(), "unexpected message for round"),
    }
}

async fn send(shared: &Shared, to: &PublicKey, msg: &GuardianMessage) -> Result<()> {
    let envelope = shared
        .engine
        .control_message(to, Kind::Custom(msg.kind()), &msg.to_json()?, routing_tags(msg))
        .await?;
    shared
        .directory
        .publish(envelope.event(), &PublishRoute::to_relays(shared.relays.clone()))
        .await?;
    debug!(to = %to, message_type = msg.message_type(), "guardian message sent");
    Ok(())
}

async fn listen(shared: Arc<Shared>, mut stream: EventStream) {
    while let Some(event) = stream.next().await {
        if let Err(e) = route(&shared, &event).await {
            debug!(from = %event.pubkey, error = %e, "guardian reply rejected");
        }
    }
    debug!("coordinator subscription closed");
}

async fn route(shared: &Shared, event: &Event) -> Result<()> {
    if shared.family.guardian_by_pubkey(&event.pubkey).is_none() {
        return Err(FrostNetError::UnknownGuardian(event.pubkey.to_hex()));
    }
    check_envelope(event)?;
    let plaintext = shared.engine.open_control(event).await?;
    let msg = parse_payload(event, &plaintext)?;

    match msg {
        GuardianMessage::ApprovalResponse(response) => {
            let result = shared.approvals.record_response(
                &response.request_id,
                &event.pubkey,
                response.approved,
                Utc::now(),
            );
            shared.approval_updates.notify_waiters();
            let record = result?;
            info!(
                request_id = %record.id,
                guardian = %event.pubkey,
                status = ?record.status,
                "approval response recorded"
            );
            Ok(())
        }
        msg => {
            let Some(session_id) = msg.session_id().copied() else {
                return Err(FrostNetError::protocol(format!(
                    "{} not expected by coordinator",
                    msg.message_type()
                )));
            };
            let sender = shared.rounds.lock().get(&session_id).cloned();
            match sender {
                Some(tx) => tx
                    .send((event.pubkey, msg))
                    .map_err(|_| FrostNetError::SessionNotFound(hex::encode(session_id))),
                None => Err(FrostNetError::SessionNotFound(hex::encode(session_id))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dealer::{ThresholdConfig, TrustedDealer};

    #[test]
    fn test_config_from_timeouts() {
        let timeouts = Timeouts::default();
        let config = CoordinatorConfig::from(&timeouts);
        assert_eq!(config.round_timeout, timeouts.threshold_round());
        assert_eq!(config.pacing, timeouts.guardian_pacing());
    }

    #[test]
    fn test_check_sender() {
        let keys: Vec<PublicKey> = (0..3).map(|_| Keys::generate().public_key()).collect();
        let (family, _) = TrustedDealer::new(ThresholdConfig::two_of_three())
            .generate("fam", &keys)
            .unwrap();
        assert!(check_sender(&family, &keys[0], 1).is_ok());
        assert!(check_sender(&family, &keys[0], 2).is_err());
        assert!(check_sender(&family, &Keys::generate().public_key(), 1).is_err());
    }
}
