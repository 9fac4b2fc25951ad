// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::prelude::*;

use courier_core::{CourierError, Custodian, FeatureFlags, MemoryStore, SessionOptions};
use courier_frost_net::protocol::{ApprovalRequestPayload, CommitmentRequestPayload};
use courier_frost_net::{
    ApprovalOutcome, CoordinatorConfig, FrostNetError, GuardianFamily, GuardianNode,
    GuardianPolicy, GuardianShare, ThresholdConfig, ThresholdCoordinator, ThresholdSigner,
    TrustedDealer, THRESHOLD_EVENT_KIND,
};
use courier_messaging::{
    Action, EnvelopeEngine, MemoryRelayNetwork, Platform, RelayDirectory, SessionSigner,
    SignerBackend, SignerKind, SignerRegistry,
};

const RELAY: &str = "wss://guardians.example.com/";

struct Deny;

impl GuardianPolicy for Deny {
    fn approve(&self, _request: &ApprovalRequestPayload) -> bool {
        false
    }

    fn allow_signing(&self, _request: &CommitmentRequestPayload) -> bool {
        false
    }
}

struct Setup {
    net: MemoryRelayNetwork,
    directory: Arc<RelayDirectory>,
    family: GuardianFamily,
    guardian_keys: Vec<Keys>,
    shares: Vec<GuardianShare>,
    registry: Arc<SignerRegistry>,
    coordinator: Arc<ThresholdCoordinator>,
}

fn setup(features: FeatureFlags) -> Setup {
    let net = MemoryRelayNetwork::with_relays(&[RELAY.into()]);
    let directory = Arc::new(RelayDirectory::new(Arc::new(net.clone()), vec![RELAY.into()]));

    let guardian_keys: Vec<Keys> = (0..3).map(|_| Keys::generate()).collect();
    let pubkeys: Vec<PublicKey> = guardian_keys.iter().map(|k| k.public_key()).collect();
    let (family, shares) = TrustedDealer::new(ThresholdConfig::two_of_three())
        .generate("family-1", &pubkeys)
        .unwrap();

    let custodian = Arc::new(Custodian::new());
    let mut secret = Keys::generate().secret_key().to_secret_bytes();
    let session = custodian
        .create_session(&mut secret, SessionOptions::default())
        .unwrap();
    let registry = Arc::new(SignerRegistry::new(Platform::Web, features));
    registry.register(Arc::new(SessionSigner::new(custodian, session).unwrap()));

    let config = CoordinatorConfig {
        round_timeout: Duration::from_secs(30),
        pacing: Duration::from_millis(10),
    };
    let coordinator = ThresholdCoordinator::new(
        EnvelopeEngine::new(registry.clone()),
        directory.clone(),
        family.clone(),
        Arc::new(MemoryStore::new()),
        vec![RELAY.into()],
        config,
    )
    .unwrap();

    Setup {
        net,
        directory,
        family,
        guardian_keys,
        shares,
        registry,
        coordinator: Arc::new(coordinator),
    }
}

impl Setup {
    async fn guardian(&self, index: usize) -> GuardianNode {
        let node = GuardianNode::new(
            self.guardian_keys[index].clone(),
            self.shares[index].clone(),
            self.family.clone(),
            self.directory.clone(),
            vec![RELAY.into()],
        )
        .unwrap();
        node.start().await.unwrap();
        node
    }

    fn events_with_type(&self, message_type: &str) -> Vec<Event> {
        self.net
            .events_on(RELAY)
            .into_iter()
            .filter(|e| e.kind == Kind::Custom(THRESHOLD_EVENT_KIND))
            .filter(|e| {
                e.tags
                    .iter()
                    .any(|t| t.as_slice() == ["t".to_string(), message_type.to_string()])
            })
            .collect()
    }
}

fn verify_group_signature(family: &GuardianFamily, hash: &[u8; 32], sig: &[u8; 64]) {
    let signature = frost_secp256k1_tr::Signature::deserialize(sig).unwrap();
    family
        .public_key_package()
        .unwrap()
        .verifying_key()
        .verify(hash, &signature)
        .unwrap();
}

#[tokio::test]
async fn test_two_of_three_signature_verifies() {
    let s = setup(FeatureFlags::all());
    let _g1 = s.guardian(0).await;
    let _g2 = s.guardian(1).await;
    let _g3 = s.guardian(2).await;
    s.coordinator.start().await.unwrap();

    let hash = [42u8; 32];
    let signature = s.coordinator.sign(hash).await.unwrap();
    verify_group_signature(&s.family, &hash, &signature);

    // Round 2 went to exactly threshold guardians.
    assert_eq!(s.events_with_type("signing_package").len(), 2);
    assert_eq!(s.events_with_type("signature_share").len(), 2);
}

#[tokio::test]
async fn test_signed_event_published_under_group_key() {
    let s = setup(FeatureFlags::all());
    let _g1 = s.guardian(0).await;
    let _g2 = s.guardian(1).await;
    s.coordinator.start().await.unwrap();

    let (event, report) = s
        .coordinator
        .sign_and_publish(EventBuilder::text_note("signed by the family"))
        .await
        .unwrap();

    assert_eq!(event.pubkey, s.family.group_public_key().unwrap());
    assert!(event.verify().is_ok());
    assert_eq!(report.delivered(), 1);
    assert!(s.net.events_on(RELAY).iter().any(|e| e.id == event.id));
}

#[tokio::test(start_paused = true)]
async fn test_below_threshold_fails_without_round_two() {
    let s = setup(FeatureFlags::all());
    let _g1 = s.guardian(0).await;
    s.coordinator.start().await.unwrap();

    let err = s.coordinator.sign([7u8; 32]).await.unwrap_err();
    assert!(matches!(
        err,
        FrostNetError::ThresholdNotMet {
            round: 1,
            needed: 2,
            got: 1
        }
    ));
    assert!(err.is_quorum_failure());
    assert_eq!(s.events_with_type("commitment").len(), 1);
    assert!(s.events_with_type("signing_package").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_policy_can_refuse_signing() {
    let s = setup(FeatureFlags::all());
    let g1 = s.guardian(0).await;
    let g2 = s.guardian(1).await;
    let _g3 = s.guardian(2).await;
    g1.set_policy(Arc::new(Deny));
    g2.set_policy(Arc::new(Deny));
    s.coordinator.start().await.unwrap();

    let err = s.coordinator.sign([8u8; 32]).await.unwrap_err();
    assert!(matches!(err, FrostNetError::ThresholdNotMet { round: 1, .. }));
    assert_eq!(g1.pending_sessions(), 0);
    assert_eq!(g2.pending_sessions(), 0);
}

#[tokio::test]
async fn test_replayed_signing_package_refused() {
    let s = setup(FeatureFlags::all());
    let nodes = vec![s.guardian(0).await, s.guardian(1).await];
    s.coordinator.start().await.unwrap();

    s.coordinator.sign([9u8; 32]).await.unwrap();

    let packages = s.events_with_type("signing_package");
    assert_eq!(packages.len(), 2);
    for package in &packages {
        let node = nodes
            .iter()
            .find(|n| {
                package
                    .tags
                    .iter()
                    .any(|t| t.as_slice() == ["p".to_string(), n.public_key().to_hex()])
            })
            .unwrap();
        let err = node.handle_event(package).await.unwrap_err();
        assert!(matches!(err, FrostNetError::NonceConsumed(_)));
    }
}

#[tokio::test]
async fn test_approval_reaches_threshold() {
    let s = setup(FeatureFlags::all());
    let _g1 = s.guardian(0).await;
    let _g2 = s.guardian(1).await;
    let g3 = s.guardian(2).await;
    g3.set_policy(Arc::new(Deny));
    s.coordinator.start().await.unwrap();

    let id = s
        .coordinator
        .request_approval("group-1", "add dave", "membership")
        .await
        .unwrap();
    let outcome = s
        .coordinator
        .wait_for_approval(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(outcome, ApprovalOutcome::Approved);
    assert_eq!(s.coordinator.approvals().records(&id).unwrap().len(), 3);
}

#[tokio::test]
async fn test_approval_rejected_when_quorum_impossible() {
    let s = setup(FeatureFlags::all());
    let g1 = s.guardian(0).await;
    let g2 = s.guardian(1).await;
    let _g3 = s.guardian(2).await;
    g1.set_policy(Arc::new(Deny));
    g2.set_policy(Arc::new(Deny));
    s.coordinator.start().await.unwrap();

    let id = s
        .coordinator
        .request_approval("group-1", "remove carol", "membership")
        .await
        .unwrap();
    let outcome = s
        .coordinator
        .wait_for_approval(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(outcome, ApprovalOutcome::Rejected);
}

#[tokio::test(start_paused = true)]
async fn test_approval_wait_returns_pending_at_deadline() {
    let s = setup(FeatureFlags::all());
    s.coordinator.start().await.unwrap();

    let id = s
        .coordinator
        .request_approval("group-1", "rename", "settings")
        .await
        .unwrap();
    let outcome = s
        .coordinator
        .wait_for_approval(&id, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ApprovalOutcome::Pending {
            approved: 0,
            needed: 2
        }
    );
}

#[tokio::test]
async fn test_threshold_signer_selected_for_threshold_action() {
    let s = setup(FeatureFlags::all());
    let _g1 = s.guardian(0).await;
    let _g2 = s.guardian(1).await;
    s.registry
        .register(Arc::new(ThresholdSigner::new(s.coordinator.clone())));

    let selected = s.registry.select(Action::ThresholdSign).await.unwrap();
    assert_eq!(selected.descriptor().kind, SignerKind::Threshold);
    assert_eq!(selected.descriptor().id, "threshold:family-1");

    // Plain event signing still goes to the custodian session.
    let event_signer = s.registry.select(Action::SignEvent).await.unwrap();
    assert_eq!(event_signer.descriptor().kind, SignerKind::Custodian);

    s.coordinator.start().await.unwrap();
    let group = selected.public_key().await.unwrap();
    let unsigned = EventBuilder::text_note("via registry").build(group);
    let event = selected.sign_event(unsigned).await.unwrap();
    assert_eq!(event.pubkey, group);
    assert!(event.verify().is_ok());

    assert!(matches!(
        selected.nip44_encrypt(&Keys::generate().public_key(), "hi").await,
        Err(CourierError::Unsupported(_))
    ));
}

#[tokio::test]
async fn test_threshold_signer_needs_feature_flag() {
    let s = setup(FeatureFlags::default());
    s.registry
        .register(Arc::new(ThresholdSigner::new(s.coordinator.clone())));
    assert!(matches!(
        s.registry.select(Action::ThresholdSign).await,
        Err(CourierError::NoEligibleSigner(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_threshold_signer_surfaces_quorum_failure() {
    let s = setup(FeatureFlags::all());
    let _g1 = s.guardian(0).await;
    s.coordinator.start().await.unwrap();
    let signer = ThresholdSigner::new(s.coordinator.clone());

    let group = signer.public_key().await.unwrap();
    let err = signer
        .sign_event(EventBuilder::text_note("x").build(group))
        .await
        .unwrap_err();
    assert!(matches!(err, CourierError::ThresholdNotMet { needed: 2, got: 1 }));
}
