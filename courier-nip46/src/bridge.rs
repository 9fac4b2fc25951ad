// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client side of the NIP-46 control channel.
//!
//! The bridge owns an ephemeral client keypair, pairs with one remote signer
//! over kind 24133 events, and correlates requests with responses by id.
//! Pairing and teardown are serialized by `lifecycle`; every pending request
//! resolves, is rejected by [`RemoteSignerBridge::clear`], or times out and
//! is removed.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use subtle::ConstantTimeEq;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use courier_core::{CourierError, Result, Timeouts};
use courier_messaging::{
    EncryptionScheme, EventQuery, EventStream, PublishRoute, RelayDirectory,
};

use crate::types::{
    is_valid_request_id, new_request_id, Nip46Message, Nip46Request, Nip46Response,
    MAX_CONTENT_LENGTH, METHOD_CONNECT,
};
use crate::uri::{BunkerUri, NostrConnectUri};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(45);
pub const MAX_PENDING_REQUESTS: usize = 128;

/// Inbound messages older than this at subscription time are ignored.
const SUBSCRIPTION_LOOKBACK: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Unpaired,
    AwaitingConnect,
    Paired,
    Cleared,
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    pub request_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl From<&Timeouts> for BridgeConfig {
    fn from(timeouts: &Timeouts) -> Self {
        Self {
            request_timeout: timeouts.bridge_request(),
        }
    }
}

struct PendingRequest {
    method: String,
    deadline: Instant,
    tx: oneshot::Sender<Result<String>>,
}

struct Pairing {
    state: PairingState,
    signer: Option<PublicKey>,
    secret: Option<Zeroizing<String>>,
    relays: Vec<String>,
    mode: EncryptionScheme,
    rejected_secrets: u32,
    connect_tx: Option<oneshot::Sender<PublicKey>>,
}

impl Pairing {
    fn new() -> Self {
        Self {
            state: PairingState::Unpaired,
            signer: None,
            secret: None,
            relays: Vec::new(),
            mode: EncryptionScheme::Nip44,
            rejected_secrets: 0,
            connect_tx: None,
        }
    }

    fn secret_matches(&self, candidate: &str) -> bool {
        self.secret
            .as_ref()
            .is_some_and(|s| bool::from(s.as_bytes().ct_eq(candidate.as_bytes())))
    }
}

/// Subscription task and the relays it listens on.
struct Listener {
    relays: Vec<String>,
    handle: JoinHandle<()>,
}

impl Listener {
    fn stop(self) {
        self.handle.abort();
    }
}

/// State shared with the listener task.
struct Shared {
    client_keys: Keys,
    directory: Arc<RelayDirectory>,
    pairing: Mutex<Pairing>,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

pub struct RemoteSignerBridge {
    shared: Arc<Shared>,
    config: BridgeConfig,
    lifecycle: AsyncMutex<()>,
    listener: Mutex<Option<Listener>>,
}

impl RemoteSignerBridge {
    /// New bridge with a fresh ephemeral client keypair.
    pub fn new(directory: Arc<RelayDirectory>) -> Self {
        Self::with_keys(Keys::generate(), directory, BridgeConfig::default())
    }

    pub fn with_keys(client_keys: Keys, directory: Arc<RelayDirectory>, config: BridgeConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                client_keys,
                directory,
                pairing: Mutex::new(Pairing::new()),
                pending: Mutex::new(HashMap::new()),
            }),
            config,
            lifecycle: AsyncMutex::new(()),
            listener: Mutex::new(None),
        }
    }

    pub fn client_pubkey(&self) -> PublicKey {
        self.shared.client_keys.public_key()
    }

    pub fn state(&self) -> PairingState {
        self.shared.pairing.lock().state
    }

    pub fn signer_pubkey(&self) -> Option<PublicKey> {
        self.shared.pairing.lock().signer
    }

    pub fn encryption_mode(&self) -> EncryptionScheme {
        self.shared.pairing.lock().mode
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    /// URI the companion app scans to pair with this bridge.
    pub fn nostrconnect_uri(&self, relays: Vec<String>, secret: &str) -> NostrConnectUri {
        NostrConnectUri::new(self.client_pubkey(), relays, secret)
    }

    /// Wait for the remote signer to answer a `nostrconnect://` invitation.
    ///
    /// A `connect` message (request or response form) carrying `secret`
    /// pairs the bridge. Messages with a different secret are ignored; if
    /// any arrived and nothing matched before `timeout`, the result is
    /// [`CourierError::PairingSecretMismatch`].
    #[instrument(skip(self, secret), fields(client = %self.client_pubkey()))]
    pub async fn establish(
        &self,
        secret: &str,
        relays: Vec<String>,
        timeout: Duration,
    ) -> Result<PublicKey> {
        let _guard = self.lifecycle.lock().await;

        let connected = {
            let mut pairing = self.shared.pairing.lock();
            match pairing.state {
                PairingState::Paired => {
                    return pairing
                        .signer
                        .ok_or_else(|| CourierError::Remote("paired without signer".into()));
                }
                PairingState::Cleared => {
                    return Err(CourierError::invalid_input("bridge has been cleared"));
                }
                PairingState::Unpaired | PairingState::AwaitingConnect => {}
            }
            let (tx, rx) = oneshot::channel();
            pairing.state = PairingState::AwaitingConnect;
            pairing.signer = None;
            pairing.secret = Some(Zeroizing::new(secret.to_string()));
            pairing.relays = relays.clone();
            pairing.rejected_secrets = 0;
            pairing.connect_tx = Some(tx);
            rx
        };

        if let Err(e) = self.ensure_listener(&relays).await {
            self.reset_pairing();
            return Err(e);
        }

        match tokio::time::timeout(timeout, connected).await {
            Ok(Ok(signer)) => {
                info!(signer = %signer, "remote signer paired");
                Ok(signer)
            }
            _ => {
                let rejected = self.shared.pairing.lock().rejected_secrets;
                self.reset_pairing();
                if rejected > 0 {
                    warn!(rejected, "pairing attempts carried the wrong secret");
                    Err(CourierError::PairingSecretMismatch)
                } else {
                    Err(CourierError::RequestTimeout("pairing".into()))
                }
            }
        }
    }

    /// Connect to a signer advertised with a `bunker://` URI.
    #[instrument(skip(self, bunker), fields(signer = %bunker.signer))]
    pub async fn connect_bunker(&self, bunker: &BunkerUri, timeout: Duration) -> Result<PublicKey> {
        let _guard = self.lifecycle.lock().await;

        {
            let mut pairing = self.shared.pairing.lock();
            if pairing.state == PairingState::Cleared {
                return Err(CourierError::invalid_input("bridge has been cleared"));
            }
            pairing.state = PairingState::AwaitingConnect;
            pairing.signer = Some(bunker.signer);
            pairing.secret = bunker.secret.clone().map(Zeroizing::new);
            pairing.relays = bunker.relays.clone();
            pairing.mode = EncryptionScheme::Nip44;
            pairing.rejected_secrets = 0;
            pairing.connect_tx = None;
        }

        if let Err(e) = self.ensure_listener(&bunker.relays).await {
            self.reset_pairing();
            return Err(e);
        }

        let mut params = vec![bunker.signer.to_hex()];
        if let Some(secret) = &bunker.secret {
            params.push(secret.clone());
        }

        let outcome = self
            .send_request(METHOD_CONNECT, params, timeout.min(self.config.request_timeout))
            .await;
        match outcome {
            Ok(result) => {
                let accepted = result == "ack"
                    || bunker
                        .secret
                        .as_deref()
                        .is_some_and(|s| bool::from(s.as_bytes().ct_eq(result.as_bytes())));
                if !accepted {
                    self.reset_pairing();
                    return Err(CourierError::PairingSecretMismatch);
                }
                self.shared.pairing.lock().state = PairingState::Paired;
                info!("bunker paired");
                Ok(bunker.signer)
            }
            Err(e) => {
                self.reset_pairing();
                Err(e)
            }
        }
    }

    /// Send `method` to the paired signer and wait for its answer.
    pub async fn request(&self, method: &str, params: Vec<String>) -> Result<String> {
        if self.state() != PairingState::Paired {
            return Err(CourierError::Remote("remote signer not paired".into()));
        }
        self.send_request(method, params, self.config.request_timeout)
            .await
    }

    /// Tear down: reject all pending requests, stop listening and forget the
    /// pairing. The bridge cannot be paired again afterwards.
    pub async fn clear(&self) {
        let _guard = self.lifecycle.lock().await;

        if let Some(listener) = self.listener.lock().take() {
            listener.stop();
        }

        let drained: Vec<PendingRequest> = self
            .shared
            .pending
            .lock()
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        let rejected = drained.len();
        for pending in drained {
            let _ = pending
                .tx
                .send(Err(CourierError::Remote("bridge cleared".into())));
        }

        let mut pairing = self.shared.pairing.lock();
        *pairing = Pairing::new();
        pairing.state = PairingState::Cleared;
        debug!(rejected, "bridge cleared");
    }

    async fn send_request(
        &self,
        method: &str,
        params: Vec<String>,
        timeout: Duration,
    ) -> Result<String> {
        let (signer, relays, mode) = {
            let pairing = self.shared.pairing.lock();
            let signer = pairing
                .signer
                .ok_or_else(|| CourierError::Remote("no remote signer".into()))?;
            (signer, pairing.relays.clone(), pairing.mode)
        };

        let id = new_request_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            purge_overdue(&mut pending);
            if pending.len() >= MAX_PENDING_REQUESTS {
                return Err(CourierError::RateLimitExceeded {
                    retry_after: timeout,
                });
            }
            pending.insert(
                id.clone(),
                PendingRequest {
                    method: method.to_string(),
                    deadline: Instant::now() + timeout,
                    tx,
                },
            );
        }

        let message = Nip46Message::Request(Nip46Request {
            id: id.clone(),
            method: method.to_string(),
            params,
        });
        if let Err(e) = send_message(&self.shared, &signer, &relays, mode, &message).await {
            self.shared.pending.lock().remove(&id);
            return Err(e);
        }
        debug!(%id, method, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CourierError::Remote("bridge cleared".into())),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                warn!(%id, method, "remote signer did not answer");
                Err(CourierError::RequestTimeout(method.to_string()))
            }
        }
    }

    /// Subscribe on `relays` unless the running listener already covers
    /// exactly that set.
    async fn ensure_listener(&self, relays: &[String]) -> Result<()> {
        {
            let mut listener = self.listener.lock();
            if listener
                .as_ref()
                .is_some_and(|l| l.relays == relays && !l.handle.is_finished())
            {
                return Ok(());
            }
            if let Some(stale) = listener.take() {
                debug!(relays = ?stale.relays, "replacing control channel subscription");
                stale.stop();
            }
        }

        let query = EventQuery::new()
            .kind(Kind::NostrConnect)
            .recipient(self.client_pubkey())
            .since(Timestamp::now() - SUBSCRIPTION_LOOKBACK);
        let stream = self
            .shared
            .directory
            .transport()
            .subscribe(relays, query)
            .await?;

        let handle = tokio::spawn(listen(Arc::clone(&self.shared), stream));
        *self.listener.lock() = Some(Listener {
            relays: relays.to_vec(),
            handle,
        });
        Ok(())
    }

    /// Back to `Unpaired` after a failed pairing attempt. The subscription
    /// is dropped so the next attempt listens on its own relays.
    fn reset_pairing(&self) {
        {
            let mut pairing = self.shared.pairing.lock();
            if pairing.state != PairingState::Cleared {
                pairing.state = PairingState::Unpaired;
                pairing.signer = None;
                pairing.secret = None;
                pairing.connect_tx = None;
            }
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.stop();
        }
    }
}

impl Drop for RemoteSignerBridge {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.stop();
        }
    }
}

fn purge_overdue(pending: &mut HashMap<String, PendingRequest>) {
    let now = Instant::now();
    pending.retain(|id, p| {
        let keep = p.deadline > now;
        if !keep {
            debug!(%id, method = %p.method, "dropping overdue request");
        }
        keep
    });
}

async fn send_message(
    shared: &Shared,
    signer: &PublicKey,
    relays: &[String],
    mode: EncryptionScheme,
    message: &Nip46Message,
) -> Result<()> {
    let json = message.to_json()?;
    let secret = shared.client_keys.secret_key();
    let content = match mode {
        EncryptionScheme::Nip44 => {
            nip44::encrypt(secret, signer, json, nip44::Version::V2).map_err(|e| e.to_string())
        }
        EncryptionScheme::Nip04 => nip04::encrypt(secret, signer, json).map_err(|e| e.to_string()),
    }
    .map_err(CourierError::crypto)?;

    let event = EventBuilder::new(Kind::NostrConnect, content)
        .tag(Tag::public_key(*signer))
        .sign_with_keys(&shared.client_keys)
        .map_err(|e| CourierError::crypto(e.to_string()))?;

    shared
        .directory
        .publish(&event, &PublishRoute::to_relays(relays.to_vec()))
        .await?;
    Ok(())
}

/// Try NIP-44 first, then legacy NIP-04.
fn decrypt_inbound(keys: &Keys, sender: &PublicKey, content: &str) -> Option<(String, EncryptionScheme)> {
    if let Ok(plain) = nip44::decrypt(keys.secret_key(), sender, content) {
        return Some((plain, EncryptionScheme::Nip44));
    }
    nip04::decrypt(keys.secret_key(), sender, content)
        .ok()
        .map(|plain| (plain, EncryptionScheme::Nip04))
}

async fn listen(shared: Arc<Shared>, mut stream: EventStream) {
    while let Some(event) = stream.next().await {
        if event.kind != Kind::NostrConnect || event.content.len() > MAX_CONTENT_LENGTH {
            continue;
        }
        if event.verify().is_err() {
            continue;
        }
        let Some((plain, mode)) = decrypt_inbound(&shared.client_keys, &event.pubkey, &event.content)
        else {
            debug!(from = %event.pubkey, "undecryptable control message");
            continue;
        };
        let message = match Nip46Message::parse(&plain) {
            Ok(message) => message,
            Err(e) => {
                debug!(from = %event.pubkey, error = %e, "malformed control message");
                continue;
            }
        };

        if let Some(reply) = handle_message(&shared, event.pubkey, mode, message) {
            let relays = shared.pairing.lock().relays.clone();
            if let Err(e) = send_message(&shared, &event.pubkey, &relays, mode, &reply).await {
                warn!(error = %e, "failed to answer remote signer");
            }
        }
    }
    debug!("control channel closed");
}

/// Apply one inbound message. Returns a reply to send, if any.
fn handle_message(
    shared: &Shared,
    from: PublicKey,
    mode: EncryptionScheme,
    message: Nip46Message,
) -> Option<Nip46Message> {
    // Responses to our own requests.
    if let Nip46Message::Response(response) = &message {
        let expected = shared.pairing.lock().signer;
        if expected == Some(from) {
            if let Some(pending) = shared.pending.lock().remove(&response.id) {
                let _ = pending.tx.send(response.clone().into_result());
                return None;
            }
        }
    }

    let mut pairing = shared.pairing.lock();
    if pairing.state != PairingState::AwaitingConnect || pairing.connect_tx.is_none() {
        return None;
    }

    let (id, presented) = match &message {
        Nip46Message::Request(req) if req.method == METHOD_CONNECT => {
            (req.id.clone(), req.params.iter().find(|p| pairing.secret_matches(p)).cloned())
        }
        Nip46Message::Response(resp) => (
            resp.id.clone(),
            resp.result.clone().filter(|r| pairing.secret_matches(r)),
        ),
        Nip46Message::Request(_) => return None,
    };

    if presented.is_none() {
        pairing.rejected_secrets += 1;
        warn!(from = %from, "connect with wrong secret ignored");
        return None;
    }
    if !is_valid_request_id(&id) {
        return None;
    }

    pairing.state = PairingState::Paired;
    pairing.signer = Some(from);
    pairing.mode = mode;
    pairing.secret = None;
    if let Some(tx) = pairing.connect_tx.take() {
        let _ = tx.send(from);
    }
    Some(Nip46Message::Response(Nip46Response::ok(id, "ack")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_messaging::MemoryRelayNetwork;

    const RELAY: &str = "wss://bridge.example.com/";

    fn bridge() -> (MemoryRelayNetwork, RemoteSignerBridge) {
        let net = MemoryRelayNetwork::with_relays(&[RELAY.into()]);
        let directory = Arc::new(RelayDirectory::new(Arc::new(net.clone()), vec![RELAY.into()]));
        (net, RemoteSignerBridge::new(directory))
    }

    #[tokio::test]
    async fn test_request_requires_pairing() {
        let (_net, bridge) = bridge();
        assert_eq!(bridge.state(), PairingState::Unpaired);
        assert!(matches!(
            bridge.request("ping", vec![]).await,
            Err(CourierError::Remote(_))
        ));
    }

    #[tokio::test]
    async fn test_response_form_connect_pairs() {
        let (_net, bridge) = bridge();
        let signer = Keys::generate().public_key();
        {
            let mut pairing = bridge.shared.pairing.lock();
            let (tx, _rx) = oneshot::channel();
            pairing.state = PairingState::AwaitingConnect;
            pairing.secret = Some(Zeroizing::new("s3cret".into()));
            pairing.connect_tx = Some(tx);
        }

        let wrong = Nip46Message::Response(Nip46Response::ok("a1", "nope"));
        assert!(handle_message(&bridge.shared, signer, EncryptionScheme::Nip04, wrong).is_none());
        assert_eq!(bridge.state(), PairingState::AwaitingConnect);

        let right = Nip46Message::Response(Nip46Response::ok("a2", "s3cret"));
        let reply = handle_message(&bridge.shared, signer, EncryptionScheme::Nip04, right);
        assert!(matches!(reply, Some(Nip46Message::Response(r)) if r.id == "a2"));
        assert_eq!(bridge.state(), PairingState::Paired);
        assert_eq!(bridge.signer_pubkey(), Some(signer));
        assert_eq!(bridge.encryption_mode(), EncryptionScheme::Nip04);
    }

    #[tokio::test]
    async fn test_responses_from_strangers_ignored() {
        let (_net, bridge) = bridge();
        let signer = Keys::generate().public_key();
        let (tx, mut rx) = oneshot::channel();
        {
            let mut pairing = bridge.shared.pairing.lock();
            pairing.state = PairingState::Paired;
            pairing.signer = Some(signer);
        }
        bridge.shared.pending.lock().insert(
            "req-1".into(),
            PendingRequest {
                method: "ping".into(),
                deadline: Instant::now() + DEFAULT_REQUEST_TIMEOUT,
                tx,
            },
        );

        let stranger = Keys::generate().public_key();
        let response = Nip46Message::Response(Nip46Response::ok("req-1", "pong"));
        handle_message(&bridge.shared, stranger, EncryptionScheme::Nip44, response.clone());
        assert_eq!(bridge.pending_requests(), 1);
        assert!(rx.try_recv().is_err());

        handle_message(&bridge.shared, signer, EncryptionScheme::Nip44, response);
        assert_eq!(bridge.pending_requests(), 0);
        assert_eq!(rx.try_recv().unwrap().unwrap(), "pong");
    }

    #[tokio::test]
    async fn test_clear_is_terminal() {
        let (_net, bridge) = bridge();
        bridge.clear().await;
        assert_eq!(bridge.state(), PairingState::Cleared);
        assert!(bridge
            .establish("x", vec![RELAY.into()], Duration::from_millis(10))
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bunker_flow_starts_from_clean_pairing() {
        let (_net, bridge) = bridge();
        let (stale_tx, _stale_rx) = oneshot::channel();
        {
            let mut pairing = bridge.shared.pairing.lock();
            pairing.rejected_secrets = 3;
            pairing.mode = EncryptionScheme::Nip04;
            pairing.connect_tx = Some(stale_tx);
        }

        let bunker = BunkerUri {
            signer: Keys::generate().public_key(),
            relays: vec![RELAY.into()],
            secret: Some("bunker-secret".into()),
        };
        let inspect = async {
            while bridge.state() != PairingState::AwaitingConnect {
                tokio::task::yield_now().await;
            }
            let pairing = bridge.shared.pairing.lock();
            (
                pairing.rejected_secrets,
                pairing.connect_tx.is_some(),
                pairing.mode,
            )
        };
        let (outcome, seen) = tokio::join!(
            bridge.connect_bunker(&bunker, Duration::from_millis(50)),
            inspect
        );

        assert_eq!(seen, (0, false, EncryptionScheme::Nip44));
        assert!(matches!(outcome, Err(CourierError::RequestTimeout(_))));
        assert_eq!(bridge.state(), PairingState::Unpaired);
        assert!(bridge.listener.lock().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pairing_drops_subscription() {
        let (_net, bridge) = bridge();
        let outcome = bridge
            .establish("s", vec![RELAY.into()], Duration::from_millis(10))
            .await;
        assert!(matches!(outcome, Err(CourierError::RequestTimeout(_))));
        assert!(bridge.listener.lock().is_none());
    }

    #[test]
    fn test_decrypt_inbound_detects_mode() {
        let client = Keys::generate();
        let signer = Keys::generate();
        let legacy = nip04::encrypt(signer.secret_key(), &client.public_key(), "hi").unwrap();
        let modern = nip44::encrypt(
            signer.secret_key(),
            &client.public_key(),
            "hi",
            nip44::Version::V2,
        )
        .unwrap();

        assert_eq!(
            decrypt_inbound(&client, &signer.public_key(), &modern).unwrap().1,
            EncryptionScheme::Nip44
        );
        assert_eq!(
            decrypt_inbound(&client, &signer.public_key(), &legacy).unwrap().1,
            EncryptionScheme::Nip04
        );
        assert!(decrypt_inbound(&client, &signer.public_key(), "garbage").is_none());
    }
}
