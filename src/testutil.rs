// src/testutil.rs
//
// Scripted doubles for the engine's three seams (peer connections,
// signaling transport, capture), plus wiring helpers. The fake connector
// models the browser signaling-state machine so negotiation tests can
// assert real offer/answer ordering without a media stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::engine::MeshEngine;
use crate::error::EngineError;
use crate::events::EventBus;
use crate::media::CaptureDevice;
use crate::negotiation::NegotiationCoordinator;
use crate::peer::{
    ConnectionState, ConnectorEvent, IceCandidateInit, MediaKind, PeerConnectionFactory,
    PeerConnector, SessionDescription, SignalingState, TrackHandle,
};
use crate::signaling::{SignalMessage, SignalingPort};

// ─── FakeConnector ──────────────────────────────────────────────────────────

struct FakeConnectorState {
    signaling: Mutex<SignalingState>,
    connection: Mutex<ConnectionState>,
    rollbacks: AtomicUsize,
    ice_restarts: AtomicUsize,
    fail_create_offer: AtomicBool,
    fail_rollback: AtomicBool,
    fail_replace: AtomicBool,
    candidates: Mutex<Vec<IceCandidateInit>>,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    tracks: Mutex<Vec<TrackHandle>>,
    replaces: Mutex<Vec<(String, String)>>,
    removed: Mutex<Vec<String>>,
    events: Mutex<Option<mpsc::Sender<ConnectorEvent>>>,
}

/// Scripted `PeerConnector`. Cloning yields a handle to the same
/// underlying state, so tests can keep one while the session owns
/// another.
#[derive(Clone)]
pub struct FakeConnector {
    state: Arc<FakeConnectorState>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FakeConnectorState {
                signaling: Mutex::new(SignalingState::Stable),
                connection: Mutex::new(ConnectionState::New),
                rollbacks: AtomicUsize::new(0),
                ice_restarts: AtomicUsize::new(0),
                fail_create_offer: AtomicBool::new(false),
                fail_rollback: AtomicBool::new(false),
                fail_replace: AtomicBool::new(false),
                candidates: Mutex::new(Vec::new()),
                remote_descriptions: Mutex::new(Vec::new()),
                tracks: Mutex::new(Vec::new()),
                replaces: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
                events: Mutex::new(None),
            }),
        }
    }

    fn set_signaling(&self, s: SignalingState) {
        *self.state.signaling.lock().unwrap() = s;
    }

    // ── Scripting ───────────────────────────────────────────────────────

    pub fn fail_create_offer(&self, fail: bool) {
        self.state.fail_create_offer.store(fail, Ordering::SeqCst);
    }

    pub fn fail_rollback(&self, fail: bool) {
        self.state.fail_rollback.store(fail, Ordering::SeqCst);
    }

    pub fn fail_replace_track(&self, fail: bool) {
        self.state.fail_replace.store(fail, Ordering::SeqCst);
    }

    /// Inject a connector event as if the underlying engine raised it.
    pub async fn push_event(&self, event: ConnectorEvent) {
        let tx = self
            .state
            .events
            .lock()
            .unwrap()
            .clone()
            .expect("connector not created through FakeFactory");
        tx.send(event).await.expect("connector event loop gone");
    }

    // ── Observations ────────────────────────────────────────────────────

    pub fn signaling_state(&self) -> SignalingState {
        *self.state.signaling.lock().unwrap()
    }

    pub fn rollback_count(&self) -> usize {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    pub fn ice_restart_count(&self) -> usize {
        self.state.ice_restarts.load(Ordering::SeqCst)
    }

    pub fn added_candidates(&self) -> Vec<IceCandidateInit> {
        self.state.candidates.lock().unwrap().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state.remote_descriptions.lock().unwrap().clone()
    }

    pub fn added_tracks(&self) -> Vec<TrackHandle> {
        self.state.tracks.lock().unwrap().clone()
    }

    pub fn replace_calls(&self) -> Vec<(String, String)> {
        self.state.replaces.lock().unwrap().clone()
    }

    pub fn removed_tracks(&self) -> Vec<String> {
        self.state.removed.lock().unwrap().clone()
    }
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError> {
        if self.state.fail_create_offer.load(Ordering::SeqCst) {
            return Err(EngineError::negotiation("fake", "scripted offer failure"));
        }
        if ice_restart {
            self.state.ice_restarts.fetch_add(1, Ordering::SeqCst);
        }
        self.set_signaling(SignalingState::HaveLocalOffer);
        Ok(SessionDescription::offer("v=0 fake offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        if self.signaling_state() != SignalingState::HaveRemoteOffer {
            return Err(EngineError::negotiation(
                "fake",
                format!("create_answer in state {:?}", self.signaling_state()),
            ));
        }
        self.set_signaling(SignalingState::Stable);
        Ok(SessionDescription::answer("v=0 fake answer"))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        use crate::peer::SdpType;
        // A real browser call suspends here; yielding lets concurrently
        // scheduled negotiation work interleave the way it would live.
        tokio::task::yield_now().await;
        let current = self.signaling_state();
        match desc.sdp_type {
            SdpType::Offer if current == SignalingState::Stable => {
                self.set_signaling(SignalingState::HaveRemoteOffer);
            }
            SdpType::Answer if current == SignalingState::HaveLocalOffer => {
                self.set_signaling(SignalingState::Stable);
            }
            sdp_type => {
                return Err(EngineError::negotiation(
                    "fake",
                    format!("remote {sdp_type:?} rejected in state {current:?}"),
                ));
            }
        }
        self.state.remote_descriptions.lock().unwrap().push(desc);
        Ok(())
    }

    async fn rollback_local_description(&self) -> Result<(), EngineError> {
        if self.state.fail_rollback.load(Ordering::SeqCst) {
            return Err(EngineError::negotiation("fake", "scripted rollback failure"));
        }
        if self.signaling_state() != SignalingState::HaveLocalOffer {
            return Err(EngineError::negotiation(
                "fake",
                format!("rollback in state {:?}", self.signaling_state()),
            ));
        }
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.set_signaling(SignalingState::Stable);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), EngineError> {
        self.state.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        FakeConnector::signaling_state(self)
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.connection.lock().unwrap()
    }

    async fn add_track(&self, track: &TrackHandle) -> Result<(), EngineError> {
        self.state.tracks.lock().unwrap().push(track.clone());
        Ok(())
    }

    async fn replace_track(&self, old_id: &str, track: &TrackHandle) -> Result<(), EngineError> {
        if self.state.fail_replace.load(Ordering::SeqCst) {
            self.state
                .replaces
                .lock()
                .unwrap()
                .push((old_id.to_string(), track.id.clone()));
            return Err(EngineError::TrackReplacementFailed {
                peer_id: "fake".into(),
                reason: "scripted replacement failure".into(),
            });
        }
        self.state
            .replaces
            .lock()
            .unwrap()
            .push((old_id.to_string(), track.id.clone()));
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), EngineError> {
        self.state.removed.lock().unwrap().push(track_id.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.set_signaling(SignalingState::Closed);
        *self.state.connection.lock().unwrap() = ConnectionState::Closed;
    }
}

// ─── FakeFactory ────────────────────────────────────────────────────────────

/// Factory that hands out fake connectors and keeps a handle to each one
/// for later inspection.
pub struct FakeFactory {
    connectors: Mutex<HashMap<String, FakeConnector>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self {
            connectors: Mutex::new(HashMap::new()),
        }
    }

    /// The connector created for `peer_id`. Panics if no session was
    /// ever opened towards that peer.
    pub fn connector(&self, peer_id: &str) -> FakeConnector {
        self.connectors
            .lock()
            .unwrap()
            .get(peer_id)
            .cloned()
            .unwrap_or_else(|| panic!("no connector created for '{peer_id}'"))
    }
}

impl Default for FakeFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(
        &self,
        peer_id: &str,
    ) -> Result<(Box<dyn PeerConnector>, mpsc::Receiver<ConnectorEvent>), EngineError> {
        let connector = FakeConnector::new();
        let (tx, rx) = mpsc::channel(64);
        *connector.state.events.lock().unwrap() = Some(tx);
        self.connectors
            .lock()
            .unwrap()
            .insert(peer_id.to_string(), connector.clone());
        Ok((Box::new(connector), rx))
    }
}

// ─── FakeSignaling ──────────────────────────────────────────────────────────

/// Records everything sent; can be scripted to fail or hang.
pub struct FakeSignaling {
    sent: Mutex<Vec<SignalMessage>>,
    fail: AtomicBool,
    hang: AtomicBool,
}

impl FakeSignaling {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            hang: AtomicBool::new(false),
        }
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn hang_sends(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }
}

impl Default for FakeSignaling {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingPort for FakeSignaling {
    async fn send(&self, message: SignalMessage) -> Result<(), EngineError> {
        if self.hang.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::SignalingUnavailable("scripted failure".into()));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

// ─── FakeCapture ────────────────────────────────────────────────────────────

/// Hands out inert track handles and records every acquisition.
pub struct FakeCapture {
    acquired: Mutex<Vec<(MediaKind, Option<String>)>>,
    counter: AtomicUsize,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self {
            acquired: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn acquired(&self) -> Vec<(MediaKind, Option<String>)> {
        self.acquired.lock().unwrap().clone()
    }
}

impl Default for FakeCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureDevice for FakeCapture {
    async fn acquire(
        &self,
        kind: MediaKind,
        device_id: Option<&str>,
    ) -> Result<TrackHandle, EngineError> {
        self.acquired
            .lock()
            .unwrap()
            .push((kind, device_id.map(str::to_string)));
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(TrackHandle::new(format!("fake-{}-{n}", kind.as_str()), kind))
    }
}

// ─── Wiring helpers ─────────────────────────────────────────────────────────

pub fn coordinator_with_fakes(
    self_id: &str,
) -> (
    Arc<NegotiationCoordinator>,
    Arc<FakeSignaling>,
    Arc<FakeFactory>,
) {
    let signaling = Arc::new(FakeSignaling::new());
    let factory = Arc::new(FakeFactory::new());
    let coordinator = Arc::new(NegotiationCoordinator::new(
        self_id,
        EngineConfig::default(),
        signaling.clone() as Arc<dyn SignalingPort>,
        factory.clone() as Arc<dyn PeerConnectionFactory>,
        EventBus::new(),
    ));
    (coordinator, signaling, factory)
}

pub fn engine_with_fakes(
    self_id: &str,
) -> (
    Arc<MeshEngine>,
    Arc<FakeSignaling>,
    Arc<FakeFactory>,
    Arc<FakeCapture>,
) {
    let signaling = Arc::new(FakeSignaling::new());
    let factory = Arc::new(FakeFactory::new());
    let capture = Arc::new(FakeCapture::new());
    let engine = MeshEngine::new(
        self_id,
        EngineConfig::default(),
        signaling.clone() as Arc<dyn SignalingPort>,
        factory.clone() as Arc<dyn PeerConnectionFactory>,
        capture.clone() as Arc<dyn CaptureDevice>,
    );
    (engine, signaling, factory, capture)
}

// ─── SignalingHub ───────────────────────────────────────────────────────────

type Routes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<(String, SignalMessage)>>>>;

/// In-memory signaling server: peer-addressed messages are delivered to
/// the target engine's `handle_signal`, server-bound state messages are
/// dropped.
pub struct SignalingHub {
    routes: Routes,
}

struct HubPort {
    from: String,
    routes: Routes,
}

#[async_trait]
impl SignalingPort for HubPort {
    async fn send(&self, message: SignalMessage) -> Result<(), EngineError> {
        let target = match &message {
            SignalMessage::Offer { to_peer_id, .. }
            | SignalMessage::Answer { to_peer_id, .. }
            | SignalMessage::IceCandidate { to_peer_id, .. } => Some(to_peer_id.clone()),
            _ => None,
        };
        let Some(target) = target else {
            return Ok(());
        };
        let tx = self.routes.lock().unwrap().get(&target).cloned();
        match tx {
            Some(tx) => tx
                .send((self.from.clone(), message))
                .map_err(|_| EngineError::SignalingUnavailable(format!("'{target}' gone"))),
            None => Err(EngineError::SignalingUnavailable(format!(
                "no route to '{target}'"
            ))),
        }
    }
}

impl SignalingHub {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a participant: builds an engine wired to the hub and
    /// pumps its inbound queue in the background.
    pub fn engine(&self, self_id: &str) -> (Arc<MeshEngine>, Arc<FakeFactory>, Arc<FakeCapture>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.routes.lock().unwrap().insert(self_id.to_string(), tx);

        let port = Arc::new(HubPort {
            from: self_id.to_string(),
            routes: Arc::clone(&self.routes),
        });
        let factory = Arc::new(FakeFactory::new());
        let capture = Arc::new(FakeCapture::new());
        let engine = MeshEngine::new(
            self_id,
            EngineConfig::default(),
            port as Arc<dyn SignalingPort>,
            factory.clone() as Arc<dyn PeerConnectionFactory>,
            capture.clone() as Arc<dyn CaptureDevice>,
        );

        let pump = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Some((from, message)) = rx.recv().await {
                let _ = pump.handle_signal(&from, message).await;
            }
        });
        (engine, factory, capture)
    }
}

impl Default for SignalingHub {
    fn default() -> Self {
        Self::new()
    }
}
