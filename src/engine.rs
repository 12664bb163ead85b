// src/engine.rs
//
// The engine facade: owns the negotiation coordinator, the local media
// controller and the state reconciler, and routes inbound signaling to
// whichever of them handles it. One engine instance per local
// participant per call.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EventBus, SessionEvent};
use crate::media::{CaptureDevice, LocalMediaController, SyncOutcome};
use crate::negotiation::{NegotiationCoordinator, NegotiationRequest};
use crate::peer::PeerConnectionFactory;
use crate::reconcile::{SyncedTrackState, TrackStateReconciler};
use crate::remote::RemoteStreamRegistry;
use crate::signaling::{SignalMessage, SignalingPort};

pub struct MeshEngine {
    self_id: String,
    signaling: Arc<dyn SignalingPort>,
    coordinator: Arc<NegotiationCoordinator>,
    media: Arc<LocalMediaController>,
    reconciler: Arc<TrackStateReconciler>,
    events: EventBus,
}

impl MeshEngine {
    pub fn new(
        self_id: impl Into<String>,
        config: EngineConfig,
        signaling: Arc<dyn SignalingPort>,
        factory: Arc<dyn PeerConnectionFactory>,
        capture: Arc<dyn CaptureDevice>,
    ) -> Arc<Self> {
        let self_id = self_id.into();
        config.log_summary();

        let events = EventBus::new();
        let coordinator = Arc::new(NegotiationCoordinator::new(
            self_id.clone(),
            config.clone(),
            Arc::clone(&signaling),
            factory,
            events.clone(),
        ));
        let media = Arc::new(LocalMediaController::new(
            self_id.clone(),
            config.clone(),
            capture,
            Arc::clone(&signaling),
            Arc::clone(&coordinator),
            events.clone(),
        ));
        let reconciler = Arc::new(TrackStateReconciler::new(
            self_id.clone(),
            config,
            Arc::clone(&signaling),
            Arc::clone(&media),
            events.clone(),
        ));
        reconciler.spawn(media.reconcile_nudge());

        info!("engine started for participant '{self_id}'");
        Arc::new(Self {
            self_id,
            signaling,
            coordinator,
            media,
            reconciler,
            events,
        })
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Subscribe to the engine's event stream.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn media(&self) -> &Arc<LocalMediaController> {
        &self.media
    }

    pub fn remote_streams(&self) -> &Arc<RemoteStreamRegistry> {
        &self.coordinator.remote_streams
    }

    // ── Peer lifecycle ──────────────────────────────────────────────────

    /// Create a session towards a peer and publish our current tracks to
    /// it. Idempotent for an already-known peer.
    pub async fn add_peer(&self, peer_id: &str) -> Result<(), EngineError> {
        let known = self.coordinator.registry.get(peer_id).is_some();
        let session = self.coordinator.ensure_session(peer_id).await?;
        if !known {
            self.media.attach_to_session(&session).await;
        }
        Ok(())
    }

    /// Tear down the session towards a peer.
    pub async fn remove_peer(&self, peer_id: &str) -> Result<(), EngineError> {
        self.coordinator.close_session(peer_id).await
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.coordinator
            .registry
            .all()
            .iter()
            .map(|s| s.remote_id.clone())
            .collect()
    }

    // ── Inbound signaling ───────────────────────────────────────────────

    /// Route one inbound signal. `from_peer_id` is the sender as reported
    /// by the signaling transport, not taken from the message body.
    pub async fn handle_signal(
        &self,
        from_peer_id: &str,
        message: SignalMessage,
    ) -> Result<(), EngineError> {
        match message {
            SignalMessage::Offer { sdp, .. } => {
                let known = self.coordinator.registry.get(from_peer_id).is_some();
                self.coordinator.handle_remote_offer(from_peer_id, sdp).await?;
                // A remote-initiated session still carries our tracks.
                if !known {
                    if let Some(session) = self.coordinator.registry.get(from_peer_id) {
                        self.media.attach_to_session(&session).await;
                    }
                }
                Ok(())
            }
            SignalMessage::Answer { sdp, .. } => {
                self.coordinator.handle_remote_answer(from_peer_id, sdp).await
            }
            SignalMessage::IceCandidate { candidate, .. } => {
                self.coordinator
                    .handle_remote_candidate(from_peer_id, candidate)
                    .await
            }
            SignalMessage::RequestParticipantState { .. } => {
                self.report_participant_state(from_peer_id).await
            }
            // Server pushes about our own state reconcile immediately,
            // same as a full participant-state reply.
            SignalMessage::MicState {
                peer_id,
                is_muted,
                timestamp,
            } if peer_id == self.self_id => {
                self.reconciler
                    .handle_server_state(SyncedTrackState {
                        is_muted: Some(is_muted),
                        is_video_off: None,
                        timestamp,
                    })
                    .await;
                Ok(())
            }
            SignalMessage::VideoState {
                peer_id,
                is_video_off,
                timestamp,
            } if peer_id == self.self_id => {
                self.reconciler
                    .handle_server_state(SyncedTrackState {
                        is_muted: None,
                        is_video_off: Some(is_video_off),
                        timestamp,
                    })
                    .await;
                Ok(())
            }
            SignalMessage::ParticipantState {
                peer_id,
                is_muted,
                is_video_off,
                timestamp,
            } if peer_id == self.self_id => {
                self.reconciler
                    .handle_server_state(SyncedTrackState {
                        is_muted,
                        is_video_off,
                        timestamp,
                    })
                    .await;
                Ok(())
            }
            other => {
                // Remote participants' own state broadcasts; consumers
                // interested in them watch the signaling layer directly.
                debug!("ignoring signal from '{from_peer_id}': {other:?}");
                Ok(())
            }
        }
    }

    async fn report_participant_state(&self, _requester: &str) -> Result<(), EngineError> {
        let state = self.media.state();
        self.signaling
            .send(SignalMessage::ParticipantState {
                peer_id: self.self_id.clone(),
                is_muted: Some(!state.mic_enabled),
                is_video_off: Some(!state.camera_enabled),
                timestamp: state.updated_at,
            })
            .await
    }

    // ── Media pass-throughs ─────────────────────────────────────────────

    pub async fn set_microphone_enabled(&self, enabled: bool) -> Result<SyncOutcome, EngineError> {
        self.media.set_microphone_enabled(enabled).await
    }

    pub async fn set_camera_enabled(
        &self,
        enabled: bool,
        device_id: Option<String>,
    ) -> Result<SyncOutcome, EngineError> {
        self.media.set_camera_enabled(enabled, device_id).await
    }

    pub async fn set_host_forced_mute(&self, forced: bool) -> Result<SyncOutcome, EngineError> {
        self.media.set_host_forced_mute(forced).await
    }

    pub async fn start_screen_share(&self) -> Result<(), EngineError> {
        self.media.start_screen_share().await
    }

    pub async fn stop_screen_share(&self) -> Result<(), EngineError> {
        self.media.stop_screen_share().await
    }

    /// Explicitly renegotiate with one peer (e.g. after an out-of-band
    /// transport change).
    pub async fn renegotiate(&self, peer_id: &str) -> Result<NegotiationRequest, EngineError> {
        self.coordinator.request_negotiation(peer_id).await
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Stop the reconciler and close every session. Queued negotiation
    /// work is rejected before this returns.
    pub async fn shutdown(&self) {
        info!("engine for '{}' shutting down", self.self_id);
        self.reconciler.stop();
        self.coordinator.close_all().await;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
