// src/peer.rs
//
// The seam between the negotiation engine and the underlying real-time
// stack. `PeerConnector` exposes exactly the operations the coordinator
// needs (offer/answer production, rollback, candidates, tracks, state);
// `WebRtcConnector` implements it over webrtc-rs, and tests drive the
// engine through a scripted fake instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::EngineConfig;
use crate::error::EngineError;

// ─── Media kinds ────────────────────────────────────────────────────────────

/// What a track carries. Screen share is a second video source and gets
/// its own slot so renderers can distinguish camera from screen content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Screen,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Screen => "screen",
        }
    }
}

// ─── Connection / signaling state ───────────────────────────────────────────

/// Peer connection state, monotonic except for the recovery transitions
/// `Disconnected`/`Failed` → `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

/// SDP negotiation state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl From<RTCSignalingState> for SignalingState {
    fn from(state: RTCSignalingState) -> Self {
        match state {
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => Self::Stable,
            RTCSignalingState::HaveLocalOffer => Self::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => Self::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => Self::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => Self::HaveRemotePranswer,
            RTCSignalingState::Closed => Self::Closed,
        }
    }
}

// ─── SDP / candidate DTOs ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as carried over signaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

impl From<RTCSessionDescription> for SessionDescription {
    fn from(desc: RTCSessionDescription) -> Self {
        let sdp_type = match desc.sdp_type {
            RTCSdpType::Answer | RTCSdpType::Pranswer => SdpType::Answer,
            _ => SdpType::Offer,
        };
        SessionDescription {
            sdp_type,
            sdp: desc.sdp,
        }
    }
}

/// ICE candidate as carried over signaling. Matches the W3C
/// `RTCIceCandidateInit` dictionary shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

// ─── Track handles ──────────────────────────────────────────────────────────

/// Handle to a local capture track shared between the media controller and
/// every session's senders. Muting flips `enabled` without releasing the
/// underlying track, preserving fast re-enable.
#[derive(Clone)]
pub struct TrackHandle {
    pub id: String,
    pub kind: MediaKind,
    enabled: Arc<AtomicBool>,
    rtc: Option<Arc<dyn TrackLocal + Send + Sync>>,
}

impl TrackHandle {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            rtc: None,
        }
    }

    pub fn with_rtc(
        id: impl Into<String>,
        kind: MediaKind,
        rtc: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            rtc: Some(rtc),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn rtc(&self) -> Option<&Arc<dyn TrackLocal + Send + Sync>> {
        self.rtc.as_ref()
    }
}

impl std::fmt::Debug for TrackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// A remote peer's live track as observed by the connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
}

// ─── Connector events ───────────────────────────────────────────────────────

/// Asynchronous notifications from the underlying connection, consumed by
/// the coordinator's per-session event loop.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    /// A locally gathered ICE candidate.
    IceCandidate(IceCandidateInit),
    /// The engine wants a renegotiation (tracks or transport changed).
    NegotiationNeeded,
    ConnectionStateChanged(ConnectionState),
    TrackStarted(RemoteTrack),
    TrackStopped(RemoteTrack),
}

// ─── PeerConnector seam ─────────────────────────────────────────────────────

/// Operations the negotiation engine performs against one underlying peer
/// connection. Offer/answer creation also installs the local description,
/// mirroring the browser `setLocalDescription()` convenience form.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create an offer and set it as the local description. `ice_restart`
    /// forces new ICE credentials for connection recovery.
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError>;

    /// Create an answer to the current remote offer and set it locally.
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    /// Roll back a pending local offer. Engines without rollback support
    /// return an error; the coordinator treats that as fatal for the
    /// session.
    async fn rollback_local_description(&self) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), EngineError>;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    async fn add_track(&self, track: &TrackHandle) -> Result<(), EngineError>;

    /// Swap the sender currently carrying `old_id` to the new track.
    async fn replace_track(&self, old_id: &str, track: &TrackHandle) -> Result<(), EngineError>;

    /// Drop the sender carrying `track_id`. A missing sender is not an
    /// error.
    async fn remove_track(&self, track_id: &str) -> Result<(), EngineError>;

    async fn close(&self);
}

/// Creates one connector per remote participant.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
    ) -> Result<(Box<dyn PeerConnector>, mpsc::Receiver<ConnectorEvent>), EngineError>;
}

// ─── webrtc-rs implementation ───────────────────────────────────────────────

/// Production factory backed by webrtc-rs with default codecs and
/// interceptors.
pub struct WebRtcFactory {
    config: EngineConfig,
}

impl WebRtcFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .config
            .ice_servers()
            .into_iter()
            .map(|s| RTCIceServer {
                urls: s.urls,
                username: s.username.unwrap_or_default(),
                credential: s.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(
        &self,
        peer_id: &str,
    ) -> Result<(Box<dyn PeerConnector>, mpsc::Receiver<ConnectorEvent>), EngineError> {
        let pc = self.new_peer_connection().await.map_err(|e| {
            warn!("failed to create peer connection for '{peer_id}': {e}");
            EngineError::negotiation(peer_id, format!("peer connection creation failed: {e}"))
        })?;

        let (tx, rx) = mpsc::channel(64);
        wire_callbacks(&pc, peer_id, tx);

        let connector = WebRtcConnector {
            peer_id: peer_id.to_string(),
            pc,
        };
        Ok((Box::new(connector), rx))
    }
}

/// Route webrtc-rs callbacks into the connector event channel.
fn wire_callbacks(pc: &Arc<RTCPeerConnection>, peer_id: &str, tx: mpsc::Sender<ConnectorEvent>) {
    {
        let tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx
                            .send(ConnectorEvent::IceCandidate(IceCandidateInit {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }))
                            .await;
                    }
                    Err(e) => warn!("ICE candidate serialization failed: {e}"),
                }
            })
        }));
    }

    {
        let tx = tx.clone();
        let pid = peer_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            let pid = pid.clone();
            Box::pin(async move {
                debug!("peer '{pid}' connection state: {state}");
                let _ = tx
                    .send(ConnectorEvent::ConnectionStateChanged(state.into()))
                    .await;
            })
        }));
    }

    {
        let tx = tx.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(ConnectorEvent::NegotiationNeeded).await;
            })
        }));
    }

    {
        let pid = peer_id.to_string();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            let pid = pid.clone();
            Box::pin(async move {
                // Screen shares are published under a dedicated stream id so
                // subscribers can tell them apart from camera video.
                let kind = if track.kind() == RTPCodecType::Audio {
                    MediaKind::Audio
                } else if track.stream_id().contains("screen") {
                    MediaKind::Screen
                } else {
                    MediaKind::Video
                };
                let remote = RemoteTrack {
                    id: track.id(),
                    kind,
                };
                info!("peer '{pid}' track started: {} ({})", remote.id, kind.as_str());
                let _ = tx.send(ConnectorEvent::TrackStarted(remote.clone())).await;

                // Drain RTP until the track ends; the read error is the only
                // end-of-track signal webrtc-rs gives us.
                loop {
                    if track.read_rtp().await.is_err() {
                        let _ = tx.send(ConnectorEvent::TrackStopped(remote)).await;
                        break;
                    }
                }
            })
        }));
    }
}

/// `PeerConnector` backed by a webrtc-rs `RTCPeerConnection`.
pub struct WebRtcConnector {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcConnector {
    fn map_err(&self, op: &str, e: webrtc::Error) -> EngineError {
        EngineError::negotiation(&self.peer_id, format!("{op}: {e}"))
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            voice_activity_detection: false,
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| self.map_err("create_offer", e))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| self.map_err("set_local_description", e))?;
        Ok(offer.into())
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| self.map_err("create_answer", e))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| self.map_err("set_local_description", e))?;
        Ok(answer.into())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let rtc_desc = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| self.map_err("parse remote description", e))?;
        self.pc
            .set_remote_description(rtc_desc)
            .await
            .map_err(|e| self.map_err("set_remote_description", e))
    }

    async fn rollback_local_description(&self) -> Result<(), EngineError> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(|e| self.map_err("rollback", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| self.map_err("add_ice_candidate", e))
    }

    fn signaling_state(&self) -> SignalingState {
        self.pc.signaling_state().into()
    }

    fn connection_state(&self) -> ConnectionState {
        self.pc.connection_state().into()
    }

    async fn add_track(&self, track: &TrackHandle) -> Result<(), EngineError> {
        let rtc = track.rtc().ok_or_else(|| {
            EngineError::negotiation(&self.peer_id, "track handle has no RTC track")
        })?;
        self.pc
            .add_track(Arc::clone(rtc))
            .await
            .map_err(|e| self.map_err("add_track", e))?;
        Ok(())
    }

    async fn replace_track(&self, old_id: &str, track: &TrackHandle) -> Result<(), EngineError> {
        let rtc = track.rtc().ok_or_else(|| {
            EngineError::negotiation(&self.peer_id, "track handle has no RTC track")
        })?;
        for sender in self.pc.get_senders().await {
            let matches = sender
                .track()
                .await
                .map(|t| t.id() == old_id)
                .unwrap_or(false);
            if matches {
                return sender
                    .replace_track(Some(Arc::clone(rtc)))
                    .await
                    .map_err(|e| self.map_err("replace_track", e));
            }
        }
        Err(EngineError::negotiation(
            &self.peer_id,
            format!("no sender carries track '{old_id}'"),
        ))
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), EngineError> {
        for sender in self.pc.get_senders().await {
            let matches = sender
                .track()
                .await
                .map(|t| t.id() == track_id)
                .unwrap_or(false);
            if matches {
                return self
                    .pc
                    .remove_track(&sender)
                    .await
                    .map_err(|e| self.map_err("remove_track", e));
            }
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("closing peer connection for '{}': {e}", self.peer_id);
        }
    }
}

// ─── Sample track constructors ──────────────────────────────────────────────

/// Build a webrtc-rs sample track for local capture output.
///
/// The stream id doubles as the camera/screen discriminator on the remote
/// side, so screen tracks must go out under a `*-screen` stream.
pub fn new_sample_track(kind: MediaKind, id: &str) -> Arc<dyn TrackLocal + Send + Sync> {
    let (codec, stream_id) = match kind {
        MediaKind::Audio => (
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                ..Default::default()
            },
            "peermesh-cam",
        ),
        MediaKind::Video => (
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                ..Default::default()
            },
            "peermesh-cam",
        ),
        MediaKind::Screen => (
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                ..Default::default()
            },
            "peermesh-screen",
        ),
    };
    Arc::new(TrackLocalStaticSample::new(
        codec,
        id.to_string(),
        stream_id.to_string(),
    ))
}

// ─── Tests ──────────────────────────────────────────────────────────────────
