// src/signaling.rs
//
// Wire shapes exchanged over the external signaling channel, plus the
// `SignalingPort` seam the engine sends through. The transport itself
// (delivery, authentication, reconnection) is somebody else's problem;
// the engine only assumes point-to-point routing by participant id and
// per-type ordering.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::peer::IceCandidateInit;

// ─── Messages ───────────────────────────────────────────────────────────────

/// Logical signaling messages, transport-agnostic.
///
/// `to_peer_id` on the SDP/candidate variants is the routing address; the
/// transport must deliver those only to that peer's logical session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    Offer {
        to_peer_id: String,
        sdp: String,
    },
    Answer {
        to_peer_id: String,
        sdp: String,
    },
    IceCandidate {
        to_peer_id: String,
        candidate: IceCandidateInit,
    },
    MicState {
        peer_id: String,
        is_muted: bool,
        timestamp: DateTime<Utc>,
    },
    VideoState {
        peer_id: String,
        is_video_off: bool,
        timestamp: DateTime<Utc>,
    },
    RequestParticipantState {
        peer_id: String,
    },
    ParticipantState {
        peer_id: String,
        is_muted: Option<bool>,
        is_video_off: Option<bool>,
        timestamp: DateTime<Utc>,
    },
}

impl SignalMessage {
    /// The peer this message is addressed to or reporting about.
    pub fn peer_id(&self) -> &str {
        match self {
            Self::Offer { to_peer_id, .. }
            | Self::Answer { to_peer_id, .. }
            | Self::IceCandidate { to_peer_id, .. } => to_peer_id,
            Self::MicState { peer_id, .. }
            | Self::VideoState { peer_id, .. }
            | Self::RequestParticipantState { peer_id }
            | Self::ParticipantState { peer_id, .. } => peer_id,
        }
    }
}

// ─── SignalingPort ──────────────────────────────────────────────────────────

/// Outbound half of the signaling channel.
///
/// Shared read-only by every session; no session may assume exclusive
/// access. A failed send surfaces as `SignalingUnavailable` and is never
/// fatal to a session by itself.
#[async_trait]
pub trait SignalingPort: Send + Sync {
    async fn send(&self, message: SignalMessage) -> Result<(), EngineError>;
}

// ─── Tests ──────────────────────────────────────────────────────────────────
