use thiserror::Error;

// ─── EngineError ────────────────────────────────────────────────────────────

/// Error taxonomy for the negotiation engine.
///
/// Errors scoped to a single peer (negotiation, track replacement) are
/// contained: they fail that peer's pending task and surface as events,
/// but never abort other sessions or the local media pipeline. Capture
/// errors propagate to the caller of the enabling operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Capture device access was refused by the platform / user.
    #[error("capture permission denied for {device}")]
    PermissionDenied { device: String },

    /// The requested (or default) capture device is unavailable.
    #[error("capture device not found: {device}")]
    DeviceNotFound { device: String },

    /// Replacing a local track on one peer's connection failed after all
    /// retries. Non-fatal: that peer keeps the stale track.
    #[error("track replacement failed for peer '{peer_id}': {reason}")]
    TrackReplacementFailed { peer_id: String, reason: String },

    /// The connection to a peer failed and recovery attempts are exhausted.
    #[error("connection to peer '{peer_id}' failed after {attempts} recovery attempt(s)")]
    ConnectionFailed { peer_id: String, attempts: u32 },

    /// SDP offer/answer protocol violation or engine failure for one task.
    #[error("negotiation failed for peer '{peer_id}': {reason}")]
    NegotiationFailed { peer_id: String, reason: String },

    /// The signaling transport refused or could not deliver a send.
    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(String),

    /// The session was closed while the operation was queued or in flight.
    #[error("session for peer '{peer_id}' is closed")]
    SessionClosed { peer_id: String },

    /// No session exists for the addressed peer.
    #[error("no session for peer '{peer_id}'")]
    SessionNotFound { peer_id: String },
}

impl EngineError {
    pub fn negotiation(peer_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NegotiationFailed {
            peer_id: peer_id.into(),
            reason: reason.into(),
        }
    }

    pub fn closed(peer_id: impl Into<String>) -> Self {
        Self::SessionClosed {
            peer_id: peer_id.into(),
        }
    }

    /// True for errors scoped to one peer's session (contained), false for
    /// errors the caller must handle (capture, signaling transport).
    pub fn is_peer_scoped(&self) -> bool {
        matches!(
            self,
            Self::TrackReplacementFailed { .. }
                | Self::ConnectionFailed { .. }
                | Self::NegotiationFailed { .. }
                | Self::SessionClosed { .. }
                | Self::SessionNotFound { .. }
        )
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
