// src/events.rs
//
// Event bus for the mesh engine.
//
// Every externally observable state change (remote streams appearing,
// local mute/video flips, connection transitions, terminal rebuild
// signals, reconciliation outcomes) is represented as a `SessionEvent`.
// A single `EventBus` backed by a `tokio::sync::broadcast` channel fans
// out each event to every consumer: the embedding UI, diagnostics, and
// tests.
//
// ────────────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::peer::{ConnectionState, MediaKind};

// ─── Event types ────────────────────────────────────────────────────────────

/// Canonical event type string, used in JSON payloads and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionEventType {
    #[serde(rename = "stream.added")]
    StreamAdded,
    #[serde(rename = "stream.removed")]
    StreamRemoved,
    #[serde(rename = "mic.state-changed")]
    MicStateChanged,
    #[serde(rename = "video.state-changed")]
    VideoStateChanged,
    #[serde(rename = "screen.state-changed")]
    ScreenStateChanged,
    #[serde(rename = "connection.state-changed")]
    ConnectionStateChanged,
    #[serde(rename = "session.needs-rebuild")]
    SessionNeedsRebuild,
    #[serde(rename = "state.conflict-resolved")]
    StateConflictResolved,
    #[serde(rename = "track.replacement-failed")]
    TrackReplacementFailed,
}

impl SessionEventType {
    /// Stable string representation used in logs and filter expressions.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StreamAdded => "stream.added",
            Self::StreamRemoved => "stream.removed",
            Self::MicStateChanged => "mic.state-changed",
            Self::VideoStateChanged => "video.state-changed",
            Self::ScreenStateChanged => "screen.state-changed",
            Self::ConnectionStateChanged => "connection.state-changed",
            Self::SessionNeedsRebuild => "session.needs-rebuild",
            Self::StateConflictResolved => "state.conflict-resolved",
            Self::TrackReplacementFailed => "track.replacement-failed",
        }
    }
}

impl std::fmt::Display for SessionEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Event payloads ─────────────────────────────────────────────────────────

/// Metadata attached to remote stream lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPayload {
    pub peer_id: String,
    pub kind: MediaKind,
}

/// Metadata attached to local media state changes (mic / camera / screen).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaStatePayload {
    pub kind: MediaKind,
    pub enabled: bool,
    /// True when the change was applied by a host-moderation override
    /// rather than local user intent.
    pub forced_by_host: bool,
}

/// Metadata attached to connection state transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPayload {
    pub peer_id: String,
    pub state: ConnectionState,
}

/// Metadata attached to the terminal needs-rebuild signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildPayload {
    pub peer_id: String,
    pub reason: String,
}

/// Metadata attached to a resolved local/server state conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictPayload {
    /// Which flag diverged: "mic" or "video".
    pub field: String,
    pub local_value: bool,
    pub server_value: bool,
    /// Value both sides hold after resolution.
    pub resolved_value: bool,
}

/// Metadata attached to an exhausted per-peer track replacement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplacementPayload {
    pub peer_id: String,
    pub kind: MediaKind,
    pub attempts: u32,
}

/// Type-safe union of all possible payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Stream(StreamPayload),
    MediaState(MediaStatePayload),
    Connection(ConnectionPayload),
    Rebuild(RebuildPayload),
    Conflict(ConflictPayload),
    Replacement(ReplacementPayload),
}

// ─── The event envelope ─────────────────────────────────────────────────────

/// A fully self-describing event, ready for serialisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Globally unique event identifier (format: `evt_<uuid-v4>`).
    pub id: String,

    /// Event type.
    #[serde(rename = "type")]
    pub event_type: SessionEventType,

    /// ISO-8601 timestamp (UTC).
    pub created_at: DateTime<Utc>,

    /// Type-specific payload.
    pub data: EventPayload,
}

impl SessionEvent {
    // ── Constructors ────────────────────────────────────────────────────

    pub fn stream_added(peer_id: &str, kind: MediaKind) -> Self {
        Self::new(
            SessionEventType::StreamAdded,
            EventPayload::Stream(StreamPayload {
                peer_id: peer_id.to_string(),
                kind,
            }),
        )
    }

    pub fn stream_removed(peer_id: &str, kind: MediaKind) -> Self {
        Self::new(
            SessionEventType::StreamRemoved,
            EventPayload::Stream(StreamPayload {
                peer_id: peer_id.to_string(),
                kind,
            }),
        )
    }

    pub fn media_state_changed(kind: MediaKind, enabled: bool, forced_by_host: bool) -> Self {
        let event_type = match kind {
            MediaKind::Audio => SessionEventType::MicStateChanged,
            MediaKind::Video => SessionEventType::VideoStateChanged,
            MediaKind::Screen => SessionEventType::ScreenStateChanged,
        };
        Self::new(
            event_type,
            EventPayload::MediaState(MediaStatePayload {
                kind,
                enabled,
                forced_by_host,
            }),
        )
    }

    pub fn connection_state_changed(peer_id: &str, state: ConnectionState) -> Self {
        Self::new(
            SessionEventType::ConnectionStateChanged,
            EventPayload::Connection(ConnectionPayload {
                peer_id: peer_id.to_string(),
                state,
            }),
        )
    }

    pub fn needs_rebuild(peer_id: &str, reason: &str) -> Self {
        Self::new(
            SessionEventType::SessionNeedsRebuild,
            EventPayload::Rebuild(RebuildPayload {
                peer_id: peer_id.to_string(),
                reason: reason.to_string(),
            }),
        )
    }

    pub fn conflict_resolved(
        field: &str,
        local_value: bool,
        server_value: bool,
        resolved_value: bool,
    ) -> Self {
        Self::new(
            SessionEventType::StateConflictResolved,
            EventPayload::Conflict(ConflictPayload {
                field: field.to_string(),
                local_value,
                server_value,
                resolved_value,
            }),
        )
    }

    pub fn replacement_failed(peer_id: &str, kind: MediaKind, attempts: u32) -> Self {
        Self::new(
            SessionEventType::TrackReplacementFailed,
            EventPayload::Replacement(ReplacementPayload {
                peer_id: peer_id.to_string(),
                kind,
                attempts,
            }),
        )
    }

    // ── Private ─────────────────────────────────────────────────────────

    fn new(event_type: SessionEventType, data: EventPayload) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            event_type,
            created_at: Utc::now(),
            data,
        }
    }

    /// Extract the peer id for peer-scoped events (`None` for local media
    /// state and reconciliation events, which concern the local
    /// participant).
    pub fn peer_id(&self) -> Option<&str> {
        match &self.data {
            EventPayload::Stream(p) => Some(&p.peer_id),
            EventPayload::Connection(p) => Some(&p.peer_id),
            EventPayload::Rebuild(p) => Some(&p.peer_id),
            EventPayload::Replacement(p) => Some(&p.peer_id),
            EventPayload::MediaState(_) | EventPayload::Conflict(_) => None,
        }
    }
}

// ─── EventBus ───────────────────────────────────────────────────────────────

/// Broadcast-based fan-out channel for `SessionEvent`.
///
/// Capacity is generous (1024 events) -- subscribers that lag more than
/// that will skip events (same semantic as `broadcast::RecvError::Lagged`).
///
/// The bus is **cheap to clone** (interior `Arc`).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a new bus with the default capacity.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Create a new bus with a custom capacity.
    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _) = broadcast::channel(cap);
        Self { tx }
    }

    /// Publish an event. Returns the number of active subscribers that will
    /// receive it. Silently succeeds even if there are no subscribers.
    pub fn emit(&self, event: SessionEvent) -> usize {
        debug!(event_type = %event.event_type, event_id = %event.id, "event emitted");
        // broadcast::send returns Err only when there are 0 receivers, which
        // is normal before any consumer has subscribed.
        self.tx.send(event).unwrap_or(0)
    }

    /// Obtain a new receiver. Each receiver gets an independent copy of
    /// every event published *after* this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
