//! Negotiation engine for mesh WebRTC calls: perfect negotiation with
//! per-peer serialized queues, ICE candidate buffering, connection
//! recovery via ICE restart, and optimistic media state with server
//! reconciliation.

pub mod candidates;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod reconcile;
pub mod recovery;
pub mod remote;
pub mod session;
pub mod signaling;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::EngineConfig;
pub use engine::MeshEngine;
pub use error::EngineError;
pub use events::{EventBus, SessionEvent, SessionEventType};
pub use media::{CaptureDevice, LocalMediaController, LocalMediaState, SyncOutcome};
pub use negotiation::{NegotiationCoordinator, NegotiationRequest, SessionRegistry};
pub use peer::{
    ConnectionState, IceCandidateInit, MediaKind, PeerConnectionFactory, PeerConnector,
    RemoteTrack, SessionDescription, SignalingState, TrackHandle, WebRtcFactory,
};
pub use reconcile::{ConflictPolicy, SyncedTrackState, TrackStateReconciler};
pub use remote::{RemoteStreamInfo, RemoteStreamRegistry};
pub use session::{is_polite, PeerSession};
pub use signaling::{SignalMessage, SignalingPort};
