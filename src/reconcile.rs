// src/reconcile.rs
//
// Convergence between the optimistic local media state and the state the
// signaling server believes. The reconciler pulls the server copy on an
// interval (or immediately after a failed push) and resolves any
// divergence per the configured conflict policy. Resolution never
// bounces state back and forth: server-won fields are applied without a
// re-push, client-won fields are re-pushed without re-applying.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::events::{EventBus, SessionEvent};
use crate::media::LocalMediaController;
use crate::signaling::{SignalMessage, SignalingPort};

// ─── ConflictPolicy ─────────────────────────────────────────────────────────

/// Who wins when local and server state disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Server state is authoritative (default).
    ServerWins,
    /// Local state is authoritative; divergence is pushed back up.
    ClientWins,
    /// Per-field newest-timestamp wins.
    Merge,
}

impl ConflictPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server-wins" | "server_wins" | "server" => Some(Self::ServerWins),
            "client-wins" | "client_wins" | "client" => Some(Self::ClientWins),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown conflict policy '{s}'"))
    }
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self::ServerWins
    }
}

// ─── Server-side state ──────────────────────────────────────────────────────

/// The server's view of one participant's track state. Absent fields are
/// fields the server has no opinion on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedTrackState {
    pub is_muted: Option<bool>,
    pub is_video_off: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

// ─── TrackStateReconciler ───────────────────────────────────────────────────

pub struct TrackStateReconciler {
    self_id: String,
    config: EngineConfig,
    signaling: Arc<dyn SignalingPort>,
    media: Arc<LocalMediaController>,
    events: EventBus,
    cancel: CancellationToken,
}

impl TrackStateReconciler {
    pub fn new(
        self_id: impl Into<String>,
        config: EngineConfig,
        signaling: Arc<dyn SignalingPort>,
        media: Arc<LocalMediaController>,
        events: EventBus,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            config,
            signaling,
            media,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Start the periodic pull loop. A nudge (failed push) triggers an
    /// immediate out-of-cycle pull.
    pub fn spawn(self: &Arc<Self>, nudge: Arc<Notify>) {
        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reconciler.config.reconcile_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // interval fires immediately; skip the initial tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = reconciler.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = nudge.notified() => {
                        debug!("early reconcile pull after failed push");
                    }
                }
                reconciler.pull().await;
            }
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Ask the server for its copy of our state. The reply arrives as a
    /// `ParticipantState` signal routed to `handle_server_state`.
    pub async fn pull(&self) {
        let request = SignalMessage::RequestParticipantState {
            peer_id: self.self_id.clone(),
        };
        if let Err(e) = self.signaling.send(request).await {
            warn!("state pull request failed: {e}");
        }
    }

    /// Compare the server's state against ours and converge.
    pub async fn handle_server_state(&self, server: SyncedTrackState) {
        let local = self.media.state();

        let mic = server.is_muted.map(|m| !m).and_then(|server_enabled| {
            (server_enabled != local.mic_enabled).then_some(server_enabled)
        });
        let camera = server.is_video_off.map(|v| !v).and_then(|server_enabled| {
            (server_enabled != local.camera_enabled).then_some(server_enabled)
        });
        if mic.is_none() && camera.is_none() {
            return;
        }

        let server_newer = server.timestamp > local.updated_at;
        let server_wins = match self.config.conflict_policy {
            ConflictPolicy::ServerWins => true,
            ConflictPolicy::ClientWins => false,
            ConflictPolicy::Merge => server_newer,
        };

        if let Some(server_enabled) = mic {
            let resolved = if server_wins {
                server_enabled
            } else {
                local.mic_enabled
            };
            info!(
                "mic state conflict: local={} server={} resolved={resolved}",
                local.mic_enabled, server_enabled
            );
            self.events.emit(SessionEvent::conflict_resolved(
                "mic",
                local.mic_enabled,
                server_enabled,
                resolved,
            ));
        }
        if let Some(server_enabled) = camera {
            let resolved = if server_wins {
                server_enabled
            } else {
                local.camera_enabled
            };
            info!(
                "camera state conflict: local={} server={} resolved={resolved}",
                local.camera_enabled, server_enabled
            );
            self.events.emit(SessionEvent::conflict_resolved(
                "video",
                local.camera_enabled,
                server_enabled,
                resolved,
            ));
        }

        if server_wins {
            self.media.apply_reconciled(mic, camera);
        } else {
            self.push_local(&local, mic.is_some(), camera.is_some()).await;
        }
    }

    /// Re-assert the client-won fields upstream.
    async fn push_local(
        &self,
        local: &crate::media::LocalMediaState,
        mic_diverged: bool,
        camera_diverged: bool,
    ) {
        if mic_diverged {
            let push = self.signaling.send(SignalMessage::MicState {
                peer_id: self.self_id.clone(),
                is_muted: !local.mic_enabled,
                timestamp: local.updated_at,
            });
            if let Err(e) = push.await {
                warn!("mic state re-push failed: {e}");
            }
        }
        if camera_diverged {
            let push = self.signaling.send(SignalMessage::VideoState {
                peer_id: self.self_id.clone(),
                is_video_off: !local.camera_enabled,
                timestamp: local.updated_at,
            });
            if let Err(e) = push.await {
                warn!("camera state re-push failed: {e}");
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
