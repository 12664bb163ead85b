// src/media.rs
//
// Local media control: microphone/camera toggles, camera device
// switching, and screen share. State changes are optimistic — the local
// state and its event fire immediately, then the new state is pushed to
// the signaling server. A push that fails or times out downgrades to
// `PendingReconciliation`; local state is never rolled back.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EventBus, SessionEvent};
use crate::negotiation::NegotiationCoordinator;
use crate::peer::{MediaKind, TrackHandle};
use crate::session::PeerSession;
use crate::signaling::{SignalMessage, SignalingPort};

// ─── Capture seam ───────────────────────────────────────────────────────────

/// Source of local capture tracks. The production implementation sits on
/// whatever capture pipeline feeds the sample tracks; tests script it.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Acquire a live track of the given kind, optionally from a specific
    /// device.
    async fn acquire(
        &self,
        kind: MediaKind,
        device_id: Option<&str>,
    ) -> Result<TrackHandle, EngineError>;
}

// ─── State ──────────────────────────────────────────────────────────────────

/// Snapshot of the local participant's media state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMediaState {
    pub mic_enabled: bool,
    pub camera_enabled: bool,
    pub screen_sharing: bool,
    /// Host-forced mute; cannot be overridden locally while set.
    pub mic_forced_off_by_host: bool,
    /// Preferred camera device, remembered even while the camera is off.
    pub camera_device_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for LocalMediaState {
    fn default() -> Self {
        Self {
            mic_enabled: false,
            camera_enabled: false,
            screen_sharing: false,
            mic_forced_off_by_host: false,
            camera_device_id: None,
            updated_at: Utc::now(),
        }
    }
}

/// Result of a media toggle with respect to the signaling server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The server acknowledged the new state.
    Confirmed,
    /// The push failed or timed out; the reconciler will converge state
    /// on its next pull.
    PendingReconciliation,
    /// A host-moderation override contradicts the request; nothing was
    /// changed or pushed.
    Ignored,
}

// ─── LocalMediaController ───────────────────────────────────────────────────

/// Drives local track lifecycle across every peer session.
pub struct LocalMediaController {
    self_id: String,
    config: EngineConfig,
    capture: Arc<dyn CaptureDevice>,
    signaling: Arc<dyn SignalingPort>,
    coordinator: Arc<NegotiationCoordinator>,
    events: EventBus,
    state: Mutex<LocalMediaState>,
    audio_track: Mutex<Option<TrackHandle>>,
    video_track: Mutex<Option<TrackHandle>>,
    screen_track: Mutex<Option<TrackHandle>>,
    /// Poked when a push fails so the reconciler pulls ahead of schedule.
    reconcile_nudge: Arc<Notify>,
}

impl LocalMediaController {
    pub fn new(
        self_id: impl Into<String>,
        config: EngineConfig,
        capture: Arc<dyn CaptureDevice>,
        signaling: Arc<dyn SignalingPort>,
        coordinator: Arc<NegotiationCoordinator>,
        events: EventBus,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            config,
            capture,
            signaling,
            coordinator,
            events,
            state: Mutex::new(LocalMediaState::default()),
            audio_track: Mutex::new(None),
            video_track: Mutex::new(None),
            screen_track: Mutex::new(None),
            reconcile_nudge: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> LocalMediaState {
        self.state.lock().unwrap().clone()
    }

    pub fn reconcile_nudge(&self) -> Arc<Notify> {
        Arc::clone(&self.reconcile_nudge)
    }

    /// Apply a state correction decided by the reconciler. Bypasses the
    /// host-forced-mute guard (the server is the authority here) and does
    /// not push back, to avoid ping-ponging with the server.
    pub(crate) fn apply_reconciled(&self, mic_enabled: Option<bool>, camera_enabled: Option<bool>) {
        let mut state = self.state.lock().unwrap();
        if let Some(enabled) = mic_enabled {
            state.mic_enabled = enabled;
            if let Some(track) = self.audio_track.lock().unwrap().as_ref() {
                track.set_enabled(enabled);
            }
            self.events
                .emit(SessionEvent::media_state_changed(
                    MediaKind::Audio,
                    enabled,
                    state.mic_forced_off_by_host,
                ));
        }
        if let Some(enabled) = camera_enabled {
            state.camera_enabled = enabled;
            if let Some(track) = self.video_track.lock().unwrap().as_ref() {
                track.set_enabled(enabled);
            }
            self.events
                .emit(SessionEvent::media_state_changed(MediaKind::Video, enabled, false));
        }
        state.updated_at = Utc::now();
    }

    // ── Microphone ──────────────────────────────────────────────────────

    pub async fn set_microphone_enabled(&self, enabled: bool) -> Result<SyncOutcome, EngineError> {
        // A host-forced mute cannot be overridden locally; the request is
        // dropped, not failed.
        if enabled && self.state.lock().unwrap().mic_forced_off_by_host {
            info!("unmute request ignored: host-forced mute in effect");
            return Ok(SyncOutcome::Ignored);
        }

        let existing = self.audio_track.lock().unwrap().clone();
        match existing {
            Some(track) => track.set_enabled(enabled),
            None if enabled => {
                let track = self.capture.acquire(MediaKind::Audio, None).await?;
                track.set_enabled(true);
                *self.audio_track.lock().unwrap() = Some(track.clone());
                self.add_everywhere(&track).await;
            }
            None => {}
        }

        let timestamp = {
            let mut state = self.state.lock().unwrap();
            state.mic_enabled = enabled;
            state.updated_at = Utc::now();
            state.updated_at
        };
        info!("microphone {}", if enabled { "enabled" } else { "muted" });
        self.events
            .emit(SessionEvent::media_state_changed(MediaKind::Audio, enabled, false));

        Ok(self
            .push(SignalMessage::MicState {
                peer_id: self.self_id.clone(),
                is_muted: !enabled,
                timestamp,
            })
            .await)
    }

    /// Host moderation: force the microphone off (or lift the force).
    /// Lifting it does not re-enable the mic; the participant opts back
    /// in themselves.
    pub async fn set_host_forced_mute(&self, forced: bool) -> Result<SyncOutcome, EngineError> {
        let (enabled, timestamp) = {
            let mut state = self.state.lock().unwrap();
            state.mic_forced_off_by_host = forced;
            if forced {
                state.mic_enabled = false;
            }
            state.updated_at = Utc::now();
            (state.mic_enabled, state.updated_at)
        };
        if forced {
            if let Some(track) = self.audio_track.lock().unwrap().as_ref() {
                track.set_enabled(false);
            }
        }
        info!(
            "host-forced mute {}",
            if forced { "applied" } else { "lifted" }
        );
        self.events
            .emit(SessionEvent::media_state_changed(MediaKind::Audio, enabled, forced));

        Ok(self
            .push(SignalMessage::MicState {
                peer_id: self.self_id.clone(),
                is_muted: !enabled,
                timestamp,
            })
            .await)
    }

    // ── Camera ──────────────────────────────────────────────────────────

    /// Toggle the camera, optionally switching device. A device switch
    /// while enabled re-acquires and replaces the track in every session
    /// without renegotiation; a switch while disabled is only recorded
    /// and takes effect on the next enable.
    pub async fn set_camera_enabled(
        &self,
        enabled: bool,
        device_id: Option<String>,
    ) -> Result<SyncOutcome, EngineError> {
        let device_switched = device_id.is_some();
        if let Some(id) = device_id {
            self.state.lock().unwrap().camera_device_id = Some(id);
        }

        if enabled {
            let need_acquire = device_switched || self.video_track.lock().unwrap().is_none();
            if need_acquire {
                let device = self.state.lock().unwrap().camera_device_id.clone();
                let track = self.capture.acquire(MediaKind::Video, device.as_deref()).await?;
                track.set_enabled(true);
                let previous = self.video_track.lock().unwrap().replace(track.clone());
                match previous {
                    Some(old) => self.replace_everywhere(&old.id, &track).await,
                    None => self.add_everywhere(&track).await,
                }
            } else if let Some(track) = self.video_track.lock().unwrap().clone() {
                track.set_enabled(true);
            }
        } else if let Some(track) = self.video_track.lock().unwrap().clone() {
            track.set_enabled(false);
        }

        let timestamp = {
            let mut state = self.state.lock().unwrap();
            state.camera_enabled = enabled;
            state.updated_at = Utc::now();
            state.updated_at
        };
        info!("camera {}", if enabled { "enabled" } else { "disabled" });
        self.events
            .emit(SessionEvent::media_state_changed(MediaKind::Video, enabled, false));

        Ok(self
            .push(SignalMessage::VideoState {
                peer_id: self.self_id.clone(),
                is_video_off: !enabled,
                timestamp,
            })
            .await)
    }

    // ── Screen share ────────────────────────────────────────────────────

    pub async fn start_screen_share(&self) -> Result<(), EngineError> {
        if self.screen_track.lock().unwrap().is_some() {
            return Ok(());
        }
        let track = self.capture.acquire(MediaKind::Screen, None).await?;
        track.set_enabled(true);
        *self.screen_track.lock().unwrap() = Some(track.clone());
        self.add_everywhere(&track).await;

        self.state.lock().unwrap().screen_sharing = true;
        info!("screen share started");
        self.events
            .emit(SessionEvent::media_state_changed(MediaKind::Screen, true, false));
        Ok(())
    }

    pub async fn stop_screen_share(&self) -> Result<(), EngineError> {
        let Some(track) = self.screen_track.lock().unwrap().take() else {
            return Ok(());
        };
        for session in self.coordinator.registry.all() {
            if let Err(e) = session.connector.remove_track(&track.id).await {
                warn!("peer '{}': screen track removal: {e}", session.remote_id);
            }
            let _ = self.coordinator.request_negotiation(&session.remote_id).await;
        }

        self.state.lock().unwrap().screen_sharing = false;
        info!("screen share stopped");
        self.events
            .emit(SessionEvent::media_state_changed(MediaKind::Screen, false, false));
        Ok(())
    }

    // ── Session attachment ──────────────────────────────────────────────

    /// Attach every live local track to a newly created session, then
    /// request a (debounced) renegotiation for it.
    pub async fn attach_to_session(&self, session: &Arc<PeerSession>) {
        let tracks: Vec<TrackHandle> = [
            self.audio_track.lock().unwrap().clone(),
            self.video_track.lock().unwrap().clone(),
            self.screen_track.lock().unwrap().clone(),
        ]
        .into_iter()
        .flatten()
        .collect();
        if tracks.is_empty() {
            return;
        }
        for track in &tracks {
            if let Err(e) = session.connector.add_track(track).await {
                warn!("peer '{}': add_track: {e}", session.remote_id);
            }
        }
        let _ = self.coordinator.request_negotiation(&session.remote_id).await;
    }

    async fn add_everywhere(&self, track: &TrackHandle) {
        for session in self.coordinator.registry.all() {
            if let Err(e) = session.connector.add_track(track).await {
                warn!("peer '{}': add_track: {e}", session.remote_id);
            }
            let _ = self.coordinator.request_negotiation(&session.remote_id).await;
        }
    }

    /// Swap a track in every session concurrently. Each peer retries
    /// independently (with a growing delay between attempts) so one bad
    /// connection cannot hold the others back.
    async fn replace_everywhere(&self, old_id: &str, track: &TrackHandle) {
        let sessions = self.coordinator.registry.all();
        let replacements = sessions
            .iter()
            .map(|session| self.replace_with_retry(session, old_id, track));
        futures::future::join_all(replacements).await;
    }

    async fn replace_with_retry(&self, session: &Arc<PeerSession>, old_id: &str, track: &TrackHandle) {
        let attempts = self.config.track_replace_attempts.max(1);
        for attempt in 1..=attempts {
            match session.connector.replace_track(old_id, track).await {
                Ok(()) => {
                    debug!(
                        "peer '{}': {} track replaced (attempt {attempt})",
                        session.remote_id,
                        track.kind.as_str()
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        "peer '{}': track replacement attempt {attempt}/{attempts} failed: {e}",
                        session.remote_id
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.track_replace_delay * attempt).await;
                    }
                }
            }
        }
        self.events.emit(SessionEvent::replacement_failed(
            &session.remote_id,
            track.kind,
            attempts,
        ));
    }

    // ── Push ────────────────────────────────────────────────────────────

    async fn push(&self, message: SignalMessage) -> SyncOutcome {
        let send = self.signaling.send(message);
        match tokio::time::timeout(self.config.sync_push_timeout, send).await {
            Ok(Ok(())) => SyncOutcome::Confirmed,
            Ok(Err(e)) => {
                warn!("state push failed: {e}");
                self.reconcile_nudge.notify_one();
                SyncOutcome::PendingReconciliation
            }
            Err(_) => {
                warn!("state push timed out");
                self.reconcile_nudge.notify_one();
                SyncOutcome::PendingReconciliation
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
