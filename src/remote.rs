// src/remote.rs
//
// Bookkeeping for media received from remote peers. Tracks are grouped
// per peer into camera/mic versus screen-share slots; consumers observe
// the registry through stream added/removed events.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::events::{EventBus, SessionEvent};
use crate::peer::{MediaKind, RemoteTrack};

/// Live remote tracks for one peer. A slot is `None` until the
/// corresponding track arrives.
#[derive(Debug, Clone, Default)]
pub struct RemoteStreamInfo {
    pub audio: Option<RemoteTrack>,
    pub video: Option<RemoteTrack>,
    pub screen: Option<RemoteTrack>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl RemoteStreamInfo {
    fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none() && self.screen.is_none()
    }
}

/// All remote media keyed by peer id.
pub struct RemoteStreamRegistry {
    streams: RwLock<HashMap<String, RemoteStreamInfo>>,
    events: EventBus,
}

impl RemoteStreamRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// A track from `peer_id` started producing media.
    pub fn track_started(&self, peer_id: &str, track: RemoteTrack) {
        let kind = track.kind;
        let now = Utc::now();
        {
            let mut streams = self.streams.write().unwrap();
            let info = streams.entry(peer_id.to_string()).or_default();
            if info.created_at.is_none() {
                info.created_at = Some(now);
            }
            info.last_updated = Some(now);
            match kind {
                MediaKind::Audio => info.audio = Some(track),
                MediaKind::Video => info.video = Some(track),
                MediaKind::Screen => info.screen = Some(track),
            }
        }
        debug!("peer '{peer_id}': remote {} track started", kind.as_str());
        self.events.emit(SessionEvent::stream_added(peer_id, kind));
    }

    /// A track from `peer_id` ended. The peer's entry is dropped once its
    /// last track is gone.
    pub fn track_stopped(&self, peer_id: &str, track: &RemoteTrack) {
        let removed = {
            let mut streams = self.streams.write().unwrap();
            let Some(info) = streams.get_mut(peer_id) else {
                return;
            };
            let slot = match track.kind {
                MediaKind::Audio => &mut info.audio,
                MediaKind::Video => &mut info.video,
                MediaKind::Screen => &mut info.screen,
            };
            match slot {
                Some(current) if current.id == track.id => *slot = None,
                _ => return,
            }
            info.last_updated = Some(Utc::now());
            if info.is_empty() {
                streams.remove(peer_id);
            }
            true
        };
        if removed {
            debug!("peer '{peer_id}': remote {} track stopped", track.kind.as_str());
            self.events
                .emit(SessionEvent::stream_removed(peer_id, track.kind));
        }
    }

    /// Drop every track belonging to a peer (session teardown).
    pub fn remove_peer(&self, peer_id: &str) {
        let info = self.streams.write().unwrap().remove(peer_id);
        let Some(info) = info else { return };
        for track in [info.audio, info.video, info.screen].into_iter().flatten() {
            self.events
                .emit(SessionEvent::stream_removed(peer_id, track.kind));
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<RemoteStreamInfo> {
        self.streams.read().unwrap().get(peer_id).cloned()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.streams.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.streams.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().unwrap().is_empty()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
