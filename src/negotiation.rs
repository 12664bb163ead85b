// src/negotiation.rs
//
// The negotiation coordinator: one politeness flag and one serialized
// task queue per remote peer, implementing Perfect Negotiation. The
// impolite side never offers (it only answers), so glare can only happen
// against a remote impolite offer, and the polite side resolves it by
// rolling back.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EventBus, SessionEvent};
use crate::peer::{
    ConnectionState, ConnectorEvent, IceCandidateInit, PeerConnectionFactory, SessionDescription,
    SignalingState,
};
use crate::recovery;
use crate::remote::RemoteStreamRegistry;
use crate::session::{is_polite, NegotiationTask, PeerSession, TaskKind};
use crate::signaling::{SignalMessage, SignalingPort};

// ─── SessionRegistry ────────────────────────────────────────────────────────

/// Owned map from participant id to session. Exactly one session exists
/// per remote participant at any time; the registry is passed by
/// reference to collaborators (media controller) rather than held as
/// ambient shared state.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.read().unwrap().get(peer_id).cloned()
    }

    pub fn insert(&self, session: Arc<PeerSession>) {
        let mut sessions = self.sessions.write().unwrap();
        sessions.insert(session.remote_id.clone(), session);
    }

    pub fn remove(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.write().unwrap().remove(peer_id)
    }

    /// Snapshot of every live session.
    pub fn all(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Request outcome ────────────────────────────────────────────────────────

/// What became of a local negotiation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRequest {
    /// An offer task will be queued when the debounce window closes.
    Scheduled,
    /// A window is already open; this trigger merged into it.
    Debounced,
    /// This side is impolite for the pair; local offers are suppressed
    /// and the peer is expected to offer instead.
    Suppressed,
}

// ─── NegotiationCoordinator ─────────────────────────────────────────────────

/// Serializes every SDP exchange per peer and resolves offer collisions
/// deterministically.
pub struct NegotiationCoordinator {
    pub self_id: String,
    config: EngineConfig,
    signaling: Arc<dyn SignalingPort>,
    factory: Arc<dyn PeerConnectionFactory>,
    pub registry: Arc<SessionRegistry>,
    pub remote_streams: Arc<RemoteStreamRegistry>,
    events: EventBus,
}

impl NegotiationCoordinator {
    pub fn new(
        self_id: impl Into<String>,
        config: EngineConfig,
        signaling: Arc<dyn SignalingPort>,
        factory: Arc<dyn PeerConnectionFactory>,
        events: EventBus,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            config,
            signaling,
            factory,
            registry: Arc::new(SessionRegistry::new()),
            remote_streams: Arc::new(RemoteStreamRegistry::new(events.clone())),
            events,
        }
    }

    // ── Session lifecycle ───────────────────────────────────────────────

    /// Get the existing session for a peer, or create one on first need
    /// to communicate (local or remote intent).
    pub async fn ensure_session(
        self: &Arc<Self>,
        peer_id: &str,
    ) -> Result<Arc<PeerSession>, EngineError> {
        if let Some(session) = self.registry.get(peer_id) {
            return Ok(session);
        }

        let (connector, events_rx) = self.factory.create(peer_id).await?;
        let polite = is_polite(&self.self_id, peer_id);
        let session = Arc::new(PeerSession::new(
            peer_id.to_string(),
            polite,
            connector,
            self.config.candidate_buffer_cap,
        ));
        info!(
            "session created for peer '{peer_id}' (polite={polite}, self='{}')",
            self.self_id
        );
        self.registry.insert(session.clone());
        self.spawn_connector_loop(session.clone(), events_rx);
        Ok(session)
    }

    /// Close and remove a peer's session. Queued and in-flight tasks are
    /// rejected before this returns.
    pub async fn close_session(&self, peer_id: &str) -> Result<(), EngineError> {
        let session = self
            .registry
            .remove(peer_id)
            .ok_or_else(|| EngineError::SessionNotFound {
                peer_id: peer_id.to_string(),
            })?;
        session.close();
        session.connector.close().await;
        self.remote_streams.remove_peer(peer_id);
        Ok(())
    }

    pub async fn close_all(&self) {
        for session in self.registry.all() {
            let _ = self.close_session(&session.remote_id).await;
        }
    }

    // ── Local negotiation intent ────────────────────────────────────────

    /// Request a renegotiation with a peer after local tracks changed.
    ///
    /// Debounced with a fixed quiet period so several rapid track changes
    /// enqueue a single offer. On the impolite side the request is
    /// suppressed entirely.
    pub async fn request_negotiation(
        self: &Arc<Self>,
        peer_id: &str,
    ) -> Result<NegotiationRequest, EngineError> {
        let session = self.ensure_session(peer_id).await?;
        if session.is_closed() {
            return Err(EngineError::closed(peer_id));
        }
        if !session.polite {
            debug!("peer '{peer_id}': impolite side, suppressing local offer");
            return Ok(NegotiationRequest::Suppressed);
        }

        use std::sync::atomic::Ordering;
        if session.debounce_armed.swap(true, Ordering::SeqCst) {
            return Ok(NegotiationRequest::Debounced);
        }

        let coordinator = Arc::clone(self);
        let session = Arc::clone(&session);
        let debounce = self.config.negotiation_debounce;
        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancel.cancelled() => {
                    session.debounce_armed.store(false, Ordering::SeqCst);
                }
                _ = tokio::time::sleep(debounce) => {
                    session.debounce_armed.store(false, Ordering::SeqCst);
                    let (task, _rx) = NegotiationTask::new(TaskKind::Offer);
                    session.enqueue(task);
                    coordinator.schedule_drain(&session);
                }
            }
        });
        Ok(NegotiationRequest::Scheduled)
    }

    /// Enqueue an urgent ICE-restart task and return its completion
    /// receiver. Used by connection recovery.
    pub fn enqueue_ice_restart(
        self: &Arc<Self>,
        session: &Arc<PeerSession>,
    ) -> oneshot::Receiver<Result<(), EngineError>> {
        let (task, rx) = NegotiationTask::new(TaskKind::IceRestart);
        session.enqueue(task);
        self.schedule_drain(session);
        rx
    }

    // ── Queue drain ─────────────────────────────────────────────────────

    /// Start a drain task unless one is already running. `negotiating`
    /// guarantees at most one offer/answer cycle in flight per session.
    pub fn schedule_drain(self: &Arc<Self>, session: &Arc<PeerSession>) {
        use std::sync::atomic::Ordering;
        if session.negotiating.swap(true, Ordering::SeqCst) {
            return;
        }
        let coordinator = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            coordinator.drain_queue(session).await;
        });
    }

    async fn drain_queue(self: Arc<Self>, session: Arc<PeerSession>) {
        use std::sync::atomic::Ordering;
        loop {
            // A closed session (engine-side or connector-side) fails every
            // remaining task instead of negotiating against a dead
            // connection.
            if session.is_closed()
                || session.connector.connection_state() == ConnectionState::Closed
            {
                session.fail_all_queued();
                session.negotiating.store(false, Ordering::SeqCst);
                return;
            }

            let Some(task) = session.pop_task() else {
                session.negotiating.store(false, Ordering::SeqCst);
                // Re-check: a task enqueued after the pop but before the
                // flag cleared must not be stranded.
                if session.queue_len() > 0 && !session.negotiating.swap(true, Ordering::SeqCst) {
                    continue;
                }
                return;
            };

            let result = match task.kind {
                TaskKind::Offer => self.execute_offer(&session, false).await,
                TaskKind::IceRestart => self.execute_offer(&session, true).await,
            };
            if let Err(ref e) = result {
                warn!("peer '{}': {:?} task failed: {e}", session.remote_id, task.kind);
            }
            task.complete(result);
        }
    }

    /// One full offer cycle: create+set local offer, send it, await the
    /// answer. The queue does not advance until the cycle finishes, so
    /// local state is back to stable before the next task.
    async fn execute_offer(
        &self,
        session: &Arc<PeerSession>,
        ice_restart: bool,
    ) -> Result<(), EngineError> {
        if session.is_closed() {
            return Err(EngineError::closed(&session.remote_id));
        }

        let offer = session.connector.create_offer(ice_restart).await?;

        let (tx, rx) = oneshot::channel();
        session.install_answer_waiter(tx);

        if let Err(e) = self
            .signaling
            .send(SignalMessage::Offer {
                to_peer_id: session.remote_id.clone(),
                sdp: offer.sdp,
            })
            .await
        {
            session.take_answer_waiter();
            return Err(e);
        }
        debug!(
            "peer '{}': offer sent (ice_restart={ice_restart})",
            session.remote_id
        );

        tokio::select! {
            _ = session.cancel.cancelled() => Err(EngineError::closed(&session.remote_id)),
            outcome = tokio::time::timeout(self.config.answer_timeout, rx) => match outcome {
                Err(_) => {
                    session.take_answer_waiter();
                    Err(EngineError::negotiation(
                        &session.remote_id,
                        "timed out waiting for answer",
                    ))
                }
                Ok(Err(_)) => Err(EngineError::closed(&session.remote_id)),
                Ok(Ok(result)) => result,
            },
        }
    }

    // ── Remote SDP handling ─────────────────────────────────────────────

    /// Apply a remote offer. Answered inline, never queued.
    ///
    /// Collision rule: with a local offer pending, the polite side rolls
    /// back and accepts the incoming offer; the impolite side discards it
    /// and expects the (polite) remote to roll back instead. A rollback
    /// failure is fatal for the session: partial negotiation state after
    /// a failed rollback cannot be trusted.
    pub async fn handle_remote_offer(
        self: &Arc<Self>,
        peer_id: &str,
        sdp: String,
    ) -> Result<(), EngineError> {
        let session = self.ensure_session(peer_id).await?;
        if session.is_closed() {
            return Err(EngineError::closed(peer_id));
        }

        let mut superseded = None;
        if session.connector.signaling_state() == SignalingState::HaveLocalOffer {
            if !session.polite {
                info!("peer '{peer_id}': offer collision, impolite side discards remote offer");
                return Ok(());
            }
            info!("peer '{peer_id}': offer collision, polite side rolls back");
            if let Err(e) = session.connector.rollback_local_description().await {
                warn!("peer '{peer_id}': rollback failed: {e}");
                self.signal_rebuild(&session, "rollback failed").await;
                return Err(EngineError::negotiation(
                    peer_id,
                    format!("rollback failed: {e}"),
                ));
            }
            superseded = session.take_answer_waiter();
        }

        let answered = self.answer_offer(&session, peer_id, sdp).await;

        // The rolled-back offer's waiter resolves only once the incoming
        // cycle is settled. The drain loop is parked on it, so the next
        // queued offer cannot start mid-answer.
        if let Some(waiter) = superseded {
            let _ = waiter.send(Err(EngineError::negotiation(
                peer_id,
                "offer rolled back, superseded by remote offer",
            )));
        }
        answered
    }

    /// Set the remote offer, release buffered candidates and send back an
    /// answer.
    async fn answer_offer(
        &self,
        session: &Arc<PeerSession>,
        peer_id: &str,
        sdp: String,
    ) -> Result<(), EngineError> {
        session
            .connector
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        self.after_remote_description(session).await;

        let answer = session.connector.create_answer().await?;
        self.signaling
            .send(SignalMessage::Answer {
                to_peer_id: peer_id.to_string(),
                sdp: answer.sdp,
            })
            .await?;
        debug!("peer '{peer_id}': answered remote offer");
        Ok(())
    }

    /// Apply a remote answer. Only valid with a local offer pending; any
    /// other state is a protocol violation that fails the task, not the
    /// session.
    pub async fn handle_remote_answer(
        &self,
        peer_id: &str,
        sdp: String,
    ) -> Result<(), EngineError> {
        let session = self
            .registry
            .get(peer_id)
            .ok_or_else(|| EngineError::SessionNotFound {
                peer_id: peer_id.to_string(),
            })?;

        let state = session.connector.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            return Err(EngineError::negotiation(
                peer_id,
                format!("answer received in state {state:?}"),
            ));
        }

        let applied = session
            .connector
            .set_remote_description(SessionDescription::answer(sdp))
            .await;

        match applied {
            Ok(()) => {
                self.after_remote_description(&session).await;
                if let Some(waiter) = session.take_answer_waiter() {
                    let _ = waiter.send(Ok(()));
                }
                Ok(())
            }
            Err(e) => {
                if let Some(waiter) = session.take_answer_waiter() {
                    let _ = waiter.send(Err(EngineError::negotiation(
                        peer_id,
                        "remote answer could not be applied",
                    )));
                }
                Err(e)
            }
        }
    }

    // ── Candidates ──────────────────────────────────────────────────────

    /// Apply a remote ICE candidate, or buffer it until a remote
    /// description exists. Apply failures are contained (logged).
    pub async fn handle_remote_candidate(
        self: &Arc<Self>,
        peer_id: &str,
        candidate: IceCandidateInit,
    ) -> Result<(), EngineError> {
        use std::sync::atomic::Ordering;
        let session = self.ensure_session(peer_id).await?;
        if session.is_closed() {
            return Err(EngineError::closed(peer_id));
        }

        if session.remote_description_set.load(Ordering::SeqCst) {
            if let Err(e) = session.connector.add_ice_candidate(candidate).await {
                warn!("peer '{peer_id}': dropping unusable remote candidate: {e}");
            }
        } else {
            session.pending_remote.lock().unwrap().push(candidate);
        }
        Ok(())
    }

    /// Record a locally gathered candidate and forward it when a remote
    /// description exists; otherwise it stays buffered until one is set.
    async fn handle_local_candidate(
        &self,
        session: &Arc<PeerSession>,
        candidate: IceCandidateInit,
    ) {
        use std::sync::atomic::Ordering;
        session.outbound.lock().unwrap().push(candidate);
        if session.remote_description_set.load(Ordering::SeqCst) {
            self.flush_outbound(session).await;
        }
    }

    /// Runs after any remote description is applied: drains buffered
    /// remote candidates in arrival order and releases held local ones.
    async fn after_remote_description(&self, session: &Arc<PeerSession>) {
        use std::sync::atomic::Ordering;
        session.remote_description_set.store(true, Ordering::SeqCst);

        let buffered = session.pending_remote.lock().unwrap().drain();
        if !buffered.is_empty() {
            debug!(
                "peer '{}': applying {} buffered candidate(s)",
                session.remote_id,
                buffered.len()
            );
        }
        for candidate in buffered {
            // One bad candidate must not abort the rest of the batch.
            if let Err(e) = session.connector.add_ice_candidate(candidate).await {
                warn!("peer '{}': buffered candidate rejected: {e}", session.remote_id);
            }
        }

        self.flush_outbound(session).await;
    }

    /// Send every held local candidate; a send failure keeps the failed
    /// candidate (and the rest) buffered for the next flush.
    async fn flush_outbound(&self, session: &Arc<PeerSession>) {
        let held = session.outbound.lock().unwrap().drain();
        let mut iter = held.into_iter();
        while let Some(candidate) = iter.next() {
            let send = self
                .signaling
                .send(SignalMessage::IceCandidate {
                    to_peer_id: session.remote_id.clone(),
                    candidate: candidate.clone(),
                })
                .await;
            if let Err(e) = send {
                warn!(
                    "peer '{}': candidate send failed, keeping buffered: {e}",
                    session.remote_id
                );
                let mut outbound = session.outbound.lock().unwrap();
                outbound.push(candidate);
                for rest in iter {
                    outbound.push(rest);
                }
                return;
            }
        }
    }

    // ── Connector events ────────────────────────────────────────────────

    fn spawn_connector_loop(
        self: &Arc<Self>,
        session: Arc<PeerSession>,
        mut rx: mpsc::Receiver<ConnectorEvent>,
    ) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                coordinator.on_connector_event(&session, event).await;
            }
        });
    }

    async fn on_connector_event(self: &Arc<Self>, session: &Arc<PeerSession>, event: ConnectorEvent) {
        use std::sync::atomic::Ordering;
        match event {
            ConnectorEvent::IceCandidate(candidate) => {
                self.handle_local_candidate(session, candidate).await;
            }
            ConnectorEvent::NegotiationNeeded => {
                let _ = self.request_negotiation(&session.remote_id.clone()).await;
            }
            ConnectorEvent::ConnectionStateChanged(state) => {
                session.set_connection_state(state);
                self.events
                    .emit(SessionEvent::connection_state_changed(&session.remote_id, state));
                match state {
                    ConnectionState::Connected => {
                        session.retry_count.store(0, Ordering::SeqCst);
                    }
                    ConnectionState::Failed => {
                        recovery::spawn_recovery(
                            Arc::clone(self),
                            Arc::clone(session),
                            self.config.clone(),
                        );
                    }
                    _ => {}
                }
            }
            ConnectorEvent::TrackStarted(track) => {
                self.remote_streams.track_started(&session.remote_id, track);
            }
            ConnectorEvent::TrackStopped(track) => {
                self.remote_streams.track_stopped(&session.remote_id, &track);
            }
        }
    }

    // ── Rebuild signal ──────────────────────────────────────────────────

    /// Tear the session down and raise the terminal needs-rebuild event,
    /// at most once per session. Recreating the session is the caller's
    /// decision.
    pub(crate) async fn signal_rebuild(&self, session: &Arc<PeerSession>, reason: &str) {
        use std::sync::atomic::Ordering;
        if session.rebuild_signaled.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("peer '{}': needs rebuild ({reason})", session.remote_id);
        self.events
            .emit(SessionEvent::needs_rebuild(&session.remote_id, reason));
        let _ = self.close_session(&session.remote_id).await;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::coordinator_with_fakes;
    use std::time::Duration;

    async fn settle() {
        // Paused-clock runs: let spawned tasks and debounce windows complete.
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn polite_side_offers_after_debounce() {
        // self "user-2" vs peer "user-1": self is polite.
        let (coordinator, signaling, _factory) = coordinator_with_fakes("user-2");

        let outcome = coordinator.request_negotiation("user-1").await.unwrap();
        assert_eq!(outcome, NegotiationRequest::Scheduled);
        settle().await;

        let sent = signaling.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], SignalMessage::Offer { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn impolite_side_suppresses_local_offers() {
        let (coordinator, signaling, _factory) = coordinator_with_fakes("user-1");

        let outcome = coordinator.request_negotiation("user-2").await.unwrap();
        assert_eq!(outcome, NegotiationRequest::Suppressed);
        settle().await;
        assert!(signaling.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_triggers_collapse_into_one_offer() {
        let (coordinator, signaling, _factory) = coordinator_with_fakes("user-2");

        for _ in 0..5 {
            let _ = coordinator.request_negotiation("user-1").await.unwrap();
        }
        settle().await;

        let offers = signaling
            .sent()
            .iter()
            .filter(|m| matches!(m, SignalMessage::Offer { .. }))
            .count();
        assert_eq!(offers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_offer_in_stable_state_is_answered() {
        let (coordinator, signaling, _factory) = coordinator_with_fakes("user-1");

        coordinator
            .handle_remote_offer("user-2", "v=0 remote".into())
            .await
            .unwrap();

        let sent = signaling.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            SignalMessage::Answer { to_peer_id, .. } => assert_eq!(to_peer_id, "user-2"),
            other => panic!("expected answer, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn collision_polite_rolls_back_and_answers() {
        let (coordinator, signaling, factory) = coordinator_with_fakes("user-2");

        // Open a local offer, then let a remote offer collide with it.
        let _ = coordinator.request_negotiation("user-1").await.unwrap();
        settle().await;
        assert_eq!(
            coordinator
                .registry
                .get("user-1")
                .unwrap()
                .connector
                .signaling_state(),
            SignalingState::HaveLocalOffer
        );

        coordinator
            .handle_remote_offer("user-1", "v=0 remote".into())
            .await
            .unwrap();

        let connector = factory.connector("user-1");
        assert_eq!(connector.rollback_count(), 1);
        let answers = signaling
            .sent()
            .iter()
            .filter(|m| matches!(m, SignalMessage::Answer { .. }))
            .count();
        assert_eq!(answers, 1);
        // Pair converged back to stable without tearing the session down.
        assert_eq!(connector.signaling_state(), SignalingState::Stable);
        assert!(coordinator.registry.get("user-1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn collision_impolite_discards_remote_offer() {
        let (coordinator, signaling, factory) = coordinator_with_fakes("user-1");

        // Impolite sides never queue local offers, so drive the connector
        // into have-local-offer directly to simulate an in-flight offer.
        let session = coordinator.ensure_session("user-2").await.unwrap();
        session.connector.create_offer(false).await.unwrap();

        coordinator
            .handle_remote_offer("user-2", "v=0 remote".into())
            .await
            .unwrap();

        let connector = factory.connector("user-2");
        assert_eq!(connector.rollback_count(), 0);
        assert!(signaling.sent().is_empty());
        assert_eq!(connector.signaling_state(), SignalingState::HaveLocalOffer);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_task_waits_for_inline_answer_cycle() {
        let (coordinator, signaling, factory) = coordinator_with_fakes("user-2");

        // First offer is in flight awaiting its answer; an urgent restart
        // queues behind it while the drain loop is parked.
        let _ = coordinator.request_negotiation("user-1").await.unwrap();
        settle().await;
        let session = coordinator.registry.get("user-1").unwrap();
        let restart_done = coordinator.enqueue_ice_restart(&session);

        // A colliding remote offer rolls the in-flight offer back. The
        // queued restart must only start once the pair is back to stable.
        coordinator
            .handle_remote_offer("user-1", "v=0 remote".into())
            .await
            .unwrap();
        settle().await;

        let sent = signaling.sent();
        assert!(matches!(sent[0], SignalMessage::Offer { .. }));
        assert!(matches!(sent[1], SignalMessage::Answer { .. }));
        assert!(matches!(sent[2], SignalMessage::Offer { .. }));
        assert_eq!(factory.connector("user-1").ice_restart_count(), 1);

        coordinator
            .handle_remote_answer("user-1", "v=0 answer".into())
            .await
            .unwrap();
        assert!(restart_done.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_failure_is_fatal_and_signals_rebuild() {
        let (coordinator, _signaling, factory) = coordinator_with_fakes("user-2");
        let _ = coordinator.request_negotiation("user-1").await.unwrap();
        settle().await;
        factory.connector("user-1").fail_rollback(true);

        let mut events = coordinator.events_for_test().subscribe();
        let result = coordinator
            .handle_remote_offer("user-1", "v=0 remote".into())
            .await;

        assert!(matches!(result, Err(EngineError::NegotiationFailed { .. })));
        assert!(coordinator.registry.get("user-1").is_none());
        let event = events.recv().await.unwrap();
        assert_eq!(
            event.event_type,
            crate::events::SessionEventType::SessionNeedsRebuild
        );
    }

    #[tokio::test(start_paused = true)]
    async fn answer_in_stable_state_is_a_protocol_violation() {
        let (coordinator, _signaling, _factory) = coordinator_with_fakes("user-2");
        let session = coordinator.ensure_session("user-1").await.unwrap();

        let result = coordinator
            .handle_remote_answer("user-1", "v=0 answer".into())
            .await;
        assert!(matches!(result, Err(EngineError::NegotiationFailed { .. })));
        // Session survives the violation.
        assert!(!session.is_closed());
        assert!(coordinator.registry.get("user-1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn offer_cycle_completes_on_answer() {
        let (coordinator, signaling, _factory) = coordinator_with_fakes("user-2");
        let _ = coordinator.request_negotiation("user-1").await.unwrap();
        settle().await;
        assert_eq!(signaling.sent().len(), 1);

        coordinator
            .handle_remote_answer("user-1", "v=0 answer".into())
            .await
            .unwrap();
        settle().await;

        let session = coordinator.registry.get("user-1").unwrap();
        assert_eq!(session.connector.signaling_state(), SignalingState::Stable);
        use std::sync::atomic::Ordering;
        assert!(!session.negotiating.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn candidates_buffer_until_remote_description() {
        let (coordinator, _signaling, factory) = coordinator_with_fakes("user-1");

        for n in 0..3 {
            coordinator
                .handle_remote_candidate("user-2", IceCandidateInit::new(format!("candidate:{n}")))
                .await
                .unwrap();
        }
        let connector = factory.connector("user-2");
        assert!(connector.added_candidates().is_empty());

        coordinator
            .handle_remote_offer("user-2", "v=0 remote".into())
            .await
            .unwrap();

        let applied = connector.added_candidates();
        assert_eq!(applied.len(), 3);
        for (n, c) in applied.iter().enumerate() {
            assert_eq!(c.candidate, format!("candidate:{n}"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn candidate_after_remote_description_applies_directly() {
        let (coordinator, _signaling, factory) = coordinator_with_fakes("user-1");
        coordinator
            .handle_remote_offer("user-2", "v=0 remote".into())
            .await
            .unwrap();

        coordinator
            .handle_remote_candidate("user-2", IceCandidateInit::new("candidate:direct"))
            .await
            .unwrap();

        let applied = factory.connector("user-2").added_candidates();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].candidate, "candidate:direct");
    }

    #[tokio::test(start_paused = true)]
    async fn local_candidates_held_until_remote_description_then_sent() {
        let (coordinator, signaling, factory) = coordinator_with_fakes("user-1");
        let _session = coordinator.ensure_session("user-2").await.unwrap();

        factory
            .connector("user-2")
            .push_event(ConnectorEvent::IceCandidate(IceCandidateInit::new(
                "candidate:local-0",
            )))
            .await;
        settle().await;
        assert!(signaling.sent().is_empty());

        coordinator
            .handle_remote_offer("user-2", "v=0 remote".into())
            .await
            .unwrap();
        settle().await;

        let candidates = signaling
            .sent()
            .iter()
            .filter(|m| matches!(m, SignalMessage::IceCandidate { .. }))
            .count();
        assert_eq!(candidates, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_session_rejects_pending_work() {
        let (coordinator, _signaling, _factory) = coordinator_with_fakes("user-2");
        let session = coordinator.ensure_session("user-1").await.unwrap();
        let (task, rx) = NegotiationTask::new(TaskKind::Offer);
        session.enqueue(task);

        coordinator.close_session("user-1").await.unwrap();

        assert!(matches!(
            rx.await.unwrap(),
            Err(EngineError::SessionClosed { .. })
        ));
        assert!(coordinator.registry.get("user-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn one_session_per_peer() {
        let (coordinator, _signaling, _factory) = coordinator_with_fakes("user-2");
        let a = coordinator.ensure_session("user-1").await.unwrap();
        let b = coordinator.ensure_session("user-1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(coordinator.registry.len(), 1);
    }
}

#[cfg(test)]
impl NegotiationCoordinator {
    pub(crate) fn events_for_test(&self) -> &EventBus {
        &self.events
    }
}
