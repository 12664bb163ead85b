// src/session.rs
//
// One `PeerSession` per remote participant. The session owns its
// connector exclusively; everything else in the engine goes through the
// coordinator, never through a direct session reference.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::candidates::CandidateBuffer;
use crate::error::EngineError;
use crate::peer::{ConnectionState, PeerConnector};

// ─── Politeness assignment ──────────────────────────────────────────────────

/// Perfect-Negotiation role assignment: a pure function of the two
/// participant identifiers, computed identically and independently on
/// both ends. Exactly one side of any pair is polite.
pub fn is_polite(self_id: &str, peer_id: &str) -> bool {
    self_id > peer_id
}

// ─── Negotiation tasks ──────────────────────────────────────────────────────

/// What a queued negotiation task does. Remote offers are answered
/// inline when they arrive and are never queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Offer,
    IceRestart,
}

pub const PRIORITY_NORMAL: u8 = 0;
pub const PRIORITY_URGENT: u8 = 1;

/// Transient unit of negotiation work with a completion handle.
pub struct NegotiationTask {
    pub kind: TaskKind,
    pub priority: u8,
    pub created_at: Instant,
    done: Option<oneshot::Sender<Result<(), EngineError>>>,
}

impl NegotiationTask {
    /// Build a task and the receiver its submitter awaits. ICE restarts
    /// are urgent so they jump ahead of queued offers.
    pub fn new(kind: TaskKind) -> (Self, oneshot::Receiver<Result<(), EngineError>>) {
        let (tx, rx) = oneshot::channel();
        let priority = match kind {
            TaskKind::Offer => PRIORITY_NORMAL,
            TaskKind::IceRestart => PRIORITY_URGENT,
        };
        (
            Self {
                kind,
                priority,
                created_at: Instant::now(),
                done: Some(tx),
            },
            rx,
        )
    }

    /// Resolve or reject the task. Dropped receivers are fine: the
    /// submitter may have given up waiting.
    pub fn complete(mut self, result: Result<(), EngineError>) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(result);
        }
    }
}

impl std::fmt::Debug for NegotiationTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationTask")
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .finish()
    }
}

// ─── PeerSession ────────────────────────────────────────────────────────────

/// Per-remote-participant negotiation state.
///
/// Field-level interior mutability: every session operation runs on the
/// engine's cooperative task set, and `negotiating` guarantees at most
/// one drain of the queue at a time.
pub struct PeerSession {
    pub remote_id: String,
    /// Fixed at creation; never changes for the session lifetime.
    pub polite: bool,
    pub connector: Box<dyn PeerConnector>,

    queue: Mutex<VecDeque<NegotiationTask>>,
    pub negotiating: AtomicBool,
    /// Set while a debounce window is open, so rapid local triggers
    /// collapse into one queued offer.
    pub debounce_armed: AtomicBool,

    /// Remote candidates waiting for a remote description.
    pub pending_remote: Mutex<CandidateBuffer>,
    /// Local candidates kept so a signaling send failure loses nothing.
    pub outbound: Mutex<CandidateBuffer>,
    pub remote_description_set: AtomicBool,

    state: Mutex<ConnectionState>,
    /// Recovery attempts since the last `Connected`.
    pub retry_count: AtomicU32,
    /// The terminal needs-rebuild signal fires at most once per session.
    pub rebuild_signaled: AtomicBool,

    closed: AtomicBool,
    pub cancel: CancellationToken,
    /// Completion handle of the offer currently awaiting its answer.
    answer_waiter: Mutex<Option<oneshot::Sender<Result<(), EngineError>>>>,
    pub created_at: Instant,
}

impl PeerSession {
    pub fn new(
        remote_id: String,
        polite: bool,
        connector: Box<dyn PeerConnector>,
        candidate_cap: usize,
    ) -> Self {
        Self {
            remote_id,
            polite,
            connector,
            queue: Mutex::new(VecDeque::new()),
            negotiating: AtomicBool::new(false),
            debounce_armed: AtomicBool::new(false),
            pending_remote: Mutex::new(CandidateBuffer::new(candidate_cap)),
            outbound: Mutex::new(CandidateBuffer::new(candidate_cap)),
            remote_description_set: AtomicBool::new(false),
            state: Mutex::new(ConnectionState::New),
            retry_count: AtomicU32::new(0),
            rebuild_signaled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            answer_waiter: Mutex::new(None),
            created_at: Instant::now(),
        }
    }

    // ── Queue ───────────────────────────────────────────────────────────

    /// Insert a task: urgent tasks go ahead of normal ones but behind
    /// earlier urgent tasks (FIFO within equal priority).
    pub fn enqueue(&self, task: NegotiationTask) {
        let kind = task.kind;
        let mut queue = self.queue.lock().unwrap();
        let pos = queue.iter().position(|t| t.priority < task.priority);
        match pos {
            Some(i) => queue.insert(i, task),
            None => queue.push_back(task),
        }
        debug!(
            "peer '{}': queued {kind:?} ({} pending)",
            self.remote_id,
            queue.len()
        );
    }

    pub fn pop_task(&self) -> Option<NegotiationTask> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Reject every queued task with a session-closed error.
    pub fn fail_all_queued(&self) {
        let tasks: Vec<_> = { self.queue.lock().unwrap().drain(..).collect() };
        for task in tasks {
            task.complete(Err(EngineError::closed(&self.remote_id)));
        }
    }

    // ── Answer waiter ───────────────────────────────────────────────────

    /// Install the completion handle an executing offer waits on. The
    /// drain loop guarantees at most one exists at a time.
    pub fn install_answer_waiter(&self, tx: oneshot::Sender<Result<(), EngineError>>) {
        *self.answer_waiter.lock().unwrap() = Some(tx);
    }

    pub fn take_answer_waiter(&self) -> Option<oneshot::Sender<Result<(), EngineError>>> {
        self.answer_waiter.lock().unwrap().take()
    }

    // ── Connection state ────────────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the session's engine-side state synchronously: queued and
    /// in-flight tasks are rejected, buffers dropped, and background
    /// waits cancelled before this returns. The connector itself is shut
    /// down by the coordinator afterwards.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.fail_all_queued();
        if let Some(waiter) = self.take_answer_waiter() {
            let _ = waiter.send(Err(EngineError::closed(&self.remote_id)));
        }
        self.pending_remote.lock().unwrap().clear();
        self.outbound.lock().unwrap().clear();
        debug!("peer '{}': session closed", self.remote_id);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeConnector;

    fn session(polite: bool) -> PeerSession {
        PeerSession::new(
            "peer-1".into(),
            polite,
            Box::new(FakeConnector::new()),
            50,
        )
    }

    #[test]
    fn politeness_is_exclusive() {
        let pairs = [
            ("user-1", "user-2"),
            ("user-2", "user-1"),
            ("a", "b"),
            ("zz", "z"),
            ("participant-10", "participant-9"),
        ];
        for (a, b) in pairs {
            assert!(
                is_polite(a, b) ^ is_polite(b, a),
                "exactly one of ({a}, {b}) must be polite"
            );
        }
    }

    #[test]
    fn politeness_matches_identifier_order() {
        // "user-2" > "user-1" lexicographically, so user-2 is the polite side.
        assert!(is_polite("user-2", "user-1"));
        assert!(!is_polite("user-1", "user-2"));
    }

    #[test]
    fn urgent_tasks_jump_the_queue_but_stay_fifo() {
        let s = session(true);
        let (offer_a, _rx_a) = NegotiationTask::new(TaskKind::Offer);
        let (offer_b, _rx_b) = NegotiationTask::new(TaskKind::Offer);
        let (restart_a, _rx_c) = NegotiationTask::new(TaskKind::IceRestart);
        let (restart_b, _rx_d) = NegotiationTask::new(TaskKind::IceRestart);

        s.enqueue(offer_a);
        s.enqueue(offer_b);
        s.enqueue(restart_a);
        s.enqueue(restart_b);

        assert_eq!(s.pop_task().unwrap().kind, TaskKind::IceRestart);
        assert_eq!(s.pop_task().unwrap().kind, TaskKind::IceRestart);
        assert_eq!(s.pop_task().unwrap().kind, TaskKind::Offer);
        assert_eq!(s.pop_task().unwrap().kind, TaskKind::Offer);
        assert!(s.pop_task().is_none());
    }

    #[tokio::test]
    async fn close_rejects_queued_tasks_and_waiter() {
        let s = session(true);
        let (task, rx) = NegotiationTask::new(TaskKind::Offer);
        s.enqueue(task);

        let (waiter_tx, waiter_rx) = oneshot::channel();
        s.install_answer_waiter(waiter_tx);

        s.close();

        assert!(s.is_closed());
        assert!(s.cancel.is_cancelled());
        assert!(matches!(
            rx.await.unwrap(),
            Err(EngineError::SessionClosed { .. })
        ));
        assert!(matches!(
            waiter_rx.await.unwrap(),
            Err(EngineError::SessionClosed { .. })
        ));
        assert_eq!(s.queue_len(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let s = session(false);
        s.close();
        s.close();
        assert!(s.is_closed());
    }
}
