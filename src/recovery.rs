// src/recovery.rs
//
// Connection failure recovery. Only the terminal `failed` state triggers
// recovery; `disconnected` is transient and left to the ICE layer. Each
// attempt waits an exponentially growing delay, then jumps an urgent
// ICE-restart offer ahead of any queued normal work. Exhausted or
// unrecoverable sessions are torn down and surfaced as needs-rebuild.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::negotiation::NegotiationCoordinator;
use crate::session::PeerSession;

/// Delay before recovery attempt `attempt` (1-based): doubles from the
/// base each attempt, capped.
pub fn backoff_delay(config: &EngineConfig, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let delay = config
        .recovery_base_delay
        .saturating_mul(1u32 << shift);
    delay.min(config.recovery_max_delay)
}

/// Kick off one recovery attempt for a session that just entered
/// `failed`. Runs detached so the connector event loop is not blocked
/// behind the backoff sleep.
pub fn spawn_recovery(
    coordinator: Arc<NegotiationCoordinator>,
    session: Arc<PeerSession>,
    config: EngineConfig,
) {
    tokio::spawn(async move {
        if session.is_closed() || session.rebuild_signaled.load(Ordering::SeqCst) {
            return;
        }

        let attempt = session.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > config.max_recovery_attempts {
            coordinator
                .signal_rebuild(&session, "recovery attempts exhausted")
                .await;
            return;
        }

        let delay = backoff_delay(&config, attempt);
        info!(
            "peer '{}': connection failed, ICE restart attempt {attempt}/{} in {}ms",
            session.remote_id,
            config.max_recovery_attempts,
            delay.as_millis()
        );
        tokio::select! {
            _ = session.cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        if session.is_closed() {
            return;
        }

        let done = coordinator.enqueue_ice_restart(&session);
        match done.await {
            Ok(Ok(())) => {
                info!("peer '{}': ICE restart offer completed", session.remote_id);
            }
            Ok(Err(e)) => {
                warn!("peer '{}': ICE restart failed: {e}", session.remote_id);
                coordinator
                    .signal_rebuild(&session, "ICE restart failed")
                    .await;
            }
            Err(_) => {
                // Task dropped without completing; session was torn down.
            }
        }
    });
}

// ─── Tests ──────────────────────────────────────────────────────────────────
