use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::reconcile::ConflictPolicy;

// ---------------------------------------------------------------------------
// Engine configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Complete engine configuration.
///
/// Every field can be set via an environment variable prefixed with
/// `PEERMESH_`. Defaults match the protocol constants the engine was
/// designed around; they are tunable, not wire requirements.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // ── Negotiation ─────────────────────────────────────────────────────
    /// Quiet period applied to local negotiation-needed signals so several
    /// rapid track changes collapse into a single offer.
    pub negotiation_debounce: Duration,
    /// Upper bound on the offer→answer wait before the task fails.
    pub answer_timeout: Duration,

    // ── ICE candidate buffering ─────────────────────────────────────────
    /// Capacity of each per-peer candidate buffer; oldest entry is evicted
    /// on overflow.
    pub candidate_buffer_cap: usize,

    // ── Recovery ────────────────────────────────────────────────────────
    /// Automatic recovery attempts after `failed` before giving up.
    pub max_recovery_attempts: u32,
    /// First recovery backoff delay; doubles per attempt.
    pub recovery_base_delay: Duration,
    /// Ceiling on the recovery backoff delay.
    pub recovery_max_delay: Duration,

    // ── Track replacement ───────────────────────────────────────────────
    /// Per-peer replace-track attempts before that peer keeps its stale
    /// track.
    pub track_replace_attempts: u32,
    /// Base delay between replacement attempts; attempt n waits n times
    /// this before the next try.
    pub track_replace_delay: Duration,

    // ── Reconciliation ──────────────────────────────────────────────────
    /// Interval of the periodic pull of authoritative participant state.
    pub reconcile_interval: Duration,
    /// Timeout on a state push before falling back to a pull.
    pub sync_push_timeout: Duration,
    /// Conflict resolution applied when server and local state diverge.
    pub conflict_policy: ConflictPolicy,

    // ── ICE servers (production connector) ──────────────────────────────
    /// STUN server URLs for the ICE agent.
    pub stun_urls: Vec<String>,
    /// TURN server URLs (empty when no relay is available).
    pub turn_urls: Vec<String>,
    pub turn_username: String,
    pub turn_password: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            negotiation_debounce: Duration::from_millis(150),
            answer_timeout: Duration::from_secs(10),
            candidate_buffer_cap: 50,
            max_recovery_attempts: 3,
            recovery_base_delay: Duration::from_millis(1000),
            recovery_max_delay: Duration::from_millis(10_000),
            track_replace_attempts: 3,
            track_replace_delay: Duration::from_millis(500),
            reconcile_interval: Duration::from_secs(30),
            sync_push_timeout: Duration::from_secs(5),
            conflict_policy: ConflictPolicy::ServerWins,
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_urls: Vec::new(),
            turn_username: String::new(),
            turn_password: String::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let defaults = EngineConfig::default();

        let config = EngineConfig {
            negotiation_debounce: env_millis(
                "PEERMESH_NEGOTIATION_DEBOUNCE_MS",
                defaults.negotiation_debounce,
            ),
            answer_timeout: env_millis("PEERMESH_ANSWER_TIMEOUT_MS", defaults.answer_timeout),
            candidate_buffer_cap: env_parse(
                "PEERMESH_CANDIDATE_BUFFER_CAP",
                defaults.candidate_buffer_cap,
            ),
            max_recovery_attempts: env_parse(
                "PEERMESH_MAX_RECOVERY_ATTEMPTS",
                defaults.max_recovery_attempts,
            ),
            recovery_base_delay: env_millis(
                "PEERMESH_RECOVERY_BASE_DELAY_MS",
                defaults.recovery_base_delay,
            ),
            recovery_max_delay: env_millis(
                "PEERMESH_RECOVERY_MAX_DELAY_MS",
                defaults.recovery_max_delay,
            ),
            track_replace_attempts: env_parse(
                "PEERMESH_TRACK_REPLACE_ATTEMPTS",
                defaults.track_replace_attempts,
            ),
            track_replace_delay: env_millis(
                "PEERMESH_TRACK_REPLACE_DELAY_MS",
                defaults.track_replace_delay,
            ),
            reconcile_interval: env_millis(
                "PEERMESH_RECONCILE_INTERVAL_MS",
                defaults.reconcile_interval,
            ),
            sync_push_timeout: env_millis(
                "PEERMESH_SYNC_PUSH_TIMEOUT_MS",
                defaults.sync_push_timeout,
            ),
            conflict_policy: std::env::var("PEERMESH_CONFLICT_POLICY")
                .ok()
                .and_then(|v| ConflictPolicy::parse(&v))
                .unwrap_or(defaults.conflict_policy),
            stun_urls: env_csv("PEERMESH_STUN_URLS", &["stun:stun.l.google.com:19302"]),
            turn_urls: env_csv("PEERMESH_TURN_URLS", &[]),
            turn_username: env_or("PEERMESH_TURN_USERNAME", ""),
            turn_password: env_or("PEERMESH_TURN_PASSWORD", ""),
        };

        config.log_summary();
        config
    }

    /// Build the ICE server list for the production ICE agent.
    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        let mut servers: Vec<IceServerConfig> = self
            .stun_urls
            .iter()
            .map(|url| IceServerConfig {
                urls: vec![url.clone()],
                username: None,
                credential: None,
            })
            .collect();

        for url in &self.turn_urls {
            servers.push(IceServerConfig {
                urls: vec![url.clone()],
                username: Some(self.turn_username.clone()),
                credential: Some(self.turn_password.clone()),
            });
        }

        servers
    }

    pub fn log_summary(&self) {
        info!("──── peermesh configuration ────");
        info!("  debounce            : {:?}", self.negotiation_debounce);
        info!("  answer_timeout      : {:?}", self.answer_timeout);
        info!("  candidate_cap       : {}", self.candidate_buffer_cap);
        info!(
            "  recovery            : {} attempt(s), {:?} base, {:?} cap",
            self.max_recovery_attempts, self.recovery_base_delay, self.recovery_max_delay
        );
        info!(
            "  track_replace       : {} attempt(s), {:?} step",
            self.track_replace_attempts, self.track_replace_delay
        );
        info!("  reconcile_interval  : {:?}", self.reconcile_interval);
        info!("  sync_push_timeout   : {:?}", self.sync_push_timeout);
        info!("  conflict_policy     : {:?}", self.conflict_policy);
        info!("  stun_urls           : {:?}", self.stun_urls);
        info!("  turn_urls           : {:?}", self.turn_urls);
        info!("────────────────────────────────");
    }
}

// ---------------------------------------------------------------------------
// ICE server configuration
// ---------------------------------------------------------------------------

/// ICE server entry handed to the production connector.
///
/// Matches the W3C `RTCIceServer` dictionary shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_csv(key: &str, defaults: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => defaults.iter().map(|s| s.to_string()).collect(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
