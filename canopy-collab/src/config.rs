//! Configuration for the collaboration core and its server.

use std::path::PathBuf;
use std::time::Duration;

/// Presence staleness settings.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// A record with no heartbeat for this long is reported offline.
    pub timeout: Duration,
    /// How often the background sweep runs.
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Backoff schedule for transient storage failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Backoff before attempt `attempt` (1-based retry count).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Core configuration shared by the store, log, tracker and bus.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    pub presence: PresenceConfig,
    /// Events buffered per subscriber before it is reported as lagging.
    pub broadcast_capacity: usize,
    /// Page size used when replaying the operation log.
    pub replay_batch_size: usize,
    pub retry: RetryPolicy,
    /// Deliver a connection's own operations back to it.
    pub echo_own_operations: bool,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            presence: PresenceConfig::default(),
            broadcast_capacity: 256,
            replay_batch_size: 256,
            retry: RetryPolicy::default(),
            echo_own_operations: false,
        }
    }
}

impl CollabConfig {
    /// Config for testing (small buffers, short timeouts, fast retries).
    pub fn for_testing() -> Self {
        Self {
            presence: PresenceConfig {
                timeout: Duration::from_secs(30),
                sweep_interval: Duration::from_secs(1),
            },
            broadcast_capacity: 64,
            replay_batch_size: 4,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
            },
            echo_own_operations: false,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub collab: CollabConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            heartbeat_interval_secs: 15,
            storage_path: None,
            collab: CollabConfig::default(),
        }
    }
}
