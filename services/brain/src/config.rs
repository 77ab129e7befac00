//! Configuration for the brain.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;

/// Brain configuration, loaded from `WARREN_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Heartbeat cadence advertised to agents at registration.
    pub heartbeat_interval: Duration,

    /// A node missing heartbeats for this long is marked OFFLINE.
    pub heartbeat_timeout: Duration,

    /// How often the heartbeat monitor sweeps the node set.
    pub heartbeat_sweep_interval: Duration,

    /// How often the stale-instance monitor sweeps.
    pub stale_sweep_interval: Duration,

    /// An instance stuck in PREPARING for this long is failed.
    pub preparing_timeout: Duration,

    /// An instance stuck in STARTING for this long is failed.
    pub starting_timeout: Duration,

    /// Total command dispatch attempts per node call.
    pub dispatch_attempts: u32,

    /// Pause between dispatch attempts.
    pub dispatch_backoff: Duration,

    /// Per-request timeout for node calls.
    pub dispatch_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 8080).into(),
            log_level: "info".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            heartbeat_sweep_interval: Duration::from_secs(30),
            stale_sweep_interval: Duration::from_secs(60),
            preparing_timeout: Duration::from_secs(300),
            starting_timeout: Duration::from_secs(300),
            dispatch_attempts: 2,
            dispatch_backoff: Duration::from_millis(500),
            dispatch_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults above.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let listen_addr = match std::env::var("WARREN_LISTEN_ADDR") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.listen_addr,
        };

        let log_level =
            std::env::var("WARREN_LOG_LEVEL").unwrap_or_else(|_| defaults.log_level.clone());

        let heartbeat_interval = env_secs("WARREN_HEARTBEAT_INTERVAL_SECS")
            .unwrap_or(defaults.heartbeat_interval);
        let heartbeat_timeout =
            env_secs("WARREN_HEARTBEAT_TIMEOUT_SECS").unwrap_or(defaults.heartbeat_timeout);
        let heartbeat_sweep_interval = env_secs("WARREN_HEARTBEAT_SWEEP_SECS")
            .unwrap_or(defaults.heartbeat_sweep_interval);
        let stale_sweep_interval =
            env_secs("WARREN_STALE_SWEEP_SECS").unwrap_or(defaults.stale_sweep_interval);
        let preparing_timeout =
            env_secs("WARREN_PREPARING_TIMEOUT_SECS").unwrap_or(defaults.preparing_timeout);
        let starting_timeout =
            env_secs("WARREN_STARTING_TIMEOUT_SECS").unwrap_or(defaults.starting_timeout);

        let dispatch_attempts = std::env::var("WARREN_DISPATCH_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.dispatch_attempts);
        let dispatch_backoff = std::env::var("WARREN_DISPATCH_BACKOFF_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.dispatch_backoff);
        let dispatch_timeout =
            env_secs("WARREN_DISPATCH_TIMEOUT_SECS").unwrap_or(defaults.dispatch_timeout);

        Ok(Self {
            listen_addr,
            log_level,
            heartbeat_interval,
            heartbeat_timeout,
            heartbeat_sweep_interval,
            stale_sweep_interval,
            preparing_timeout,
            starting_timeout,
            dispatch_attempts,
            dispatch_backoff,
            dispatch_timeout,
        })
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}
