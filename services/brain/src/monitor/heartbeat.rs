//! Heartbeat liveness monitor.
//!
//! Marks nodes OFFLINE once their last heartbeat is older than the
//! configured timeout. The decay is silent: no instance event is written,
//! and a fresh heartbeat brings the node straight back to ONLINE.

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::state::AppState;

/// Periodically sweeps the node set for missed heartbeats.
pub struct HeartbeatMonitor {
    state: AppState,
}

impl HeartbeatMonitor {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Run the monitor until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let sweep_interval = self.state.config().heartbeat_sweep_interval;
        info!(
            interval_secs = sweep_interval.as_secs(),
            timeout_secs = self.state.config().heartbeat_timeout.as_secs(),
            "Starting heartbeat monitor"
        );

        let mut interval = tokio::time::interval(sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_at(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Heartbeat monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single sweep against the given clock reading.
    pub async fn sweep_at(&self, now: DateTime<Utc>) {
        let cutoff = now - self.state.config().heartbeat_timeout;
        let marked = self.state.registry().sweep_missed_heartbeats(cutoff).await;
        for node_id in &marked {
            warn!(node_id = %node_id, "Node missed heartbeats; marked OFFLINE");
        }
    }
}
