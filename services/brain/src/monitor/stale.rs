//! Stale provisioning monitor.
//!
//! A dispatched prepare or start that never produces a callback would leave
//! its instance in PREPARING or STARTING forever. This monitor fails such
//! instances once they exceed the per-state timeout, recording a
//! FAILURE_TIMEOUT event with reason "timeout".

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use warren_proto::InstanceState;

use crate::state::AppState;

/// Periodically fails instances stuck mid-provision.
pub struct StaleInstanceMonitor {
    state: AppState,
}

impl StaleInstanceMonitor {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Run the monitor until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let sweep_interval = self.state.config().stale_sweep_interval;
        info!(
            interval_secs = sweep_interval.as_secs(),
            preparing_timeout_secs = self.state.config().preparing_timeout.as_secs(),
            starting_timeout_secs = self.state.config().starting_timeout.as_secs(),
            "Starting stale instance monitor"
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
                        info!("Stale instance monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single sweep against the given clock reading.
    pub async fn sweep_at(&self, now: DateTime<Utc>) {
        let config = self.state.config();
        let passes = [
            (InstanceState::Preparing, config.preparing_timeout),
            (InstanceState::Starting, config.starting_timeout),
        ];
        for (state, timeout) in passes {
            let cutoff = now - timeout;
            let failed = self
                .state
                .registry()
                .sweep_stale_instances(state, cutoff, now)
                .await;
            for instance_id in &failed {
                warn!(
                    instance_id = %instance_id,
                    stuck_in = %state,
                    timeout_secs = timeout.as_secs(),
                    "Instance timed out; marked FAILED"
                );
            }
        }
    }
}
