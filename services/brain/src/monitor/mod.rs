//! Background monitors.
//!
//! Two periodic sweeps keep the registry honest between API calls: the
//! heartbeat monitor decays silent nodes to OFFLINE, and the stale-instance
//! monitor fails instances stuck mid-provision. Both run until shutdown is
//! signaled.

mod heartbeat;
mod stale;

pub use heartbeat::HeartbeatMonitor;
pub use stale::StaleInstanceMonitor;
