//! Registration and heartbeat plumbing for the node agent.
//!
//! The agent cannot serve commands without a node id, so registration
//! blocks startup and retries until the brain answers. After that the
//! heartbeat loop keeps the node ONLINE; it retries within each cycle and
//! never exits on failure, because a flaky brain must not take the agent
//! down with it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use warren_id::NodeId;
use warren_proto::{NodeHeartbeatRequest, NodeStatus, RegisterNodeRequest, RegisterNodeResponse};

use crate::client::BrainClient;
use crate::config::Config;
use crate::workspace::Workspace;

const REGISTER_RETRY_DELAY: Duration = Duration::from_secs(5);
const HEARTBEAT_ATTEMPTS: u32 = 3;
const HEARTBEAT_RETRY_BASE: Duration = Duration::from_millis(500);

/// Registers with the brain, retrying until it answers.
pub async fn register_until_success(
    client: &BrainClient,
    config: &Config,
) -> RegisterNodeResponse {
    let request = RegisterNodeRequest {
        name: config.node_name.clone(),
        region: config.region.clone(),
        tags: config.tags.clone(),
        dev_mode: config.dev_mode,
        capacity_slots: config.capacity_slots,
        node_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        base_url: config.advertised_url.clone(),
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match client.register(&request).await {
            Ok(response) => {
                info!(
                    node_id = %response.node_id,
                    heartbeat_interval_seconds = response.heartbeat_interval_seconds,
                    "Registered with brain"
                );
                return response;
            }
            Err(e) => {
                warn!(error = %e, attempt, "Registration failed; retrying");
                tokio::time::sleep(REGISTER_RETRY_DELAY).await;
            }
        }
    }
}

/// Run the heartbeat loop until shutdown.
pub async fn run_heartbeat_loop(
    client: Arc<BrainClient>,
    workspace: Arc<Workspace>,
    node_id: NodeId,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        node_id = %node_id,
        interval_secs = interval.as_secs(),
        "Starting heartbeat loop"
    );

    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);
    interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let request = NodeHeartbeatRequest {
                    status: NodeStatus::Online,
                    used_slots: workspace.instance_count() as i32,
                };

                match send_with_retry(&client, node_id, &request).await {
                    Ok(()) => {
                        consecutive_failures = 0;
                        debug!(used_slots = request.used_slots, "Heartbeat acknowledged");
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(
                                error = %e,
                                consecutive_failures,
                                "Heartbeat cycle failed"
                            );
                        } else {
                            error!(
                                error = %e,
                                consecutive_failures,
                                "Heartbeat failing repeatedly"
                            );
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }
}

/// One heartbeat cycle: up to three attempts with doubling backoff.
async fn send_with_retry(
    client: &BrainClient,
    node_id: NodeId,
    request: &NodeHeartbeatRequest,
) -> anyhow::Result<()> {
    let mut backoff = HEARTBEAT_RETRY_BASE;
    let mut attempt = 1u32;
    loop {
        match client.send_heartbeat(node_id, request).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if attempt >= HEARTBEAT_ATTEMPTS {
                    return Err(e);
                }
                debug!(error = %e, attempt, "Heartbeat attempt failed");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;

    /// Stub brain whose heartbeat endpoint fails the first `failures`
    /// requests with a 500, then accepts.
    async fn flaky_brain(failures: u32) -> (String, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/api/nodes/{node_id}/heartbeat",
            post(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < failures {
                        StatusCode::INTERNAL_SERVER_ERROR
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), hits)
    }

    #[tokio::test]
    async fn cycle_retries_through_a_transient_failure() {
        let (url, hits) = flaky_brain(1).await;
        let client = BrainClient::new(&url, Duration::from_secs(2)).unwrap();
        let request = NodeHeartbeatRequest {
            status: NodeStatus::Online,
            used_slots: 0,
        };

        send_with_retry(&client, NodeId::new(), &request)
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cycle_gives_up_after_three_attempts() {
        let (url, hits) = flaky_brain(10).await;
        let client = BrainClient::new(&url, Duration::from_secs(2)).unwrap();
        let request = NodeHeartbeatRequest {
            status: NodeStatus::Online,
            used_slots: 2,
        };

        let result = send_with_retry(&client, NodeId::new(), &request).await;
        assert!(result.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
