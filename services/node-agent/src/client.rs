//! Brain API client for the node agent.
//!
//! Covers the three agent→brain surfaces: registration, heartbeats, and
//! instance lifecycle callbacks.

use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{debug, error, warn};
use warren_id::{InstanceId, NodeId};
use warren_proto::{CallbackKind, NodeHeartbeatRequest, RegisterNodeRequest, RegisterNodeResponse};

/// Brain API client.
pub struct BrainClient {
    client: reqwest::Client,
    base_url: String,
}

impl BrainClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Register this agent, upserting on name. Returns the assigned node id
    /// and the heartbeat interval the brain wants.
    pub async fn register(&self, request: &RegisterNodeRequest) -> Result<RegisterNodeResponse> {
        let url = format!("{}/api/nodes/register", self.base_url);
        debug!(url = %url, name = %request.name, "Registering node");

        let response = self.client.post(&url).json(request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Registration rejected");
            bail!("registration failed: {} - {}", status, body);
        }

        let body: RegisterNodeResponse = response.json().await?;
        Ok(body)
    }

    /// Send one heartbeat. The brain returns its node document on success;
    /// the agent only cares that the beat was accepted.
    pub async fn send_heartbeat(
        &self,
        node_id: NodeId,
        request: &NodeHeartbeatRequest,
    ) -> Result<()> {
        let url = format!("{}/api/nodes/{}/heartbeat", self.base_url, node_id);
        let response = self.client.post(&url).json(request).send().await?;
        if !response.status().is_success() {
            bail!("heartbeat failed with status: {}", response.status());
        }
        Ok(())
    }

    /// Report a lifecycle callback for an instance. Callbacks carry no body;
    /// the path says everything.
    pub async fn send_callback(
        &self,
        node_id: NodeId,
        instance_id: InstanceId,
        kind: CallbackKind,
    ) -> Result<()> {
        let url = format!(
            "{}/api/nodes/{}/instances/{}/{}",
            self.base_url,
            node_id,
            instance_id,
            kind.as_str()
        );
        debug!(instance_id = %instance_id, callback = %kind, "Reporting callback");

        let response = self.client.post(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, callback = %kind, "Callback rejected");
            bail!("callback {} failed: {} - {}", kind, status, body);
        }
        Ok(())
    }

    /// Best-effort `failed` callback on an error path; a brain outage must
    /// not mask the original failure.
    pub async fn notify_failed_quietly(&self, node_id: NodeId, instance_id: InstanceId) {
        if let Err(e) = self
            .send_callback(node_id, instance_id, CallbackKind::Failed)
            .await
        {
            warn!(instance_id = %instance_id, error = %e, "Could not report failure to brain");
        }
    }
}
