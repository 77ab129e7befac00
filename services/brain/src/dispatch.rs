//! Brain→node command dispatch.
//!
//! Commands are posted to the node agent at
//! `{base_url}/api/instances/{instance_id}/{action}`. Transport errors and
//! 5xx responses are retried with a fixed backoff; a 4xx means the agent
//! understood and refused, so it is surfaced immediately. Dispatch runs
//! after the state transition has been committed, and a failure here is
//! reported to the caller rather than rolled back.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use warren_id::{InstanceId, NodeId};
use warren_proto::{CommandAction, InstanceCommand, PrepareInstanceCommand};

use crate::config::Config;
use crate::model::Node;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("node {0} has no base URL on record")]
    MissingBaseUrl(NodeId),

    #[error("node rejected {action} for instance {instance_id}: {status}")]
    Rejected {
        action: CommandAction,
        instance_id: InstanceId,
        status: StatusCode,
        body: String,
    },

    #[error("{action} for instance {instance_id} failed after {attempts} attempt(s): {last_error}")]
    Exhausted {
        action: CommandAction,
        instance_id: InstanceId,
        attempts: u32,
        last_error: String,
    },
}

/// HTTP dispatcher for node agent commands.
pub struct Dispatcher {
    client: reqwest::Client,
    attempts: u32,
    backoff: Duration,
}

impl Dispatcher {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.dispatch_timeout)
            .build()?;
        Ok(Self {
            client,
            attempts: config.dispatch_attempts.max(1),
            backoff: config.dispatch_backoff,
        })
    }

    /// Sends a prepare command with the full material list.
    pub async fn dispatch_prepare(
        &self,
        node: &Node,
        command: &PrepareInstanceCommand,
    ) -> Result<(), DispatchError> {
        self.post(node, command.instance_id, CommandAction::Prepare, command)
            .await
    }

    /// Sends a start, stop, or destroy command.
    pub async fn dispatch(
        &self,
        node: &Node,
        action: CommandAction,
        command: &InstanceCommand,
    ) -> Result<(), DispatchError> {
        self.post(node, command.instance_id, action, command).await
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        node: &Node,
        instance_id: InstanceId,
        action: CommandAction,
        body: &T,
    ) -> Result<(), DispatchError> {
        let base_url = node
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or(DispatchError::MissingBaseUrl(node.id))?;
        let url = command_url(base_url, instance_id, action);

        let mut last_error = String::new();
        for attempt in 1..=self.attempts {
            if attempt > 1 {
                tokio::time::sleep(self.backoff).await;
            }
            match self.client.post(&url).json(body).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!(
                            instance_id = %instance_id,
                            node_id = %node.id,
                            action = %action,
                            attempt,
                            "Command dispatched"
                        );
                        return Ok(());
                    }
                    let text = response.text().await.unwrap_or_default();
                    if status.is_server_error() {
                        warn!(
                            instance_id = %instance_id,
                            node_id = %node.id,
                            action = %action,
                            attempt,
                            status = %status,
                            "Node returned server error; retrying"
                        );
                        last_error = format!("status {status}");
                        continue;
                    }
                    return Err(DispatchError::Rejected {
                        action,
                        instance_id,
                        status,
                        body: text,
                    });
                }
                Err(error) => {
                    warn!(
                        instance_id = %instance_id,
                        node_id = %node.id,
                        action = %action,
                        attempt,
                        error = %error,
                        "Command dispatch failed; retrying"
                    );
                    last_error = error.to_string();
                }
            }
        }

        Err(DispatchError::Exhausted {
            action,
            instance_id,
            attempts: self.attempts,
            last_error,
        })
    }
}

fn command_url(base_url: &str, instance_id: InstanceId, action: CommandAction) -> String {
    format!(
        "{}/api/instances/{}/{}",
        base_url.trim_end_matches('/'),
        instance_id,
        action
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_proto::NodeStatus;

    fn node_without_base_url() -> Node {
        Node {
            id: NodeId::new(),
            name: "node-a".to_string(),
            region: None,
            tags: None,
            dev_mode: false,
            capacity_slots: 1,
            used_slots: 0,
            status: NodeStatus::Online,
            last_heartbeat_at: None,
            base_url: None,
            node_version: None,
            registered_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn command_url_strips_trailing_slash() {
        let instance_id = InstanceId::new();
        let url = command_url("http://10.0.0.5:8081/", instance_id, CommandAction::Stop);
        assert_eq!(
            url,
            format!("http://10.0.0.5:8081/api/instances/{instance_id}/stop")
        );
    }

    #[tokio::test]
    async fn missing_base_url_fails_without_network() {
        let config = Config::default();
        let dispatcher = Dispatcher::new(&config).unwrap();
        let node = node_without_base_url();
        let command = InstanceCommand {
            instance_id: InstanceId::new(),
            name: "lobby-1".to_string(),
        };
        let err = dispatcher
            .dispatch(&node, CommandAction::Start, &command)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::MissingBaseUrl(_)));
    }

    #[tokio::test]
    async fn blank_base_url_is_treated_as_missing() {
        let config = Config::default();
        let dispatcher = Dispatcher::new(&config).unwrap();
        let mut node = node_without_base_url();
        node.base_url = Some("   ".to_string());
        let command = InstanceCommand {
            instance_id: InstanceId::new(),
            name: "lobby-1".to_string(),
        };
        let err = dispatcher
            .dispatch(&node, CommandAction::Stop, &command)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::MissingBaseUrl(_)));
    }
}
