//! Node registration, heartbeat, and cache-admin payloads.

use serde::{Deserialize, Serialize};
use warren_id::{NodeId, TemplateId};

use crate::types::NodeStatus;

fn default_capacity() -> i32 {
    1
}

/// Agent→brain registration request. Registration is an upsert keyed on
/// `name`; re-registering refreshes the node's metadata and heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Comma-separated capability tags, matched as a lowercase set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default = "default_capacity")]
    pub capacity_slots: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_version: Option<String>,
    pub base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeResponse {
    pub node_id: NodeId,
    pub heartbeat_interval_seconds: u64,
}

/// Periodic agent→brain heartbeat. `used_slots` must stay within the node's
/// registered capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHeartbeatRequest {
    pub status: NodeStatus,
    pub used_slots: i32,
}

/// Cache purge request for the agent's admin endpoint. No template id means
/// purge everything under the cache root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeCacheRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<TemplateId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeCacheResponse {
    /// "all" or "template".
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<TemplateId>,
    pub deleted_files: u64,
    pub deleted_directories: u64,
    pub deleted_bytes: u64,
}
