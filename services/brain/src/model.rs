//! Domain entities tracked by the brain.
//!
//! Nodes and instances are the two mutable records; templates and template
//! versions form an append-only catalog; instance events are the audit trail.
//! State enums live in `warren-proto` because both services speak them on the
//! wire.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use warren_id::{EventId, InstanceId, NodeId, TemplateId, TemplateVersionId};
use warren_proto::{InstanceEventType, InstanceState, NodeStatus};

/// Parses a free-form tag string into a normalized set.
///
/// Tags are comma-separated, matched case-insensitively, and surrounding
/// whitespace is ignored. Empty segments are dropped, so `"ssd,,ssd "` is the
/// single tag `ssd`.
pub fn parse_tags(tags: &str) -> BTreeSet<String> {
    tags.split(',')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// A worker machine capable of hosting instances.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    /// Unique across the fleet; registration upserts on this.
    pub name: String,
    pub region: Option<String>,
    /// Raw comma-separated tag string as registered; match via [`Node::tag_set`].
    pub tags: Option<String>,
    pub dev_mode: bool,
    pub capacity_slots: i32,
    pub used_slots: i32,
    pub status: NodeStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Where the brain posts lifecycle commands. Absent until the agent
    /// advertises one; dispatch fails fast without it.
    pub base_url: Option<String>,
    pub node_version: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl Node {
    pub fn tag_set(&self) -> BTreeSet<String> {
        self.tags.as_deref().map(parse_tags).unwrap_or_default()
    }

    pub fn has_free_slot(&self) -> bool {
        self.used_slots < self.capacity_slots
    }

    /// Applies a heartbeat: status, load, and liveness timestamp.
    pub fn record_heartbeat(&mut self, status: NodeStatus, used_slots: i32, now: DateTime<Utc>) {
        self.status = status;
        self.used_slots = used_slots;
        self.last_heartbeat_at = Some(now);
    }
}

/// One template version applied at a given overlay position.
///
/// Order indices are unique per instance; lower indices are applied first and
/// later layers win on path conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceLayer {
    pub template_version_id: TemplateVersionId,
    pub order_index: i32,
}

/// One provisioned, templated server process tracked through its lifecycle.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    /// Unique across all instances, terminal ones included.
    pub name: String,
    pub display_name: Option<String>,
    pub state: InstanceState,
    /// Set when placement assigns a node; cleared never (terminal instances
    /// keep their last assignment for the audit trail).
    pub node_id: Option<NodeId>,
    /// Placement constraints captured at creation.
    pub requested_region: Option<String>,
    pub requested_tags: Option<String>,
    pub dev_mode: Option<bool>,
    pub layers: Vec<InstanceLayer>,
    pub ports_json: Option<String>,
    /// Normalized at creation: a structured variables map is serialized into
    /// this JSON string, so only one representation is ever stored.
    pub variables_json: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// A named template; versions are append-only under it.
#[derive(Debug, Clone)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// An immutable, checksummed snapshot of a template's contents.
#[derive(Debug, Clone)]
pub struct TemplateVersion {
    pub id: TemplateVersionId,
    pub template_id: TemplateId,
    pub version: String,
    /// SHA-256 hex digest of the stored tarball.
    pub checksum: String,
    /// Object-storage key locating the tarball.
    pub s3_key: String,
    pub metadata_json: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit record; exactly one per applied state transition.
#[derive(Debug, Clone)]
pub struct InstanceEvent {
    pub id: EventId,
    pub instance_id: InstanceId,
    pub event_type: InstanceEventType,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
