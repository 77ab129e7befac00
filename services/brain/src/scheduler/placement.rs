//! Node selection for instance placement.

use warren_id::NodeId;
use warren_proto::NodeStatus;

use crate::model::{parse_tags, Node};

/// Placement constraints captured from the instance request.
#[derive(Debug, Clone, Default)]
pub struct PlacementRequest {
    /// Exact-match region after trimming; blank or absent means any region.
    pub region: Option<String>,
    /// Comma-separated tags the node must cover (case-insensitive superset).
    pub tags: Option<String>,
    /// When set, the node's dev-mode flag must match exactly.
    pub dev_mode: Option<bool>,
}

/// Picks the node to host an instance, or `None` when no candidate survives
/// filtering. Exhaustion is not an error; the caller decides (typically by
/// leaving the instance REQUESTED).
///
/// Survivors are ranked by (used slots, name, id) ascending so placement is
/// deterministic under equal load.
pub fn select_node(nodes: &[Node], request: &PlacementRequest) -> Option<NodeId> {
    let wanted_region = request
        .region
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty());
    let wanted_tags = request
        .tags
        .as_deref()
        .map(parse_tags)
        .unwrap_or_default();

    nodes
        .iter()
        .filter(|node| node.status == NodeStatus::Online)
        .filter(|node| match wanted_region {
            Some(region) => node
                .region
                .as_deref()
                .map(str::trim)
                .is_some_and(|r| r == region),
            None => true,
        })
        .filter(|node| match request.dev_mode {
            Some(dev_mode) => node.dev_mode == dev_mode,
            None => true,
        })
        .filter(|node| node.has_free_slot())
        .filter(|node| wanted_tags.is_subset(&node.tag_set()))
        .min_by(|a, b| {
            a.used_slots
                .cmp(&b.used_slots)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|node| node.id)
}
