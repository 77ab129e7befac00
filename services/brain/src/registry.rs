//! In-process registry of nodes, instances, templates, and the audit trail.
//!
//! All entity state lives behind one `tokio::sync::RwLock`, and every
//! multi-step rule (name uniqueness, placement plus transition, callback
//! guards, stale re-checks) executes inside a single lock scope so API
//! traffic and the background sweeps never observe a half-applied change.
//! Durable persistence is an external collaborator; this module is the seam
//! a database would slot into.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;
use warren_id::{EventId, InstanceId, NodeId, TemplateId, TemplateVersionId};
use warren_proto::{
    CallbackKind, InstanceEventType, InstanceState, NodeStatus, RegisterNodeRequest,
};

use crate::lifecycle::{self, TransitionError};
use crate::model::{Instance, InstanceEvent, InstanceLayer, Node, Template, TemplateVersion};
use crate::scheduler::{select_node, PlacementRequest};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("instance {0} not found")]
    InstanceNotFound(InstanceId),

    #[error("template {0} not found")]
    TemplateNotFound(TemplateId),

    #[error("template version {0} not found")]
    TemplateVersionNotFound(TemplateVersionId),

    #[error("template {0} has no versions")]
    TemplateHasNoVersions(TemplateId),

    #[error("an instance named {0:?} already exists")]
    DuplicateInstanceName(String),

    #[error("a template named {0:?} already exists")]
    DuplicateTemplateName(String),

    #[error("template {template_id} already has version {version:?}")]
    DuplicateTemplateVersion {
        template_id: TemplateId,
        version: String,
    },

    #[error("instance {0} is not assigned to a node")]
    InstanceNotAssigned(InstanceId),

    #[error("instance {instance_id} is not assigned to node {node_id}")]
    NodeMismatch {
        instance_id: InstanceId,
        node_id: NodeId,
    },

    #[error("no eligible node for instance {0}")]
    NoEligibleNode(InstanceId),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// What the create API accepts for a new instance.
#[derive(Debug, Clone, Default)]
pub struct NewInstance {
    pub name: String,
    pub display_name: Option<String>,
    /// Explicit node pin; placement is skipped for pinned instances.
    pub node_id: Option<NodeId>,
    pub region: Option<String>,
    pub tags: Option<String>,
    pub dev_mode: Option<bool>,
    pub ports_json: Option<String>,
    pub variables_json: Option<String>,
    pub layers: Vec<LayerSpec>,
}

/// One requested layer: an explicit version, or a template whose latest
/// version is resolved at create time.
#[derive(Debug, Clone, Default)]
pub struct LayerSpec {
    pub template_id: Option<TemplateId>,
    pub template_version_id: Option<TemplateVersionId>,
    /// Defaults to the layer's position in the request list.
    pub order_index: Option<i32>,
}

#[derive(Default)]
struct RegistryInner {
    nodes: HashMap<NodeId, Node>,
    instances: HashMap<InstanceId, Instance>,
    templates: HashMap<TemplateId, Template>,
    template_versions: HashMap<TemplateVersionId, TemplateVersion>,
    events: HashMap<InstanceId, Vec<InstanceEvent>>,
}

/// Shared entity store. Cheap to clone via `Arc` in `AppState`.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    /// Registers a node, upserting on name. Re-registration refreshes the
    /// node's metadata and heartbeat and keeps its id.
    pub async fn register_node(
        &self,
        request: &RegisterNodeRequest,
        now: DateTime<Utc>,
    ) -> Result<Node, RegistryError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(RegistryError::Validation("node name is required".into()));
        }
        if request.capacity_slots < 1 {
            return Err(RegistryError::Validation(
                "capacitySlots must be at least 1".into(),
            ));
        }
        if request.base_url.trim().is_empty() {
            return Err(RegistryError::Validation("baseUrl is required".into()));
        }

        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.nodes.values_mut().find(|n| n.name == name) {
            existing.region = request.region.clone();
            existing.tags = request.tags.clone();
            existing.dev_mode = request.dev_mode;
            existing.capacity_slots = request.capacity_slots;
            existing.base_url = Some(request.base_url.clone());
            existing.node_version = request.node_version.clone();
            existing.last_heartbeat_at = Some(now);
            return Ok(existing.clone());
        }

        let node = Node {
            id: NodeId::new(),
            name: name.to_string(),
            region: request.region.clone(),
            tags: request.tags.clone(),
            dev_mode: request.dev_mode,
            capacity_slots: request.capacity_slots,
            used_slots: 0,
            status: NodeStatus::Unknown,
            last_heartbeat_at: Some(now),
            base_url: Some(request.base_url.clone()),
            node_version: request.node_version.clone(),
            registered_at: now,
        };
        inner.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    /// Records a heartbeat after validating status and slot bounds.
    pub async fn record_heartbeat(
        &self,
        node_id: NodeId,
        status: NodeStatus,
        used_slots: i32,
        now: DateTime<Utc>,
    ) -> Result<Node, RegistryError> {
        if status == NodeStatus::Unknown {
            return Err(RegistryError::Validation(
                "heartbeat status must be ONLINE or OFFLINE".into(),
            ));
        }
        if used_slots < 0 {
            return Err(RegistryError::Validation(
                "usedSlots cannot be negative".into(),
            ));
        }
        let mut inner = self.inner.write().await;
        let node = inner
            .nodes
            .get_mut(&node_id)
            .ok_or(RegistryError::NodeNotFound(node_id))?;
        if used_slots > node.capacity_slots {
            return Err(RegistryError::Validation(
                "usedSlots cannot be greater than capacitySlots".into(),
            ));
        }
        node.record_heartbeat(status, used_slots, now);
        Ok(node.clone())
    }

    pub async fn get_node(&self, node_id: NodeId) -> Result<Node, RegistryError> {
        let inner = self.inner.read().await;
        inner
            .nodes
            .get(&node_id)
            .cloned()
            .ok_or(RegistryError::NodeNotFound(node_id))
    }

    /// All nodes, ordered by name for stable listings.
    pub async fn list_nodes(&self) -> Vec<Node> {
        let inner = self.inner.read().await;
        let mut nodes: Vec<Node> = inner.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    /// Marks every non-OFFLINE node whose last heartbeat predates `cutoff`
    /// as OFFLINE, returning the affected ids. No event is recorded; a fresh
    /// heartbeat or registration reverses the decay.
    pub async fn sweep_missed_heartbeats(&self, cutoff: DateTime<Utc>) -> Vec<NodeId> {
        let mut inner = self.inner.write().await;
        let mut marked = Vec::new();
        for node in inner.nodes.values_mut() {
            if node.status == NodeStatus::Offline {
                continue;
            }
            let stale = node.last_heartbeat_at.map_or(true, |at| at < cutoff);
            if stale {
                node.status = NodeStatus::Offline;
                marked.push(node.id);
            }
        }
        marked
    }

    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    pub async fn create_template(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Template, RegistryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::Validation(
                "template name is required".into(),
            ));
        }
        let mut inner = self.inner.write().await;
        if inner.templates.values().any(|t| t.name == name) {
            return Err(RegistryError::DuplicateTemplateName(name.to_string()));
        }
        let template = Template {
            id: TemplateId::new(),
            name: name.to_string(),
            created_at: now,
        };
        inner.templates.insert(template.id, template.clone());
        Ok(template)
    }

    /// Appends an immutable version to a template.
    pub async fn add_template_version(
        &self,
        template_id: TemplateId,
        version: &str,
        checksum: &str,
        s3_key: &str,
        metadata_json: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TemplateVersion, RegistryError> {
        let version = version.trim();
        let checksum = checksum.trim();
        let s3_key = s3_key.trim();
        if version.is_empty() || checksum.is_empty() || s3_key.is_empty() {
            return Err(RegistryError::Validation(
                "version, checksum, and s3Key are required".into(),
            ));
        }
        let mut inner = self.inner.write().await;
        if !inner.templates.contains_key(&template_id) {
            return Err(RegistryError::TemplateNotFound(template_id));
        }
        let duplicate = inner
            .template_versions
            .values()
            .any(|v| v.template_id == template_id && v.version == version);
        if duplicate {
            return Err(RegistryError::DuplicateTemplateVersion {
                template_id,
                version: version.to_string(),
            });
        }
        let template_version = TemplateVersion {
            id: TemplateVersionId::new(),
            template_id,
            version: version.to_string(),
            checksum: checksum.to_string(),
            s3_key: s3_key.to_string(),
            metadata_json,
            created_at: now,
        };
        inner
            .template_versions
            .insert(template_version.id, template_version.clone());
        Ok(template_version)
    }

    pub async fn list_templates(&self) -> Vec<Template> {
        let inner = self.inner.read().await;
        let mut templates: Vec<Template> = inner.templates.values().cloned().collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        templates
    }

    pub async fn get_template(&self, template_id: TemplateId) -> Result<Template, RegistryError> {
        let inner = self.inner.read().await;
        inner
            .templates
            .get(&template_id)
            .cloned()
            .ok_or(RegistryError::TemplateNotFound(template_id))
    }

    /// Versions of one template, oldest first.
    pub async fn list_template_versions(
        &self,
        template_id: TemplateId,
    ) -> Result<Vec<TemplateVersion>, RegistryError> {
        let inner = self.inner.read().await;
        if !inner.templates.contains_key(&template_id) {
            return Err(RegistryError::TemplateNotFound(template_id));
        }
        let mut versions: Vec<TemplateVersion> = inner
            .template_versions
            .values()
            .filter(|v| v.template_id == template_id)
            .cloned()
            .collect();
        versions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(versions)
    }

    /// Resolves the versions referenced by an instance's layers, in layer
    /// order, for building a prepare payload.
    pub async fn resolve_layers(
        &self,
        layers: &[InstanceLayer],
    ) -> Result<Vec<(TemplateVersion, i32)>, RegistryError> {
        let inner = self.inner.read().await;
        let mut resolved = Vec::with_capacity(layers.len());
        for layer in layers {
            let version = inner
                .template_versions
                .get(&layer.template_version_id)
                .cloned()
                .ok_or(RegistryError::TemplateVersionNotFound(
                    layer.template_version_id,
                ))?;
            resolved.push((version, layer.order_index));
        }
        Ok(resolved)
    }

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    /// Creates an instance in REQUESTED with its REQUEST_RECEIVED event.
    ///
    /// Layer specs are validated (at least one layer, order indices >= 0 and
    /// unique, each naming a template or version), versions are resolved
    /// (explicit version id, or the template's latest), and the layer list is
    /// stored sorted by order index.
    pub async fn create_instance(
        &self,
        spec: NewInstance,
        now: DateTime<Utc>,
    ) -> Result<Instance, RegistryError> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(RegistryError::Validation(
                "instance name is required".into(),
            ));
        }

        let mut inner = self.inner.write().await;
        if inner.instances.values().any(|i| i.name == name) {
            return Err(RegistryError::DuplicateInstanceName(name.to_string()));
        }
        if let Some(node_id) = spec.node_id {
            if !inner.nodes.contains_key(&node_id) {
                return Err(RegistryError::NodeNotFound(node_id));
            }
        }
        let mut layers = resolve_layer_specs(&inner, &spec.layers)?;
        layers.sort_by_key(|l| l.order_index);

        let instance = Instance {
            id: InstanceId::new(),
            name: name.to_string(),
            display_name: spec.display_name,
            state: InstanceState::Requested,
            node_id: spec.node_id,
            requested_region: spec.region,
            requested_tags: spec.tags,
            dev_mode: spec.dev_mode,
            layers,
            ports_json: spec.ports_json,
            variables_json: spec.variables_json,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
        };
        inner.instances.insert(instance.id, instance.clone());
        inner.events.entry(instance.id).or_default().push(InstanceEvent {
            id: EventId::new(),
            instance_id: instance.id,
            event_type: InstanceEventType::RequestReceived,
            payload: None,
            created_at: now,
        });
        Ok(instance)
    }

    pub async fn get_instance(&self, instance_id: InstanceId) -> Result<Instance, RegistryError> {
        let inner = self.inner.read().await;
        inner
            .instances
            .get(&instance_id)
            .cloned()
            .ok_or(RegistryError::InstanceNotFound(instance_id))
    }

    /// All instances, newest first.
    pub async fn list_instances(&self) -> Vec<Instance> {
        let inner = self.inner.read().await;
        let mut instances: Vec<Instance> = inner.instances.values().cloned().collect();
        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        instances
    }

    /// Audit trail for one instance, ascending by timestamp.
    pub async fn instance_events(
        &self,
        instance_id: InstanceId,
    ) -> Result<Vec<InstanceEvent>, RegistryError> {
        let inner = self.inner.read().await;
        if !inner.instances.contains_key(&instance_id) {
            return Err(RegistryError::InstanceNotFound(instance_id));
        }
        let mut events = inner.events.get(&instance_id).cloned().unwrap_or_default();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(events)
    }

    /// Places a REQUESTED instance and moves it to PREPARING.
    ///
    /// Pinned instances keep their node; otherwise placement runs over the
    /// current node set with the instance's stored constraints. Exhaustion
    /// leaves the instance REQUESTED and surfaces [`RegistryError::NoEligibleNode`].
    /// Returns the updated instance and the hosting node for dispatch.
    pub async fn place_for_prepare(
        &self,
        instance_id: InstanceId,
        now: DateTime<Utc>,
    ) -> Result<(Instance, Node), RegistryError> {
        let mut inner = self.inner.write().await;
        let instance = inner
            .instances
            .get(&instance_id)
            .ok_or(RegistryError::InstanceNotFound(instance_id))?;
        if !lifecycle::is_allowed(instance.state, InstanceState::Preparing) {
            return Err(TransitionError::InvalidTransition {
                from: instance.state,
                to: InstanceState::Preparing,
            }
            .into());
        }

        let node_id = match instance.node_id {
            Some(pinned) => {
                if !inner.nodes.contains_key(&pinned) {
                    return Err(RegistryError::NodeNotFound(pinned));
                }
                pinned
            }
            None => {
                let request = PlacementRequest {
                    region: instance.requested_region.clone(),
                    tags: instance.requested_tags.clone(),
                    dev_mode: instance.dev_mode,
                };
                let nodes: Vec<Node> = inner.nodes.values().cloned().collect();
                select_node(&nodes, &request)
                    .ok_or(RegistryError::NoEligibleNode(instance_id))?
            }
        };

        let instance = inner
            .instances
            .get_mut(&instance_id)
            .ok_or(RegistryError::InstanceNotFound(instance_id))?;
        instance.node_id = Some(node_id);
        let event = lifecycle::transition(
            instance,
            InstanceState::Preparing,
            InstanceEventType::PrepareDispatched,
            now,
            None,
        )?;
        let snapshot = instance.clone();
        inner.events.entry(instance_id).or_default().push(event);
        let node = inner.nodes[&node_id].clone();
        Ok((snapshot, node))
    }

    /// Applies a command-driven transition (start, stop) and returns the
    /// instance plus its hosting node for dispatch.
    pub async fn command_transition(
        &self,
        instance_id: InstanceId,
        to: InstanceState,
        event_type: InstanceEventType,
        now: DateTime<Utc>,
    ) -> Result<(Instance, Node), RegistryError> {
        let mut inner = self.inner.write().await;
        let instance = inner
            .instances
            .get(&instance_id)
            .ok_or(RegistryError::InstanceNotFound(instance_id))?;
        let node_id = instance
            .node_id
            .ok_or(RegistryError::InstanceNotAssigned(instance_id))?;
        if !inner.nodes.contains_key(&node_id) {
            return Err(RegistryError::NodeNotFound(node_id));
        }

        let instance = inner
            .instances
            .get_mut(&instance_id)
            .ok_or(RegistryError::InstanceNotFound(instance_id))?;
        let event = lifecycle::transition(instance, to, event_type, now, None)?;
        let snapshot = instance.clone();
        inner.events.entry(instance_id).or_default().push(event);
        let node = inner.nodes[&node_id].clone();
        Ok((snapshot, node))
    }

    /// Begins a destroy: a RUNNING instance moves to STOPPING (the agent
    /// stops the process before tearing down), a STOPPED instance is
    /// dispatched as-is. The `destroyed` callback performs the final
    /// transition.
    pub async fn begin_destroy(
        &self,
        instance_id: InstanceId,
        now: DateTime<Utc>,
    ) -> Result<(Instance, Node), RegistryError> {
        let mut inner = self.inner.write().await;
        let instance = inner
            .instances
            .get(&instance_id)
            .ok_or(RegistryError::InstanceNotFound(instance_id))?;
        let node_id = instance
            .node_id
            .ok_or(RegistryError::InstanceNotAssigned(instance_id))?;
        if !inner.nodes.contains_key(&node_id) {
            return Err(RegistryError::NodeNotFound(node_id));
        }

        let instance = inner
            .instances
            .get_mut(&instance_id)
            .ok_or(RegistryError::InstanceNotFound(instance_id))?;
        match instance.state {
            InstanceState::Running => {
                let event = lifecycle::transition(
                    instance,
                    InstanceState::Stopping,
                    InstanceEventType::StopDispatched,
                    now,
                    None,
                )?;
                let snapshot = instance.clone();
                inner.events.entry(instance_id).or_default().push(event);
                let node = inner.nodes[&node_id].clone();
                Ok((snapshot, node))
            }
            InstanceState::Stopped => {
                let snapshot = instance.clone();
                let node = inner.nodes[&node_id].clone();
                Ok((snapshot, node))
            }
            from => Err(TransitionError::InvalidTransition {
                from,
                to: InstanceState::Destroyed,
            }
            .into()),
        }
    }

    /// Applies a node-reported lifecycle callback.
    ///
    /// Guards: the node and instance must exist, the instance must be
    /// assigned, and the assigned node must be the caller.
    pub async fn apply_callback(
        &self,
        node_id: NodeId,
        instance_id: InstanceId,
        kind: CallbackKind,
        now: DateTime<Utc>,
    ) -> Result<Instance, RegistryError> {
        let (to, event_type, reason) = match kind {
            CallbackKind::Prepared => (
                InstanceState::Starting,
                InstanceEventType::PrepareCompleted,
                None,
            ),
            CallbackKind::Running => (
                InstanceState::Running,
                InstanceEventType::StartCompleted,
                None,
            ),
            CallbackKind::Stopped => (
                InstanceState::Stopped,
                InstanceEventType::StopCompleted,
                None,
            ),
            CallbackKind::Destroyed => (
                InstanceState::Destroyed,
                InstanceEventType::DestroyCompleted,
                None,
            ),
            CallbackKind::Failed => (
                InstanceState::Failed,
                InstanceEventType::FailureReported,
                Some("reported by node"),
            ),
        };

        let mut inner = self.inner.write().await;
        if !inner.nodes.contains_key(&node_id) {
            return Err(RegistryError::NodeNotFound(node_id));
        }
        let instance = inner
            .instances
            .get_mut(&instance_id)
            .ok_or(RegistryError::InstanceNotFound(instance_id))?;
        let assigned = instance
            .node_id
            .ok_or(RegistryError::InstanceNotAssigned(instance_id))?;
        if assigned != node_id {
            return Err(RegistryError::NodeMismatch {
                instance_id,
                node_id,
            });
        }

        let event = lifecycle::transition(instance, to, event_type, now, reason)?;
        let snapshot = instance.clone();
        inner.events.entry(instance_id).or_default().push(event);
        Ok(snapshot)
    }

    /// Fails instances stuck in `state` since before `cutoff`.
    ///
    /// Candidates are collected under a read lock, then each is re-checked
    /// under the write lock immediately before the FAILED transition so a
    /// concurrent legitimate transition is never clobbered. Returns the ids
    /// actually failed.
    pub async fn sweep_stale_instances(
        &self,
        state: InstanceState,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<InstanceId> {
        let candidates: Vec<InstanceId> = {
            let inner = self.inner.read().await;
            inner
                .instances
                .values()
                .filter(|i| i.state == state && i.updated_at < cutoff)
                .map(|i| i.id)
                .collect()
        };
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut failed = Vec::new();
        let mut inner = self.inner.write().await;
        for instance_id in candidates {
            let Some(instance) = inner.instances.get_mut(&instance_id) else {
                continue;
            };
            // Re-check: the instance may have moved on while we waited.
            if instance.state != state || instance.updated_at >= cutoff {
                continue;
            }
            match lifecycle::transition(
                instance,
                InstanceState::Failed,
                InstanceEventType::FailureTimeout,
                now,
                Some("timeout"),
            ) {
                Ok(event) => {
                    inner.events.entry(instance_id).or_default().push(event);
                    failed.push(instance_id);
                }
                Err(error) => {
                    warn!(
                        instance_id = %instance_id,
                        error = %error,
                        "Stale sweep transition rejected"
                    );
                }
            }
        }
        failed
    }
}

fn resolve_layer_specs(
    inner: &RegistryInner,
    specs: &[LayerSpec],
) -> Result<Vec<InstanceLayer>, RegistryError> {
    if specs.is_empty() {
        return Err(RegistryError::Validation(
            "at least one template layer is required".into(),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    let mut layers = Vec::with_capacity(specs.len());
    for (position, spec) in specs.iter().enumerate() {
        let order_index = spec.order_index.unwrap_or(position as i32);
        if order_index < 0 {
            return Err(RegistryError::Validation(
                "layer order index must be >= 0".into(),
            ));
        }
        if !seen.insert(order_index) {
            return Err(RegistryError::Validation(format!(
                "duplicate layer order index {order_index}"
            )));
        }

        let version = match (spec.template_version_id, spec.template_id) {
            (Some(version_id), template_id) => {
                let version = inner
                    .template_versions
                    .get(&version_id)
                    .ok_or(RegistryError::TemplateVersionNotFound(version_id))?;
                if let Some(template_id) = template_id {
                    if version.template_id != template_id {
                        return Err(RegistryError::Validation(
                            "templateVersionId does not belong to templateId".into(),
                        ));
                    }
                }
                version
            }
            (None, Some(template_id)) => {
                if !inner.templates.contains_key(&template_id) {
                    return Err(RegistryError::TemplateNotFound(template_id));
                }
                inner
                    .template_versions
                    .values()
                    .filter(|v| v.template_id == template_id)
                    .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
                    .ok_or(RegistryError::TemplateHasNoVersions(template_id))?
            }
            (None, None) => {
                return Err(RegistryError::Validation(
                    "templateId or templateVersionId is required for each layer".into(),
                ));
            }
        };

        layers.push(InstanceLayer {
            template_version_id: version.id,
            order_index,
        });
    }
    Ok(layers)
}
