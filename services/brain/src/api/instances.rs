//! Instance API endpoints.
//!
//! Create, inspect, and drive instances through their lifecycle. The
//! lifecycle commands commit the state transition first and then dispatch
//! to the hosting node; a dispatch failure is reported as a gateway error
//! without unwinding the recorded transition (the stale-instance monitor
//! catches provisioning that never completes).

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use warren_id::{EventId, InstanceId, NodeId, TemplateId, TemplateVersionId};
use warren_proto::{
    CommandAction, InstanceCommand, InstanceEventType, InstanceState, PrepareInstanceCommand,
    PrepareLayer,
};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::{Instance, InstanceEvent};
use crate::registry::{LayerSpec, NewInstance};
use crate::state::AppState;

/// Create instance routes.
///
/// Instances are the unit of orchestration: /api/instances
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_instances).post(create_instance))
        .route("/{instance_id}", get(get_instance))
        .route("/{instance_id}/events", get(list_events))
        .route("/{instance_id}/prepare", post(prepare_instance))
        .route("/{instance_id}/start", post(start_instance))
        .route("/{instance_id}/stop", post(stop_instance))
        .route("/{instance_id}/destroy", post(destroy_instance))
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Request to create a new instance.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    /// Unique instance name.
    pub name: String,

    /// Human-readable display name.
    #[serde(default)]
    pub display_name: Option<String>,

    /// Explicit node pin; placement is skipped when set.
    #[serde(default)]
    pub node_id: Option<NodeId>,

    /// Placement constraint: required node region.
    #[serde(default)]
    pub region: Option<String>,

    /// Placement constraint: comma-separated required tags.
    #[serde(default)]
    pub tags: Option<String>,

    /// Placement constraint: required node dev-mode flag.
    #[serde(default)]
    pub dev_mode: Option<bool>,

    /// Port layout, opaque to the brain.
    #[serde(default)]
    pub ports_json: Option<String>,

    /// Structured substitution variables. Mutually exclusive with
    /// `variables_json`.
    #[serde(default)]
    pub variables: Option<HashMap<String, String>>,

    /// Pre-serialized substitution variables.
    #[serde(default)]
    pub variables_json: Option<String>,

    /// Template layers, merged lowest order index first.
    #[serde(default)]
    pub layers: Vec<InstanceLayerRequest>,
}

/// One requested template layer.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceLayerRequest {
    /// Resolve the template's latest version.
    #[serde(default)]
    pub template_id: Option<TemplateId>,

    /// Use this exact version.
    #[serde(default)]
    pub template_version_id: Option<TemplateVersionId>,

    /// Merge position; defaults to the layer's index in the request list.
    #[serde(default)]
    pub order_index: Option<i32>,
}

/// Response for a single instance.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceResponse {
    pub id: InstanceId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub state: InstanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_mode: Option<bool>,
    pub layers: Vec<InstanceLayerResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceLayerResponse {
    pub template_version_id: TemplateVersionId,
    pub order_index: i32,
}

impl From<Instance> for InstanceResponse {
    fn from(instance: Instance) -> Self {
        Self {
            id: instance.id,
            name: instance.name,
            display_name: instance.display_name,
            state: instance.state,
            node_id: instance.node_id,
            region: instance.requested_region,
            tags: instance.requested_tags,
            dev_mode: instance.dev_mode,
            layers: instance
                .layers
                .iter()
                .map(|layer| InstanceLayerResponse {
                    template_version_id: layer.template_version_id,
                    order_index: layer.order_index,
                })
                .collect(),
            ports_json: instance.ports_json,
            variables_json: instance.variables_json,
            failure_reason: instance.failure_reason,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
            started_at: instance.started_at,
            stopped_at: instance.stopped_at,
        }
    }
}

/// One entry of an instance's audit trail.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceEventResponse {
    pub id: EventId,
    pub instance_id: InstanceId,
    pub event_type: InstanceEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl From<InstanceEvent> for InstanceEventResponse {
    fn from(event: InstanceEvent) -> Self {
        Self {
            id: event.id,
            instance_id: event.instance_id,
            event_type: event.event_type,
            payload: event.payload,
            created_at: event.created_at,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// List all instances, newest first.
///
/// GET /api/instances
async fn list_instances(State(state): State<AppState>) -> impl IntoResponse {
    let instances: Vec<InstanceResponse> = state
        .registry()
        .list_instances()
        .await
        .into_iter()
        .map(InstanceResponse::from)
        .collect();
    Json(instances)
}

/// Get a single instance.
///
/// GET /api/instances/{instance_id}
async fn get_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<InstanceId>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = state
        .registry()
        .get_instance(instance_id)
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?;
    Ok(Json(InstanceResponse::from(instance)))
}

/// List an instance's audit trail, oldest first.
///
/// GET /api/instances/{instance_id}/events
async fn list_events(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<InstanceId>,
) -> Result<impl IntoResponse, ApiError> {
    let events: Vec<InstanceEventResponse> = state
        .registry()
        .instance_events(instance_id)
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?
        .into_iter()
        .map(InstanceEventResponse::from)
        .collect();
    Ok(Json(events))
}

/// Create a new instance in REQUESTED.
///
/// POST /api/instances
async fn create_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(request): Json<CreateInstanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // A structured variables map is normalized to its JSON form here; the
    // instance only ever stores variablesJson.
    let variables_json = match (request.variables, request.variables_json) {
        (Some(_), Some(_)) => {
            return Err(ApiError::bad_request(
                "invalid_request",
                "variables and variablesJson are mutually exclusive",
            )
            .with_request_id(ctx.request_id));
        }
        (Some(map), None) => Some(serde_json::to_string(&map).map_err(|e| {
            ApiError::internal("variables_serialization_failed", e.to_string())
                .with_request_id(ctx.request_id.clone())
        })?),
        (None, other) => other,
    };

    let spec = NewInstance {
        name: request.name,
        display_name: request.display_name,
        node_id: request.node_id,
        region: request.region,
        tags: request.tags,
        dev_mode: request.dev_mode,
        ports_json: request.ports_json,
        variables_json,
        layers: request
            .layers
            .iter()
            .map(|layer| LayerSpec {
                template_id: layer.template_id,
                template_version_id: layer.template_version_id,
                order_index: layer.order_index,
            })
            .collect(),
    };

    let instance = state
        .registry()
        .create_instance(spec, Utc::now())
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?;

    info!(instance_id = %instance.id, name = %instance.name, "Instance created");

    Ok((StatusCode::CREATED, Json(InstanceResponse::from(instance))))
}

/// Place a REQUESTED instance and dispatch its prepare command.
///
/// POST /api/instances/{instance_id}/prepare
async fn prepare_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<InstanceId>,
) -> Result<impl IntoResponse, ApiError> {
    // Resolve the material list up front so a catalog problem surfaces
    // before any state is committed.
    let current = state
        .registry()
        .get_instance(instance_id)
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?;
    let layers = state
        .registry()
        .resolve_layers(&current.layers)
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?;

    let (instance, node) = state
        .registry()
        .place_for_prepare(instance_id, Utc::now())
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?;

    let command = PrepareInstanceCommand {
        instance_id: instance.id,
        name: instance.name.clone(),
        display_name: instance.display_name.clone(),
        ports_json: instance.ports_json.clone(),
        variables: None,
        variables_json: instance.variables_json.clone(),
        layers: layers
            .into_iter()
            .map(|(version, order_index)| PrepareLayer {
                template_version_id: version.id,
                template_id: version.template_id,
                version: version.version,
                checksum: version.checksum,
                s3_key: version.s3_key,
                metadata_json: version.metadata_json,
                order_index,
            })
            .collect(),
    };

    state
        .dispatcher()
        .dispatch_prepare(&node, &command)
        .await
        .map_err(|e| ApiError::from_dispatch(e, &ctx.request_id))?;

    info!(
        instance_id = %instance.id,
        node_id = %node.id,
        layers = command.layers.len(),
        "Prepare dispatched"
    );

    Ok(Json(InstanceResponse::from(instance)))
}

/// Restart a STOPPED instance in place.
///
/// POST /api/instances/{instance_id}/start
async fn start_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<InstanceId>,
) -> Result<impl IntoResponse, ApiError> {
    dispatch_lifecycle(
        state,
        ctx,
        instance_id,
        InstanceState::Starting,
        InstanceEventType::StartDispatched,
        CommandAction::Start,
    )
    .await
}

/// Stop a RUNNING instance.
///
/// POST /api/instances/{instance_id}/stop
async fn stop_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<InstanceId>,
) -> Result<impl IntoResponse, ApiError> {
    dispatch_lifecycle(
        state,
        ctx,
        instance_id,
        InstanceState::Stopping,
        InstanceEventType::StopDispatched,
        CommandAction::Stop,
    )
    .await
}

/// Tear an instance down. A RUNNING instance is stopped first; the agent's
/// `destroyed` callback performs the final transition.
///
/// POST /api/instances/{instance_id}/destroy
async fn destroy_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<InstanceId>,
) -> Result<impl IntoResponse, ApiError> {
    let (instance, node) = state
        .registry()
        .begin_destroy(instance_id, Utc::now())
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?;

    let command = InstanceCommand {
        instance_id: instance.id,
        name: instance.name.clone(),
    };
    state
        .dispatcher()
        .dispatch(&node, CommandAction::Destroy, &command)
        .await
        .map_err(|e| ApiError::from_dispatch(e, &ctx.request_id))?;

    info!(instance_id = %instance.id, node_id = %node.id, "Destroy dispatched");

    Ok(Json(InstanceResponse::from(instance)))
}

async fn dispatch_lifecycle(
    state: AppState,
    ctx: RequestContext,
    instance_id: InstanceId,
    to: InstanceState,
    event_type: InstanceEventType,
    action: CommandAction,
) -> Result<Json<InstanceResponse>, ApiError> {
    let (instance, node) = state
        .registry()
        .command_transition(instance_id, to, event_type, Utc::now())
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?;

    let command = InstanceCommand {
        instance_id: instance.id,
        name: instance.name.clone(),
    };
    state
        .dispatcher()
        .dispatch(&node, action, &command)
        .await
        .map_err(|e| ApiError::from_dispatch(e, &ctx.request_id))?;

    info!(
        instance_id = %instance.id,
        node_id = %node.id,
        action = %action,
        state = %instance.state,
        "Command dispatched"
    );

    Ok(Json(InstanceResponse::from(instance)))
}
