//! Node API endpoints.
//!
//! Registration and heartbeats are internal APIs called by node agents;
//! the list and get endpoints serve operator tooling.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use warren_id::NodeId;
use warren_proto::{NodeHeartbeatRequest, NodeStatus, RegisterNodeRequest, RegisterNodeResponse};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::Node;
use crate::state::AppState;

/// Create node routes.
///
/// Nodes are top-level infrastructure resources: /api/nodes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_nodes))
        .route("/register", post(register_node))
        .route("/{node_id}", get(get_node))
        .route("/{node_id}/heartbeat", post(heartbeat))
}

/// Response for a single node.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResponse {
    pub id: NodeId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    pub dev_mode: bool,
    pub capacity_slots: i32,
    pub used_slots: i32,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_version: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl From<Node> for NodeResponse {
    fn from(node: Node) -> Self {
        Self {
            id: node.id,
            name: node.name,
            region: node.region,
            tags: node.tags,
            dev_mode: node.dev_mode,
            capacity_slots: node.capacity_slots,
            used_slots: node.used_slots,
            status: node.status,
            last_heartbeat_at: node.last_heartbeat_at,
            base_url: node.base_url,
            node_version: node.node_version,
            registered_at: node.registered_at,
        }
    }
}

/// List all registered nodes.
///
/// GET /api/nodes
async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    let nodes: Vec<NodeResponse> = state
        .registry()
        .list_nodes()
        .await
        .into_iter()
        .map(NodeResponse::from)
        .collect();
    Json(nodes)
}

/// Get a single node.
///
/// GET /api/nodes/{node_id}
async fn get_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(node_id): Path<NodeId>,
) -> Result<impl IntoResponse, ApiError> {
    let node = state
        .registry()
        .get_node(node_id)
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?;
    Ok(Json(NodeResponse::from(node)))
}

/// Register a node, upserting on name.
///
/// POST /api/nodes/register
async fn register_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(request): Json<RegisterNodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let node = state
        .registry()
        .register_node(&request, Utc::now())
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?;

    info!(
        node_id = %node.id,
        name = %node.name,
        capacity_slots = node.capacity_slots,
        "Node registered"
    );

    let response = RegisterNodeResponse {
        node_id: node.id,
        heartbeat_interval_seconds: state.config().heartbeat_interval.as_secs(),
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// Record a node heartbeat.
///
/// POST /api/nodes/{node_id}/heartbeat
async fn heartbeat(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(node_id): Path<NodeId>,
    Json(request): Json<NodeHeartbeatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let node = state
        .registry()
        .record_heartbeat(node_id, request.status, request.used_slots, Utc::now())
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?;
    Ok(Json(NodeResponse::from(node)))
}
