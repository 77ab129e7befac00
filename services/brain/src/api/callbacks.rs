//! Node→brain lifecycle callbacks.
//!
//! Agents report command outcomes by POSTing to
//! `/api/nodes/{node_id}/instances/{instance_id}/{kind}`. Each callback is
//! guarded: the node must exist, the instance must exist and be assigned,
//! and the assigned node must be the caller.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use tracing::info;
use warren_id::{InstanceId, NodeId};
use warren_proto::CallbackKind;

use crate::api::error::ApiError;
use crate::api::instances::InstanceResponse;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

/// Create callback routes, nested under /api/nodes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/{node_id}/instances/{instance_id}/prepared",
            post(prepared),
        )
        .route("/{node_id}/instances/{instance_id}/running", post(running))
        .route("/{node_id}/instances/{instance_id}/stopped", post(stopped))
        .route(
            "/{node_id}/instances/{instance_id}/destroyed",
            post(destroyed),
        )
        .route("/{node_id}/instances/{instance_id}/failed", post(failed))
}

async fn prepared(
    state: State<AppState>,
    ctx: RequestContext,
    path: Path<(NodeId, InstanceId)>,
) -> Result<impl IntoResponse, ApiError> {
    apply(state, ctx, path, CallbackKind::Prepared).await
}

async fn running(
    state: State<AppState>,
    ctx: RequestContext,
    path: Path<(NodeId, InstanceId)>,
) -> Result<impl IntoResponse, ApiError> {
    apply(state, ctx, path, CallbackKind::Running).await
}

async fn stopped(
    state: State<AppState>,
    ctx: RequestContext,
    path: Path<(NodeId, InstanceId)>,
) -> Result<impl IntoResponse, ApiError> {
    apply(state, ctx, path, CallbackKind::Stopped).await
}

async fn destroyed(
    state: State<AppState>,
    ctx: RequestContext,
    path: Path<(NodeId, InstanceId)>,
) -> Result<impl IntoResponse, ApiError> {
    apply(state, ctx, path, CallbackKind::Destroyed).await
}

async fn failed(
    state: State<AppState>,
    ctx: RequestContext,
    path: Path<(NodeId, InstanceId)>,
) -> Result<impl IntoResponse, ApiError> {
    apply(state, ctx, path, CallbackKind::Failed).await
}

async fn apply(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((node_id, instance_id)): Path<(NodeId, InstanceId)>,
    kind: CallbackKind,
) -> Result<(StatusCode, Json<InstanceResponse>), ApiError> {
    let instance = state
        .registry()
        .apply_callback(node_id, instance_id, kind, Utc::now())
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?;

    info!(
        instance_id = %instance_id,
        node_id = %node_id,
        callback = %kind,
        state = %instance.state,
        "Callback applied"
    );

    Ok((StatusCode::OK, Json(InstanceResponse::from(instance))))
}
