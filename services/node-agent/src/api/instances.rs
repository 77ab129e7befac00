//! Instance command endpoints.
//!
//! The brain POSTs commands to `/api/instances/{instance_id}/{action}`.
//! Commands run synchronously; the matching lifecycle callback has already
//! been delivered by the time a 200 goes out.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use warren_id::InstanceId;
use warren_proto::{InstanceCommand, PrepareInstanceCommand};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

/// Create instance command routes, nested under /api/instances.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/{instance_id}/prepare", post(prepare))
        .route("/{instance_id}/start", post(start))
        .route("/{instance_id}/stop", post(stop))
        .route("/{instance_id}/destroy", post(destroy))
}

/// The path and body must name the same instance; a disagreement means a
/// routing bug on the brain side and is rejected outright.
fn ensure_ids_match(
    path_id: InstanceId,
    body_id: InstanceId,
    ctx: &RequestContext,
) -> Result<(), ApiError> {
    if path_id != body_id {
        return Err(ApiError::bad_request(
            "instance_id_mismatch",
            format!("path names {path_id} but the body names {body_id}"),
        )
        .with_request_id(ctx.request_id.clone()));
    }
    Ok(())
}

/// Assemble an instance's workspace from template layers.
///
/// POST /api/instances/{instance_id}/prepare
async fn prepare(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<InstanceId>,
    Json(command): Json<PrepareInstanceCommand>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_ids_match(instance_id, command.instance_id, &ctx)?;
    state
        .instances()
        .prepare(&command)
        .await
        .map_err(|e| ApiError::from_command(e, &ctx.request_id))?;
    Ok(StatusCode::OK)
}

/// POST /api/instances/{instance_id}/start
async fn start(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<InstanceId>,
    Json(command): Json<InstanceCommand>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_ids_match(instance_id, command.instance_id, &ctx)?;
    state
        .instances()
        .start(&command)
        .await
        .map_err(|e| ApiError::from_command(e, &ctx.request_id))?;
    Ok(StatusCode::OK)
}

/// POST /api/instances/{instance_id}/stop
async fn stop(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<InstanceId>,
    Json(command): Json<InstanceCommand>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_ids_match(instance_id, command.instance_id, &ctx)?;
    state
        .instances()
        .stop(&command)
        .await
        .map_err(|e| ApiError::from_command(e, &ctx.request_id))?;
    Ok(StatusCode::OK)
}

/// Remove the instance's workspace.
///
/// POST /api/instances/{instance_id}/destroy
async fn destroy(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<InstanceId>,
    Json(command): Json<InstanceCommand>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_ids_match(instance_id, command.instance_id, &ctx)?;
    state
        .instances()
        .destroy(&command)
        .await
        .map_err(|e| ApiError::from_command(e, &ctx.request_id))?;
    Ok(StatusCode::OK)
}
