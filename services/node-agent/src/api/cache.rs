//! Cache administration endpoints.

use axum::{body::Bytes, extract::State, response::IntoResponse, routing::post, Json, Router};
use tracing::info;
use warren_proto::{PurgeCacheRequest, PurgeCacheResponse};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

/// Create cache admin routes, nested under /api/cache.
pub fn routes() -> Router<AppState> {
    Router::new().route("/purge", post(purge))
}

/// Purge the template cache: everything, or one template when the body
/// names one. An empty body means purge everything.
///
/// POST /api/cache/purge
async fn purge(
    State(state): State<AppState>,
    ctx: RequestContext,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: PurgeCacheRequest = if body.is_empty() {
        PurgeCacheRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            ApiError::bad_request("invalid_purge_request", e.to_string())
                .with_request_id(ctx.request_id.clone())
        })?
    };

    let response = match request.template_id {
        Some(template_id) => {
            let totals = state
                .cache_manager()
                .purge_template(&template_id.to_string())
                .map_err(|e| ApiError::from_purge(e, &ctx.request_id))?;
            PurgeCacheResponse {
                scope: "template".to_string(),
                template_id: Some(template_id),
                deleted_files: totals.files_deleted,
                deleted_directories: totals.directories_deleted,
                deleted_bytes: totals.bytes_reclaimed,
            }
        }
        None => {
            let totals = state
                .cache_manager()
                .purge_all()
                .map_err(|e| ApiError::from_purge(e, &ctx.request_id))?;
            PurgeCacheResponse {
                scope: "all".to_string(),
                template_id: None,
                deleted_files: totals.files_deleted,
                deleted_directories: totals.directories_deleted,
                deleted_bytes: totals.bytes_reclaimed,
            }
        }
    };

    info!(
        scope = %response.scope,
        files = response.deleted_files,
        bytes = response.deleted_bytes,
        "Cache purge served"
    );
    Ok(Json(response))
}
