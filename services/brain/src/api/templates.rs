//! Template catalog endpoints.
//!
//! Templates are named, versioned archives in object storage. The brain only
//! holds the catalog rows; agents fetch the archives themselves using the
//! storage key carried in prepare commands.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use warren_id::{TemplateId, TemplateVersionId};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::{Template, TemplateVersion};
use crate::state::AppState;

/// Create template routes.
///
/// Templates are catalog resources: /api/templates
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_templates).post(create_template))
        .route("/{template_id}", get(get_template))
        .route(
            "/{template_id}/versions",
            get(list_versions).post(add_version),
        )
}

/// Request to create a template.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTemplateRequest {
    pub name: String,
}

/// Request to append a version to a template.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTemplateVersionRequest {
    pub version: String,
    /// Hex SHA-256 of the archive.
    pub checksum: String,
    /// Object storage key of the archive.
    pub s3_key: String,
    #[serde(default)]
    pub metadata_json: Option<String>,
}

/// Response for a single template.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateResponse {
    pub id: TemplateId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl From<Template> for TemplateResponse {
    fn from(template: Template) -> Self {
        Self {
            id: template.id,
            name: template.name,
            created_at: template.created_at,
        }
    }
}

/// Response for a single template version.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateVersionResponse {
    pub id: TemplateVersionId,
    pub template_id: TemplateId,
    pub version: String,
    pub checksum: String,
    pub s3_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_json: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<TemplateVersion> for TemplateVersionResponse {
    fn from(version: TemplateVersion) -> Self {
        Self {
            id: version.id,
            template_id: version.template_id,
            version: version.version,
            checksum: version.checksum,
            s3_key: version.s3_key,
            metadata_json: version.metadata_json,
            created_at: version.created_at,
        }
    }
}

/// List all templates.
///
/// GET /api/templates
async fn list_templates(State(state): State<AppState>) -> impl IntoResponse {
    let templates: Vec<TemplateResponse> = state
        .registry()
        .list_templates()
        .await
        .into_iter()
        .map(TemplateResponse::from)
        .collect();
    Json(templates)
}

/// Get a single template.
///
/// GET /api/templates/{template_id}
async fn get_template(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(template_id): Path<TemplateId>,
) -> Result<impl IntoResponse, ApiError> {
    let template = state
        .registry()
        .get_template(template_id)
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?;
    Ok(Json(TemplateResponse::from(template)))
}

/// Create a template.
///
/// POST /api/templates
async fn create_template(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(request): Json<CreateTemplateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let template = state
        .registry()
        .create_template(&request.name, Utc::now())
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?;

    info!(template_id = %template.id, name = %template.name, "Template created");

    Ok((StatusCode::CREATED, Json(TemplateResponse::from(template))))
}

/// List a template's versions, oldest first.
///
/// GET /api/templates/{template_id}/versions
async fn list_versions(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(template_id): Path<TemplateId>,
) -> Result<impl IntoResponse, ApiError> {
    let versions: Vec<TemplateVersionResponse> = state
        .registry()
        .list_template_versions(template_id)
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?
        .into_iter()
        .map(TemplateVersionResponse::from)
        .collect();
    Ok(Json(versions))
}

/// Append an immutable version to a template.
///
/// POST /api/templates/{template_id}/versions
async fn add_version(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(template_id): Path<TemplateId>,
    Json(request): Json<CreateTemplateVersionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let version = state
        .registry()
        .add_template_version(
            template_id,
            &request.version,
            &request.checksum,
            &request.s3_key,
            request.metadata_json,
            Utc::now(),
        )
        .await
        .map_err(|e| ApiError::from_registry(e, &ctx.request_id))?;

    info!(
        template_id = %template_id,
        version_id = %version.id,
        version = %version.version,
        "Template version added"
    );

    Ok((
        StatusCode::CREATED,
        Json(TemplateVersionResponse::from(version)),
    ))
}
