use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use warren_proto::ProblemDetails;

use crate::instance::CommandError;
use crate::template::{CacheError, MergeError, PurgeError};

fn new_problem(
    status: StatusCode,
    code: impl Into<String>,
    detail: impl Into<String>,
) -> ProblemDetails {
    let title = status.canonical_reason().unwrap_or("Unknown Error");
    ProblemDetails::new(status.as_u16(), title, code, detail)
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        let status = StatusCode::BAD_REQUEST;
        let problem = Box::new(new_problem(status, code, message));
        Self { status, problem }
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        let status = StatusCode::CONFLICT;
        let problem = Box::new(new_problem(status, code, message));
        Self { status, problem }
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        let problem = Box::new(new_problem(status, code, message));
        Self { status, problem }
    }

    pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        let status = StatusCode::BAD_GATEWAY;
        let mut problem = Box::new(new_problem(status, code, message));
        problem.set_retryable(true);
        Self { status, problem }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    /// Maps a failed instance command to its HTTP shape: bad input is 400,
    /// commanding an unprepared instance is 409, storage trouble is a
    /// retryable 502, local trouble is 500.
    pub fn from_command(error: CommandError, request_id: &str) -> Self {
        let api_error = match &error {
            CommandError::ConflictingVariables | CommandError::MalformedVariablesJson => {
                Self::bad_request("invalid_variables", error.to_string())
            }
            CommandError::NotPrepared(_) => {
                Self::conflict("instance_not_prepared", error.to_string())
            }
            CommandError::Cache(cache_error) => match cache_error {
                CacheError::Segment(_) | CacheError::MissingField(_) => {
                    Self::bad_request("invalid_template_reference", error.to_string())
                }
                CacheError::Storage(_)
                | CacheError::ChecksumMismatch { .. }
                | CacheError::LengthMismatch { .. } => {
                    Self::bad_gateway("template_fetch_failed", error.to_string())
                }
                CacheError::EmptyEntryName(_)
                | CacheError::LinkEntry(_)
                | CacheError::EntryEscapes(_)
                | CacheError::TooManyEntries(_)
                | CacheError::TooLarge(_) => {
                    Self::bad_request("archive_rejected", error.to_string())
                }
                CacheError::Io(_)
                | CacheError::Metadata(_)
                | CacheError::PopulationFailed { .. } => {
                    Self::internal("cache_failed", error.to_string())
                }
            },
            CommandError::Merge(MergeError::NoLayers)
            | CommandError::Merge(MergeError::DuplicateOrderIndex(_)) => {
                Self::bad_request("invalid_layers", error.to_string())
            }
            CommandError::Merge(_) => Self::internal("merge_failed", error.to_string()),
            CommandError::Substitute(_) => Self::internal("substitution_failed", error.to_string()),
            CommandError::Io(_) => Self::internal("workspace_io_failed", error.to_string()),
            CommandError::Callback(_) => Self::bad_gateway("callback_failed", error.to_string()),
        };
        api_error.with_request_id(request_id.to_string())
    }

    pub fn from_purge(error: PurgeError, request_id: &str) -> Self {
        let api_error = match &error {
            PurgeError::Segment(_) => Self::bad_request("invalid_template_id", error.to_string()),
            PurgeError::OutsideCache(_) | PurgeError::Io(_) => {
                Self::internal("purge_failed", error.to_string())
            }
        };
        api_error.with_request_id(request_id.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
