use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use warren_proto::ProblemDetails;

use crate::dispatch::DispatchError;
use crate::lifecycle::TransitionError;
use crate::registry::RegistryError;

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

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        let status = StatusCode::NOT_FOUND;
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

    /// Maps a registry failure to its HTTP shape: missing entities are 404,
    /// broken preconditions (duplicates, placement exhaustion, lifecycle
    /// table violations, callback guards) are 409, malformed input is 400.
    pub fn from_registry(error: RegistryError, request_id: &str) -> Self {
        let api_error = match &error {
            RegistryError::NodeNotFound(_) => Self::not_found("node_not_found", error.to_string()),
            RegistryError::InstanceNotFound(_) => {
                Self::not_found("instance_not_found", error.to_string())
            }
            RegistryError::TemplateNotFound(_) => {
                Self::not_found("template_not_found", error.to_string())
            }
            RegistryError::TemplateVersionNotFound(_) => {
                Self::not_found("template_version_not_found", error.to_string())
            }
            RegistryError::TemplateHasNoVersions(_) => {
                Self::not_found("template_has_no_versions", error.to_string())
            }
            RegistryError::DuplicateInstanceName(_) => {
                Self::conflict("duplicate_instance_name", error.to_string())
            }
            RegistryError::DuplicateTemplateName(_) => {
                Self::conflict("duplicate_template_name", error.to_string())
            }
            RegistryError::DuplicateTemplateVersion { .. } => {
                Self::conflict("duplicate_template_version", error.to_string())
            }
            RegistryError::InstanceNotAssigned(_) => {
                Self::conflict("instance_not_assigned", error.to_string())
            }
            RegistryError::NodeMismatch { .. } => {
                Self::conflict("node_mismatch", error.to_string())
            }
            RegistryError::NoEligibleNode(_) => {
                Self::conflict("no_eligible_node", error.to_string())
            }
            RegistryError::Validation(_) => Self::bad_request("invalid_request", error.to_string()),
            RegistryError::Transition(TransitionError::InvalidTransition { .. }) => {
                Self::conflict("invalid_transition", error.to_string())
            }
            RegistryError::Transition(_) => Self::bad_request("invalid_reason", error.to_string()),
        };
        api_error.with_request_id(request_id.to_string())
    }

    /// A command that could not be delivered to the node is a gateway
    /// failure; the recorded state transition is not rolled back.
    pub fn from_dispatch(error: DispatchError, request_id: &str) -> Self {
        Self::bad_gateway("dispatch_failed", error.to_string())
            .with_request_id(request_id.to_string())
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

#[cfg(test)]
mod tests {
    use super::*;
    use warren_id::InstanceId;
    use warren_proto::InstanceState;

    #[test]
    fn registry_errors_map_to_expected_statuses() {
        let id = InstanceId::new();
        let cases = [
            (
                ApiError::from_registry(RegistryError::InstanceNotFound(id), "req_1"),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from_registry(
                    RegistryError::DuplicateInstanceName("lobby".into()),
                    "req_1",
                ),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from_registry(RegistryError::NoEligibleNode(id), "req_1"),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from_registry(RegistryError::Validation("bad".into()), "req_1"),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from_registry(
                    RegistryError::Transition(TransitionError::InvalidTransition {
                        from: InstanceState::Requested,
                        to: InstanceState::Running,
                    }),
                    "req_1",
                ),
                StatusCode::CONFLICT,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.status, expected);
            assert_eq!(error.problem.request_id, "req_1");
        }
    }

    #[test]
    fn dispatch_errors_are_retryable_bad_gateway() {
        let error = ApiError::from_dispatch(
            DispatchError::Exhausted {
                action: warren_proto::CommandAction::Start,
                instance_id: InstanceId::new(),
                attempts: 2,
                last_error: "connection refused".into(),
            },
            "req_2",
        );
        assert_eq!(error.status, StatusCode::BAD_GATEWAY);
        assert!(error.problem.retryable);
    }
}
