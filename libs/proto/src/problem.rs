//! RFC 7807 problem documents shared by every warren HTTP surface.

use serde::{Deserialize, Serialize};

/// Error body returned by both the brain and the node agent, served as
/// `application/problem+json`.
///
/// `type` is a stable URI derived from `code`; clients match on `code`
/// rather than parsing the URI. `retryable` tells the caller whether the
/// same request can be replayed as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
}

impl ProblemDetails {
    pub fn new(
        status: u16,
        title: impl Into<String>,
        code: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        let code = code.into();
        Self {
            r#type: format!("https://warren-fleet.dev/problems/{code}"),
            title: title.into(),
            status,
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
        }
    }

    /// Stamps the request id and, when no more specific URI was set, reuses
    /// it as the `instance` of this occurrence.
    pub fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }

    pub fn set_retryable(&mut self, retryable: bool) {
        self.retryable = retryable;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_serializes_type_uri_and_camel_case() {
        let mut problem = ProblemDetails::new(409, "Conflict", "node_mismatch", "wrong node");
        problem.set_request_id("req_42");
        let value = serde_json::to_value(&problem).unwrap();
        assert_eq!(
            value["type"],
            "https://warren-fleet.dev/problems/node_mismatch"
        );
        assert_eq!(value["status"], 409);
        assert_eq!(value["requestId"], "req_42");
        assert_eq!(value["instance"], "req_42");
        assert_eq!(value["retryable"], false);
    }

    #[test]
    fn instance_is_omitted_until_set() {
        let problem = ProblemDetails::new(400, "Bad Request", "invalid_request", "bad");
        let value = serde_json::to_value(&problem).unwrap();
        assert!(value.get("instance").is_none());
    }
}
