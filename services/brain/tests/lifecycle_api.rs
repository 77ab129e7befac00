//! Instance lifecycle integration tests.
//!
//! Drives the brain's HTTP API end to end against a stub node agent that
//! records every dispatched command, covering placement, command dispatch,
//! callbacks, and the error surfaces in between.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use tokio::net::TcpListener;
use warren_brain::{api, config::Config, dispatch::Dispatcher, registry::Registry, state::AppState};

/// One command the stub agent received from the brain.
#[derive(Debug, Clone)]
struct ReceivedCommand {
    instance_id: String,
    action: String,
    body: serde_json::Value,
}

#[derive(Clone, Default)]
struct StubAgentState {
    commands: Arc<Mutex<Vec<ReceivedCommand>>>,
    /// Number of upcoming requests to answer with a 500.
    fail_next: Arc<AtomicUsize>,
}

/// Minimal node agent: acknowledges every command, optionally failing first.
struct StubAgent {
    base_url: String,
    state: StubAgentState,
}

impl StubAgent {
    async fn start() -> Self {
        let state = StubAgentState::default();
        let app = Router::new()
            .route("/api/instances/{instance_id}/{action}", post(record_command))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, state }
    }

    fn commands(&self) -> Vec<ReceivedCommand> {
        self.state.commands.lock().unwrap().clone()
    }

    fn fail_next(&self, count: usize) {
        self.state.fail_next.store(count, Ordering::SeqCst);
    }
}

async fn record_command(
    State(state): State<StubAgentState>,
    Path((instance_id, action)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    if state
        .fail_next
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    state.commands.lock().unwrap().push(ReceivedCommand {
        instance_id,
        action,
        body,
    });
    StatusCode::OK
}

/// Test harness: brain API on an ephemeral port plus one stub agent.
struct Harness {
    base_url: String,
    client: reqwest::Client,
    agent: StubAgent,
}

impl Harness {
    async fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,warren_brain=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let config = Config {
            // Keep retries fast; behavior is what's under test.
            dispatch_backoff: Duration::from_millis(10),
            dispatch_timeout: Duration::from_secs(2),
            ..Config::default()
        };
        let dispatcher = Dispatcher::new(&config).unwrap();
        let state = AppState::new(Registry::new(), dispatcher, config);
        let app = api::create_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            client: reqwest::Client::new(),
            agent: StubAgent::start().await,
        }
    }

    async fn post_json(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn post_empty(&self, path: &str) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .send()
            .await
            .unwrap()
    }

    async fn get_json(&self, path: &str) -> serde_json::Value {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success(), "GET {path} failed");
        resp.json().await.unwrap()
    }

    /// Registers an ONLINE node backed by the stub agent.
    async fn register_online_node(&self, name: &str, region: &str, tags: &str) -> String {
        let resp = self
            .post_json(
                "/api/nodes/register",
                serde_json::json!({
                    "name": name,
                    "region": region,
                    "tags": tags,
                    "capacitySlots": 4,
                    "baseUrl": self.agent.base_url,
                }),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: serde_json::Value = resp.json().await.unwrap();
        let node_id = body["nodeId"].as_str().expect("missing nodeId").to_string();
        assert!(body["heartbeatIntervalSeconds"].as_u64().unwrap() > 0);

        let resp = self
            .post_json(
                &format!("/api/nodes/{node_id}/heartbeat"),
                serde_json::json!({ "status": "ONLINE", "usedSlots": 0 }),
            )
            .await;
        assert!(resp.status().is_success());
        node_id
    }

    /// Creates a template with a single version and returns the template id.
    async fn seed_template(&self, name: &str) -> String {
        let resp = self
            .post_json("/api/templates", serde_json::json!({ "name": name }))
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let template: serde_json::Value = resp.json().await.unwrap();
        let template_id = template["id"].as_str().unwrap().to_string();

        let resp = self
            .post_json(
                &format!("/api/templates/{template_id}/versions"),
                serde_json::json!({
                    "version": "1.0.0",
                    "checksum": "ab".repeat(32),
                    "s3Key": format!("templates/{name}/1.0.0.tar.gz"),
                }),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        template_id
    }

    async fn create_instance(&self, name: &str, template_id: &str) -> serde_json::Value {
        let resp = self
            .post_json(
                "/api/instances",
                serde_json::json!({
                    "name": name,
                    "layers": [{ "templateId": template_id }],
                }),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        resp.json().await.unwrap()
    }

    async fn callback(&self, node_id: &str, instance_id: &str, kind: &str) -> reqwest::Response {
        self.post_empty(&format!(
            "/api/nodes/{node_id}/instances/{instance_id}/{kind}"
        ))
        .await
    }

    async fn instance_state(&self, instance_id: &str) -> String {
        self.get_json(&format!("/api/instances/{instance_id}")).await["state"]
            .as_str()
            .unwrap()
            .to_string()
    }
}

#[tokio::test]
async fn test_full_lifecycle() {
    let harness = Harness::new().await;
    let node_id = harness.register_online_node("node-01", "eu-west", "ssd").await;
    let template_id = harness.seed_template("paper").await;
    let instance = harness.create_instance("lobby-1", &template_id).await;
    let instance_id = instance["id"].as_str().unwrap();
    assert_eq!(instance["state"], "REQUESTED");

    // Prepare: placement, transition, dispatch.
    let resp = harness
        .post_empty(&format!("/api/instances/{instance_id}/prepare"))
        .await;
    assert!(resp.status().is_success());
    let prepared: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(prepared["state"], "PREPARING");
    assert_eq!(prepared["nodeId"].as_str().unwrap(), node_id);

    let commands = harness.agent.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].action, "prepare");
    assert_eq!(commands[0].instance_id, instance_id);
    let layers = commands[0].body["layers"].as_array().unwrap();
    assert_eq!(layers.len(), 1);
    assert_eq!(layers[0]["version"], "1.0.0");
    assert!(layers[0]["s3Key"].as_str().unwrap().ends_with(".tar.gz"));

    // Agent reports prepared, then running.
    let resp = harness.callback(&node_id, instance_id, "prepared").await;
    assert!(resp.status().is_success());
    assert_eq!(harness.instance_state(instance_id).await, "STARTING");
    let resp = harness.callback(&node_id, instance_id, "running").await;
    assert!(resp.status().is_success());
    let running = harness
        .get_json(&format!("/api/instances/{instance_id}"))
        .await;
    assert_eq!(running["state"], "RUNNING");
    assert!(running["startedAt"].is_string());

    // Stop, confirm, restart.
    let resp = harness
        .post_empty(&format!("/api/instances/{instance_id}/stop"))
        .await;
    assert!(resp.status().is_success());
    assert_eq!(harness.instance_state(instance_id).await, "STOPPING");
    harness.callback(&node_id, instance_id, "stopped").await;
    assert_eq!(harness.instance_state(instance_id).await, "STOPPED");

    let resp = harness
        .post_empty(&format!("/api/instances/{instance_id}/start"))
        .await;
    assert!(resp.status().is_success());
    assert_eq!(harness.instance_state(instance_id).await, "STARTING");
    harness.callback(&node_id, instance_id, "running").await;
    assert_eq!(harness.instance_state(instance_id).await, "RUNNING");

    // Destroy from RUNNING goes through STOPPING.
    let resp = harness
        .post_empty(&format!("/api/instances/{instance_id}/destroy"))
        .await;
    assert!(resp.status().is_success());
    assert_eq!(harness.instance_state(instance_id).await, "STOPPING");
    harness.callback(&node_id, instance_id, "destroyed").await;
    assert_eq!(harness.instance_state(instance_id).await, "DESTROYED");

    // The stub saw every dispatched action in order.
    let actions: Vec<String> = harness
        .agent
        .commands()
        .iter()
        .map(|c| c.action.clone())
        .collect();
    assert_eq!(actions, ["prepare", "stop", "start", "destroy"]);

    // The audit trail reads in order.
    let events = harness
        .get_json(&format!("/api/instances/{instance_id}/events"))
        .await;
    let event_types: Vec<&str> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["eventType"].as_str().unwrap())
        .collect();
    assert_eq!(
        event_types,
        [
            "REQUEST_RECEIVED",
            "PREPARE_DISPATCHED",
            "PREPARE_COMPLETED",
            "START_COMPLETED",
            "STOP_DISPATCHED",
            "STOP_COMPLETED",
            "START_DISPATCHED",
            "START_COMPLETED",
            "STOP_DISPATCHED",
            "DESTROY_COMPLETED",
        ]
    );
}

#[tokio::test]
async fn test_prepare_without_candidates_conflicts() {
    let harness = Harness::new().await;
    // A node exists, but in the wrong region.
    harness
        .register_online_node("node-01", "us-east", "ssd")
        .await;
    let template_id = harness.seed_template("paper").await;

    let resp = harness
        .post_json(
            "/api/instances",
            serde_json::json!({
                "name": "lobby-eu",
                "region": "eu-west",
                "layers": [{ "templateId": template_id }],
            }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let instance: serde_json::Value = resp.json().await.unwrap();
    let instance_id = instance["id"].as_str().unwrap();

    let resp = harness
        .post_empty(&format!("/api/instances/{instance_id}/prepare"))
        .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let problem: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "no_eligible_node");

    // Exhaustion leaves the instance REQUESTED with nothing dispatched.
    assert_eq!(harness.instance_state(instance_id).await, "REQUESTED");
    assert!(harness.agent.commands().is_empty());
}

#[tokio::test]
async fn test_duplicate_instance_name_conflicts() {
    let harness = Harness::new().await;
    let template_id = harness.seed_template("paper").await;
    harness.create_instance("lobby-1", &template_id).await;

    let resp = harness
        .post_json(
            "/api/instances",
            serde_json::json!({
                "name": "lobby-1",
                "layers": [{ "templateId": template_id }],
            }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let problem: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "duplicate_instance_name");
    assert_eq!(
        problem["type"],
        "https://warren-fleet.dev/problems/duplicate_instance_name"
    );
}

#[tokio::test]
async fn test_create_instance_rejects_bad_layers() {
    let harness = Harness::new().await;
    let template_id = harness.seed_template("paper").await;

    // A layer must name a template or a version.
    let resp = harness
        .post_json(
            "/api/instances",
            serde_json::json!({ "name": "lobby-1", "layers": [{}] }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // No layers at all.
    let resp = harness
        .post_json(
            "/api/instances",
            serde_json::json!({ "name": "lobby-2", "layers": [] }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Both variables forms at once.
    let resp = harness
        .post_json(
            "/api/instances",
            serde_json::json!({
                "name": "lobby-3",
                "layers": [{ "templateId": template_id }],
                "variables": { "MOTD": "hi" },
                "variablesJson": "{\"MOTD\":\"hi\"}",
            }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_callback_from_wrong_node_is_rejected() {
    let harness = Harness::new().await;
    let node_id = harness.register_online_node("node-01", "eu-west", "ssd").await;
    let template_id = harness.seed_template("paper").await;
    let instance = harness.create_instance("lobby-1", &template_id).await;
    let instance_id = instance["id"].as_str().unwrap();

    // Register a second node that never hosts the instance. It stays in
    // UNKNOWN (no heartbeat) so placement cannot pick it.
    let resp = harness
        .post_json(
            "/api/nodes/register",
            serde_json::json!({
                "name": "node-02",
                "capacitySlots": 4,
                "baseUrl": harness.agent.base_url,
            }),
        )
        .await;
    let other: serde_json::Value = resp.json().await.unwrap();
    let other_id = other["nodeId"].as_str().unwrap();

    let resp = harness
        .post_empty(&format!("/api/instances/{instance_id}/prepare"))
        .await;
    assert!(resp.status().is_success());

    let resp = harness.callback(other_id, instance_id, "prepared").await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let problem: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "node_mismatch");

    // The rightful node still completes the handshake.
    let resp = harness.callback(&node_id, instance_id, "prepared").await;
    assert!(resp.status().is_success());
}

#[tokio::test]
async fn test_callback_before_assignment_conflicts() {
    let harness = Harness::new().await;
    let node_id = harness.register_online_node("node-01", "eu-west", "ssd").await;
    let template_id = harness.seed_template("paper").await;
    let instance = harness.create_instance("lobby-1", &template_id).await;
    let instance_id = instance["id"].as_str().unwrap();

    let resp = harness.callback(&node_id, instance_id, "running").await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let problem: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "instance_not_assigned");
}

#[tokio::test]
async fn test_failed_callback_records_reason() {
    let harness = Harness::new().await;
    let node_id = harness.register_online_node("node-01", "eu-west", "ssd").await;
    let template_id = harness.seed_template("paper").await;
    let instance = harness.create_instance("lobby-1", &template_id).await;
    let instance_id = instance["id"].as_str().unwrap();

    harness
        .post_empty(&format!("/api/instances/{instance_id}/prepare"))
        .await;
    let resp = harness.callback(&node_id, instance_id, "failed").await;
    assert!(resp.status().is_success());

    let failed = harness
        .get_json(&format!("/api/instances/{instance_id}"))
        .await;
    assert_eq!(failed["state"], "FAILED");
    assert_eq!(failed["failureReason"], "reported by node");
}

#[tokio::test]
async fn test_dispatch_retries_a_server_error() {
    let harness = Harness::new().await;
    harness.register_online_node("node-01", "eu-west", "ssd").await;
    let template_id = harness.seed_template("paper").await;
    let instance = harness.create_instance("lobby-1", &template_id).await;
    let instance_id = instance["id"].as_str().unwrap();

    // First attempt gets a 500; the retry succeeds.
    harness.agent.fail_next(1);
    let resp = harness
        .post_empty(&format!("/api/instances/{instance_id}/prepare"))
        .await;
    assert!(resp.status().is_success());
    assert_eq!(harness.agent.commands().len(), 1);
    assert_eq!(harness.instance_state(instance_id).await, "PREPARING");
}

#[tokio::test]
async fn test_dispatch_exhaustion_is_bad_gateway_without_rollback() {
    let harness = Harness::new().await;
    harness.register_online_node("node-01", "eu-west", "ssd").await;
    let template_id = harness.seed_template("paper").await;
    let instance = harness.create_instance("lobby-1", &template_id).await;
    let instance_id = instance["id"].as_str().unwrap();

    // Both attempts fail.
    harness.agent.fail_next(2);
    let resp = harness
        .post_empty(&format!("/api/instances/{instance_id}/prepare"))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let problem: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "dispatch_failed");
    assert_eq!(problem["retryable"], true);

    // The transition was committed before dispatch; the stale monitor is
    // responsible for eventually failing it.
    assert_eq!(harness.instance_state(instance_id).await, "PREPARING");
}

#[tokio::test]
async fn test_heartbeat_validates_slots() {
    let harness = Harness::new().await;
    let node_id = harness.register_online_node("node-01", "eu-west", "ssd").await;

    let resp = harness
        .post_json(
            &format!("/api/nodes/{node_id}/heartbeat"),
            serde_json::json!({ "status": "ONLINE", "usedSlots": 99 }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let problem: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "invalid_request");
    assert!(problem["detail"]
        .as_str()
        .unwrap()
        .contains("capacitySlots"));
}

#[tokio::test]
async fn test_registration_upserts_on_name() {
    let harness = Harness::new().await;
    let first = harness.register_online_node("node-01", "eu-west", "ssd").await;

    let resp = harness
        .post_json(
            "/api/nodes/register",
            serde_json::json!({
                "name": "node-01",
                "region": "eu-central",
                "capacitySlots": 8,
                "baseUrl": harness.agent.base_url,
            }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["nodeId"].as_str().unwrap(), first);

    let nodes = harness.get_json("/api/nodes").await;
    let nodes = nodes.as_array().unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["region"], "eu-central");
    assert_eq!(nodes[0]["capacitySlots"], 8);
}

#[tokio::test]
async fn test_placement_prefers_least_loaded_matching_node() {
    let harness = Harness::new().await;
    let busy = harness.register_online_node("node-a", "eu-west", "ssd").await;
    let idle = harness.register_online_node("node-b", "eu-west", "ssd").await;

    // node-a carries load; node-b is empty.
    let resp = harness
        .post_json(
            &format!("/api/nodes/{busy}/heartbeat"),
            serde_json::json!({ "status": "ONLINE", "usedSlots": 3 }),
        )
        .await;
    assert!(resp.status().is_success());

    let template_id = harness.seed_template("paper").await;
    let resp = harness
        .post_json(
            "/api/instances",
            serde_json::json!({
                "name": "lobby-1",
                "region": "eu-west",
                "tags": "ssd",
                "layers": [{ "templateId": template_id }],
            }),
        )
        .await;
    let instance: serde_json::Value = resp.json().await.unwrap();
    let instance_id = instance["id"].as_str().unwrap();

    let resp = harness
        .post_empty(&format!("/api/instances/{instance_id}/prepare"))
        .await;
    assert!(resp.status().is_success());
    let placed: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(placed["nodeId"].as_str().unwrap(), idle);
}
