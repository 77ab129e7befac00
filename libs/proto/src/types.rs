//! Shared status, state, and action enums.

use serde::{Deserialize, Serialize};

/// Node liveness status as tracked by the brain and reported by agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Online,
    Offline,
    /// Registered but no heartbeat seen yet.
    Unknown,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "ONLINE",
            NodeStatus::Offline => "OFFLINE",
            NodeStatus::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance lifecycle states.
///
/// DESTROYED and FAILED are terminal; the legal transition table lives with
/// the brain's lifecycle module, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Requested,
    Preparing,
    Starting,
    Running,
    Stopping,
    Stopped,
    Destroyed,
    Failed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Requested => "REQUESTED",
            InstanceState::Preparing => "PREPARING",
            InstanceState::Starting => "STARTING",
            InstanceState::Running => "RUNNING",
            InstanceState::Stopping => "STOPPING",
            InstanceState::Stopped => "STOPPED",
            InstanceState::Destroyed => "DESTROYED",
            InstanceState::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit-trail event types, one per recorded lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceEventType {
    RequestReceived,
    PrepareDispatched,
    PrepareCompleted,
    StartDispatched,
    StartCompleted,
    StopDispatched,
    StopCompleted,
    DestroyCompleted,
    FailureReported,
    FailureTimeout,
}

impl InstanceEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceEventType::RequestReceived => "REQUEST_RECEIVED",
            InstanceEventType::PrepareDispatched => "PREPARE_DISPATCHED",
            InstanceEventType::PrepareCompleted => "PREPARE_COMPLETED",
            InstanceEventType::StartDispatched => "START_DISPATCHED",
            InstanceEventType::StartCompleted => "START_COMPLETED",
            InstanceEventType::StopDispatched => "STOP_DISPATCHED",
            InstanceEventType::StopCompleted => "STOP_COMPLETED",
            InstanceEventType::DestroyCompleted => "DESTROY_COMPLETED",
            InstanceEventType::FailureReported => "FAILURE_REPORTED",
            InstanceEventType::FailureTimeout => "FAILURE_TIMEOUT",
        }
    }
}

impl std::fmt::Display for InstanceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Brain→node command actions; `as_str` is the URL path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandAction {
    Prepare,
    Start,
    Stop,
    Destroy,
}

impl CommandAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandAction::Prepare => "prepare",
            CommandAction::Start => "start",
            CommandAction::Stop => "stop",
            CommandAction::Destroy => "destroy",
        }
    }
}

impl std::fmt::Display for CommandAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node→brain callback kinds; `as_str` is the URL path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackKind {
    Prepared,
    Running,
    Stopped,
    Destroyed,
    Failed,
}

impl CallbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackKind::Prepared => "prepared",
            CallbackKind::Running => "running",
            CallbackKind::Stopped => "stopped",
            CallbackKind::Destroyed => "destroyed",
            CallbackKind::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
