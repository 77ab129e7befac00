//! # warren-proto
//!
//! The JSON wire contract between the warren brain and its node agents.
//!
//! Three surfaces share these types:
//! - **Brain→Node commands**: `POST {nodeBaseUrl}/api/instances/{instanceId}/{action}`
//!   with [`PrepareInstanceCommand`] for `prepare` and [`InstanceCommand`] for the rest.
//! - **Node→Brain callbacks**: `POST /api/nodes/{nodeId}/instances/{instanceId}/{kind}`
//!   with no body; [`CallbackKind`] names the path segment.
//! - **Node registration/heartbeat**: `POST /api/nodes/register` and
//!   `POST /api/nodes/{nodeId}/heartbeat`.
//!
//! Errors on all three surfaces are [`ProblemDetails`] documents.
//!
//! Field names are camelCase on the wire. Enums serialize as their fixed wire
//! tokens (`ONLINE`, `PREPARE_DISPATCHED`, ...), so changing a variant name is
//! a wire-breaking change.

mod commands;
mod nodes;
mod problem;
mod types;

pub use commands::*;
pub use nodes::*;
pub use problem::*;
pub use types::*;
