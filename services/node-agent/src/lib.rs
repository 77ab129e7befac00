//! warren node agent library.
//!
//! This crate primarily ships a `node-agent` binary, but we expose a small
//! library surface to enable integration testing and reuse.

pub mod api;
pub mod client;
pub mod config;
pub mod heartbeat;
pub mod instance;
pub mod state;
pub mod storage;
pub mod template;
pub mod workspace;
