//! warren brain library.
//!
//! This crate primarily ships a `brain` binary, but we expose a small
//! library surface to enable integration testing and reuse.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod model;
pub mod monitor;
pub mod registry;
pub mod scheduler;
pub mod state;
