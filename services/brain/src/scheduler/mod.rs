//! Scheduler module for instance placement.
//!
//! Placement is a pure function over the current node set: filter on
//! liveness, region, dev mode, capacity, and tag coverage, then pick the
//! least-loaded survivor with deterministic tie-breaking. There is no
//! background reconciliation here; the instance API invokes placement
//! directly when a prepare is requested.

mod placement;

pub use placement::{select_node, PlacementRequest};
