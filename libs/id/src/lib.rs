//! # warren-id
//!
//! Typed resource IDs for the warren fleet.
//!
//! Every resource ID is a prefixed ULID, e.g. `node_01HV4Z2WQXKJNM8GPQY6VBKC3D`.
//! The prefix makes IDs self-describing and prevents mixing resource types at
//! compile time; the ULID payload makes them time-ordered and collision-free.
//!
//! Parsing is strict: the prefix must match the type exactly and the payload
//! must be a valid ULID. IDs round-trip through their string form and through
//! serde (they serialize as plain strings).

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
