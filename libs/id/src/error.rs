//! Error types for ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing a typed ID from a string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The input has no `_` between prefix and payload.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The prefix does not match the ID type.
    #[error("wrong ID prefix: expected '{expected}', got '{actual}'")]
    WrongPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The payload is not a valid ULID.
    #[error("invalid ULID payload: {0}")]
    BadUlid(String),
}
