//! Id parse errors.

use thiserror::Error;

/// Why a string was rejected as an id or cid.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("id cannot be empty")]
    Empty,

    /// A generated id carried the prefix of a different id type.
    #[error("wrong id prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("id has no '_' between prefix and ulid")]
    MissingSeparator,

    #[error("invalid ulid in id: {0}")]
    InvalidUlid(String),
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
