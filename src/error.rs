//! Error types for index table operations

use thiserror::Error;

/// Result type for index table operations
pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors that can occur while building, decoding or serializing index tables
#[derive(Error, Debug)]
pub enum IndexError {
    /// Wire bytes are inconsistent: bad counts, mismatched item sizes
    #[error("Malformed index segment: {message}")]
    Malformed { message: String },

    /// Buffer too short for the declared contents
    #[error("Insufficient data: need {needed} bytes, have {available}")]
    InsufficientData { needed: usize, available: usize },

    /// Slice offset or pos table length disagrees with the delta array
    #[error("{field} length {actual} does not match delta array ({expected})")]
    ArityMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Edit unit not covered by any segment
    #[error("Edit unit {edit_unit} is outside every segment")]
    OutOfRange { edit_unit: i64 },

    /// An entry or segment already occupies this position
    #[error("Position {position} is already indexed")]
    AlreadyExists { position: i64 },

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl IndexError {
    /// Create a malformed-data error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        IndexError::Malformed {
            message: msg.into(),
        }
    }
}
