//! Error types for the model crate.

use crate::id::NodeId;
use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors that can occur when reading or mutating the model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The referenced node does not exist.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// A list edit referenced a position past the end of the list.
    #[error("index {index} out of bounds for feature '{feature}' (len {len})")]
    IndexOutOfBounds {
        /// The feature that was being edited.
        feature: String,
        /// The requested position.
        index: usize,
        /// The current length of the list.
        len: usize,
    },

    /// The edit gate rejected the mutation.
    #[error("edit rejected: {reason}")]
    EditRejected {
        /// Why the gate refused the mutation.
        reason: String,
    },
}
