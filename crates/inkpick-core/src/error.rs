//! Error types for the selection engine.

use crate::element::ElementId;
use crate::storage::StorageError;
use thiserror::Error;

/// Errors raised by the spatial index.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IndexError {
    #[error("Invalid bounds for element {id}: {reason}")]
    InvalidBounds { id: ElementId, reason: String },
    #[error("Element {0} is already indexed")]
    DuplicateElementId(ElementId),
    #[error("Spatial backend unavailable: {0}")]
    BackendUnavailable(&'static str),
}

/// Top-level error for selection engine operations.
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("Unknown element: {0}")]
    UnknownElementId(ElementId),
    #[error("History data is corrupt: {0}")]
    HistoryCorrupt(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for selection engine operations.
pub type Result<T> = std::result::Result<T, SelectionError>;
