use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

use crate::types::Version;

/// Unified error type for collaboration operations
#[derive(Debug, Error)]
pub enum CollabError {
    // Protocol errors (cross the worker boundary with their kind intact)
    #[error("document '{0}' not found in storage")]
    DocumentNotFound(String),

    #[error("version conflict on '{doc_name}': pushed at {requested}, authoritative is {current}")]
    VersionConflict {
        doc_name: String,
        requested: Version,
        current: Version,
    },

    #[error("manager mismatch: request addressed {requested}, current instance is {current}")]
    ManagerMismatch { requested: String, current: String },

    #[error("history for '{doc_name}' starts at {oldest}; version {requested} is no longer available")]
    HistoryNotAvailable {
        doc_name: String,
        requested: Version,
        oldest: Version,
    },

    #[error("invalid step: {0}")]
    InvalidStep(String),

    // Client-side errors
    #[error("push retries exhausted for '{doc_name}' after {attempts} attempts")]
    RetriesExhausted { doc_name: String, attempts: u32 },

    #[error("editor session for '{0}' is in the fatal state and no longer editable")]
    NotEditable(String),

    // Transport errors
    #[error("collab transport closed")]
    TransportClosed,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    // Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type alias for collaboration operations
pub type Result<T> = std::result::Result<T, CollabError>;

/// Discriminating kind of a [`CollabError`], stable across the worker boundary.
///
/// The client's recovery logic dispatches on this code, so it must survive
/// serialization (a `VersionConflict` that arrives as a generic failure would
/// break the pull/rebase/retry path).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum CollabErrorCode {
    /// Neither memory nor storage has the document
    DocumentNotFound,
    /// Push based on a stale version; pull, rebase, retry
    VersionConflict,
    /// Manager was restarted; full re-fetch required
    ManagerMismatch,
    /// Requested version fell out of the retained step log; full re-fetch required
    HistoryNotAvailable,
    /// Step failed validation or application; the whole batch was rejected
    InvalidStep,
    /// The request channel is gone
    TransportClosed,
    /// Storage backend failure
    Storage,
    /// Anything that should not normally cross the boundary
    Internal,
}

impl CollabErrorCode {
    /// Whether the client state machine has an automatic recovery path.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            CollabErrorCode::VersionConflict
                | CollabErrorCode::ManagerMismatch
                | CollabErrorCode::HistoryNotAvailable
        )
    }

    /// Whether recovery requires a full document re-fetch rather than an
    /// incremental pull.
    pub fn needs_refetch(self) -> bool {
        matches!(
            self,
            CollabErrorCode::ManagerMismatch | CollabErrorCode::HistoryNotAvailable
        )
    }
}

/// A serializable representation of [`CollabError`] for the worker boundary.
#[derive(Debug, Clone, Serialize, Deserialize, Error, TS)]
#[ts(export, export_to = "bindings/")]
#[error("{message}")]
pub struct WireError {
    /// Error kind, kept exact so the client can dispatch on it
    pub code: CollabErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Associated document name (if applicable)
    pub doc_name: Option<String>,
}

impl CollabError {
    /// The discriminating kind of this error.
    pub fn code(&self) -> CollabErrorCode {
        match self {
            CollabError::DocumentNotFound(_) => CollabErrorCode::DocumentNotFound,
            CollabError::VersionConflict { .. } => CollabErrorCode::VersionConflict,
            CollabError::ManagerMismatch { .. } => CollabErrorCode::ManagerMismatch,
            CollabError::HistoryNotAvailable { .. } => CollabErrorCode::HistoryNotAvailable,
            CollabError::InvalidStep(_) => CollabErrorCode::InvalidStep,
            CollabError::TransportClosed => CollabErrorCode::TransportClosed,
            CollabError::Storage(_) => CollabErrorCode::Storage,
            CollabError::Wire(wire) => wire.code,
            CollabError::RetriesExhausted { .. }
            | CollabError::NotEditable(_)
            | CollabError::UnexpectedResponse(_)
            | CollabError::Serialization(_) => CollabErrorCode::Internal,
            #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
            CollabError::Sqlite(_) => CollabErrorCode::Storage,
        }
    }

    /// Document name this error concerns (if applicable)
    pub fn doc_name(&self) -> Option<&str> {
        match self {
            CollabError::DocumentNotFound(doc_name)
            | CollabError::VersionConflict { doc_name, .. }
            | CollabError::HistoryNotAvailable { doc_name, .. }
            | CollabError::RetriesExhausted { doc_name, .. }
            | CollabError::NotEditable(doc_name) => Some(doc_name),
            CollabError::Wire(wire) => wire.doc_name.as_deref(),
            _ => None,
        }
    }

    /// Whether the client state machine has an automatic recovery path.
    pub fn is_recoverable(&self) -> bool {
        self.code().is_recoverable()
    }

    /// Whether recovery requires a full document re-fetch.
    pub fn needs_refetch(&self) -> bool {
        self.code().needs_refetch()
    }

    /// Convert to the wire representation for the worker boundary
    pub fn to_wire(&self) -> WireError {
        WireError::from(self)
    }
}

impl From<&CollabError> for WireError {
    fn from(err: &CollabError) -> Self {
        // Keep the original wire error intact instead of re-wrapping it
        if let CollabError::Wire(wire) = err {
            return wire.clone();
        }
        Self {
            code: err.code(),
            message: err.to_string(),
            doc_name: err.doc_name().map(str::to_string),
        }
    }
}

impl From<CollabError> for WireError {
    fn from(err: CollabError) -> Self {
        WireError::from(&err)
    }
}
