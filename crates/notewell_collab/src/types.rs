//! Core types for the collaboration protocol.
//!
//! This module defines the identifier aliases and the snapshot/value types
//! exchanged between the editor-side client, the authoritative manager, and
//! the persistence layer.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::step::Step;

/// Monotonically increasing version of a document.
///
/// Owned exclusively by the manager; incremented by exactly the number of
/// steps applied per accepted push. Never decreases.
pub type Version = u64;

/// Opaque identifier of one editor session.
///
/// Steps are tagged with the authoring client's id so that a client can skip
/// its own steps when they come back through a pull (echo suppression).
pub type ClientId = String;

/// Identifier of the user on whose behalf requests are made.
pub type UserId = String;

/// Identifier of one manager incarnation.
///
/// A manager mints a fresh id on construction; a client that still carries an
/// older id learns the manager was restarted and must re-fetch the document
/// instead of pulling incrementally.
pub type ManagerId = String;

/// A document as persisted by the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct StoredDoc {
    /// Full document content
    pub content: String,

    /// Version in effect when the write was scheduled
    pub version: Version,

    /// Unix timestamp of last modification (milliseconds)
    pub modified_at: i64,
}

impl StoredDoc {
    /// Create a stored doc stamped with the current time.
    pub fn new(content: impl Into<String>, version: Version) -> Self {
        Self {
            content: content.into(),
            version,
            modified_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Snapshot of a document returned by `get_document`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct DocumentSnapshot {
    /// Current authoritative content
    pub doc: String,

    /// Current authoritative version
    pub version: Version,

    /// Identity of the serving manager incarnation
    pub manager_id: ManagerId,
}

/// Steps returned by `pull_events`.
///
/// `steps` and `client_ids` are parallel arrays: `client_ids[i]` authored
/// `steps[i]`. `version` is the authoritative version after the last returned
/// step (the current version when no steps are returned).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PulledEvents {
    /// Steps applied since the requested version, in application order
    pub steps: Vec<Step>,

    /// Authoring client id per step
    pub client_ids: Vec<ClientId>,

    /// Authoritative version after the returned steps
    pub version: Version,
}

impl PulledEvents {
    /// True when the pull returned no new steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
