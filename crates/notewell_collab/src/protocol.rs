//! Typed request/response protocol for the client/manager boundary.
//!
//! Requests and responses are a closed set of tagged variants, matched
//! exhaustively on both sides. A response of the wrong shape for its request
//! fails fast with a typed error instead of proceeding with missing fields,
//! and manager errors cross the boundary as [`WireError`] with their
//! discriminating kind intact (see [`crate::error`]).

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CollabError, Result};
use crate::step::Step;
use crate::types::{ClientId, DocumentSnapshot, ManagerId, PulledEvents, UserId, Version};

/// A request from an editor-side client to the authoritative manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum CollabRequest {
    /// Fetch the current snapshot of a document
    GetDocument {
        /// Document to fetch
        doc_name: String,
        /// Requesting user
        user_id: UserId,
    },

    /// Fetch every step applied since `version`
    PullEvents {
        /// Document to pull from
        doc_name: String,
        /// Last version the client has applied
        version: Version,
        /// Requesting user
        user_id: UserId,
        /// Manager incarnation the client believes it is talking to
        manager_id: ManagerId,
    },

    /// Append steps authored against `version`
    PushEvents {
        /// Document to push to
        doc_name: String,
        /// Version the steps were authored against
        version: Version,
        /// The steps, in application order
        steps: Vec<Step>,
        /// Authoring editor session
        client_id: ClientId,
        /// Requesting user
        user_id: UserId,
        /// Manager incarnation the client believes it is talking to
        manager_id: ManagerId,
    },
}

impl CollabRequest {
    /// Document this request concerns.
    pub fn doc_name(&self) -> &str {
        match self {
            CollabRequest::GetDocument { doc_name, .. }
            | CollabRequest::PullEvents { doc_name, .. }
            | CollabRequest::PushEvents { doc_name, .. } => doc_name,
        }
    }

    /// Short name of the request kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            CollabRequest::GetDocument { .. } => "get_document",
            CollabRequest::PullEvents { .. } => "pull_events",
            CollabRequest::PushEvents { .. } => "push_events",
        }
    }
}

/// A successful response from the manager.
///
/// Errors travel separately as [`crate::error::WireError`]; the transport
/// carries `Result<CollabResponse, WireError>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum CollabResponse {
    /// Snapshot answering `GetDocument`
    Document(DocumentSnapshot),

    /// Steps answering `PullEvents`
    Events(PulledEvents),

    /// New authoritative version answering `PushEvents`
    Pushed {
        /// Version after the pushed steps were applied
        version: Version,
    },
}

impl CollabResponse {
    /// Short name of the response kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            CollabResponse::Document(_) => "document",
            CollabResponse::Events(_) => "events",
            CollabResponse::Pushed { .. } => "pushed",
        }
    }

    /// Extract the snapshot, failing fast when the manager answered a
    /// `GetDocument` with something else.
    pub fn into_document(self) -> Result<DocumentSnapshot> {
        match self {
            CollabResponse::Document(snapshot) => Ok(snapshot),
            other => Err(CollabError::UnexpectedResponse(format!(
                "expected document, got {}",
                other.kind()
            ))),
        }
    }

    /// Extract the pulled events, failing fast on a shape mismatch.
    pub fn into_events(self) -> Result<PulledEvents> {
        match self {
            CollabResponse::Events(events) => Ok(events),
            other => Err(CollabError::UnexpectedResponse(format!(
                "expected events, got {}",
                other.kind()
            ))),
        }
    }

    /// Extract the post-push version, failing fast on a shape mismatch.
    pub fn into_pushed(self) -> Result<Version> {
        match self {
            CollabResponse::Pushed { version } => Ok(version),
            other => Err(CollabError::UnexpectedResponse(format!(
                "expected pushed, got {}",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serde_round_trip() {
        let request = CollabRequest::PushEvents {
            doc_name: "notes/today".to_string(),
            version: 4,
            steps: vec![Step::insert_at(0, "hi")],
            client_id: "client-1".to_string(),
            user_id: "user-1".to_string(),
            manager_id: "mgr-1".to_string(),
        };
        let json = serde_json::to_string(&request).unwrap();
        let back: CollabRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
        assert_eq!(back.doc_name(), "notes/today");
        assert_eq!(back.kind(), "push_events");
    }

    #[test]
    fn test_response_serde_round_trip() {
        let response = CollabResponse::Events(PulledEvents {
            steps: vec![Step::delete(1, 3)],
            client_ids: vec!["client-2".to_string()],
            version: 9,
        });
        let json = serde_json::to_string(&response).unwrap();
        let back: CollabResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn test_shape_mismatch_is_typed() {
        let response = CollabResponse::Pushed { version: 2 };
        let err = response.into_document().unwrap_err();
        assert!(matches!(err, CollabError::UnexpectedResponse(_)));
    }

    #[test]
    fn test_expected_shapes_extract() {
        let snapshot = DocumentSnapshot {
            doc: "x".to_string(),
            version: 1,
            manager_id: "mgr-1".to_string(),
        };
        let doc = CollabResponse::Document(snapshot.clone())
            .into_document()
            .unwrap();
        assert_eq!(doc, snapshot);
        assert_eq!(
            CollabResponse::Pushed { version: 6 }.into_pushed().unwrap(),
            6
        );
    }
}
