#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Editor-side sync session (local steps, conflict rebase, polling)
pub mod client;

/// Debounced write coalescing between documents and storage
pub mod disk;

/// Error and wire-error types
pub mod error;

/// Authoritative document registry, version counter, and step log
pub mod manager;

/// In-memory storage backend
pub mod memory_storage;

/// Request/response protocol for the worker boundary
pub mod protocol;

/// SQLite storage backend (native only)
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
pub mod sqlite_storage;

/// Invertible text steps and position mapping for rebasing
pub mod step;

/// Storage provider trait
pub mod storage;

/// Transport seam and the worker facade behind it
pub mod transport;

/// Shared identifiers, snapshots, and pulled-event payloads
pub mod types;
