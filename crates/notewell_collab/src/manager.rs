//! Authoritative collaboration state, one instance per worker.
//!
//! [`CollabManager`] owns the single source of truth for every open document:
//! the current content, the monotonically increasing version counter, and the
//! ordered log of accepted steps. Clients never mutate documents directly;
//! they describe edits as [`Step`]s and submit them through
//! [`push_events`](CollabManager::push_events), which either appends the whole
//! batch atomically or rejects it with a typed error the client can recover
//! from.
//!
//! # Responsibilities
//!
//! - Serve document snapshots (`get_document`), step ranges (`pull_events`)
//!   and step submissions (`push_events`) with the version/manager-id checks
//!   the protocol requires.
//! - Keep per-document mutation serialized behind a per-handle async mutex so
//!   different documents proceed in parallel.
//! - Trim the step log by the retention policy and answer pulls below the
//!   floor with `HistoryNotAvailable`.
//! - Schedule every accepted change on the [`DebouncedDisk`] so durability
//!   lags edits by at most the debounce ceiling.
//!
//! # Example
//!
//! ```ignore
//! let storage = Arc::new(MemoryStorage::new());
//! storage.save_doc("notes/today.md", "hello", 0)?;
//! let manager = CollabManager::new(storage, ManagerOptions::default());
//!
//! let snapshot = manager.get_document("notes/today.md", "user-a").await?;
//! let step = Step::insert_at(5, " world");
//! let version = manager
//!     .push_events("notes/today.md", snapshot.version, vec![step], "client-1", "user-a", manager.manager_id())
//!     .await?;
//! assert_eq!(version, snapshot.version + 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;

use crate::disk::{DebouncedDisk, PendingWritesCallback, PersistenceErrorCallback};
use crate::error::{CollabError, Result};
use crate::protocol::{CollabRequest, CollabResponse};
use crate::step::Step;
use crate::storage::DiskStorage;
use crate::types::{ClientId, DocumentSnapshot, ManagerId, PulledEvents, StoredDoc, Version};

/// Configuration for [`CollabManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Hard cap on retained log entries per document. Clients further behind
    /// than this refetch the whole document.
    pub max_retained_steps: usize,

    /// Debounce timings for the disk layer
    pub debounce: crate::disk::DebounceOptions,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            max_retained_steps: 500,
            debounce: crate::disk::DebounceOptions::default(),
        }
    }
}

/// One accepted step with the version it applied to.
///
/// `version` is the base the step transformed, so the entry at the log front
/// names the oldest version a client may still pull from.
struct LoggedStep {
    step: Step,
    client_id: ClientId,
    version: Version,
}

struct DocState {
    doc: String,
    version: Version,
    steps: VecDeque<LoggedStep>,
}

impl DocState {
    fn from_stored(stored: StoredDoc) -> Self {
        Self {
            doc: stored.content,
            version: stored.version,
            steps: VecDeque::new(),
        }
    }

    /// Oldest version still answerable from the log.
    fn oldest_retained(&self) -> Version {
        self.steps.front().map(|e| e.version).unwrap_or(self.version)
    }

    /// Advance the log floor after an accepted push.
    ///
    /// The floor trails the current version by the hard cap and nothing
    /// else: the protocol identifies callers only by user id, which several
    /// editor views may share, so there is no per-caller position the
    /// manager could safely trim against. Entries below the floor are
    /// dropped; a client behind it gets `HistoryNotAvailable` on its next
    /// pull and recovers by refetching.
    fn trim(&mut self, max_retained: usize) {
        let floor = self.version.saturating_sub(max_retained as Version);
        while self
            .steps
            .front()
            .is_some_and(|entry| entry.version < floor)
        {
            self.steps.pop_front();
        }
    }
}

struct DocHandle {
    state: Mutex<DocState>,
}

/// Authoritative document registry and protocol endpoint.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct CollabManager {
    manager_id: ManagerId,
    options: ManagerOptions,
    disk: DebouncedDisk,
    docs: RwLock<HashMap<String, Arc<DocHandle>>>,
}

impl CollabManager {
    /// Create a manager over `storage` with a freshly minted instance id.
    pub fn new(storage: Arc<dyn DiskStorage>, options: ManagerOptions) -> Self {
        let manager_id = uuid::Uuid::new_v4().to_string();
        log::info!("[CollabManager] starting instance {}", manager_id);
        let disk = DebouncedDisk::new(storage, options.debounce.clone());
        Self {
            manager_id,
            options,
            disk,
            docs: RwLock::new(HashMap::new()),
        }
    }

    /// Identifier of this manager incarnation. Requests stamped with a
    /// different id are answered with `ManagerMismatch`.
    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    /// Register the pending-writes size observer (unsaved-changes indicator).
    pub fn set_on_pending_writes(&self, callback: PendingWritesCallback) {
        self.disk.set_on_pending_writes(callback);
    }

    /// Register the observer for repeated disk-write failures.
    pub fn set_on_persistence_error(&self, callback: PersistenceErrorCallback) {
        self.disk.set_on_persistence_error(callback);
    }

    /// Dispatch one protocol request to the matching operation.
    pub async fn handle_request(&self, request: CollabRequest) -> Result<CollabResponse> {
        match request {
            CollabRequest::GetDocument { doc_name, user_id } => self
                .get_document(&doc_name, &user_id)
                .await
                .map(CollabResponse::Document),
            CollabRequest::PullEvents {
                doc_name,
                version,
                user_id,
                manager_id,
            } => self
                .pull_events(&doc_name, version, &user_id, &manager_id)
                .await
                .map(CollabResponse::Events),
            CollabRequest::PushEvents {
                doc_name,
                version,
                steps,
                client_id,
                user_id,
                manager_id,
            } => self
                .push_events(&doc_name, version, steps, &client_id, &user_id, &manager_id)
                .await
                .map(|version| CollabResponse::Pushed { version }),
        }
    }

    /// Fetch the current document, loading it from the disk layer on first
    /// touch. The read goes through the debounced pending map, so an
    /// unflushed write is served rather than stale disk state.
    pub async fn get_document(&self, doc_name: &str, user_id: &str) -> Result<DocumentSnapshot> {
        let handle = self
            .load_handle(doc_name)?
            .ok_or_else(|| CollabError::DocumentNotFound(doc_name.to_string()))?;
        let state = handle.state.lock().await;
        log::debug!(
            "[CollabManager] get_document '{}' v{} for user {}",
            doc_name,
            state.version,
            user_id
        );
        Ok(DocumentSnapshot {
            doc: state.doc.clone(),
            version: state.version,
            manager_id: self.manager_id.clone(),
        })
    }

    /// Return every step applied since `version`, in order, with the authors'
    /// client ids as a parallel array.
    pub async fn pull_events(
        &self,
        doc_name: &str,
        version: Version,
        user_id: &str,
        manager_id: &str,
    ) -> Result<PulledEvents> {
        self.check_manager_id(manager_id)?;
        let handle = self
            .load_handle(doc_name)?
            .ok_or_else(|| CollabError::DocumentNotFound(doc_name.to_string()))?;
        let state = handle.state.lock().await;

        if version >= state.version {
            // Nothing new; also covers the degenerate ahead-of-manager case.
            return Ok(PulledEvents {
                steps: Vec::new(),
                client_ids: Vec::new(),
                version: state.version,
            });
        }

        let oldest = state.oldest_retained();
        if version < oldest {
            return Err(CollabError::HistoryNotAvailable {
                doc_name: doc_name.to_string(),
                requested: version,
                oldest,
            });
        }

        let offset = (version - oldest) as usize;
        let mut steps = Vec::with_capacity(state.steps.len() - offset);
        let mut client_ids = Vec::with_capacity(state.steps.len() - offset);
        for entry in state.steps.iter().skip(offset) {
            steps.push(entry.step.clone());
            client_ids.push(entry.client_id.clone());
        }
        log::debug!(
            "[CollabManager] pull '{}': {} steps (v{} -> v{}) for user {}",
            doc_name,
            steps.len(),
            version,
            state.version,
            user_id
        );
        Ok(PulledEvents {
            steps,
            client_ids,
            version: state.version,
        })
    }

    /// Apply a batch of steps at `version` and return the new version.
    ///
    /// The batch is validated against a scratch copy first; a step that fails
    /// to apply rejects the whole batch with the document unchanged. On
    /// success the version advances by exactly `steps.len()` and the new
    /// content is scheduled on the debounced disk.
    pub async fn push_events(
        &self,
        doc_name: &str,
        version: Version,
        steps: Vec<Step>,
        client_id: &str,
        user_id: &str,
        manager_id: &str,
    ) -> Result<Version> {
        self.check_manager_id(manager_id)?;
        let handle = self
            .load_handle(doc_name)?
            .ok_or_else(|| CollabError::DocumentNotFound(doc_name.to_string()))?;
        let mut state = handle.state.lock().await;

        if version != state.version {
            log::debug!(
                "[CollabManager] rejecting push to '{}' at v{} (authoritative v{})",
                doc_name,
                version,
                state.version
            );
            return Err(CollabError::VersionConflict {
                doc_name: doc_name.to_string(),
                requested: version,
                current: state.version,
            });
        }

        // All-or-nothing: apply to a scratch copy before touching the doc.
        let mut scratch = state.doc.clone();
        for step in &steps {
            scratch = step.apply(&scratch)?;
        }

        let count = steps.len() as Version;
        for (i, step) in steps.into_iter().enumerate() {
            state.steps.push_back(LoggedStep {
                step,
                client_id: client_id.to_string(),
                version: version + i as Version,
            });
        }
        state.doc = scratch;
        state.version += count;
        state.trim(self.options.max_retained_steps);

        self.disk
            .update(doc_name, StoredDoc::new(state.doc.clone(), state.version));
        log::debug!(
            "[CollabManager] push '{}': {} steps from client {} of user {} (v{} -> v{})",
            doc_name,
            count,
            client_id,
            user_id,
            version,
            state.version
        );
        Ok(state.version)
    }

    /// Force-write every pending document to storage. Returns the number of
    /// keys still unwritten (non-zero only when the backend is failing).
    pub fn flush_all(&self) -> usize {
        let remaining = self.disk.flush_all();
        if remaining > 0 {
            log::warn!(
                "[CollabManager] flush_all left {} document(s) unwritten",
                remaining
            );
        }
        remaining
    }

    /// Flush `doc_name` and drop its in-memory handle. The document stays in
    /// storage and reloads (with an empty log) on next touch.
    pub fn remove_document(&self, doc_name: &str) {
        let removed = self.docs.write().unwrap().remove(doc_name);
        if removed.is_some() {
            self.disk.flush(doc_name);
            log::debug!("[CollabManager] unloaded '{}'", doc_name);
        }
    }

    /// Number of documents currently held in memory.
    pub fn loaded_count(&self) -> usize {
        self.docs.read().unwrap().len()
    }

    /// Names of the documents currently held in memory, sorted.
    pub fn doc_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.docs.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Flush everything and clear the registry. The worker layer refuses
    /// requests after this point.
    pub fn destroy(&self) {
        let remaining = self.flush_all();
        self.docs.write().unwrap().clear();
        log::info!(
            "[CollabManager] instance {} destroyed ({} unflushed)",
            self.manager_id,
            remaining
        );
    }

    fn check_manager_id(&self, manager_id: &str) -> Result<()> {
        if manager_id != self.manager_id {
            return Err(CollabError::ManagerMismatch {
                requested: manager_id.to_string(),
                current: self.manager_id.clone(),
            });
        }
        Ok(())
    }

    /// Look up the handle for `doc_name`, loading it through the disk layer
    /// on a miss. `Ok(None)` means the document exists nowhere.
    fn load_handle(&self, doc_name: &str) -> Result<Option<Arc<DocHandle>>> {
        {
            let docs = self.docs.read().unwrap();
            if let Some(handle) = docs.get(doc_name) {
                return Ok(Some(handle.clone()));
            }
        }

        let stored = match self.disk.get(doc_name)? {
            Some(stored) => stored,
            None => return Ok(None),
        };

        let mut docs = self.docs.write().unwrap();
        // Another request may have loaded it while we read storage.
        if let Some(handle) = docs.get(doc_name) {
            return Ok(Some(handle.clone()));
        }
        log::debug!(
            "[CollabManager] loaded '{}' at v{}",
            doc_name,
            stored.version
        );
        let handle = Arc::new(DocHandle {
            state: Mutex::new(DocState::from_stored(stored)),
        });
        docs.insert(doc_name.to_string(), handle.clone());
        Ok(Some(handle))
    }
}

impl std::fmt::Debug for CollabManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabManager")
            .field("manager_id", &self.manager_id)
            .field("loaded", &self.loaded_count())
            .finish()
    }
}
