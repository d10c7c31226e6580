//! Write-coalescing layer between in-memory documents and durable storage.
//!
//! [`DebouncedDisk`] decouples the frequency of document change
//! notifications from the frequency of durable writes. Rapid updates to one
//! key collapse into a single write once a quiet period passes, bounded by a
//! hard ceiling so continuous editing still persists regularly.
//!
//! # Responsibilities
//!
//! - Keep the latest unwritten value per key in a pending map and serve it
//!   from [`get`](DebouncedDisk::get) so readers never see stale disk state.
//! - Flush a key after `debounce_wait` of quiet, or `debounce_max_wait`
//!   after the first queued update, whichever comes first.
//! - Report every pending-map size change synchronously through the
//!   pending-writes callback; the app treats a non-zero count as "unsaved
//!   changes" and blocks unload on it.
//! - Never drop a value on a failed write: the entry stays pending, is
//!   retried, and repeated failures surface through the persistence-error
//!   callback.

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{CollabError, Result};
use crate::storage::DiskStorage;
use crate::types::StoredDoc;

/// Callback invoked with the pending-map size on every size change.
pub type PendingWritesCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Callback invoked when writes for a key keep failing.
pub type PersistenceErrorCallback = Arc<dyn Fn(&str, &CollabError) + Send + Sync>;

/// Timing and retry configuration for [`DebouncedDisk`].
#[derive(Debug, Clone)]
pub struct DebounceOptions {
    /// Quiet period; reset by every update to the key
    pub debounce_wait: Duration,

    /// Hard ceiling measured from the first pending update to the key
    pub debounce_max_wait: Duration,

    /// Consecutive write failures for one key before the persistence-error
    /// callback fires
    pub max_flush_retries: u32,
}

impl Default for DebounceOptions {
    fn default() -> Self {
        Self {
            debounce_wait: Duration::from_millis(300),
            debounce_max_wait: Duration::from_millis(1500),
            max_flush_retries: 3,
        }
    }
}

struct PendingWrite {
    doc: StoredDoc,
    /// When the first update of this pending run was queued
    first_queued: Instant,
    /// Bumped on every value change; a flush only commits if it still holds
    /// the generation it was scheduled for
    generation: u64,
    /// Consecutive flush failures
    failures: u32,
    timer: Option<JoinHandle<()>>,
}

struct DiskInner {
    storage: Arc<dyn DiskStorage>,
    options: DebounceOptions,
    pending: Mutex<IndexMap<String, PendingWrite>>,
    on_pending_writes: RwLock<Option<PendingWritesCallback>>,
    on_persistence_error: RwLock<Option<PersistenceErrorCallback>>,
}

/// Debounced write-through cache over a [`DiskStorage`] backend.
///
/// Dropping the disk aborts nothing but orphans the timers (they no-op once
/// the disk is gone); call [`flush_all`](DebouncedDisk::flush_all) first when
/// pending data must survive.
pub struct DebouncedDisk {
    inner: Arc<DiskInner>,
}

impl DebouncedDisk {
    /// Create a debounced disk over `storage`.
    pub fn new(storage: Arc<dyn DiskStorage>, options: DebounceOptions) -> Self {
        Self {
            inner: Arc::new(DiskInner {
                storage,
                options,
                pending: Mutex::new(IndexMap::new()),
                on_pending_writes: RwLock::new(None),
                on_persistence_error: RwLock::new(None),
            }),
        }
    }

    /// Register the pending-writes size callback.
    pub fn set_on_pending_writes(&self, callback: PendingWritesCallback) {
        *self.inner.on_pending_writes.write().unwrap() = Some(callback);
    }

    /// Register the persistence-error callback.
    pub fn set_on_persistence_error(&self, callback: PersistenceErrorCallback) {
        *self.inner.on_persistence_error.write().unwrap() = Some(callback);
    }

    /// Read a document, preferring the queued pending value over storage.
    pub fn get(&self, key: &str) -> Result<Option<StoredDoc>> {
        {
            let pending = self.inner.pending.lock().unwrap();
            if let Some(entry) = pending.get(key) {
                return Ok(Some(entry.doc.clone()));
            }
        }
        self.inner.storage.load_doc(key)
    }

    /// Queue `doc` for a debounced write to `key`.
    pub fn update(&self, key: &str, doc: StoredDoc) {
        DiskInner::enqueue(&self.inner, key, doc);
    }

    /// Queue a write computed from the previous value.
    ///
    /// The updater receives the pending value if one is queued, otherwise
    /// the stored value, otherwise `None`. Callers mutating the same key
    /// concurrently must serialize themselves (the manager's per-document
    /// lock does).
    pub fn update_with<F>(&self, key: &str, updater: F) -> Result<()>
    where
        F: FnOnce(Option<&StoredDoc>) -> StoredDoc,
    {
        let previous = {
            let pending = self.inner.pending.lock().unwrap();
            pending.get(key).map(|entry| entry.doc.clone())
        };
        let previous = match previous {
            Some(doc) => Some(doc),
            None => self.inner.storage.load_doc(key)?,
        };
        let doc = updater(previous.as_ref());
        DiskInner::enqueue(&self.inner, key, doc);
        Ok(())
    }

    /// Number of keys with unwritten pending values.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    /// Write the pending value for one key through immediately.
    ///
    /// Returns `true` when `key` is no longer pending afterwards, whether
    /// because the write succeeded or nothing was queued.
    pub fn flush(&self, key: &str) -> bool {
        let target = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.get_mut(key).map(|entry| {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
                entry.generation
            })
        };
        if let Some(generation) = target {
            DiskInner::flush_key(&self.inner, key, generation);
        }
        !self.inner.pending.lock().unwrap().contains_key(key)
    }

    /// Write every pending value through immediately, in first-queued order.
    ///
    /// Returns the number of keys still pending afterwards (non-zero only
    /// when writes failed; those entries are retained and retried).
    pub fn flush_all(&self) -> usize {
        let targets: Vec<(String, u64)> = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending
                .iter_mut()
                .map(|(key, entry)| {
                    if let Some(timer) = entry.timer.take() {
                        timer.abort();
                    }
                    (key.clone(), entry.generation)
                })
                .collect()
        };
        log::debug!("[DebouncedDisk] flushing all ({} pending)", targets.len());
        for (key, generation) in targets {
            DiskInner::flush_key(&self.inner, &key, generation);
        }
        self.pending_count()
    }
}

impl std::fmt::Debug for DebouncedDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebouncedDisk")
            .field("pending", &self.pending_count())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl DiskInner {
    /// Insert or supersede the pending entry for `key` and (re)arm its timer.
    fn enqueue(inner: &Arc<DiskInner>, key: &str, doc: StoredDoc) {
        let now = Instant::now();
        let size_change = {
            let mut pending = inner.pending.lock().unwrap();
            match pending.get_mut(key) {
                Some(entry) => {
                    entry.doc = doc;
                    entry.generation += 1;
                    if let Some(timer) = entry.timer.take() {
                        timer.abort();
                    }
                    let deadline = Self::deadline(inner, now, entry.first_queued);
                    entry.timer = Some(Self::spawn_timer(
                        inner,
                        key.to_string(),
                        entry.generation,
                        deadline,
                    ));
                    None
                }
                None => {
                    let generation = 1;
                    let deadline = Self::deadline(inner, now, now);
                    let timer =
                        Some(Self::spawn_timer(inner, key.to_string(), generation, deadline));
                    pending.insert(
                        key.to_string(),
                        PendingWrite {
                            doc,
                            first_queued: now,
                            generation,
                            failures: 0,
                            timer,
                        },
                    );
                    Some(pending.len())
                }
            }
        };
        if let Some(size) = size_change {
            log::debug!("[DebouncedDisk] queued write for '{}' ({} pending)", key, size);
            Self::notify_pending(inner, size);
        }
    }

    fn deadline(inner: &Arc<DiskInner>, now: Instant, first_queued: Instant) -> Instant {
        let quiet = now + inner.options.debounce_wait;
        let ceiling = first_queued + inner.options.debounce_max_wait;
        quiet.min(ceiling)
    }

    fn spawn_timer(
        inner: &Arc<DiskInner>,
        key: String,
        generation: u64,
        deadline: Instant,
    ) -> JoinHandle<()> {
        let weak: Weak<DiskInner> = Arc::downgrade(inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                Self::flush_key(&inner, &key, generation);
            }
        })
    }

    /// Attempt to write the pending value for `key`, provided it still holds
    /// `generation`. On success the entry is removed and the size callback
    /// fires; on failure the entry is retained and a retry is armed.
    fn flush_key(inner: &Arc<DiskInner>, key: &str, generation: u64) {
        let doc = {
            let pending = inner.pending.lock().unwrap();
            match pending.get(key) {
                Some(entry) if entry.generation == generation => entry.doc.clone(),
                // Superseded or already flushed; the newer timer owns it now
                _ => return,
            }
        };

        let result = inner.storage.save_doc(key, &doc.content, doc.version);

        match result {
            Ok(()) => {
                let size = {
                    let mut pending = inner.pending.lock().unwrap();
                    match pending.get(key) {
                        // Only commit the removal if no newer value arrived
                        // while the write was in flight
                        Some(entry) if entry.generation == generation => {
                            pending.shift_remove(key);
                            Some(pending.len())
                        }
                        _ => None,
                    }
                };
                if let Some(size) = size {
                    log::debug!(
                        "[DebouncedDisk] flushed '{}' at version {} ({} pending)",
                        key,
                        doc.version,
                        size
                    );
                    Self::notify_pending(inner, size);
                }
            }
            Err(err) => {
                let failures = {
                    let mut pending = inner.pending.lock().unwrap();
                    match pending.get_mut(key) {
                        Some(entry) if entry.generation == generation => {
                            entry.failures += 1;
                            let retry_at = Instant::now() + inner.options.debounce_wait;
                            entry.timer = Some(Self::spawn_timer(
                                inner,
                                key.to_string(),
                                generation,
                                retry_at,
                            ));
                            Some(entry.failures)
                        }
                        _ => None,
                    }
                };
                if let Some(failures) = failures {
                    log::warn!(
                        "[DebouncedDisk] write failed for '{}' (attempt {}): {}",
                        key,
                        failures,
                        err
                    );
                    if failures >= inner.options.max_flush_retries {
                        let callback = inner.on_persistence_error.read().unwrap().clone();
                        if let Some(callback) = callback {
                            callback(key, &err);
                        }
                    }
                }
            }
        }
    }

    fn notify_pending(inner: &Arc<DiskInner>, size: usize) {
        let callback = inner.on_pending_writes.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(size);
        }
    }
}
