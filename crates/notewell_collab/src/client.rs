//! Editor-side synchronization plugin.
//!
//! One [`CollabClient`] per open editor view. The client keeps a local copy
//! of the document, applies the user's edits immediately, and reconciles with
//! the authoritative manager over a [`CollabTransport`]: unconfirmed steps are
//! pushed, remote steps are pulled and rebased under local ones, and version
//! conflicts resolve by pull-rebase-retry.
//!
//! All protocol traffic for one client flows through a single sync task (and
//! the round lock [`sync_now`](CollabClient::sync_now) shares with it), so a
//! push is never in flight while another push or pull is. Local editing stays
//! responsive: [`apply_local_step`](CollabClient::apply_local_step) only
//! touches the session briefly and wakes the task instead of awaiting the
//! network.
//!
//! # States
//!
//! `Init` until the initial document fetch lands, then `Synced`. A push in
//! flight is `AwaitingAck`. Unrecoverable failures (transport gone, retries
//! exhausted, corrupt rebase) end in `Fatal`: further edits are refused and
//! the registered fatal-error observer decides whether the error was handled.

use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use ts_rs::TS;

use crate::error::{CollabError, Result};
use crate::protocol::CollabRequest;
use crate::step::{rebase_steps, Rebaseable, Step};
use crate::transport::CollabTransport;
use crate::types::{ClientId, ManagerId, PulledEvents, UserId, Version};

/// Observer for fatal failures. Returns `true` when the error was handled;
/// `false` propagates it to the error log.
pub type FatalErrorCallback = Arc<dyn Fn(&CollabError) -> bool + Send + Sync>;

/// Lifecycle of a [`CollabClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum CollabState {
    /// Created but the initial document fetch has not completed
    Init,
    /// Local document matches the last confirmed server state
    Synced,
    /// A push is in flight, awaiting the manager's acknowledgement
    AwaitingAck,
    /// Unrecoverable failure; the session refuses further edits
    Fatal,
}

/// Configuration for one collaborative editing session.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Document this session edits
    pub doc_name: String,
    /// User on whose behalf requests are made
    pub user_id: UserId,
    /// Identity attached to pushed steps; unique per editor instance
    pub client_id: ClientId,
    /// How often to poll for remote steps
    pub poll_interval: Duration,
    /// Failed push attempts tolerated before the session goes fatal
    pub max_push_retries: u32,
}

impl ClientOptions {
    /// Options with the default polling cadence and retry budget.
    pub fn new(
        doc_name: impl Into<String>,
        user_id: impl Into<UserId>,
        client_id: impl Into<ClientId>,
    ) -> Self {
        Self {
            doc_name: doc_name.into(),
            user_id: user_id.into(),
            client_id: client_id.into(),
            poll_interval: Duration::from_secs(2),
            max_push_retries: 5,
        }
    }
}

/// Mutable per-session state, guarded as one unit.
struct Session {
    doc: String,
    version: Version,
    manager_id: ManagerId,
    unconfirmed: Vec<Rebaseable>,
}

struct ClientInner {
    options: ClientOptions,
    transport: Arc<dyn CollabTransport>,
    state: RwLock<CollabState>,
    session: Mutex<Session>,
    /// Serializes sync rounds between the background task and `sync_now`
    round_lock: Mutex<()>,
    push_notify: Notify,
    shutdown_notify: Notify,
    on_fatal_error: RwLock<Option<FatalErrorCallback>>,
}

/// Handle to a running editor sync session.
pub struct CollabClient {
    inner: Arc<ClientInner>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl CollabClient {
    /// Fetch the document and start the background sync task.
    ///
    /// Fails (and starts nothing) when the initial fetch fails; otherwise
    /// the returned client is `Synced`.
    pub async fn start(
        transport: Arc<dyn CollabTransport>,
        options: ClientOptions,
    ) -> Result<CollabClient> {
        let inner = Arc::new(ClientInner {
            options,
            transport,
            state: RwLock::new(CollabState::Init),
            session: Mutex::new(Session {
                doc: String::new(),
                version: 0,
                manager_id: String::new(),
                unconfirmed: Vec::new(),
            }),
            round_lock: Mutex::new(()),
            push_notify: Notify::new(),
            shutdown_notify: Notify::new(),
            on_fatal_error: RwLock::new(None),
        });

        refetch(&inner).await?;

        let task = tokio::spawn(sync_task(inner.clone()));
        Ok(CollabClient {
            inner,
            task: StdMutex::new(Some(task)),
        })
    }

    /// Register the fatal-error observer.
    pub fn set_on_fatal_error(&self, callback: FatalErrorCallback) {
        *self.inner.on_fatal_error.write().unwrap() = Some(callback);
    }

    /// Name of the document this session edits.
    pub fn doc_name(&self) -> &str {
        &self.inner.options.doc_name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CollabState {
        *self.inner.state.read().unwrap()
    }

    /// Current local document content.
    pub async fn document(&self) -> String {
        self.inner.session.lock().await.doc.clone()
    }

    /// Last confirmed server version.
    pub async fn version(&self) -> Version {
        self.inner.session.lock().await.version
    }

    /// Number of locally applied steps not yet acknowledged (drives the
    /// unsaved-edits indicator).
    pub async fn unconfirmed_len(&self) -> usize {
        self.inner.session.lock().await.unconfirmed.len()
    }

    /// Apply one local edit and queue it for pushing.
    ///
    /// The step is validated against and applied to the local document
    /// immediately; the network round happens on the sync task.
    pub async fn apply_local_step(&self, step: Step) -> Result<()> {
        if self.state() == CollabState::Fatal {
            return Err(CollabError::NotEditable(
                self.inner.options.doc_name.clone(),
            ));
        }
        {
            let mut session = self.inner.session.lock().await;
            let inverted = step.invert(&session.doc)?;
            session.doc = step.apply(&session.doc)?;
            session.unconfirmed.push(Rebaseable { step, inverted });
        }
        self.inner.push_notify.notify_one();
        Ok(())
    }

    /// Run one full push-then-pull round immediately.
    ///
    /// Waits for any in-flight round first, so callers observe a settled
    /// session afterwards. Errors transition the session to `Fatal` exactly
    /// as they would on the background task.
    pub async fn sync_now(&self) -> Result<()> {
        if self.state() == CollabState::Fatal {
            return Err(CollabError::NotEditable(
                self.inner.options.doc_name.clone(),
            ));
        }
        let _round = self.inner.round_lock.lock().await;
        let result = async {
            push_all(&self.inner).await?;
            pull_once(&self.inner).await
        }
        .await;
        if let Err(err) = &result {
            enter_fatal(&self.inner, err);
        }
        result
    }

    /// Stop the background task. Unpushed local steps stay in the buffer;
    /// call [`sync_now`](Self::sync_now) first to flush them.
    pub async fn stop(&self) {
        self.inner.shutdown_notify.notify_one();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for CollabClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabClient")
            .field("doc_name", &self.inner.options.doc_name)
            .field("client_id", &self.inner.options.client_id)
            .field("state", &self.state())
            .finish()
    }
}

async fn sync_task(inner: Arc<ClientInner>) {
    let mut poll = tokio::time::interval_at(
        tokio::time::Instant::now() + inner.options.poll_interval,
        inner.options.poll_interval,
    );
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    log::debug!(
        "[CollabClient] sync task for '{}' started",
        inner.options.doc_name
    );
    loop {
        tokio::select! {
            _ = inner.shutdown_notify.notified() => break,
            _ = inner.push_notify.notified() => {
                let _round = inner.round_lock.lock().await;
                if let Err(err) = push_all(&inner).await {
                    enter_fatal(&inner, &err);
                }
            }
            _ = poll.tick() => {
                let _round = inner.round_lock.lock().await;
                if let Err(err) = pull_once(&inner).await {
                    enter_fatal(&inner, &err);
                }
            }
        }
        if current_state(&inner) == CollabState::Fatal {
            break;
        }
    }
    log::debug!(
        "[CollabClient] sync task for '{}' stopped",
        inner.options.doc_name
    );
}

/// Push until the unconfirmed buffer is drained, resolving version conflicts
/// by pull-rebase-retry within the configured attempt budget.
async fn push_all(inner: &ClientInner) -> Result<()> {
    if current_state(inner) == CollabState::Fatal {
        return Ok(());
    }
    let mut attempts: u32 = 0;
    loop {
        let (version, manager_id, batch) = {
            let session = inner.session.lock().await;
            if session.unconfirmed.is_empty() {
                set_state(inner, CollabState::Synced);
                return Ok(());
            }
            let batch: Vec<Step> = session
                .unconfirmed
                .iter()
                .map(|entry| entry.step.clone())
                .collect();
            (session.version, session.manager_id.clone(), batch)
        };

        set_state(inner, CollabState::AwaitingAck);
        let sent = batch.len();
        let request = CollabRequest::PushEvents {
            doc_name: inner.options.doc_name.clone(),
            version,
            steps: batch,
            client_id: inner.options.client_id.clone(),
            user_id: inner.options.user_id.clone(),
            manager_id,
        };

        match inner.transport.send_request(request).await {
            Ok(response) => {
                let new_version = response.into_pushed()?;
                let mut session = inner.session.lock().await;
                // Steps appended while the push was in flight sit after the
                // confirmed prefix; only the prefix is acknowledged.
                let confirmed = sent.min(session.unconfirmed.len());
                session.unconfirmed.drain(..confirmed);
                session.version = new_version;
                if session.unconfirmed.is_empty() {
                    drop(session);
                    set_state(inner, CollabState::Synced);
                    return Ok(());
                }
                // New local steps arrived meanwhile; push them right away.
                attempts = 0;
            }
            Err(wire) if wire.code == crate::error::CollabErrorCode::VersionConflict => {
                attempts += 1;
                if attempts >= inner.options.max_push_retries {
                    return Err(CollabError::RetriesExhausted {
                        doc_name: inner.options.doc_name.clone(),
                        attempts,
                    });
                }
                log::debug!(
                    "[CollabClient] push conflict on '{}' (attempt {}), pulling and rebasing",
                    inner.options.doc_name,
                    attempts
                );
                pull_and_rebase(inner).await?;
            }
            Err(wire) if wire.code.needs_refetch() => {
                log::warn!(
                    "[CollabClient] push to '{}' rejected ({}), refetching",
                    inner.options.doc_name,
                    wire
                );
                refetch(inner).await?;
                return Ok(());
            }
            Err(wire) => return Err(CollabError::Wire(wire)),
        }
    }
}

/// One poll: fetch steps since our version and integrate them.
async fn pull_once(inner: &ClientInner) -> Result<()> {
    if current_state(inner) == CollabState::Fatal {
        return Ok(());
    }
    pull_and_rebase(inner).await?;
    // A poll can finish while fresh local steps still sit in the buffer;
    // the session is not settled until their push is acknowledged.
    if inner.session.lock().await.unconfirmed.is_empty() {
        set_state(inner, CollabState::Synced);
    }
    Ok(())
}

async fn pull_and_rebase(inner: &ClientInner) -> Result<()> {
    let (version, manager_id) = {
        let session = inner.session.lock().await;
        (session.version, session.manager_id.clone())
    };
    let request = CollabRequest::PullEvents {
        doc_name: inner.options.doc_name.clone(),
        version,
        user_id: inner.options.user_id.clone(),
        manager_id,
    };
    match inner.transport.send_request(request).await {
        Ok(response) => {
            let events = response.into_events()?;
            integrate_events(inner, events).await
        }
        Err(wire) if wire.code.needs_refetch() => {
            log::warn!(
                "[CollabClient] pull for '{}' rejected ({}), refetching",
                inner.options.doc_name,
                wire
            );
            refetch(inner).await
        }
        Err(wire) => Err(CollabError::Wire(wire)),
    }
}

/// Fold a pulled step range into the local session.
///
/// A leading run of steps carrying our own client id is an echo of a push
/// whose reply never reached us: those confirm buffer entries instead of
/// being re-applied. The rest are remote steps; the unconfirmed buffer is
/// rebased on top of them.
async fn integrate_events(inner: &ClientInner, events: PulledEvents) -> Result<()> {
    let mut session = inner.session.lock().await;

    let echoed = events
        .client_ids
        .iter()
        .take_while(|id| **id == inner.options.client_id)
        .count()
        // An echo always corresponds to a buffer entry; the clamp keeps a
        // misbehaving server from draining past the buffer.
        .min(session.unconfirmed.len());
    if echoed > 0 {
        session.unconfirmed.drain(..echoed);
        log::debug!(
            "[CollabClient] confirmed {} echoed step(s) for '{}'",
            echoed,
            inner.options.doc_name
        );
    }

    let remote = &events.steps[echoed..];
    if remote.is_empty() {
        session.version = events.version;
        return Ok(());
    }

    let pending = std::mem::take(&mut session.unconfirmed);
    let rebased = match rebase_steps(&session.doc, &pending, remote) {
        Ok(rebased) => rebased,
        Err(err) => {
            session.unconfirmed = pending;
            return Err(err);
        }
    };
    if rebased.dropped > 0 {
        log::warn!(
            "[CollabClient] {} local step(s) on '{}' were overwritten by remote deletions",
            rebased.dropped,
            inner.options.doc_name
        );
    }
    log::debug!(
        "[CollabClient] integrated {} remote step(s) into '{}' (v{} -> v{})",
        remote.len(),
        inner.options.doc_name,
        session.version,
        events.version
    );
    session.doc = rebased.doc;
    session.unconfirmed = rebased.pending;
    session.version = events.version;
    Ok(())
}

/// Reload the document from scratch, adopting the current manager id.
///
/// Unconfirmed local steps are discarded: after a manager restart or a
/// history gap there is no version to rebase them against.
async fn refetch(inner: &ClientInner) -> Result<()> {
    let request = CollabRequest::GetDocument {
        doc_name: inner.options.doc_name.clone(),
        user_id: inner.options.user_id.clone(),
    };
    let snapshot = inner
        .transport
        .send_request(request)
        .await
        .map_err(CollabError::Wire)?
        .into_document()?;

    let mut session = inner.session.lock().await;
    if !session.unconfirmed.is_empty() {
        log::warn!(
            "[CollabClient] discarding {} unconfirmed local step(s) for '{}'",
            session.unconfirmed.len(),
            inner.options.doc_name
        );
        session.unconfirmed.clear();
    }
    log::debug!(
        "[CollabClient] loaded '{}' at v{} from manager {}",
        inner.options.doc_name,
        snapshot.version,
        snapshot.manager_id
    );
    session.doc = snapshot.doc;
    session.version = snapshot.version;
    session.manager_id = snapshot.manager_id;
    drop(session);
    set_state(inner, CollabState::Synced);
    Ok(())
}

fn current_state(inner: &ClientInner) -> CollabState {
    *inner.state.read().unwrap()
}

fn set_state(inner: &ClientInner, next: CollabState) {
    let mut state = inner.state.write().unwrap();
    if *state == next || *state == CollabState::Fatal {
        return;
    }
    log::debug!(
        "[CollabClient] '{}' {:?} -> {:?}",
        inner.options.doc_name,
        *state,
        next
    );
    *state = next;
}

fn enter_fatal(inner: &ClientInner, err: &CollabError) {
    {
        let mut state = inner.state.write().unwrap();
        if *state == CollabState::Fatal {
            return;
        }
        *state = CollabState::Fatal;
    }
    log::error!(
        "[CollabClient] '{}' entering fatal state: {}",
        inner.options.doc_name,
        err
    );
    let callback = inner.on_fatal_error.read().unwrap().clone();
    let handled = callback.map(|callback| callback(err)).unwrap_or(false);
    if !handled {
        // The app-level crash reporter hooks in here.
        log::error!(
            "[CollabClient] unhandled fatal error on '{}': {:?}",
            inner.options.doc_name,
            err
        );
    }
}
