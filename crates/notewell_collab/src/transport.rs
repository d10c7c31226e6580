//! Request transport between editor clients and the worker-hosted manager.
//!
//! The editor side and the authoritative [`CollabManager`] live on opposite
//! sides of a message boundary (a web worker in the app, a task here).
//! [`CollabTransport`] is the seam: clients hand over a [`CollabRequest`] and
//! await exactly one [`CollabResponse`] or [`WireError`].
//!
//! [`CollabWorker`] hosts a manager behind that seam. Requests and replies are
//! JSON strings, the same envelope discipline as a `postMessage` boundary, so
//! everything crossing it is proven serializable in both directions. Each
//! request carries its own reply channel; responses cannot be mis-paired no
//! matter how requests interleave across documents.
//!
//! The [`WorkerTransport`] returned by [`CollabWorker::spawn`] carries an
//! explicit readiness gate: requests sent before the serve loop is up wait on
//! it instead of racing the startup.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{CollabErrorCode, WireError};
use crate::manager::CollabManager;
use crate::protocol::{CollabRequest, CollabResponse};

/// Owned future type for object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of one request/response exchange.
pub type TransportResult = std::result::Result<CollabResponse, WireError>;

/// Carries collaboration requests to whatever hosts the manager.
///
/// Implementations must uphold one-request-one-reply pairing; ordering across
/// concurrent calls is unconstrained.
pub trait CollabTransport: Send + Sync {
    /// Send one request and await its reply.
    fn send_request(&self, request: CollabRequest) -> BoxFuture<'_, TransportResult>;
}

fn closed() -> WireError {
    WireError {
        code: CollabErrorCode::TransportClosed,
        message: "collab transport closed".to_string(),
        doc_name: None,
    }
}

struct WorkerRequest {
    /// JSON-encoded [`CollabRequest`]
    payload: String,
    /// JSON-encoded `Result<CollabResponse, WireError>`
    reply: oneshot::Sender<String>,
}

/// Handle to a spawned worker serve loop.
///
/// Dropping the handle (without calling [`shutdown`](CollabWorker::shutdown))
/// also stops the loop; in-flight requests finish and the manager is flushed
/// either way.
pub struct CollabWorker {
    manager: Arc<CollabManager>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl CollabWorker {
    /// Start serving `manager` and return the worker handle plus a transport
    /// connected to it.
    pub fn spawn(manager: Arc<CollabManager>) -> (CollabWorker, WorkerTransport) {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<WorkerRequest>();
        let (ready_tx, ready_rx) = watch::channel(false);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let serve_manager = manager.clone();
        let handle = tokio::spawn(async move {
            let _ = ready_tx.send(true);
            log::debug!(
                "[CollabWorker] serving manager {}",
                serve_manager.manager_id()
            );
            let mut inflight = JoinSet::new();
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    request = request_rx.recv() => match request {
                        Some(request) => {
                            let manager = serve_manager.clone();
                            inflight.spawn(async move {
                                let reply = serve_one(&manager, &request.payload).await;
                                // Receiver gone means the caller gave up; the
                                // work itself already happened.
                                let _ = request.reply.send(reply);
                            });
                        }
                        None => break,
                    }
                }
            }
            // Drain in-flight requests before flushing so their writes are
            // included.
            while inflight.join_next().await.is_some() {}
            serve_manager.destroy();
            log::debug!("[CollabWorker] stopped");
        });

        let transport = WorkerTransport {
            sender: request_tx,
            ready: ready_rx,
        };
        let worker = CollabWorker {
            manager,
            shutdown: Some(shutdown_tx),
            handle,
        };
        (worker, transport)
    }

    /// The hosted manager.
    pub fn manager(&self) -> &CollabManager {
        &self.manager
    }

    /// Stop accepting requests, drain in-flight ones, flush the manager, and
    /// wait for the serve loop to finish. Later sends fail with
    /// `TransportClosed`.
    pub async fn shutdown(mut self) {
        log::info!("[CollabWorker] shutdown requested");
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(err) = (&mut self.handle).await {
            log::error!("[CollabWorker] serve loop failed: {}", err);
        }
    }
}

async fn serve_one(manager: &CollabManager, payload: &str) -> String {
    let result: TransportResult = match serde_json::from_str::<CollabRequest>(payload) {
        Ok(request) => manager
            .handle_request(request)
            .await
            .map_err(|err| err.to_wire()),
        Err(err) => Err(WireError {
            code: CollabErrorCode::Internal,
            message: format!("malformed request: {}", err),
            doc_name: None,
        }),
    };
    match serde_json::to_string(&result) {
        Ok(reply) => reply,
        Err(err) => {
            log::error!("[CollabWorker] failed to encode reply: {}", err);
            let fallback: TransportResult = Err(WireError {
                code: CollabErrorCode::Internal,
                message: "reply serialization failed".to_string(),
                doc_name: None,
            });
            serde_json::to_string(&fallback).unwrap_or_default()
        }
    }
}

/// Client-side endpoint of a [`CollabWorker`].
///
/// Cheap to clone; every clone talks to the same serve loop.
#[derive(Clone)]
pub struct WorkerTransport {
    sender: mpsc::UnboundedSender<WorkerRequest>,
    ready: watch::Receiver<bool>,
}

impl CollabTransport for WorkerTransport {
    fn send_request(&self, request: CollabRequest) -> BoxFuture<'_, TransportResult> {
        Box::pin(async move {
            // Queue behind the explicit readiness gate rather than racing
            // worker startup.
            let mut ready = self.ready.clone();
            ready.wait_for(|up| *up).await.map_err(|_| closed())?;

            let payload = serde_json::to_string(&request).map_err(|err| WireError {
                code: CollabErrorCode::Internal,
                message: format!("failed to encode request: {}", err),
                doc_name: Some(request.doc_name().to_string()),
            })?;

            let (reply_tx, reply_rx) = oneshot::channel();
            self.sender
                .send(WorkerRequest {
                    payload,
                    reply: reply_tx,
                })
                .map_err(|_| closed())?;

            let raw = reply_rx.await.map_err(|_| closed())?;
            serde_json::from_str::<TransportResult>(&raw).map_err(|err| WireError {
                code: CollabErrorCode::Internal,
                message: format!("malformed reply: {}", err),
                doc_name: None,
            })?
        })
    }
}
