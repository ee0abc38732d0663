//! Generic store of requests awaiting user approval
//!
//! Each approval kind (signing, metadata, sites, networks, assets) gets its
//! own `RequestStore`. A record lives here from `create` until it is resolved,
//! rejected or cancelled, and every membership change is published twice:
//! as a `StoreChange` on the shared change channel (consumed by `State`,
//! which drives the popup and badge) and as a fresh snapshot on the store's
//! watch channel (consumed by the popup UI subscription).

use futures::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};

use super::{RequestError, RequestKind, RequestOrigin, RequestRecord};
use crate::browser::TabId;
use crate::transport::PortId;

pub type RequestId = String;

/// Side effect run after a request settles. Receives `None` when the
/// request was rejected or cancelled.
pub type ResolveHook<T, R> =
    Arc<dyn Fn(RequestRecord<T>, Option<R>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Added,
    Removed,
}

/// Membership change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub kind: RequestKind,
    pub id: RequestId,
    pub change: Change,
}

struct PendingEntry<T, R> {
    record: RequestRecord<T>,
    responder: oneshot::Sender<Result<R, RequestError>>,
}

pub struct RequestStore<T, R> {
    kind: RequestKind,
    next_id: AtomicU64,
    // Insertion order is preserved so the popup shows oldest first
    requests: Mutex<Vec<PendingEntry<T, R>>>,
    snapshot: watch::Sender<Vec<RequestRecord<T>>>,
    changes: mpsc::UnboundedSender<StoreChange>,
    on_resolve: Option<ResolveHook<T, R>>,
}

impl<T, R> RequestStore<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + 'static,
{
    pub fn new(kind: RequestKind, changes: mpsc::UnboundedSender<StoreChange>) -> Self {
        let (snapshot, _) = watch::channel(Vec::new());
        Self {
            kind,
            next_id: AtomicU64::new(0),
            requests: Mutex::new(Vec::new()),
            snapshot,
            changes,
            on_resolve: None,
        }
    }

    pub fn with_resolve_hook(mut self, hook: ResolveHook<T, R>) -> Self {
        self.on_resolve = Some(hook);
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Queue a request. The returned future settles once the request is
    /// resolved, rejected or cancelled.
    pub fn create(&self, origin: RequestOrigin, request: T) -> PendingResponse<R> {
        let created_at = crate::now_millis();
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{}.{}.{}", self.kind.as_str(), created_at, seq);
        let (responder, rx) = oneshot::channel();

        let record = RequestRecord {
            id: id.clone(),
            origin,
            request,
            created_at,
        };

        {
            let mut requests = self.lock();
            requests.push(PendingEntry { record, responder });
            // Publish while still holding the lock so no observer can see
            // the insert without the matching notification.
            self.publish(&requests);
            self.notify(&id, Change::Added);
        }

        tracing::debug!(kind = self.kind.as_str(), id = %id, "Request queued");
        PendingResponse { id, rx }
    }

    /// Approve a request with `response`. Returns false if the id is unknown
    /// or already settled.
    pub async fn resolve(&self, id: &str, response: R) -> bool {
        let Some(entry) = self.take(id) else {
            tracing::warn!(kind = self.kind.as_str(), id, "Resolve for unknown or settled request");
            return false;
        };

        if entry.responder.send(Ok(response.clone())).is_err() {
            tracing::debug!(kind = self.kind.as_str(), id, "Requester went away before resolution");
        }
        self.run_hook(entry.record, Some(response)).await;
        true
    }

    pub async fn reject(&self, id: &str, reason: impl Into<String>) -> bool {
        self.settle_err(id, RequestError::Rejected(reason.into())).await
    }

    pub async fn cancel(&self, id: &str) -> bool {
        self.settle_err(id, RequestError::Cancelled).await
    }

    /// Cancel everything that came in through a port that has disconnected.
    pub async fn cancel_port(&self, port: PortId) -> usize {
        self.cancel_where(|origin| origin.port == Some(port)).await
    }

    /// Cancel everything that originated from a tab that has closed.
    pub async fn cancel_tab(&self, tab_id: TabId) -> usize {
        self.cancel_where(|origin| origin.tab_id == Some(tab_id)).await
    }

    pub fn get(&self, id: &str) -> Option<RequestRecord<T>> {
        self.lock()
            .iter()
            .find(|entry| entry.record.id == id)
            .map(|entry| entry.record.clone())
    }

    pub fn requests(&self) -> Vec<RequestRecord<T>> {
        self.lock().iter().map(|entry| entry.record.clone()).collect()
    }

    pub fn request_count(&self) -> usize {
        self.lock().len()
    }

    /// Current and future snapshots of the queue
    pub fn subscribe(&self) -> watch::Receiver<Vec<RequestRecord<T>>> {
        self.snapshot.subscribe()
    }

    async fn settle_err(&self, id: &str, error: RequestError) -> bool {
        let Some(entry) = self.take(id) else {
            tracing::warn!(kind = self.kind.as_str(), id, "Reject for unknown or settled request");
            return false;
        };

        let _ = entry.responder.send(Err(error));
        self.run_hook(entry.record, None).await;
        true
    }

    async fn cancel_where(&self, matches: impl Fn(&RequestOrigin) -> bool) -> usize {
        let cancelled: Vec<PendingEntry<T, R>> = {
            let mut requests = self.lock();
            let (gone, kept): (Vec<_>, Vec<_>) = requests
                .drain(..)
                .partition(|entry| matches(&entry.record.origin));
            *requests = kept;

            if !gone.is_empty() {
                self.publish(&requests);
                for entry in &gone {
                    self.notify(&entry.record.id, Change::Removed);
                }
            }
            gone
        };

        let count = cancelled.len();
        for entry in cancelled {
            tracing::info!(kind = self.kind.as_str(), id = %entry.record.id, "Request cancelled, origin went away");
            let _ = entry.responder.send(Err(RequestError::Cancelled));
            self.run_hook(entry.record, None).await;
        }
        count
    }

    fn take(&self, id: &str) -> Option<PendingEntry<T, R>> {
        let mut requests = self.lock();
        let index = requests.iter().position(|entry| entry.record.id == id)?;
        let entry = requests.remove(index);
        self.publish(&requests);
        self.notify(id, Change::Removed);
        Some(entry)
    }

    async fn run_hook(&self, record: RequestRecord<T>, response: Option<R>) {
        let Some(hook) = &self.on_resolve else {
            return;
        };
        let id = record.id.clone();
        if let Err(e) = hook(record, response).await {
            // Settlement already happened; the hook is best effort
            tracing::error!(kind = self.kind.as_str(), id = %id, "Resolve hook failed: {:#}", e);
        }
    }

    fn publish(&self, requests: &[PendingEntry<T, R>]) {
        self.snapshot
            .send_replace(requests.iter().map(|entry| entry.record.clone()).collect());
    }

    fn notify(&self, id: &str, change: Change) {
        let _ = self.changes.send(StoreChange {
            kind: self.kind,
            id: id.to_string(),
            change,
        });
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PendingEntry<T, R>>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Future for the eventual user decision on a queued request
pub struct PendingResponse<R> {
    id: RequestId,
    rx: oneshot::Receiver<Result<R, RequestError>>,
}

impl<R> PendingResponse<R> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<R> Future for PendingResponse<R> {
    type Output = Result<R, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or_else(|_| Err(RequestError::Dropped)))
    }
}
