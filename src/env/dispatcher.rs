//! Request/response correlation
//!
//! Every outgoing request gets the next id from a monotonic counter and a
//! [`PendingRequest`] entry. Whoever removes the entry from the pending
//! table (a matching response, a timeout, a cancellation, or connection
//! loss) is the only party allowed to fire its callback, which is what makes
//! delivery exactly-once.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use super::connection::{ConnectionEvent, ConnectionManager};
use super::envelope::{Envelope, RequestId};
use super::error::EnvError;
use super::notifications::NotificationRouter;

/// Receives the outcome of one request
pub type ResponseCallback = Box<dyn FnOnce(Result<Value, EnvError>) + Send>;

/// Bookkeeping for a request awaiting its response
pub struct PendingRequest {
    /// Correlation id
    pub request_id: RequestId,
    /// When the request was handed to the connection
    pub issued_at: Instant,
    callback: ResponseCallback,
}

impl PendingRequest {
    fn fire(self, result: Result<Value, EnvError>) {
        let request_id = self.request_id;
        let callback = self.callback;
        if catch_unwind(AssertUnwindSafe(move || callback(result))).is_err() {
            tracing::error!("callback for request {} panicked", request_id);
        }
    }
}

#[derive(Default)]
struct PendingTable {
    last_id: RequestId,
    pending: HashMap<RequestId, PendingRequest>,
}

impl PendingTable {
    /// Remove every entry, ascending by id.
    fn drain(&mut self) -> Vec<PendingRequest> {
        let mut drained: Vec<_> = self.pending.drain().map(|(_, pending)| pending).collect();
        drained.sort_by_key(|pending| pending.request_id);
        drained
    }
}

fn fire_all(drained: Vec<PendingRequest>, error: &EnvError) -> usize {
    if drained.is_empty() {
        return 0;
    }
    tracing::info!("cancelling {} pending requests: {}", drained.len(), error);
    let count = drained.len();
    for pending in drained {
        pending.fire(Err(error.clone()));
    }
    count
}

/// Correlates requests and responses over one connection
#[derive(Clone)]
pub struct RequestDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    connection: ConnectionManager,
    router: NotificationRouter,
    table: Mutex<PendingTable>,
}

impl Drop for DispatcherInner {
    // Nobody can answer these any more.
    fn drop(&mut self) {
        let drained = self.table.get_mut().drain();
        fire_all(drained, &EnvError::connection_lost("client dropped"));
    }
}

impl RequestDispatcher {
    /// Attach a dispatcher to `connection`.
    ///
    /// Inbound envelopes flow into [`handle_inbound`] and a Closed
    /// connection event cancels everything still pending with
    /// [`EnvError::ConnectionLost`].
    ///
    /// [`handle_inbound`]: RequestDispatcher::handle_inbound
    pub fn new(connection: ConnectionManager, router: NotificationRouter) -> Self {
        let inner = Arc::new(DispatcherInner {
            connection: connection.clone(),
            router,
            table: Mutex::new(PendingTable::default()),
        });

        let weak = Arc::downgrade(&inner);
        connection.on_message(move |envelope| {
            if let Some(inner) = weak.upgrade() {
                RequestDispatcher { inner }.handle_inbound(envelope);
            }
        });

        let weak: Weak<DispatcherInner> = Arc::downgrade(&inner);
        connection.on_state(move |event| {
            if let ConnectionEvent::Closed { reason } = event {
                if let Some(inner) = weak.upgrade() {
                    RequestDispatcher { inner }.cancel_all(EnvError::connection_lost(reason.clone()));
                }
            }
        });

        Self { inner }
    }

    /// Send `payload` and arrange for `callback` to receive the response.
    ///
    /// If the send fails the callback fires with that error before this
    /// returns and nothing stays pending.
    pub fn request<F>(&self, payload: Value, callback: F) -> RequestId
    where
        F: FnOnce(Result<Value, EnvError>) + Send + 'static,
    {
        let request_id = {
            let mut table = self.inner.table.lock();
            table.last_id += 1;
            let request_id = table.last_id;
            table.pending.insert(
                request_id,
                PendingRequest {
                    request_id,
                    issued_at: Instant::now(),
                    callback: Box::new(callback),
                },
            );
            request_id
        };

        if let Err(err) = self
            .inner
            .connection
            .send(&Envelope::request(request_id, payload))
        {
            if let Some(pending) = self.take(request_id) {
                tracing::debug!("request {} not sent: {}", request_id, err);
                pending.fire(Err(err));
            }
        }
        request_id
    }

    /// Like [`request`](RequestDispatcher::request), but fail with
    /// [`EnvError::Timeout`] if no response arrives within `timeout`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request_with_timeout<F>(&self, payload: Value, timeout: Duration, callback: F) -> RequestId
    where
        F: FnOnce(Result<Value, EnvError>) + Send + 'static,
    {
        let request_id = self.request(payload, callback);
        if self.is_pending(request_id) {
            let weak = Arc::downgrade(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    let dispatcher = RequestDispatcher { inner };
                    if let Some(pending) = dispatcher.take(request_id) {
                        tracing::warn!("request {} timed out after {:?}", request_id, timeout);
                        pending.fire(Err(EnvError::Timeout {
                            request_id,
                            after: timeout,
                        }));
                    }
                }
            });
        }
        request_id
    }

    /// Route one inbound envelope.
    ///
    /// Responses resolve their pending request; responses nobody is waiting
    /// for are dropped; envelopes without an id go to the router.
    pub fn handle_inbound(&self, envelope: Envelope) {
        match envelope.request_id {
            Some(request_id) => match self.take(request_id) {
                Some(pending) => {
                    tracing::trace!(
                        "request {} answered in {:?}",
                        request_id,
                        pending.issued_at.elapsed()
                    );
                    pending.fire(Ok(envelope.payload));
                }
                None => {
                    tracing::warn!("dropping response for unknown request {}", request_id);
                }
            },
            None => {
                self.inner.router.dispatch(envelope.payload);
            }
        }
    }

    /// Resolve one pending request with [`EnvError::Cancelled`].
    ///
    /// Returns false if the request had already completed.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        match self.take(request_id) {
            Some(pending) => {
                pending.fire(Err(EnvError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Resolve every pending request with `error`. Returns how many there were.
    pub fn cancel_all(&self, error: EnvError) -> usize {
        let drained = self.inner.table.lock().drain();
        fire_all(drained, &error)
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.table.lock().pending.len()
    }

    /// Ids awaiting a response, ascending.
    pub fn pending_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<_> = self.inner.table.lock().pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Whether `request_id` is still awaiting a response.
    pub fn is_pending(&self, request_id: RequestId) -> bool {
        self.inner.table.lock().pending.contains_key(&request_id)
    }

    /// The connection requests are sent over.
    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// The router push messages are forwarded to.
    pub fn router(&self) -> &NotificationRouter {
        &self.inner.router
    }

    fn take(&self, request_id: RequestId) -> Option<PendingRequest> {
        self.inner.table.lock().pending.remove(&request_id)
    }
}
