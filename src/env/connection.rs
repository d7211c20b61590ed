//! Connection lifecycle
//!
//! A [`ConnectionManager`] owns exactly one transport channel for its whole
//! life: Disconnected → Connecting → Connected → Closed. A closed manager is
//! never reopened; reconnecting means building a new one.

use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::envelope::{Envelope, EnvelopeCodec};
use super::error::{EnvError, TransportError};
use super::transport::{Connector, TransportChannel, TransportEvent};

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `connect` has not been called
    Disconnected,
    /// The channel is being opened
    Connecting,
    /// Frames can be sent
    Connected,
    /// Terminal state
    Closed,
}

/// Lifecycle notification delivered to state subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The channel opened
    Connected,
    /// The channel closed, failed to open, or was closed by the client
    Closed {
        /// Human-readable cause
        reason: String,
    },
}

type MessageHandler = Arc<dyn Fn(Envelope) + Send + Sync>;
type StateHandler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Owns the transport channel and its lifecycle
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    codec: EnvelopeCodec,
    state_tx: watch::Sender<ConnectionState>,
    shared: Mutex<Shared>,
}

struct Shared {
    state: ConnectionState,
    url: Option<String>,
    close_reason: Option<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    message_handlers: Vec<MessageHandler>,
    state_handlers: Vec<StateHandler>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Create a disconnected manager.
    pub fn new(connector: Arc<dyn Connector>, codec: EnvelopeCodec) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                codec,
                state_tx,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    url: None,
                    close_reason: None,
                    outbound: None,
                    message_handlers: Vec::new(),
                    state_handlers: Vec::new(),
                    task: None,
                }),
            }),
        }
    }

    /// Start opening a channel to `url`.
    ///
    /// Returns immediately; the outcome is reported through [`on_state`]
    /// subscribers and [`wait_for_settled`]. Must be called from within a
    /// tokio runtime.
    ///
    /// [`on_state`]: ConnectionManager::on_state
    /// [`wait_for_settled`]: ConnectionManager::wait_for_settled
    pub fn connect(&self, url: &str) -> Result<(), EnvError> {
        {
            let mut shared = self.inner.shared.lock();
            if shared.state != ConnectionState::Disconnected {
                return Err(EnvError::InvalidState(format!(
                    "cannot connect from {:?}",
                    shared.state
                )));
            }
            shared.state = ConnectionState::Connecting;
            shared.url = Some(url.to_string());
            self.inner.state_tx.send_replace(ConnectionState::Connecting);
        }
        tracing::info!("connecting to {}", url);

        let open = self.inner.connector.open(url);
        let task = tokio::spawn(run_connection(Arc::downgrade(&self.inner), open));

        let mut shared = self.inner.shared.lock();
        if shared.state == ConnectionState::Closed {
            task.abort();
        } else {
            shared.task = Some(task);
        }
        Ok(())
    }

    /// Serialize and transmit an envelope.
    ///
    /// Fails with [`EnvError::NotConnected`] unless the state is Connected.
    pub fn send(&self, envelope: &Envelope) -> Result<(), EnvError> {
        let shared = self.inner.shared.lock();
        let outbound = match (&shared.state, &shared.outbound) {
            (ConnectionState::Connected, Some(outbound)) => outbound,
            _ => return Err(EnvError::NotConnected),
        };
        let text = self.inner.codec.encode(envelope);
        tracing::trace!("send {}", text);
        outbound
            .send(text)
            .map_err(|_| EnvError::Transport(TransportError::Closed))
    }

    /// Register a handler for every decoded inbound envelope.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.inner
            .shared
            .lock()
            .message_handlers
            .push(Arc::new(handler));
    }

    /// Register a handler for lifecycle events.
    pub fn on_state<F>(&self, handler: F)
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner
            .shared
            .lock()
            .state_handlers
            .push(Arc::new(handler));
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if let Some(task) = self.inner.transition_closed("closed by client".to_string()) {
            task.abort();
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    /// Whether frames can be sent.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<String> {
        self.inner.shared.lock().close_reason.clone()
    }

    /// URL passed to [`connect`](ConnectionManager::connect).
    pub fn url(&self) -> Option<String> {
        self.inner.shared.lock().url.clone()
    }

    /// Codec used for this connection's frames.
    pub fn codec(&self) -> EnvelopeCodec {
        self.inner.codec
    }

    /// Wait until the connection is either Connected or Closed.
    ///
    /// Waits forever if `connect` is never called.
    pub async fn wait_for_settled(&self) -> ConnectionState {
        let mut rx = self.inner.state_tx.subscribe();
        let settled = rx
            .wait_for(|state| {
                matches!(state, ConnectionState::Connected | ConnectionState::Closed)
            })
            .await
            .map(|state| *state);
        settled.unwrap_or(ConnectionState::Closed)
    }

    /// Watch lifecycle state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.shared.get_mut().task.take() {
            task.abort();
        }
    }
}

impl Inner {
    fn mark_connected(&self, outbound: mpsc::UnboundedSender<String>) -> bool {
        let handlers = {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Connecting {
                return false;
            }
            shared.state = ConnectionState::Connected;
            shared.outbound = Some(outbound);
            self.state_tx.send_replace(ConnectionState::Connected);
            shared.state_handlers.clone()
        };
        tracing::info!("connection established");
        for handler in handlers {
            handler(&ConnectionEvent::Connected);
        }
        true
    }

    /// Move to Closed, clearing every handler. Returns the reader task handle
    /// the first time, `None` on repeat calls.
    fn transition_closed(&self, reason: String) -> Option<JoinHandle<()>> {
        let (handlers, task) = {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Closed {
                return None;
            }
            shared.state = ConnectionState::Closed;
            shared.close_reason = Some(reason.clone());
            shared.outbound = None;
            shared.message_handlers.clear();
            self.state_tx.send_replace(ConnectionState::Closed);
            (
                std::mem::take(&mut shared.state_handlers),
                shared.task.take(),
            )
        };
        tracing::info!("connection closed: {}", reason);
        let event = ConnectionEvent::Closed { reason };
        for handler in handlers {
            handler(&event);
        }
        task
    }

    fn deliver(&self, text: &str) {
        let envelope = match self.codec.decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!("dropping inbound frame: {}", err);
                return;
            }
        };
        let handlers = {
            let shared = self.shared.lock();
            if shared.state != ConnectionState::Connected {
                return;
            }
            shared.message_handlers.clone()
        };
        for handler in handlers {
            handler(envelope.clone());
        }
    }
}

async fn run_connection(
    inner: Weak<Inner>,
    open: BoxFuture<'static, Result<TransportChannel, TransportError>>,
) {
    let opened = open.await;
    let Some(strong) = inner.upgrade() else {
        return;
    };
    let TransportChannel {
        outbound,
        mut inbound,
    } = match opened {
        Ok(channel) => channel,
        Err(err) => {
            tracing::warn!("{}", err);
            strong.transition_closed(err.to_string());
            return;
        }
    };
    if !strong.mark_connected(outbound) {
        return;
    }
    drop(strong);

    loop {
        let event = inbound.recv().await;
        let Some(strong) = inner.upgrade() else {
            return;
        };
        match event {
            Some(TransportEvent::Message(text)) => strong.deliver(&text),
            Some(TransportEvent::Closed(reason)) => {
                strong.transition_closed(reason.unwrap_or_else(|| "closed by peer".to_string()));
                return;
            }
            None => {
                strong.transition_closed("transport dropped".to_string());
                return;
            }
        }
    }
}
