//! In-process transport
//!
//! [`MemoryConnector::pair`] returns a connector and the [`MemoryBackend`]
//! that plays the server: it sees every frame the client writes and can
//! push replies, notifications, garbage, or a close.

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Connector, TransportChannel, TransportEvent};
use crate::env::error::TransportError;

enum Mode {
    Ready(TransportChannel),
    Consumed,
    Refuse(String),
}

/// Connector that hands out one pre-built in-memory channel
pub struct MemoryConnector {
    mode: Mutex<Mode>,
}

impl MemoryConnector {
    /// A connector and the backend end of its single channel.
    pub fn pair() -> (Self, MemoryBackend) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connector = Self {
            mode: Mutex::new(Mode::Ready(TransportChannel {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })),
        };
        let backend = MemoryBackend {
            sent: outbound_rx,
            events: inbound_tx,
        };
        (connector, backend)
    }

    /// A connector whose every open fails with `reason`.
    pub fn refusing(reason: impl Into<String>) -> Self {
        Self {
            mode: Mutex::new(Mode::Refuse(reason.into())),
        }
    }
}

impl Connector for MemoryConnector {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<TransportChannel, TransportError>> {
        let url = url.to_string();
        let mut mode = self.mode.lock();
        let result = match std::mem::replace(&mut *mode, Mode::Consumed) {
            Mode::Ready(channel) => Ok(channel),
            Mode::Consumed => Err(TransportError::ConnectFailed {
                url,
                reason: "memory channel already used".to_string(),
            }),
            Mode::Refuse(reason) => {
                *mode = Mode::Refuse(reason.clone());
                Err(TransportError::ConnectFailed { url, reason })
            }
        };
        async move { result }.boxed()
    }
}

/// Server end of an in-memory channel
pub struct MemoryBackend {
    sent: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryBackend {
    /// Wait for the next frame written by the client.
    ///
    /// Returns `None` once the client side has gone away.
    pub async fn recv(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    /// Wait for the next frame written by the client, parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<Value> {
        let text = self.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// The next already-written frame, if any, parsed as JSON.
    pub fn try_recv_json(&mut self) -> Option<Value> {
        let text = self.sent.try_recv().ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Deliver a JSON frame to the client. Returns false if the client is gone.
    pub fn push(&self, value: Value) -> bool {
        self.push_text(value.to_string())
    }

    /// Deliver a raw text frame to the client.
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.events.send(TransportEvent::Message(text.into())).is_ok()
    }

    /// Close the channel from the server side.
    pub fn close(&self, reason: Option<&str>) -> bool {
        self.events
            .send(TransportEvent::Closed(reason.map(str::to_string)))
            .is_ok()
    }
}
