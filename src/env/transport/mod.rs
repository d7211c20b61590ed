//! Transport boundary
//!
//! The client only needs an ordered, message-preserving, bidirectional text
//! channel. A [`Connector`] opens one and hands back a [`TransportChannel`]:
//! an outbound queue drained by the transport, and an inbound queue of
//! [`TransportEvent`]s fed by it.

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use super::error::TransportError;

pub mod memory;
pub mod websocket;

pub use memory::{MemoryBackend, MemoryConnector};
pub use websocket::WebSocketConnector;

/// Something arriving from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete text frame
    Message(String),
    /// The peer or the transport closed the channel
    Closed(Option<String>),
}

/// An open channel
#[derive(Debug)]
pub struct TransportChannel {
    /// Frames queued here are written in order
    pub outbound: mpsc::UnboundedSender<String>,
    /// Frames and the final close event, in arrival order
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transport channels
pub trait Connector: Send + Sync + 'static {
    /// Open a channel to `url`.
    fn open(&self, url: &str) -> BoxFuture<'static, Result<TransportChannel, TransportError>>;
}
