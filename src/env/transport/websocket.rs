//! WebSocket transport over `tokio-tungstenite`.

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::{Connector, TransportChannel, TransportEvent};
use crate::env::error::TransportError;

/// Connector for `ws://` and `wss://` URLs
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WebSocketConnector {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<TransportChannel, TransportError>> {
        let url = url.to_string();
        async move {
            let (ws, _) = connect_async(url.as_str())
                .await
                .map_err(|err| TransportError::ConnectFailed {
                    url: url.clone(),
                    reason: err.to_string(),
                })?;
            tracing::debug!("websocket connected to {}", url);

            let (mut ws_tx, mut ws_rx) = ws.split();
            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportEvent>();

            let writer_events = inbound_tx.clone();
            tokio::spawn(async move {
                while let Some(text) = outbound_rx.recv().await {
                    if let Err(err) = ws_tx.send(Message::Text(text.into())).await {
                        let _ = writer_events.send(TransportEvent::Closed(Some(format!(
                            "write failed: {err}"
                        ))));
                        return;
                    }
                }
                // Outbound side dropped: the client closed the connection.
                let _ = ws_tx.close().await;
            });

            tokio::spawn(async move {
                let reason = loop {
                    match ws_rx.next().await {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx
                                .send(TransportEvent::Message(text.as_str().to_string()))
                                .is_err()
                            {
                                return;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map(|frame| frame.reason.as_str().to_string());
                        }
                        // Pings are answered by tungstenite; binary frames are not part of
                        // either dialect.
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => break Some(format!("read failed: {err}")),
                        None => break None,
                    }
                };
                let _ = inbound_tx.send(TransportEvent::Closed(reason));
            });

            Ok(TransportChannel {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        }
        .boxed()
    }
}
