//! Transport capability behind the connection
//!
//! A [`Transport`] opens one duplex link and hands back a pair of channels:
//! an outgoing sender for serialized frames and an incoming receiver of
//! [`LinkEvent`]s. Dropping the outgoing sender closes the link.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::{Error, Result};

/// Something that happened on an open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One inbound text frame
    Frame(String),
    /// The peer closed the link (optional close reason)
    Closed(Option<String>),
    /// The link broke
    Failed(String),
}

/// Channels of one open link
#[derive(Debug)]
pub struct TransportLink {
    /// Serialized frames to write; drop to close
    pub outgoing: mpsc::UnboundedSender<String>,
    /// Inbound frames and terminal events
    pub incoming: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens duplex links to the remote service
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link to `url`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the handshake fails
    async fn open(&self, url: &Url) -> Result<TransportLink>;
}

/// WebSocket transport over `tokio-tungstenite`
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Create a WebSocket transport
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &Url) -> Result<TransportLink> {
        let (stream, response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Error::Transport(format!("connect to {url} failed: {e}")))?;

        tracing::debug!(url = %url, status = %response.status(), "websocket handshake complete");

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();

        // Writer: ends (and closes the socket) once every sender is dropped
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::warn!(error = %e, "websocket write failed");
                    return;
                }
            }
            let _ = sink.close().await;
            tracing::trace!("websocket writer finished");
        });

        // Reader: ends on close, error, or when nobody listens anymore
        tokio::spawn(async move {
            let terminal = loop {
                let event = match source.next().await {
                    Some(Ok(Message::Text(text))) => LinkEvent::Frame(text.to_string()),
                    Some(Ok(Message::Binary(bytes))) => {
                        LinkEvent::Frame(String::from_utf8_lossy(&bytes).into_owned())
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break LinkEvent::Closed(frame.map(|f| f.reason.to_string()));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break LinkEvent::Failed(e.to_string()),
                    None => break LinkEvent::Closed(None),
                };
                if in_tx.send(event).is_err() {
                    return;
                }
            };
            let _ = in_tx.send(terminal);
        });

        Ok(TransportLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
