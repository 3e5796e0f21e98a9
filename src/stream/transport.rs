//! Event Stream Transport
//!
//! Single responsibility: Open a bidirectional stream of envelopes.
//! No knowledge of the handshake, acknowledgments or reconnection.
//!
//! The connection manager only sees [`EventStream`]: a sink it writes
//! envelopes into and a stream it reads envelopes from. [`Connector`] is the
//! seam that produces one; [`WebSocketConnector`] is the production
//! implementation, tests plug in an in-memory one.

use async_trait::async_trait;
use futures_util::{future, stream, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{http::Request, protocol::Message},
};
use tracing::debug;

use super::envelope::{decode_envelope, encode_envelope, Envelope};
use crate::error::{ClientError, Result};

/// Outbound half of a stream.
pub type OutboundSink = Pin<Box<dyn Sink<Envelope, Error = ClientError> + Send>>;

/// Inbound half of a stream.
///
/// `Err` items with [`ClientError::is_stream_fatal`] false are bad frames;
/// the stream stays usable. `None` means the peer closed the stream.
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<Envelope>> + Send>>;

/// A freshly opened stream.
pub struct EventStream {
    pub outbound: OutboundSink,
    pub inbound: InboundStream,
}

impl EventStream {
    pub fn new(outbound: OutboundSink, inbound: InboundStream) -> Self {
        Self { outbound, inbound }
    }
}

/// Opens event streams to the platform.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new stream. Returns only once the transport is connected.
    async fn open(&self) -> Result<EventStream>;

    /// Where this connector points, for logs.
    fn endpoint(&self) -> &str;
}

/// Connects to the platform's WebSocket event endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> Result<EventStream> {
        debug!(url = %self.url, "Connecting to event endpoint");

        let request = Request::builder()
            .uri(&self.url)
            .header("Host", extract_host(&self.url))
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .body(())
            .map_err(|e| ClientError::Connection(format!("Failed to build request: {}", e)))?;

        let (ws, _) = tokio::time::timeout(
            self.connect_timeout,
            connect_async_with_config(request, None, false),
        )
        .await
        .map_err(|_| ClientError::Timeout(format!("Connecting to {}", self.url)))?
        .map_err(|e| ClientError::Connection(format!("WebSocket connect failed: {}", e)))?;

        let (sink, ws_stream) = ws.split();

        let outbound = sink
            .sink_map_err(ClientError::from)
            .with(|envelope: Envelope| future::ready(encode_envelope(&envelope).map(Message::Binary)));

        let inbound = stream::unfold(ws_stream, |mut ws_stream| async move {
            loop {
                match ws_stream.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        return Some((decode_envelope(&data), ws_stream));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(frame = ?frame, "Event endpoint closed the stream");
                        return None;
                    }
                    // Pong is handled automatically by tungstenite
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(other)) => {
                        let err = ClientError::Codec(format!(
                            "Unexpected non-binary frame ({} bytes)",
                            other.len()
                        ));
                        return Some((Err(err), ws_stream));
                    }
                    Some(Err(e)) => return Some((Err(ClientError::from(e)), ws_stream)),
                    None => return None,
                }
            }
        });

        debug!(url = %self.url, "Event endpoint connected");
        Ok(EventStream::new(Box::pin(outbound), Box::pin(inbound)))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

/// Extract host from URL for Host header
fn extract_host(url: &str) -> &str {
    url.split("//")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or("localhost")
}
