//! Event Dispatch
//!
//! Single responsibility: Route each inbound envelope to exactly one handler.
//!
//! # Handler Order
//!
//! | Priority | Handler                 | Handles                              |
//! |----------|-------------------------|--------------------------------------|
//! | 1        | [`AckResponseHandler`]  | `EventAckResponse`                   |
//! | 2        | [`GreetHandler`]        | `CalculationMemberGreetEvent`        |
//! | 3        | [`KeepAliveHandler`]    | `CalculationMemberKeepAliveEvent`    |
//! | 4..n     | user handlers           | whatever they claim, in order added  |
//! | last     | [`FallbackHandler`]     | everything, logs and drops           |
//!
//! The first handler whose `supports` returns true wins. A handler may return
//! a response envelope, which the dispatcher sends back on the stream.
//! Failures are logged against the envelope and go no further.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::envelope::{event_types, AckResponse, Envelope, EnvelopeCodec, GreetEvent};
use super::handshake::HandshakeRegistry;
use super::monitor::ConnectionMonitor;
use crate::error::Result;

/// Handles one or more inbound event types.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, event_type: &str) -> bool;

    /// Process the envelope, optionally producing a reply.
    async fn handle(&self, envelope: &Envelope) -> Result<Option<Envelope>>;
}

/// Where dispatcher replies go.
#[async_trait]
pub trait EnvelopeSender: Send + Sync {
    async fn send_envelope(&self, envelope: Envelope) -> Result<()>;
}

/// What happened to one dispatched envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled { handler: String, responded: bool },
    HandlerFailed { handler: String, error: String },
    ResponseFailed { handler: String, error: String },
    /// No handler at all; only possible on a dispatcher without a fallback.
    Unhandled,
}

/// Correlates acks with the monitor's sent cache.
pub struct AckResponseHandler {
    monitor: Arc<ConnectionMonitor>,
}

impl AckResponseHandler {
    pub fn new(monitor: Arc<ConnectionMonitor>) -> Self {
        Self { monitor }
    }
}

#[async_trait]
impl EventHandler for AckResponseHandler {
    fn name(&self) -> &str {
        "ack-response"
    }

    fn supports(&self, event_type: &str) -> bool {
        event_type == event_types::ACK_RESPONSE
    }

    async fn handle(&self, envelope: &Envelope) -> Result<Option<Envelope>> {
        let ack: AckResponse = envelope.decode_payload()?;
        self.monitor.on_ack(&ack);
        Ok(None)
    }
}

/// Resolves the pending handshake a greet answers.
pub struct GreetHandler {
    handshakes: Arc<HandshakeRegistry>,
}

impl GreetHandler {
    pub fn new(handshakes: Arc<HandshakeRegistry>) -> Self {
        Self { handshakes }
    }
}

#[async_trait]
impl EventHandler for GreetHandler {
    fn name(&self) -> &str {
        "greet"
    }

    fn supports(&self, event_type: &str) -> bool {
        event_type == event_types::GREET
    }

    async fn handle(&self, envelope: &Envelope) -> Result<Option<Envelope>> {
        let greet: GreetEvent = envelope.decode_payload()?;
        debug!(join_id = %greet.join_id(), member_id = ?greet.member_id, "Greet received");
        self.handshakes.complete(greet).await;
        Ok(None)
    }
}

/// Records the keep-alive and acks it.
pub struct KeepAliveHandler {
    monitor: Arc<ConnectionMonitor>,
    codec: EnvelopeCodec,
}

impl KeepAliveHandler {
    pub fn new(monitor: Arc<ConnectionMonitor>, codec: EnvelopeCodec) -> Self {
        Self { monitor, codec }
    }
}

#[async_trait]
impl EventHandler for KeepAliveHandler {
    fn name(&self) -> &str {
        "keep-alive"
    }

    fn supports(&self, event_type: &str) -> bool {
        event_type == event_types::KEEP_ALIVE
    }

    async fn handle(&self, envelope: &Envelope) -> Result<Option<Envelope>> {
        self.monitor.record_keep_alive();
        let ack = self.codec.ack(&envelope.id, true, None)?;
        Ok(Some(ack))
    }
}

/// Catch-all for types nobody claimed.
pub struct FallbackHandler;

#[async_trait]
impl EventHandler for FallbackHandler {
    fn name(&self) -> &str {
        "fallback"
    }

    fn supports(&self, _event_type: &str) -> bool {
        true
    }

    async fn handle(&self, envelope: &Envelope) -> Result<Option<Envelope>> {
        warn!(
            id = %envelope.id,
            event_type = %envelope.event_type,
            "No handler for event type, dropping"
        );
        Ok(None)
    }
}

/// Ordered handler chain.
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    /// The standard chain: built-in handlers, then `user_handlers`, then fallback.
    pub fn new(
        monitor: Arc<ConnectionMonitor>,
        handshakes: Arc<HandshakeRegistry>,
        codec: EnvelopeCodec,
        user_handlers: Vec<Arc<dyn EventHandler>>,
    ) -> Self {
        let mut handlers: Vec<Arc<dyn EventHandler>> = vec![
            Arc::new(AckResponseHandler::new(Arc::clone(&monitor))),
            Arc::new(GreetHandler::new(handshakes)),
            Arc::new(KeepAliveHandler::new(monitor, codec)),
        ];
        handlers.extend(user_handlers);
        Self::from_handlers(handlers)
    }

    /// An arbitrary chain; the fallback is always appended last.
    pub fn from_handlers(mut handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        handlers.push(Arc::new(FallbackHandler));
        Self { handlers }
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn handler_for(&self, event_type: &str) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.iter().find(|h| h.supports(event_type))
    }

    /// Handle one envelope and send any reply through `sender`.
    pub async fn dispatch(&self, envelope: &Envelope, sender: &dyn EnvelopeSender) -> DispatchOutcome {
        let Some(handler) = self.handler_for(&envelope.event_type) else {
            return DispatchOutcome::Unhandled;
        };
        let handler_name = handler.name().to_string();

        let response = match handler.handle(envelope).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    id = %envelope.id,
                    event_type = %envelope.event_type,
                    handler = %handler_name,
                    error = %e,
                    "Event handler failed"
                );
                return DispatchOutcome::HandlerFailed {
                    handler: handler_name,
                    error: e.to_string(),
                };
            }
        };

        let Some(response) = response else {
            return DispatchOutcome::Handled {
                handler: handler_name,
                responded: false,
            };
        };

        let response_id = response.id.clone();
        match sender.send_envelope(response).await {
            Ok(()) => {
                debug!(
                    id = %envelope.id,
                    response_id = %response_id,
                    handler = %handler_name,
                    "Response sent"
                );
                DispatchOutcome::Handled {
                    handler: handler_name,
                    responded: true,
                }
            }
            Err(e) => {
                warn!(
                    id = %envelope.id,
                    response_id = %response_id,
                    handler = %handler_name,
                    error = %e,
                    "Failed to send handler response"
                );
                DispatchOutcome::ResponseFailed {
                    handler: handler_name,
                    error: e.to_string(),
                }
            }
        }
    }
}
