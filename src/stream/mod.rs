//! Calculation Member Event Stream
//!
//! A client that keeps one persistent, bidirectional event stream open to the
//! calculation-dispatch platform.
//!
//! # Architecture
//!
//! | Module       | Responsibility                                        |
//! |--------------|-------------------------------------------------------|
//! | `envelope`   | Envelope building, msgpack wire format                |
//! | `transport`  | Opening a stream (WebSocket in production)            |
//! | `reconnect`  | Backoff, sequential retry scheduling, failure ceiling |
//! | `handshake`  | Join/greet correlation                                |
//! | `dispatch`   | Routing inbound envelopes to typed handlers           |
//! | `sent_cache` | Sent-but-unacknowledged envelopes                     |
//! | `events`     | Monitoring events and listener registry               |
//! | `monitor`    | States, keep-alive and backlog health                 |
//! | `manager`    | The stream's whole lifecycle                          |
//!
//! # Usage
//!
//! ```ignore
//! use calculation_member::stream::{ConnectionManager, ManagerConfig, WebSocketConnector};
//!
//! let connector = Arc::new(WebSocketConnector::new("ws://localhost:9090/events", timeout));
//! let manager = ConnectionManager::builder(connector, ManagerConfig::default())
//!     .with_handler(Arc::new(MyCalculationHandler))
//!     .build();
//!
//! manager.start();
//! // ...
//! manager.shutdown().await;
//! ```
//!
//! Only `Ready` streams accept [`ConnectionManager::send_event`]. Watch
//! [`ConnectionMonitor::watch_observer`] to know when that is.

mod dispatch;
mod envelope;
mod events;
mod handshake;
mod manager;
mod monitor;
mod reconnect;
mod sent_cache;
mod state;
mod transport;

pub use dispatch::{
    AckResponseHandler, DispatchOutcome, EnvelopeSender, EventDispatcher, EventHandler, FallbackHandler,
    GreetHandler, KeepAliveHandler,
};
pub use envelope::{
    decode_envelope, encode_envelope, event_types, new_event_id, AckResponse, Envelope, EnvelopeCodec, GreetEvent,
    JoinEvent, KeepAliveEvent,
};
pub use events::{MonitorEventBus, MonitoringEvent, MonitoringEventType, MonitoringListener, MonitoringRecord};
pub use handshake::HandshakeRegistry;
pub use manager::{ConnectAttempt, ConnectionManager, ConnectionManagerBuilder, ManagerConfig};
pub use monitor::{
    AckOutcome, BacklogLevel, ConnectionMonitor, ConnectionSnapshot, KeepAliveHealth, MonitorConfig, SweepReport,
};
pub use reconnect::{
    BackoffConfig, ExponentialBackoff, ReconnectDecision, ReconnectionStrategy, RetryAction, SequentialScheduler,
};
pub use sent_cache::{SentCacheStats, SentEventCache};
pub use state::{ConnectionState, ObserverState};
pub use transport::{Connector, EventStream, InboundStream, OutboundSink, WebSocketConnector};
