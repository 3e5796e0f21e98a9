//! Connection Manager
//!
//! Owns the one event stream and walks it through
//! connect → join → handshake → ready. All writes go through a single-writer
//! section, so the wire order is the order in which sends were submitted.
//!
//! # Lifecycle
//!
//! ```text
//! initiate_connection()
//!   ├─ attempt already in flight ─► no-op
//!   ├─ open fails ───────────────► request reconnection
//!   └─ open succeeds
//!        ├─ install as active stream, spawn reader
//!        ├─ send join, wait for greet (handshake timeout)
//!        │    ├─ greet ──────────► Ready, reset reconnect counter
//!        │    └─ timeout ────────► fail the stream
//!        └─ reader sees error/close ─► request reconnection (active stream only)
//! ```
//!
//! Exactly one reconnection request is made per failed stream: the open
//! failure path makes it directly, every other failure goes through the
//! reader's termination path.

use async_trait::async_trait;
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock, Semaphore};
use tracing::{debug, info, warn};

use super::dispatch::{EnvelopeSender, EventDispatcher, EventHandler};
use super::envelope::{Envelope, EnvelopeCodec};
use super::events::{MonitoringEvent, MonitoringEventType, MonitoringListener};
use super::handshake::HandshakeRegistry;
use super::monitor::{ConnectionMonitor, MonitorConfig};
use super::reconnect::{BackoffConfig, ExponentialBackoff, ReconnectDecision, ReconnectionStrategy, RetryAction};
use super::state::{ConnectionState, ObserverState};
use super::transport::{Connector, InboundStream, OutboundSink};
use crate::error::{ClientError, Result};

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// URI stamped on every outbound envelope
    pub source: String,
    /// Capability tags sent with the join
    pub tags: Vec<String>,
    /// How long to wait for the greet (default: 5s)
    pub handshake_timeout: Duration,
    /// Inbound envelopes handled at once (default: 64)
    pub max_concurrent_dispatch: usize,
    pub backoff: BackoffConfig,
    pub monitor: MonitorConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            source: format!("urn:calculation-member:{}", uuid::Uuid::new_v4()),
            tags: Vec::new(),
            handshake_timeout: Duration::from_millis(5000),
            max_concurrent_dispatch: 64,
            backoff: BackoffConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

/// Result of one `connect` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAttempt {
    /// Handshake completed; the stream accepts sends.
    Ready,
    /// Another attempt was already running; nothing was done.
    InProgress,
    /// The attempt failed; a reconnection has been requested.
    Failed,
    /// The manager has been shut down.
    Shutdown,
}

enum StreamAbort {
    Fail(String),
    Close,
}

enum Termination {
    Failed(String),
    Closed,
    Shutdown,
}

/// What happened between opening a stream and the end of its handshake.
enum Established {
    Ready,
    OpenFailed,
    HandshakeFailed(Arc<ActiveStream>, String),
    /// The stream ended during the handshake; its reader already handled it.
    Abandoned,
    Shutdown,
}

struct ActiveStream {
    id: u64,
    sink: Mutex<OutboundSink>,
    abort: StdMutex<Option<oneshot::Sender<StreamAbort>>>,
}

impl ActiveStream {
    /// Tell the reader to stop. Returns false if it already stopped.
    fn abort(&self, reason: StreamAbort) -> bool {
        let tx = match self.abort.lock() {
            Ok(mut abort) => abort.take(),
            Err(_) => None,
        };
        match tx {
            Some(tx) => tx.send(reason).is_ok(),
            None => false,
        }
    }

    async fn close(&self) {
        if let Err(e) = self.sink.lock().await.close().await {
            debug!(stream_id = self.id, error = %e, "Error closing outbound sink");
        }
    }
}

/// Clears the attempt flag however the attempt ends.
struct AttemptGuard<'a>(&'a AtomicBool);

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Inner {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    codec: EnvelopeCodec,
    dispatcher: EventDispatcher,
    monitor: Arc<ConnectionMonitor>,
    strategy: Arc<dyn ReconnectionStrategy>,
    handshakes: Arc<HandshakeRegistry>,
    active: RwLock<Option<Arc<ActiveStream>>>,
    connecting: AtomicBool,
    shutdown: AtomicBool,
    next_stream_id: AtomicU64,
    dispatch_permits: Arc<Semaphore>,
}

impl Inner {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    async fn initiate_connection(self: &Arc<Self>) -> ConnectAttempt {
        if self.is_shutdown() {
            return ConnectAttempt::Shutdown;
        }

        if self
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Connection attempt already in flight, skipping");
            return ConnectAttempt::InProgress;
        }

        let guard = AttemptGuard(&self.connecting);
        let established = self.establish().await;
        // Release before any follow-up so a retry can never find the flag set
        drop(guard);

        match established {
            Established::Ready => ConnectAttempt::Ready,
            Established::OpenFailed => {
                self.request_reconnection();
                ConnectAttempt::Failed
            }
            Established::HandshakeFailed(active, reason) => {
                if !active.abort(StreamAbort::Fail(reason)) {
                    // Reader already ended and requested the reconnection
                    self.monitor.set_observer_state(ObserverState::Error);
                }
                ConnectAttempt::Failed
            }
            Established::Abandoned => ConnectAttempt::Failed,
            Established::Shutdown => ConnectAttempt::Shutdown,
        }
    }

    async fn establish(self: &Arc<Self>) -> Established {
        self.monitor.set_observer_state(ObserverState::Connecting);
        self.monitor.set_connection_state(ConnectionState::Connecting);
        info!(endpoint = %self.connector.endpoint(), "Opening event stream");

        let stream = match self.connector.open().await {
            Ok(stream) => stream,
            Err(e) => {
                if self.is_shutdown() {
                    return Established::Shutdown;
                }
                warn!(endpoint = %self.connector.endpoint(), error = %e, "Failed to open event stream");
                self.monitor.set_observer_state(ObserverState::Error);
                self.monitor.set_connection_state(ConnectionState::TransientFailure);
                return Established::OpenFailed;
            }
        };

        let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (abort_tx, abort_rx) = oneshot::channel();
        let active = Arc::new(ActiveStream {
            id: stream_id,
            sink: Mutex::new(stream.outbound),
            abort: StdMutex::new(Some(abort_tx)),
        });

        let previous = self.active.write().await.replace(Arc::clone(&active));
        if let Some(previous) = previous {
            debug!(previous = previous.id, stream_id = stream_id, "Replacing previous event stream");
            previous.close().await;
        }

        if self.is_shutdown() {
            self.active.write().await.take();
            active.close().await;
            return Established::Shutdown;
        }

        tokio::spawn(read_stream(Arc::downgrade(self), stream_id, stream.inbound, abort_rx));
        self.monitor.set_connection_state(ConnectionState::Ready);

        self.handshake(active).await
    }

    async fn handshake(&self, active: Arc<ActiveStream>) -> Established {
        let join = match self.codec.join(&self.config.tags) {
            Ok(join) => join,
            Err(e) => return Established::HandshakeFailed(active, e.to_string()),
        };
        let join_id = join.id.clone();
        let greet = self.handshakes.register(&join_id).await;

        self.monitor.set_observer_state(ObserverState::Joining);
        if let Err(e) = self.write(&active, join).await {
            self.handshakes.cancel(&join_id).await;
            return Established::HandshakeFailed(active, format!("Failed to send join: {}", e));
        }
        self.monitor.set_observer_state(ObserverState::AwaitsGreet);
        debug!(join_id = %join_id, tags = ?self.config.tags, "Join sent, awaiting greet");

        match tokio::time::timeout(self.config.handshake_timeout, greet).await {
            Ok(Ok(greet)) => {
                self.monitor.set_observer_state(ObserverState::Ready);
                self.strategy.reset();
                info!(
                    stream_id = active.id,
                    join_id = %join_id,
                    member_id = ?greet.member_id,
                    "Handshake complete, event stream ready"
                );
                Established::Ready
            }
            Ok(Err(_)) => {
                debug!(join_id = %join_id, "Stream ended during handshake");
                Established::Abandoned
            }
            Err(_) => {
                self.handshakes.cancel(&join_id).await;
                let timeout_ms = self.config.handshake_timeout.as_millis() as u64;
                warn!(join_id = %join_id, timeout_ms = timeout_ms, "Handshake timed out");
                Established::HandshakeFailed(active, format!("No greet within {}ms", timeout_ms))
            }
        }
    }

    /// Single-writer send on `active`. A transport failure fails the stream.
    async fn write(&self, active: &ActiveStream, envelope: Envelope) -> Result<()> {
        let mut sink = active.sink.lock().await;
        match sink.send(envelope).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_stream_fatal() {
                    active.abort(StreamAbort::Fail(e.to_string()));
                }
                Err(e)
            }
        }
    }

    async fn current_stream(&self) -> Result<Arc<ActiveStream>> {
        self.active.read().await.clone().ok_or(ClientError::NotConnected)
    }

    /// Send with tracking; `check_ready` is off for internal sends.
    async fn send_tracked(&self, envelope: Envelope, check_ready: bool) -> Result<()> {
        if self.is_shutdown() {
            return Err(ClientError::Shutdown);
        }
        if check_ready {
            let state = self.monitor.observer_state();
            if !state.is_ready() {
                return Err(ClientError::NotReady(state));
            }
        }

        let active = self.current_stream().await?;
        let id = envelope.id.clone();
        // Track first so a fast ack always finds its entry
        let tracked = self.monitor.track_sent(&envelope);

        let result = self.write(&active, envelope).await;
        if result.is_err() && tracked {
            self.monitor.sent_events().remove(&id);
        }
        result
    }

    async fn spawn_dispatch(self: &Arc<Self>, envelope: Envelope) {
        let permit = match Arc::clone(&self.dispatch_permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            inner.dispatcher.dispatch(&envelope, &*inner).await;
        });
    }

    async fn on_stream_terminated(self: &Arc<Self>, stream_id: u64, termination: Termination) {
        {
            let mut active = self.active.write().await;
            match active.as_ref() {
                Some(current) if current.id == stream_id => {
                    active.take();
                }
                _ => {
                    debug!(stream_id = stream_id, "Inactive stream terminated, ignoring");
                    return;
                }
            }
        }

        let abandoned = self.handshakes.fail_all().await;
        if abandoned > 0 {
            debug!(abandoned = abandoned, "Pending handshakes abandoned");
        }

        if self.is_shutdown() {
            return;
        }

        match termination {
            Termination::Failed(reason) => {
                warn!(stream_id = stream_id, reason = %reason, "Event stream failed");
                self.monitor.set_observer_state(ObserverState::Error);
                self.monitor.set_connection_state(ConnectionState::TransientFailure);
            }
            Termination::Closed => {
                info!(stream_id = stream_id, "Event stream closed by platform");
                self.monitor.set_observer_state(ObserverState::Disconnected);
                self.monitor.set_connection_state(ConnectionState::Idle);
            }
            Termination::Shutdown => return,
        }

        self.request_reconnection();
    }

    fn request_reconnection(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let retry: RetryAction = Box::new(move || {
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.initiate_connection().await;
                }
            }
            .boxed()
        });

        match self.strategy.request_reconnection(retry) {
            ReconnectDecision::Scheduled(delay) => {
                debug!(delay_ms = delay.as_millis() as u64, "Reconnection requested");
            }
            ReconnectDecision::GaveUp { attempts } => {
                self.monitor
                    .publish(MonitoringEvent::ReconnectCeilingReached { attempts });
            }
            ReconnectDecision::Stopped => {
                debug!("Reconnection strategy stopped, not retrying");
            }
        }
    }

    async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down connection manager");

        self.strategy.shutdown();
        self.monitor.stop();

        let active = self.active.write().await.take();
        if let Some(active) = active {
            active.close().await;
            active.abort(StreamAbort::Close);
        }

        self.handshakes.fail_all().await;
        self.monitor.set_connection_state(ConnectionState::Shutdown);
    }
}

#[async_trait]
impl EnvelopeSender for Inner {
    async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        self.send_tracked(envelope, false).await
    }
}

async fn read_stream(
    inner: Weak<Inner>,
    stream_id: u64,
    mut inbound: InboundStream,
    mut abort: oneshot::Receiver<StreamAbort>,
) {
    debug!(stream_id = stream_id, "Stream reader started");

    let termination = loop {
        tokio::select! {
            reason = &mut abort => {
                break match reason {
                    Ok(StreamAbort::Fail(reason)) => Termination::Failed(reason),
                    Ok(StreamAbort::Close) => Termination::Shutdown,
                    // Stream was replaced and dropped
                    Err(_) => Termination::Closed,
                };
            }
            item = inbound.next() => match item {
                Some(Ok(envelope)) => {
                    let Some(inner) = inner.upgrade() else { return };
                    inner.spawn_dispatch(envelope).await;
                }
                Some(Err(e)) if !e.is_stream_fatal() => {
                    warn!(stream_id = stream_id, error = %e, "Dropping undecodable frame");
                }
                Some(Err(e)) => break Termination::Failed(e.to_string()),
                None => break Termination::Closed,
            }
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.on_stream_terminated(stream_id, termination).await;
    }
    debug!(stream_id = stream_id, "Stream reader stopped");
}

/// Maintains the persistent event stream.
///
/// Cheap to clone; clones share the same stream.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn builder(connector: Arc<dyn Connector>, config: ManagerConfig) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            connector,
            config,
            strategy: None,
            handlers: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Start the health sweep and the first connection attempt in the background.
    pub fn start(&self) {
        self.inner.monitor.start_sweep();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.initiate_connection().await;
        });
    }

    /// Run one connection attempt to completion.
    pub async fn connect(&self) -> ConnectAttempt {
        self.inner.initiate_connection().await
    }

    /// Send an application envelope. Requires a ready stream.
    pub async fn send_event(&self, envelope: Envelope) -> Result<()> {
        self.inner.send_tracked(envelope, true).await
    }

    /// Stop reconnecting, stop the sweep and close the stream. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    pub fn codec(&self) -> &EnvelopeCodec {
        &self.inner.codec
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.inner.monitor
    }

    pub fn observer_state(&self) -> ObserverState {
        self.inner.monitor.observer_state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.monitor.connection_state()
    }

    pub fn failed_attempts(&self) -> u32 {
        self.inner.strategy.failed_attempts()
    }
}

pub struct ConnectionManagerBuilder {
    connector: Arc<dyn Connector>,
    config: ManagerConfig,
    strategy: Option<Arc<dyn ReconnectionStrategy>>,
    handlers: Vec<Arc<dyn EventHandler>>,
    listeners: Vec<(MonitoringEventType, Arc<dyn MonitoringListener>)>,
}

impl ConnectionManagerBuilder {
    /// Replace the default exponential backoff.
    pub fn with_strategy(mut self, strategy: Arc<dyn ReconnectionStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Add a handler after the built-in ones.
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_listener(mut self, event_type: MonitoringEventType, listener: Arc<dyn MonitoringListener>) -> Self {
        self.listeners.push((event_type, listener));
        self
    }

    /// Build the manager. Must be called inside a tokio runtime.
    pub fn build(self) -> ConnectionManager {
        let config = self.config;

        let monitor = Arc::new(ConnectionMonitor::new(config.monitor.clone()));
        for (event_type, listener) in self.listeners {
            monitor.subscribe(event_type, listener);
        }

        let handshakes = Arc::new(HandshakeRegistry::new());
        let codec = EnvelopeCodec::new(config.source.clone());
        let dispatcher = EventDispatcher::new(
            Arc::clone(&monitor),
            Arc::clone(&handshakes),
            codec.clone(),
            self.handlers,
        );

        let strategy = self
            .strategy
            .unwrap_or_else(|| Arc::new(ExponentialBackoff::new(config.backoff.clone())));
        let permits = config.max_concurrent_dispatch.max(1);

        info!(
            endpoint = %self.connector.endpoint(),
            source = %config.source,
            handlers = ?dispatcher.handler_names(),
            "Connection manager created"
        );

        ConnectionManager {
            inner: Arc::new(Inner {
                config,
                connector: self.connector,
                codec,
                dispatcher,
                monitor,
                strategy,
                handshakes,
                active: RwLock::new(None),
                connecting: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                next_stream_id: AtomicU64::new(0),
                dispatch_permits: Arc::new(Semaphore::new(permits)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::transport::EventStream;
    use futures::channel::mpsc;

    /// Connector whose streams can be driven from the test.
    struct LoopbackConnector {
        peers: StdMutex<Vec<mpsc::UnboundedSender<Result<Envelope>>>>,
        outbound: StdMutex<Vec<mpsc::UnboundedReceiver<Envelope>>>,
    }

    impl LoopbackConnector {
        fn new() -> Self {
            Self {
                peers: StdMutex::new(Vec::new()),
                outbound: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Connector for LoopbackConnector {
        async fn open(&self) -> Result<EventStream> {
            let (out_tx, out_rx) = mpsc::unbounded::<Envelope>();
            let (in_tx, in_rx) = mpsc::unbounded::<Result<Envelope>>();
            self.peers.lock().unwrap().push(in_tx);
            self.outbound.lock().unwrap().push(out_rx);

            let sink = out_tx.sink_map_err(|e| ClientError::Transport(e.to_string()));
            Ok(EventStream::new(Box::pin(sink), Box::pin(in_rx)))
        }

        fn endpoint(&self) -> &str {
            "loopback"
        }
    }

    fn config() -> ManagerConfig {
        ManagerConfig {
            source: "urn:calculation-member:test".into(),
            tags: vec!["pricing".into()],
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_ready() {
        let manager = ConnectionManager::builder(Arc::new(LoopbackConnector::new()), config()).build();
        let envelope = manager.codec().keep_alive().unwrap();

        let err = manager.send_event(envelope).await.unwrap_err();
        assert!(matches!(err, ClientError::NotReady(ObserverState::Disconnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_after_shutdown_is_rejected() {
        let manager = ConnectionManager::builder(Arc::new(LoopbackConnector::new()), config()).build();
        manager.shutdown().await;
        manager.shutdown().await;

        let envelope = manager.codec().keep_alive().unwrap();
        assert!(matches!(manager.send_event(envelope).await, Err(ClientError::Shutdown)));
        assert_eq!(manager.connection_state(), ConnectionState::Shutdown);
        assert_eq!(manager.connect().await, ConnectAttempt::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_is_sent_untracked_with_tags() {
        let connector = Arc::new(LoopbackConnector::new());
        let manager = ConnectionManager::builder(connector.clone(), config()).build();

        let attempt = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut outbound = connector.outbound.lock().unwrap().remove(0);
        let join = outbound.next().await.unwrap();
        let payload: crate::stream::envelope::JoinEvent = join.decode_payload().unwrap();
        assert_eq!(payload.tags, vec!["pricing".to_string()]);
        assert_eq!(manager.observer_state(), ObserverState::AwaitsGreet);
        assert!(manager.monitor().sent_events().is_empty());

        let greet = manager.codec().greet(&join.id, None).unwrap();
        connector.peers.lock().unwrap()[0].unbounded_send(Ok(greet)).unwrap();

        assert_eq!(attempt.await.unwrap(), ConnectAttempt::Ready);
        assert_eq!(manager.observer_state(), ObserverState::Ready);
        assert_eq!(manager.connection_state(), ConnectionState::Ready);
    }
}
