//! Connection Monitor
//!
//! Single responsibility: Observe stream health and report it. The monitor
//! never changes connection behavior; it only records and broadcasts.
//!
//! # What It Tracks
//!
//! | Signal              | Source                          | Reported as                  |
//! |---------------------|---------------------------------|------------------------------|
//! | Unacked sends       | every tracked send / ack        | backlog warning, event       |
//! | Last keep-alive     | keep-alive handler              | stale keep-alive warning     |
//! | Observer state      | connection manager              | state-change event           |
//! | Connection state    | connection manager              | state-change event           |
//!
//! The periodic sweep runs on its own task with a fixed delay between runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::envelope::{event_types, AckResponse, Envelope};
use super::events::{MonitorEventBus, MonitoringEvent, MonitoringEventType, MonitoringListener, MonitoringRecord};
use super::sent_cache::SentEventCache;
use super::state::{ConnectionState, ObserverState};

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Maximum tracked unacked events (default: 100)
    pub sent_cache_max_size: usize,
    /// How long an unacked event stays tracked (default: 5 minutes)
    pub sent_cache_ttl: Duration,
    /// Delay before the first sweep (default: 1s)
    pub initial_delay: Duration,
    /// Delay between sweeps (default: 3s)
    pub interval: Duration,
    /// Keep-alive silence that triggers a warning (default: 60s)
    pub keep_alive_warning_threshold: Duration,
    /// Backlog fraction of max size that logs a warning (default: 0.10)
    pub backlog_warn_ratio: f64,
    /// Backlog fraction of max size that publishes an event (default: 0.50)
    pub backlog_alert_ratio: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sent_cache_max_size: 100,
            sent_cache_ttl: Duration::from_secs(300),
            initial_delay: Duration::from_secs(1),
            interval: Duration::from_secs(3),
            keep_alive_warning_threshold: Duration::from_secs(60),
            backlog_warn_ratio: 0.10,
            backlog_alert_ratio: 0.50,
        }
    }
}

/// Result of correlating an ack with the sent cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged,
    Rejected,
    /// Never tracked, already acked, or expired.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveHealth {
    Healthy { since_last: Duration },
    Stale { since_last: Duration },
    NeverReceived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogLevel {
    Normal,
    Warning,
    Critical,
}

/// What one sweep found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub pending: usize,
    pub keep_alive: KeepAliveHealth,
    pub backlog: BacklogLevel,
}

/// Point-in-time view of the connection's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub observer: ObserverState,
    pub connection: ConnectionState,
    pub pending_events: usize,
    pub evicted_events: u64,
    pub expired_events: u64,
    pub acknowledged: u64,
    pub rejected: u64,
    pub unknown_acks: u64,
    pub since_last_keep_alive: Option<Duration>,
}

/// Tracks sends, acks, keep-alives and states; runs the health sweep.
pub struct ConnectionMonitor {
    config: MonitorConfig,
    sent: SentEventCache,
    bus: MonitorEventBus,
    observer: watch::Sender<ObserverState>,
    connection: watch::Sender<ConnectionState>,
    last_keep_alive: watch::Sender<Option<Instant>>,
    acknowledged: AtomicU64,
    rejected: AtomicU64,
    unknown_acks: AtomicU64,
    sweep: Mutex<Option<AbortHandle>>,
}

impl ConnectionMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let sent = SentEventCache::new(config.sent_cache_max_size, config.sent_cache_ttl);
        let (observer, _) = watch::channel(ObserverState::default());
        let (connection, _) = watch::channel(ConnectionState::default());
        let (last_keep_alive, _) = watch::channel(None);

        Self {
            config,
            sent,
            bus: MonitorEventBus::new(),
            observer,
            connection,
            last_keep_alive,
            acknowledged: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            unknown_acks: AtomicU64::new(0),
            sweep: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn sent_events(&self) -> &SentEventCache {
        &self.sent
    }

    // ========================================================================
    // Sent events and acks
    // ========================================================================

    /// Handshake and ack envelopes are never tracked.
    pub fn is_tracked(event_type: &str) -> bool {
        event_type != event_types::JOIN && event_type != event_types::ACK_RESPONSE
    }

    /// Record a send. Returns whether the envelope is now tracked.
    pub fn track_sent(&self, envelope: &Envelope) -> bool {
        if !Self::is_tracked(&envelope.event_type) {
            return false;
        }
        self.sent.insert(envelope.clone());
        debug!(id = %envelope.id, event_type = %envelope.event_type, "Tracking sent event");
        true
    }

    /// Correlate an ack with the event it references.
    pub fn on_ack(&self, ack: &AckResponse) -> AckOutcome {
        match self.sent.remove(&ack.source_event_id) {
            Some(envelope) if ack.success => {
                self.acknowledged.fetch_add(1, Ordering::Relaxed);
                debug!(
                    source_event_id = %ack.source_event_id,
                    event_type = %envelope.event_type,
                    "Event acknowledged"
                );
                AckOutcome::Acknowledged
            }
            Some(envelope) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    source_event_id = %ack.source_event_id,
                    event_type = %envelope.event_type,
                    message = ?ack.message,
                    "Event rejected by platform"
                );
                AckOutcome::Rejected
            }
            None => {
                self.unknown_acks.fetch_add(1, Ordering::Relaxed);
                debug!(
                    source_event_id = %ack.source_event_id,
                    success = ack.success,
                    "Ack for unknown event (expired or never tracked)"
                );
                AckOutcome::Unknown
            }
        }
    }

    // ========================================================================
    // Keep-alive
    // ========================================================================

    pub fn record_keep_alive(&self) {
        self.last_keep_alive.send_replace(Some(Instant::now()));
        debug!("Keep-alive received");
    }

    pub fn since_last_keep_alive(&self) -> Option<Duration> {
        self.last_keep_alive.borrow().map(|at| at.elapsed())
    }

    // ========================================================================
    // States
    // ========================================================================

    pub fn observer_state(&self) -> ObserverState {
        *self.observer.borrow()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// Watch observer transitions, e.g. to wait for `Ready`.
    pub fn watch_observer(&self) -> watch::Receiver<ObserverState> {
        self.observer.subscribe()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub fn set_observer_state(&self, to: ObserverState) {
        let from = self.observer.send_replace(to);
        if from != to {
            info!(from = %from, to = %to, "Observer state changed");
            self.bus.publish(MonitoringEvent::ObserverStateChanged { from, to });
        }
    }

    pub fn set_connection_state(&self, to: ConnectionState) {
        let from = self.connection.send_replace(to);
        if from != to {
            debug!(from = %from, to = %to, "Connection state changed");
            self.bus.publish(MonitoringEvent::ConnectionStateChanged { from, to });
        }
    }

    // ========================================================================
    // Broadcast
    // ========================================================================

    pub fn subscribe(&self, event_type: MonitoringEventType, listener: Arc<dyn MonitoringListener>) {
        self.bus.subscribe(event_type, listener);
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<MonitoringRecord> {
        self.bus.subscribe_all()
    }

    pub fn publish(&self, event: MonitoringEvent) {
        self.bus.publish(event);
    }

    // ========================================================================
    // Sweep
    // ========================================================================

    /// Run one health check.
    pub fn sweep_once(&self) -> SweepReport {
        let expired = self.sent.cleanup_expired();
        let keep_alive = self.check_keep_alive();
        let (pending, backlog) = self.check_backlog();

        SweepReport {
            expired,
            pending,
            keep_alive,
            backlog,
        }
    }

    fn check_keep_alive(&self) -> KeepAliveHealth {
        let threshold = self.config.keep_alive_warning_threshold;
        let observer = self.observer_state();
        let connection = self.connection_state();

        let Some(since_last) = self.since_last_keep_alive() else {
            warn!(
                observer = %observer,
                connection = %connection,
                "No keep-alive received yet"
            );
            self.bus.publish(MonitoringEvent::KeepAliveStale {
                since_last_ms: None,
                threshold_ms: threshold.as_millis() as u64,
                observer,
                connection,
            });
            return KeepAliveHealth::NeverReceived;
        };

        if since_last > threshold {
            warn!(
                since_last_ms = since_last.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                observer = %observer,
                connection = %connection,
                "Keep-alive overdue"
            );
            self.bus.publish(MonitoringEvent::KeepAliveStale {
                since_last_ms: Some(since_last.as_millis() as u64),
                threshold_ms: threshold.as_millis() as u64,
                observer,
                connection,
            });
            return KeepAliveHealth::Stale { since_last };
        }

        KeepAliveHealth::Healthy { since_last }
    }

    fn check_backlog(&self) -> (usize, BacklogLevel) {
        let max_size = self.sent.max_size();
        let pending = self.sent.estimated_size();
        let warn_at = (max_size as f64 * self.config.backlog_warn_ratio) as usize;
        let alert_at = (max_size as f64 * self.config.backlog_alert_ratio) as usize;

        if pending > alert_at {
            let event_ids = self.sent.pending_ids();
            warn!(
                pending = pending,
                max_size = max_size,
                "Unacknowledged events piling up"
            );
            self.bus.publish(MonitoringEvent::PendingEventsBacklog {
                pending,
                max_size,
                event_ids,
            });
            return (pending, BacklogLevel::Critical);
        }

        if pending > warn_at {
            warn!(pending = pending, max_size = max_size, "Unacknowledged events growing");
            return (pending, BacklogLevel::Warning);
        }

        (pending, BacklogLevel::Normal)
    }

    /// Start the periodic sweep. A second call replaces the running sweep.
    pub fn start_sweep(self: &Arc<Self>) {
        let monitor: Weak<Self> = Arc::downgrade(self);
        let initial_delay = self.config.initial_delay;
        let interval = self.config.interval;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            loop {
                match monitor.upgrade() {
                    Some(monitor) => {
                        let report = monitor.sweep_once();
                        debug!(
                            pending = report.pending,
                            expired = report.expired,
                            "Connection monitor sweep completed"
                        );
                    }
                    None => break,
                }
                tokio::time::sleep(interval).await;
            }
        });

        info!(
            initial_delay_ms = initial_delay.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "Connection monitor sweep started"
        );

        if let Ok(mut sweep) = self.sweep.lock() {
            if let Some(previous) = sweep.replace(handle.abort_handle()) {
                previous.abort();
            }
        }
    }

    /// Stop the periodic sweep.
    pub fn stop(&self) {
        if let Ok(mut sweep) = self.sweep.lock() {
            if let Some(handle) = sweep.take() {
                handle.abort();
                debug!("Connection monitor sweep stopped");
            }
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let stats = self.sent.stats();
        ConnectionSnapshot {
            observer: self.observer_state(),
            connection: self.connection_state(),
            pending_events: stats.pending,
            evicted_events: stats.evicted,
            expired_events: stats.expired,
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            unknown_acks: self.unknown_acks.load(Ordering::Relaxed),
            since_last_keep_alive: self.since_last_keep_alive(),
        }
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn envelope(id: &str, event_type: &str) -> Envelope {
        Envelope {
            id: id.to_string(),
            event_type: event_type.to_string(),
            source: "urn:test".to_string(),
            payload: Vec::new(),
        }
    }

    fn ack(source_event_id: &str, success: bool) -> AckResponse {
        AckResponse {
            id: format!("ack-{}", source_event_id),
            source_event_id: source_event_id.to_string(),
            success,
            message: None,
        }
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Arc<dyn MonitoringListener> {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &MonitoringEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_acks_empty_the_cache() {
        let monitor = ConnectionMonitor::new(MonitorConfig::default());
        for i in 1..=5 {
            assert!(monitor.track_sent(&envelope(&format!("E{}", i), "EntityProcessorCalculationResponse")));
        }
        assert_eq!(monitor.sent_events().estimated_size(), 5);

        for i in 1..=5 {
            assert_eq!(monitor.on_ack(&ack(&format!("E{}", i), true)), AckOutcome::Acknowledged);
        }

        assert!(monitor.sent_events().is_empty());
        assert_eq!(monitor.snapshot().acknowledged, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_is_correlated_and_removed() {
        let monitor = ConnectionMonitor::new(MonitorConfig::default());
        monitor.track_sent(&envelope("E1", "EntityCriteriaCalculationResponse"));

        assert_eq!(monitor.on_ack(&ack("E1", false)), AckOutcome::Rejected);
        assert!(monitor.sent_events().is_empty());
        assert_eq!(monitor.snapshot().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_ack_leaves_cache_untouched() {
        let monitor = ConnectionMonitor::new(MonitorConfig::default());
        monitor.track_sent(&envelope("E1", "EntityProcessorCalculationResponse"));

        assert_eq!(monitor.on_ack(&ack("never-sent", true)), AckOutcome::Unknown);
        assert_eq!(monitor.sent_events().pending_ids(), vec!["E1"]);
        assert_eq!(monitor.snapshot().unknown_acks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_and_ack_types_are_exempt() {
        let monitor = ConnectionMonitor::new(MonitorConfig::default());
        assert!(!monitor.track_sent(&envelope("j", event_types::JOIN)));
        assert!(!monitor.track_sent(&envelope("a", event_types::ACK_RESPONSE)));
        assert!(monitor.sent_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_warns_when_no_keep_alive_ever() {
        let monitor = ConnectionMonitor::new(MonitorConfig::default());
        let stale = Arc::new(AtomicUsize::new(0));
        monitor.subscribe(MonitoringEventType::KeepAliveStale, counting(&stale));

        let report = monitor.sweep_once();

        assert_eq!(report.keep_alive, KeepAliveHealth::NeverReceived);
        assert_eq!(stale.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_detects_stale_keep_alive() {
        let monitor = ConnectionMonitor::new(MonitorConfig::default());
        monitor.record_keep_alive();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(monitor.sweep_once().keep_alive, KeepAliveHealth::Healthy { .. }));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(monitor.sweep_once().keep_alive, KeepAliveHealth::Stale { .. }));

        monitor.record_keep_alive();
        assert!(matches!(monitor.sweep_once().keep_alive, KeepAliveHealth::Healthy { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_escalation() {
        let monitor = ConnectionMonitor::new(MonitorConfig::default());
        let backlog = Arc::new(AtomicUsize::new(0));
        monitor.subscribe(MonitoringEventType::PendingEventsBacklog, counting(&backlog));

        for i in 0..5 {
            monitor.track_sent(&envelope(&format!("E{}", i), "Calc"));
        }
        assert_eq!(monitor.sweep_once().backlog, BacklogLevel::Normal);

        for i in 5..20 {
            monitor.track_sent(&envelope(&format!("E{}", i), "Calc"));
        }
        assert_eq!(monitor.sweep_once().backlog, BacklogLevel::Warning);
        assert_eq!(backlog.load(Ordering::SeqCst), 0);

        for i in 20..60 {
            monitor.track_sent(&envelope(&format!("E{}", i), "Calc"));
        }
        let report = monitor.sweep_once();
        assert_eq!(report.backlog, BacklogLevel::Critical);
        assert_eq!(report.pending, 60);
        assert_eq!(backlog.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_event_lists_pending_ids() {
        let monitor = ConnectionMonitor::new(MonitorConfig {
            sent_cache_max_size: 4,
            ..Default::default()
        });
        let mut feed = monitor.subscribe_all();

        for id in ["a", "b", "c"] {
            monitor.track_sent(&envelope(id, "Calc"));
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        monitor.sweep_once();

        let mut backlog = None;
        while let Ok(record) = feed.try_recv() {
            if let MonitoringEvent::PendingEventsBacklog { event_ids, .. } = record.event {
                backlog = Some(event_ids);
            }
        }
        assert_eq!(backlog, Some(vec!["a".to_string(), "b".to_string(), "c".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_changes_are_broadcast_once() {
        let monitor = ConnectionMonitor::new(MonitorConfig::default());
        let changes = Arc::new(AtomicUsize::new(0));
        monitor.subscribe(MonitoringEventType::ObserverStateChanged, counting(&changes));

        monitor.set_observer_state(ObserverState::Connecting);
        monitor.set_observer_state(ObserverState::Connecting);
        monitor.set_observer_state(ObserverState::Joining);

        assert_eq!(changes.load(Ordering::SeqCst), 2);
        assert_eq!(monitor.observer_state(), ObserverState::Joining);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep_runs_until_stopped() {
        let monitor = Arc::new(ConnectionMonitor::new(MonitorConfig::default()));
        let stale = Arc::new(AtomicUsize::new(0));
        monitor.subscribe(MonitoringEventType::KeepAliveStale, counting(&stale));

        monitor.start_sweep();
        // Sweeps at 1s, 4s, 7s
        tokio::time::sleep(Duration::from_millis(7_500)).await;
        assert_eq!(stale.load(Ordering::SeqCst), 3);

        monitor.stop();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(stale.load(Ordering::SeqCst), 3);
    }
}
