//! Monitoring Events - health and state broadcasts for operators
//!
//! Listeners register for one [`MonitoringEventType`] each. Publishing an
//! event invokes every listener registered for its type; a type with no
//! listeners is simply dropped. Every event is also pushed, timestamped, to a
//! broadcast channel so a log shipper or dashboard can follow the whole feed.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use super::state::{ConnectionState, ObserverState};

/// Discriminator used to key listener registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringEventType {
    ObserverStateChanged,
    ConnectionStateChanged,
    KeepAliveStale,
    PendingEventsBacklog,
    ReconnectCeilingReached,
}

/// Something an operator may want to alert on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitoringEvent {
    ObserverStateChanged {
        from: ObserverState,
        to: ObserverState,
    },
    ConnectionStateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// No keep-alive within the threshold. `since_last_ms` is `None` if none
    /// was ever received.
    KeepAliveStale {
        since_last_ms: Option<u64>,
        threshold_ms: u64,
        observer: ObserverState,
        connection: ConnectionState,
    },
    PendingEventsBacklog {
        pending: usize,
        max_size: usize,
        event_ids: Vec<String>,
    },
    ReconnectCeilingReached {
        attempts: u32,
    },
}

impl MonitoringEvent {
    pub fn event_type(&self) -> MonitoringEventType {
        match self {
            MonitoringEvent::ObserverStateChanged { .. } => MonitoringEventType::ObserverStateChanged,
            MonitoringEvent::ConnectionStateChanged { .. } => MonitoringEventType::ConnectionStateChanged,
            MonitoringEvent::KeepAliveStale { .. } => MonitoringEventType::KeepAliveStale,
            MonitoringEvent::PendingEventsBacklog { .. } => MonitoringEventType::PendingEventsBacklog,
            MonitoringEvent::ReconnectCeilingReached { .. } => MonitoringEventType::ReconnectCeilingReached,
        }
    }
}

/// A published event with its wall-clock timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringRecord {
    pub timestamp: String,
    #[serde(flatten)]
    pub event: MonitoringEvent,
}

impl MonitoringRecord {
    fn now(event: MonitoringEvent) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            event,
        }
    }
}

/// Receives monitoring events of the type it was registered for.
pub trait MonitoringListener: Send + Sync {
    fn on_event(&self, event: &MonitoringEvent);
}

impl<F> MonitoringListener for F
where
    F: Fn(&MonitoringEvent) + Send + Sync,
{
    fn on_event(&self, event: &MonitoringEvent) {
        self(event)
    }
}

/// Type-keyed listener registry plus a broadcast feed.
pub struct MonitorEventBus {
    listeners: DashMap<MonitoringEventType, Vec<Arc<dyn MonitoringListener>>>,
    tx: broadcast::Sender<MonitoringRecord>,
}

impl MonitorEventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            listeners: DashMap::new(),
            tx,
        }
    }

    /// Register `listener` for one event type.
    pub fn subscribe(&self, event_type: MonitoringEventType, listener: Arc<dyn MonitoringListener>) {
        self.listeners.entry(event_type).or_default().push(listener);
    }

    /// Follow every published event.
    pub fn subscribe_all(&self) -> broadcast::Receiver<MonitoringRecord> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self, event_type: MonitoringEventType) -> usize {
        self.listeners.get(&event_type).map(|l| l.len()).unwrap_or(0)
    }

    /// Deliver `event` to its type's listeners and the broadcast feed.
    pub fn publish(&self, event: MonitoringEvent) {
        let event_type = event.event_type();

        // Clone the list so no map guard is held while listeners run
        let listeners = self.listeners.get(&event_type).map(|l| l.clone());
        match listeners {
            Some(listeners) => {
                for listener in &listeners {
                    listener.on_event(&event);
                }
            }
            None => trace!(event_type = ?event_type, "No listeners for monitoring event"),
        }

        let _ = self.tx.send(MonitoringRecord::now(event));
    }
}

impl Default for MonitorEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_listener(counter: &Arc<AtomicUsize>) -> Arc<dyn MonitoringListener> {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &MonitoringEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_listeners_only_see_their_type() {
        let bus = MonitorEventBus::new();
        let ceiling = Arc::new(AtomicUsize::new(0));
        let stale = Arc::new(AtomicUsize::new(0));

        bus.subscribe(MonitoringEventType::ReconnectCeilingReached, counting_listener(&ceiling));
        bus.subscribe(MonitoringEventType::KeepAliveStale, counting_listener(&stale));

        bus.publish(MonitoringEvent::ReconnectCeilingReached { attempts: 11 });

        assert_eq!(ceiling.load(Ordering::SeqCst), 1);
        assert_eq!(stale.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_event_without_listeners_is_dropped() {
        let bus = MonitorEventBus::new();
        assert_eq!(bus.listener_count(MonitoringEventType::PendingEventsBacklog), 0);

        bus.publish(MonitoringEvent::PendingEventsBacklog {
            pending: 60,
            max_size: 100,
            event_ids: vec![],
        });
    }

    #[test]
    fn test_every_listener_of_a_type_runs() {
        let bus = MonitorEventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            bus.subscribe(MonitoringEventType::ObserverStateChanged, counting_listener(&counter));
        }

        bus.publish(MonitoringEvent::ObserverStateChanged {
            from: ObserverState::Disconnected,
            to: ObserverState::Connecting,
        });

        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_broadcast_feed_receives_records() {
        let bus = MonitorEventBus::new();
        let mut feed = bus.subscribe_all();

        bus.publish(MonitoringEvent::ReconnectCeilingReached { attempts: 4 });

        let record = feed.recv().await.unwrap();
        assert_eq!(record.event, MonitoringEvent::ReconnectCeilingReached { attempts: 4 });

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "reconnect_ceiling_reached");
        assert_eq!(json["attempts"], 4);
        assert!(json["timestamp"].is_string());
    }
}
