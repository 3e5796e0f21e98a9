//! Sent Events Cache - bounded record of envelopes awaiting acknowledgment
//!
//! Entries are keyed by envelope id and leave the cache when:
//!
//! - a correlated ack or nack arrives ([`SentEventCache::remove`])
//! - they outlive the TTL (checked on access and by [`SentEventCache::cleanup_expired`])
//! - the cache is full and they are the oldest entry
//!
//! The cache exists for observability. Nothing is ever resent from it.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::envelope::Envelope;

struct SentEntry {
    envelope: Envelope,
    sent_at: Instant,
}

/// Counters reported by [`SentEventCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SentCacheStats {
    pub pending: usize,
    pub max_size: usize,
    pub evicted: u64,
    pub expired: u64,
}

/// Bounded, expiring map of sent envelopes.
pub struct SentEventCache {
    entries: DashMap<String, SentEntry>,
    max_size: usize,
    ttl: Duration,
    evicted: AtomicU64,
    expired: AtomicU64,
}

impl SentEventCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_size: max_size.max(1),
            ttl,
            evicted: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Record a sent envelope, evicting the oldest entry if full.
    pub fn insert(&self, envelope: Envelope) {
        if !self.entries.contains_key(&envelope.id) && self.entries.len() >= self.max_size {
            self.cleanup_expired();
            while self.entries.len() >= self.max_size {
                if !self.evict_oldest() {
                    break;
                }
            }
        }

        self.entries.insert(
            envelope.id.clone(),
            SentEntry {
                envelope,
                sent_at: Instant::now(),
            },
        );
    }

    /// Remove an entry by id. Expired entries count as absent.
    pub fn remove(&self, id: &str) -> Option<Envelope> {
        let (_, entry) = self.entries.remove(id)?;
        if entry.sent_at.elapsed() >= self.ttl {
            self.expired.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(entry.envelope)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .map(|e| e.sent_at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    /// Estimated number of entries; may include not-yet-purged expired ones.
    pub fn estimated_size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids still waiting for an ack, oldest first.
    pub fn pending_ids(&self) -> Vec<String> {
        let mut entries: Vec<(String, Instant)> = self
            .entries
            .iter()
            .filter(|e| e.sent_at.elapsed() < self.ttl)
            .map(|e| (e.key().clone(), e.sent_at))
            .collect();

        entries.sort_by_key(|(_, sent_at)| *sent_at);
        entries.into_iter().map(|(id, _)| id).collect()
    }

    /// Purge expired entries, returning how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.sent_at.elapsed() >= self.ttl)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for id in &expired {
            if self.entries.remove(id).is_some() {
                removed += 1;
            }
        }

        if removed > 0 {
            self.expired.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(expired = removed, "Expired unacknowledged events");
        }

        removed
    }

    pub fn stats(&self) -> SentCacheStats {
        SentCacheStats {
            pending: self.entries.len(),
            max_size: self.max_size,
            evicted: self.evicted.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }

    fn evict_oldest(&self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.sent_at)
            .map(|e| e.key().clone());

        match oldest {
            Some(id) => {
                if self.entries.remove(&id).is_some() {
                    self.evicted.fetch_add(1, Ordering::Relaxed);
                    debug!(id = %id, "Evicted oldest unacknowledged event");
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(id: &str) -> Envelope {
        Envelope {
            id: id.to_string(),
            event_type: "EntityProcessorCalculationResponse".to_string(),
            source: "urn:test".to_string(),
            payload: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_and_remove() {
        let cache = SentEventCache::new(10, Duration::from_secs(300));
        cache.insert(envelope("e1"));

        assert!(cache.contains("e1"));
        assert_eq!(cache.remove("e1").map(|e| e.id), Some("e1".to_string()));
        assert!(cache.is_empty());
        assert!(cache.remove("e1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cache_evicts_oldest() {
        let cache = SentEventCache::new(3, Duration::from_secs(300));
        for id in ["a", "b", "c"] {
            cache.insert(envelope(id));
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        cache.insert(envelope("d"));

        assert_eq!(cache.estimated_size(), 3);
        assert!(!cache.contains("a"));
        assert_eq!(cache.pending_ids(), vec!["b", "c", "d"]);
        assert_eq!(cache.stats().evicted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = SentEventCache::new(10, Duration::from_secs(60));
        cache.insert(envelope("old"));
        tokio::time::advance(Duration::from_secs(61)).await;
        cache.insert(envelope("new"));

        assert!(!cache.contains("old"));
        assert_eq!(cache.pending_ids(), vec!["new"]);
        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.estimated_size(), 1);
        assert_eq!(cache.stats().expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_not_returned() {
        let cache = SentEventCache::new(10, Duration::from_secs(1));
        cache.insert(envelope("late"));
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(cache.remove("late").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinserting_same_id_does_not_evict() {
        let cache = SentEventCache::new(2, Duration::from_secs(300));
        cache.insert(envelope("a"));
        cache.insert(envelope("b"));
        cache.insert(envelope("b"));

        assert_eq!(cache.estimated_size(), 2);
        assert_eq!(cache.stats().evicted, 0);
    }
}
