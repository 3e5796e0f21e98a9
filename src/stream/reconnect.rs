//! Reconnection Strategy
//!
//! Single responsibility: Decide when, and whether, to retry a connection.
//!
//! # Policy
//!
//! Every failed attempt bumps a counter and schedules the retry after
//!
//! ```text
//! delay = min(initial_delay * 2^attempt, max_delay)     attempt = 0, 1, 2, ...
//! ```
//!
//! on a [`SequentialScheduler`], which runs one retry at a time. Once the
//! counter reaches the configured ceiling nothing more is scheduled: the
//! failure is logged at error level and an operator has to intervene.
//!
//! A fully successful handshake calls [`ReconnectionStrategy::reset`], so the
//! next failure starts from `initial_delay` again.

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Work to run when a retry comes due.
pub type RetryAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Outcome of a reconnection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// The retry will run after this delay.
    Scheduled(Duration),
    /// The failure ceiling was reached; nothing was scheduled.
    GaveUp { attempts: u32 },
    /// The strategy has been shut down.
    Stopped,
}

/// Decides when a failed connection is retried.
pub trait ReconnectionStrategy: Send + Sync {
    /// Register one more failed attempt and schedule `retry` if allowed.
    fn request_reconnection(&self, retry: RetryAction) -> ReconnectDecision;

    /// Zero the failed-attempt counter after a successful connect.
    fn reset(&self);

    /// Cancel pending retries and refuse new ones.
    fn shutdown(&self);

    /// Failed attempts since the last reset.
    fn failed_attempts(&self) -> u32;
}

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry (default: 200 ms)
    pub initial_delay: Duration,
    /// Upper bound for any single delay (default: 10 s)
    pub max_delay: Duration,
    /// Failed attempts after which retrying stops (default: 10)
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(10_000),
            max_attempts: 10,
        }
    }
}

impl BackoffConfig {
    /// Delay for a zero-based attempt index.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay.as_millis().min(u64::MAX as u128) as u64;
        let max = self.max_delay.as_millis().min(u64::MAX as u128) as u64;

        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(initial.saturating_mul(factor).min(max))
    }
}

struct ScheduledRetry {
    due: Instant,
    action: RetryAction,
}

/// A single worker task that runs scheduled actions strictly one after another.
///
/// An action queued while another is running waits for it to finish, so two
/// retries can never overlap.
pub struct SequentialScheduler {
    name: &'static str,
    tx: mpsc::UnboundedSender<ScheduledRetry>,
    worker: AbortHandle,
}

impl SequentialScheduler {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn spawn(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ScheduledRetry>();

        let handle = tokio::spawn(async move {
            debug!(scheduler = name, "Scheduler started");
            while let Some(retry) = rx.recv().await {
                tokio::time::sleep_until(retry.due).await;
                (retry.action)().await;
            }
            debug!(scheduler = name, "Scheduler stopped");
        });

        Self {
            name,
            tx,
            worker: handle.abort_handle(),
        }
    }

    /// Queue `action` to run `delay` from now. Returns false once cancelled.
    pub fn schedule(&self, delay: Duration, action: RetryAction) -> bool {
        let retry = ScheduledRetry {
            due: Instant::now() + delay,
            action,
        };
        self.tx.send(retry).is_ok() && !self.worker.is_finished()
    }

    /// Stop the worker immediately, dropping anything queued.
    pub fn cancel(&self) {
        self.worker.abort();
        debug!(scheduler = self.name, "Scheduler cancelled");
    }
}

impl Drop for SequentialScheduler {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// Capped exponential backoff with a failure ceiling.
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempts: AtomicU32,
    stopped: AtomicBool,
    scheduler: SequentialScheduler,
}

impl ExponentialBackoff {
    /// Create the strategy and its scheduler. Must be called inside a tokio runtime.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            scheduler: SequentialScheduler::spawn("reconnect"),
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

impl ReconnectionStrategy for ExponentialBackoff {
    fn request_reconnection(&self, retry: RetryAction) -> ReconnectDecision {
        if self.stopped.load(Ordering::SeqCst) {
            debug!("Reconnection requested after shutdown, ignoring");
            return ReconnectDecision::Stopped;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

        if attempt >= self.config.max_attempts {
            error!(
                attempts = attempt + 1,
                max_attempts = self.config.max_attempts,
                "Reconnection ceiling reached, giving up. Restart required to resume"
            );
            return ReconnectDecision::GaveUp {
                attempts: attempt + 1,
            };
        }

        let delay = self.config.delay_for(attempt);

        if !self.scheduler.schedule(delay, retry) {
            warn!("Reconnect scheduler is gone, retry dropped");
            return ReconnectDecision::Stopped;
        }

        info!(
            attempt = attempt + 1,
            max_attempts = self.config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Reconnection scheduled"
        );

        ReconnectDecision::Scheduled(delay)
    }

    fn reset(&self) {
        let previous = self.attempts.swap(0, Ordering::SeqCst);
        if previous > 0 {
            debug!(previous = previous, "Reconnection counter reset");
        }
    }

    fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.scheduler.cancel();
        }
    }

    fn failed_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::{Arc, Mutex};

    fn noop() -> RetryAction {
        Box::new(|| async {}.boxed())
    }

    #[test]
    fn test_backoff_table() {
        let config = BackoffConfig::default();
        let delays: Vec<u64> = (0..9).map(|a| config.delay_for(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![200, 400, 800, 1600, 3200, 6400, 10000, 10000, 10000]);
    }

    #[test]
    fn test_backoff_never_overflows() {
        let config = BackoffConfig::default();
        assert_eq!(config.delay_for(63), Duration::from_millis(10_000));
        assert_eq!(config.delay_for(64), Duration::from_millis(10_000));
        assert_eq!(config.delay_for(u32::MAX), Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_stops_scheduling() {
        let strategy = ExponentialBackoff::new(BackoffConfig {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(1000),
            max_attempts: 3,
        });

        let decisions: Vec<ReconnectDecision> =
            (0..4).map(|_| strategy.request_reconnection(noop())).collect();

        assert_eq!(
            decisions,
            vec![
                ReconnectDecision::Scheduled(Duration::from_millis(200)),
                ReconnectDecision::Scheduled(Duration::from_millis(400)),
                ReconnectDecision::Scheduled(Duration::from_millis(800)),
                ReconnectDecision::GaveUp { attempts: 4 },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restarts_from_initial_delay() {
        let strategy = ExponentialBackoff::new(BackoffConfig::default());

        for _ in 0..5 {
            strategy.request_reconnection(noop());
        }
        assert_eq!(strategy.failed_attempts(), 5);

        strategy.reset();
        assert_eq!(strategy.failed_attempts(), 0);
        assert_eq!(
            strategy.request_reconnection(noop()),
            ReconnectDecision::Scheduled(Duration::from_millis(200))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_run_after_delay_and_in_order() {
        let strategy = ExponentialBackoff::new(BackoffConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let started = Instant::now();

        for label in ["first", "second"] {
            let log = Arc::clone(&log);
            strategy.request_reconnection(Box::new(move || {
                async move {
                    log.lock().unwrap().push((label, started.elapsed()));
                }
                .boxed()
            }));
        }

        tokio::time::sleep(Duration::from_secs(1)).await;

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0, "first");
        assert!(log[0].1 >= Duration::from_millis(200));
        assert_eq!(log[1].0, "second");
        assert!(log[1].1 >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_never_overlap() {
        let scheduler = SequentialScheduler::spawn("test");
        let running = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            scheduler.schedule(
                Duration::ZERO,
                Box::new(move || {
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    }
                    .boxed()
                }),
            );
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_retry() {
        let strategy = ExponentialBackoff::new(BackoffConfig::default());
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        strategy.request_reconnection(Box::new(move || {
            async move {
                flag.store(true, Ordering::SeqCst);
            }
            .boxed()
        }));

        strategy.shutdown();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(strategy.request_reconnection(noop()), ReconnectDecision::Stopped);
    }
}
