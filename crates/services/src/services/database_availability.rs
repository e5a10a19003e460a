//! Cached liveness verdict for the backing database.

use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{Instant, timeout},
};
use tracing::{debug, info, warn};
use ts_rs::TS;
use utils::listeners::{ListenerId, ListenerRegistry};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AvailabilityState {
    Unknown,
    Checking,
    Available,
    Unavailable,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProbeError {
    /// The store answered but a table (or other required object) is missing.
    #[error("required resource missing: {0}")]
    ResourceMissing(String),
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("probe failed: {0}")]
    Failed(String),
}

/// A lightweight check that the backing store is reachable and usable.
#[async_trait]
pub trait AvailabilityProbe: Send + Sync {
    async fn probe(&self) -> Result<(), ProbeError>;
}

/// Point-in-time view of the cache, as served by the health endpoint
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct AvailabilityStatus {
    pub state: AvailabilityState,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct CacheState {
    state: AvailabilityState,
    verdict_at: Option<Instant>,
    last_checked_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    in_flight: Option<watch::Receiver<Option<bool>>>,
}

impl CacheState {
    fn new() -> Self {
        Self {
            state: AvailabilityState::Unknown,
            verdict_at: None,
            last_checked_at: None,
            last_error: None,
            in_flight: None,
        }
    }

    fn fresh_verdict(&self, ttl: Duration) -> Option<bool> {
        let verdict_at = self.verdict_at?;
        if verdict_at.elapsed() >= ttl {
            return None;
        }
        match self.state {
            AvailabilityState::Available => Some(true),
            AvailabilityState::Unavailable => Some(false),
            AvailabilityState::Unknown | AvailabilityState::Checking => None,
        }
    }

    /// Records a verdict and returns the new state if it changed.
    fn record(&mut self, available: bool, error: Option<String>) -> Option<AvailabilityState> {
        let previous = self.state;
        self.state = if available {
            AvailabilityState::Available
        } else {
            AvailabilityState::Unavailable
        };
        self.verdict_at = Some(Instant::now());
        self.last_checked_at = Some(Utc::now());
        self.last_error = error;
        (previous != self.state).then_some(self.state)
    }
}

enum Lookup {
    Cached(bool),
    Pending(watch::Receiver<Option<bool>>),
}

/// Caches whether the database is usable.
///
/// Verdicts younger than the TTL are served without probing. Only one probe
/// runs at a time; callers arriving while it runs wait for its verdict. The
/// probe runs on its own task, so a caller that gives up does not abandon the
/// other waiters.
#[derive(Clone)]
pub struct AvailabilityManager {
    probe: Arc<dyn AvailabilityProbe>,
    cache_ttl: Duration,
    probe_timeout: Duration,
    cache: Arc<Mutex<CacheState>>,
    listeners: Arc<ListenerRegistry<AvailabilityState>>,
}

impl AvailabilityManager {
    pub fn new(probe: Arc<dyn AvailabilityProbe>) -> Self {
        Self::with_timings(probe, DEFAULT_CACHE_TTL, DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_timings(
        probe: Arc<dyn AvailabilityProbe>,
        cache_ttl: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            probe,
            cache_ttl,
            probe_timeout,
            cache: Arc::new(Mutex::new(CacheState::new())),
            listeners: Arc::new(ListenerRegistry::new()),
        }
    }

    /// Returns the cached verdict if fresh, otherwise probes (or joins a running probe).
    pub async fn is_available(&self) -> bool {
        match self.lookup(false) {
            Lookup::Cached(available) => available,
            Lookup::Pending(rx) => Self::wait_for_verdict(rx).await,
        }
    }

    /// Probes regardless of the cached verdict's age.
    pub async fn force_check(&self) -> bool {
        match self.lookup(true) {
            Lookup::Cached(available) => available,
            Lookup::Pending(rx) => Self::wait_for_verdict(rx).await,
        }
    }

    /// Records a fresh positive verdict, e.g. after a successful write.
    pub fn mark_available(&self) {
        let changed = self.lock().record(true, None);
        self.notify_change(changed);
    }

    /// Records a fresh negative verdict, e.g. after a failed write.
    pub fn mark_unavailable(&self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(reason = %reason, "Database marked unavailable");
        let changed = self.lock().record(false, Some(reason));
        self.notify_change(changed);
    }

    pub fn state(&self) -> AvailabilityState {
        self.lock().state
    }

    pub fn status(&self) -> AvailabilityStatus {
        let cache = self.lock();
        AvailabilityStatus {
            state: cache.state,
            last_checked_at: cache.last_checked_at,
            last_error: cache.last_error.clone(),
        }
    }

    /// Registers `listener` for state changes; it is called once per transition.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&AvailabilityState) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Forgets every verdict and returns to `Unknown`. Test hook.
    ///
    /// A probe already running still records its verdict when it finishes.
    pub fn reset(&self) {
        *self.lock() = CacheState::new();
    }

    fn lookup(&self, force: bool) -> Lookup {
        let (rx, tx) = {
            let mut cache = self.lock();
            if !force {
                if let Some(available) = cache.fresh_verdict(self.cache_ttl) {
                    return Lookup::Cached(available);
                }
            }
            if let Some(rx) = &cache.in_flight {
                // A closed channel means the probe task died without reporting.
                if rx.has_changed().is_ok() {
                    debug!("Joining in-flight database probe");
                    return Lookup::Pending(rx.clone());
                }
                warn!("Previous database probe was lost, starting a new one");
            }
            let (tx, rx) = watch::channel(None);
            cache.in_flight = Some(rx.clone());
            cache.state = AvailabilityState::Checking;
            (rx, tx)
        };

        self.notify_change(Some(AvailabilityState::Checking));
        self.spawn_probe(tx);
        Lookup::Pending(rx)
    }

    fn spawn_probe(&self, tx: watch::Sender<Option<bool>>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let probe = timeout(manager.probe_timeout, manager.probe.probe());
            let outcome = match AssertUnwindSafe(probe).catch_unwind().await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(ProbeError::Timeout(manager.probe_timeout)),
                Err(_) => Err(ProbeError::Failed("probe panicked".to_string())),
            };

            let available = outcome.is_ok();
            match &outcome {
                Ok(()) => info!("Database availability probe succeeded"),
                Err(ProbeError::ResourceMissing(what)) => {
                    warn!(missing = %what, "Database reachable but schema is incomplete")
                }
                Err(e) => warn!(error = %e, "Database availability probe failed"),
            }

            let changed = {
                let mut cache = manager.lock();
                cache.in_flight = None;
                cache.record(available, outcome.err().map(|e| e.to_string()))
            };
            manager.notify_change(changed);
            // Nobody waiting is fine.
            let _ = tx.send(Some(available));
        });
    }

    async fn wait_for_verdict(mut rx: watch::Receiver<Option<bool>>) -> bool {
        match rx.wait_for(Option::is_some).await {
            Ok(verdict) => verdict.unwrap_or(false),
            Err(_) => {
                warn!("Database probe task ended without a verdict");
                false
            }
        }
    }

    fn notify_change(&self, changed: Option<AvailabilityState>) {
        if let Some(state) = changed {
            self.listeners.emit(&state);
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex as StdMutex,
        atomic::{AtomicUsize, Ordering},
    };

    use futures::future::join_all;

    use super::*;

    struct FakeProbe {
        calls: AtomicUsize,
        delay: Duration,
        outcome: StdMutex<Result<(), ProbeError>>,
    }

    impl FakeProbe {
        fn new(outcome: Result<(), ProbeError>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                outcome: StdMutex::new(outcome),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn set_outcome(&self, outcome: Result<(), ProbeError>) {
            *self.outcome.lock().unwrap() = outcome;
        }
    }

    #[async_trait]
    impl AvailabilityProbe for FakeProbe {
        async fn probe(&self) -> Result<(), ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.outcome.lock().unwrap().clone()
        }
    }

    /// Panics on its first call and succeeds afterwards.
    #[derive(Default)]
    struct PanicsOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AvailabilityProbe for PanicsOnce {
        async fn probe(&self) -> Result<(), ProbeError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("driver blew up");
            }
            Ok(())
        }
    }

    fn manager(probe: &Arc<FakeProbe>) -> AvailabilityManager {
        AvailabilityManager::new(probe.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_verdict_is_cached_within_ttl() {
        let probe = FakeProbe::new(Ok(()), Duration::from_millis(10));
        let manager = manager(&probe);

        assert!(manager.is_available().await);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(manager.is_available().await);
        assert_eq!(probe.calls(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        probe.set_outcome(Err(ProbeError::Failed("connection refused".into())));
        assert!(!manager.is_available().await, "expired verdict re-probes");
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_probe() {
        let probe = FakeProbe::new(Ok(()), Duration::from_millis(500));
        let manager = manager(&probe);

        let verdicts = join_all((0..8).map(|_| manager.is_available())).await;

        assert!(verdicts.into_iter().all(|v| v));
        assert_eq!(probe.calls(), 1);
        assert_eq!(manager.state(), AvailabilityState::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_check_always_reprobes() {
        let probe = FakeProbe::new(Ok(()), Duration::ZERO);
        let manager = manager(&probe);

        assert!(manager.is_available().await);
        probe.set_outcome(Err(ProbeError::Failed("gone".into())));
        assert!(!manager.force_check().await);
        assert!(!manager.force_check().await);
        assert_eq!(probe.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_times_out_as_unavailable() {
        let probe = FakeProbe::new(Ok(()), Duration::from_secs(10));
        let manager = manager(&probe);

        assert!(!manager.is_available().await);

        let status = manager.status();
        assert_eq!(status.state, AvailabilityState::Unavailable);
        assert!(status.last_error.unwrap().contains("timed out"));
        assert!(status.last_checked_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_resource_is_unavailable() {
        let probe = FakeProbe::new(
            Err(ProbeError::ResourceMissing("notifications".into())),
            Duration::ZERO,
        );
        let manager = manager(&probe);

        assert!(!manager.is_available().await);
        assert_eq!(
            manager.status().last_error.as_deref(),
            Some("required resource missing: notifications")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_marks_short_circuit_probe() {
        let probe = FakeProbe::new(Ok(()), Duration::ZERO);
        let manager = manager(&probe);

        manager.mark_unavailable("insert failed");
        assert!(!manager.is_available().await);
        manager.mark_available();
        assert!(manager.is_available().await);
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listeners_see_transitions_until_unsubscribed() {
        let probe = FakeProbe::new(Ok(()), Duration::ZERO);
        let manager = manager(&probe);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let id = manager.subscribe(move |state| seen_clone.lock().unwrap().push(*state));

        manager.is_available().await;
        manager.mark_available(); // no transition, no callback
        assert!(manager.unsubscribe(id));
        manager.mark_unavailable("offline");

        assert_eq!(
            *seen.lock().unwrap(),
            vec![AvailabilityState::Checking, AvailabilityState::Available]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forgets_verdict() {
        let probe = FakeProbe::new(Ok(()), Duration::ZERO);
        let manager = manager(&probe);

        manager.is_available().await;
        manager.reset();

        assert_eq!(manager.state(), AvailabilityState::Unknown);
        assert!(manager.status().last_checked_at.is_none());
        manager.is_available().await;
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_check_is_recorded_as_unavailable() {
        let check = Arc::new(PanicsOnce::default());
        let manager = AvailabilityManager::new(check.clone());

        assert!(!manager.is_available().await);
        let status = manager.status();
        assert_eq!(status.state, AvailabilityState::Unavailable);
        assert!(status.last_error.unwrap().contains("panicked"));

        // The cache is not wedged on the dead check.
        assert!(!manager.is_available().await);
        assert!(manager.force_check().await);
        assert_eq!(manager.state(), AvailabilityState::Available);
        assert_eq!(check.calls.load(Ordering::SeqCst), 2);
    }
}
