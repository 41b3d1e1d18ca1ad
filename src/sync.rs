//! Incremental synchronization plumbing shared by every cache.
//!
//! A cache pulls "everything modified after my watermark" from the store,
//! folds it, and advances the watermark to the newest modify time it saw.
//! [`SyncState`] owns the watermarks and the first-update flag; the
//! watermarks only move after a fold succeeded, so a failed cycle re-reads
//! the same window next time. [`SingleFlight`] collapses concurrent update
//! calls into one store round trip whose outcome every caller observes.
//! Updates and clears of one cache hold [`SyncState::lock_cycle`] so a clear
//! never lands between an update's fetch and its commit.

use crate::{
    error::{Error, Result},
    metrics::CacheMetrics,
    record::epoch,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{watch, Mutex as CycleLock, MutexGuard as CycleGuard};

/// Result of folding one batch of records of a single feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FoldOutcome {
    /// Records applied to the indexes.
    pub processed: u64,
    /// Records rejected during conversion.
    pub skipped: u64,
    /// Newest modify time in the batch, skipped records included.
    pub newest: Option<DateTime<Utc>>,
}

/// Outcome of one successful fetch-and-fold cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResult {
    /// Newest modify time seen, per sub-resource. Absent when the delta for
    /// that sub-resource was empty.
    pub watermarks: HashMap<String, DateTime<Utc>>,
    /// Records applied to the indexes.
    pub processed: u64,
    /// Records dropped as unparseable.
    pub skipped: u64,
}

impl UpdateResult {
    /// Add the outcome of folding the `sub` feed.
    pub fn absorb(&mut self, sub: &str, outcome: FoldOutcome) {
        self.processed += outcome.processed;
        self.skipped += outcome.skipped;
        self.observe(sub, outcome.newest);
    }

    /// Record the newest modify time seen for `sub`, if any.
    pub fn observe(&mut self, sub: &str, newest: Option<DateTime<Utc>>) {
        if let Some(ts) = newest {
            self.watermarks
                .entry(sub.to_string())
                .and_modify(|cur| {
                    if ts > *cur {
                        *cur = ts;
                    }
                })
                .or_insert(ts);
        }
    }
}

/// Watermarks and first-update flag of one cache.
#[derive(Debug)]
pub struct SyncState {
    watermarks: DashMap<String, DateTime<Utc>>,
    first_update: AtomicBool,
    cycle: CycleLock<()>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            watermarks: DashMap::new(),
            first_update: AtomicBool::new(true),
            cycle: CycleLock::new(()),
        }
    }

    /// Serialize fetch-fold-commit cycles against clears. Hold the guard for
    /// the whole cycle, across the store await.
    pub async fn lock_cycle(&self) -> CycleGuard<'_, ()> {
        self.cycle.lock().await
    }

    /// Watermark of `sub`; the epoch before anything was folded.
    pub fn watermark(&self, sub: &str) -> DateTime<Utc> {
        self.watermarks
            .get(sub)
            .map(|ts| *ts)
            .unwrap_or_else(epoch)
    }

    /// Whether no update has succeeded since creation or the last reset.
    pub fn is_first_update(&self) -> bool {
        self.first_update.load(Ordering::Acquire)
    }

    /// Advance watermarks after a successful fold. Watermarks never move
    /// backwards.
    pub fn commit(&self, result: &UpdateResult) {
        for (sub, ts) in &result.watermarks {
            self.watermarks
                .entry(sub.clone())
                .and_modify(|cur| {
                    if *ts > *cur {
                        *cur = *ts;
                    }
                })
                .or_insert(*ts);
        }
        self.first_update.store(false, Ordering::Release);
    }

    /// Forget every watermark; the next update re-reads from the epoch.
    pub fn reset(&self) {
        self.watermarks.clear();
        self.first_update.store(true, Ordering::Release);
    }

    /// Commit or report the outcome of one cycle, logging and counting it.
    pub fn finish(
        &self,
        cache: &str,
        started: Instant,
        outcome: Result<UpdateResult>,
        metrics: &CacheMetrics,
    ) -> Result<()> {
        match outcome {
            Ok(result) => {
                self.commit(&result);
                metrics.record_update_success(started.elapsed(), result.processed);
                if result.skipped > 0 {
                    metrics.record_skipped(result.skipped);
                }
                if result.processed > 0 {
                    log::debug!(
                        "[Cache][{}] folded {} records in {:?}",
                        cache,
                        result.processed,
                        started.elapsed()
                    );
                } else {
                    log::trace!("[Cache][{}] no changes", cache);
                }
                Ok(())
            }
            Err(err) => {
                metrics.record_update_failure(err.kind());
                log::warn!("[Cache][{}] update failed: {}", cache, err);
                Err(err)
            }
        }
    }
}

type Flight = watch::Receiver<Option<Result<()>>>;

/// Per-key de-duplication of concurrent async work.
#[derive(Debug, Default)]
pub struct SingleFlight {
    in_flight: Mutex<HashMap<String, Flight>>,
}

// Removes the leader's entry even if the leader future is dropped mid-await.
struct FlightGuard<'a> {
    flights: &'a Mutex<HashMap<String, Flight>>,
    key: &'a str,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.flights).remove(self.key);
    }
}

fn lock(flights: &Mutex<HashMap<String, Flight>>) -> MutexGuard<'_, HashMap<String, Flight>> {
    flights.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` unless a run for `key` is already in flight, in which case
    /// wait for that run and return its result.
    ///
    /// # Errors
    ///
    /// Propagates the leader's error to every waiter. Returns
    /// [`Error::UpdateAborted`] to waiters whose leader was cancelled before
    /// publishing a result.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let joined = {
            let mut flights = lock(&self.in_flight);
            match flights.get(key) {
                Some(rx) => Err(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    flights.insert(key.to_string(), rx);
                    Ok(tx)
                }
            }
        };

        match joined {
            Ok(tx) => {
                let guard = FlightGuard {
                    flights: &self.in_flight,
                    key,
                };
                let result = work().await;
                drop(guard);
                tx.send_replace(Some(result.clone()));
                result
            }
            Err(mut rx) => {
                log::debug!("[SingleFlight] joining in-flight run for '{}'", key);
                match rx.wait_for(|outcome| outcome.is_some()).await {
                    Ok(outcome) => match &*outcome {
                        Some(result) => result.clone(),
                        None => Err(Error::UpdateAborted(key.to_string())),
                    },
                    Err(_) => Err(Error::UpdateAborted(key.to_string())),
                }
            }
        }
    }

    /// Whether a run for `key` is currently in flight.
    pub fn is_in_flight(&self, key: &str) -> bool {
        lock(&self.in_flight).contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_watermarks_only_advance() {
        let state = SyncState::new();
        assert!(state.is_first_update());
        assert_eq!(state.watermark("users"), epoch());

        let t1 = Utc::now();
        let mut result = UpdateResult::default();
        result.observe("users", Some(t1));
        result.observe("groups", None);
        state.commit(&result);

        assert!(!state.is_first_update());
        assert_eq!(state.watermark("users"), t1);
        assert_eq!(state.watermark("groups"), epoch());

        let mut older = UpdateResult::default();
        older.observe("users", Some(t1 - Duration::seconds(10)));
        state.commit(&older);
        assert_eq!(state.watermark("users"), t1);

        state.reset();
        assert!(state.is_first_update());
        assert_eq!(state.watermark("users"), epoch());
    }

    #[test]
    fn test_failed_finish_keeps_watermark() {
        let state = SyncState::new();
        let metrics = CacheMetrics::new();
        let outcome = Err(Error::Store("boom".to_string()));
        assert!(state
            .finish("roles", Instant::now(), outcome, &metrics)
            .is_err());
        assert!(state.is_first_update());
        assert_eq!(metrics.snapshot().update_failures, 1);
        assert_eq!(metrics.snapshot().error_counts.get("store"), Some(&1));
    }

    #[tokio::test]
    async fn test_reset_waits_for_running_cycle() {
        let state = Arc::new(SyncState::new());
        let cycle = state.lock_cycle().await;

        let clearer = {
            let state = state.clone();
            tokio::spawn(async move {
                let _cycle = state.lock_cycle().await;
                state.reset();
            })
        };
        tokio::task::yield_now().await;
        assert!(!clearer.is_finished());

        let mut result = UpdateResult::default();
        result.observe("strategies", Some(Utc::now()));
        state.commit(&result);
        drop(cycle);

        clearer.await.unwrap();
        assert!(state.is_first_update());
        assert_eq!(state.watermark("strategies"), epoch());
    }

    #[tokio::test]
    async fn test_single_flight_collapses_concurrent_runs() {
        let flight = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = watch::channel(false);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let calls = calls.clone();
            let mut release = release_rx.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("strategyRule", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = release.wait_for(|go| *go).await;
                        Ok(())
                    })
                    .await
            }));
        }

        // let every task register before the leader finishes
        while !flight.is_in_flight("strategyRule") {
            tokio::task::yield_now().await;
        }
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        release_tx.send_replace(true);

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!flight.is_in_flight("strategyRule"));
    }

    #[tokio::test]
    async fn test_single_flight_shares_errors() {
        let flight = Arc::new(SingleFlight::new());
        let (release_tx, release_rx) = watch::channel(false);

        let leader = {
            let flight = flight.clone();
            let mut release = release_rx.clone();
            tokio::spawn(async move {
                flight
                    .run("roles", || async move {
                        let _ = release.wait_for(|go| *go).await;
                        Err(Error::Store("down".to_string()))
                    })
                    .await
            })
        };
        while !flight.is_in_flight("roles") {
            tokio::task::yield_now().await;
        }

        let follower = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.run("roles", || async { Ok(()) }).await })
        };
        tokio::task::yield_now().await;
        release_tx.send_replace(true);

        assert_eq!(leader.await.unwrap(), Err(Error::Store("down".to_string())));
        let follower = follower.await.unwrap();
        // the follower either joined the failed run or started after it ended
        assert!(follower == Err(Error::Store("down".to_string())) || follower.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_leader_releases_key() {
        let flight = Arc::new(SingleFlight::new());
        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run("users", || async {
                        std::future::pending::<()>().await;
                        Ok(())
                    })
                    .await
            })
        };
        while !flight.is_in_flight("users") {
            tokio::task::yield_now().await;
        }

        let follower = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.run("users", || async { Ok(()) }).await })
        };
        tokio::task::yield_now().await;

        leader.abort();
        let _ = leader.await;
        let outcome = follower.await.unwrap();
        assert!(outcome.is_ok() || outcome == Err(Error::UpdateAborted("users".to_string())));
        assert!(!flight.is_in_flight("users"));
    }
}
