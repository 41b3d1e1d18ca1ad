//! Counters describing cache refresh and authorization activity.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::policy::PolicyAction;

/// Metrics collector shared by one cache and its refresh task.
#[derive(Debug, Clone)]
pub struct CacheMetrics {
    /// Number of updates that folded a delta successfully.
    pub update_successes: Arc<AtomicU64>,
    /// Number of updates that failed (store error or aborted leader).
    pub update_failures: Arc<AtomicU64>,
    /// Records applied to the indexes.
    pub records_folded: Arc<AtomicU64>,
    /// Records dropped because they could not be parsed.
    pub records_skipped: Arc<AtomicU64>,
    /// Hint decisions that came out ALLOW.
    pub hint_allows: Arc<AtomicU64>,
    /// Hint decisions that came out DENY.
    pub hint_denies: Arc<AtomicU64>,
    /// Wall time of the last successful update, epoch millis; zero if none.
    last_update_ms: Arc<AtomicI64>,
    /// Slowest update observed per duration bucket.
    pub update_durations: Arc<DashMap<String, Duration>>,
    /// Failure counts by error kind.
    pub error_counts: Arc<DashMap<String, AtomicU64>>,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            update_successes: Arc::new(AtomicU64::new(0)),
            update_failures: Arc::new(AtomicU64::new(0)),
            records_folded: Arc::new(AtomicU64::new(0)),
            records_skipped: Arc::new(AtomicU64::new(0)),
            hint_allows: Arc::new(AtomicU64::new(0)),
            hint_denies: Arc::new(AtomicU64::new(0)),
            last_update_ms: Arc::new(AtomicI64::new(0)),
            update_durations: Arc::new(DashMap::new()),
            error_counts: Arc::new(DashMap::new()),
        }
    }

    /// Record a successful update that applied `folded` records.
    pub fn record_update_success(&self, duration: Duration, folded: u64) {
        self.update_successes.fetch_add(1, Ordering::Relaxed);
        self.records_folded.fetch_add(folded, Ordering::Relaxed);
        self.last_update_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        let bucket = self.duration_to_bucket(duration);
        self.update_durations
            .entry(bucket)
            .and_modify(|existing| {
                if duration > *existing {
                    *existing = duration;
                }
            })
            .or_insert(duration);
    }

    /// Record a failed update.
    pub fn record_update_failure(&self, error_kind: &str) {
        self.update_failures.fetch_add(1, Ordering::Relaxed);
        self.error_counts
            .entry(error_kind.to_string())
            .and_modify(|count| {
                count.fetch_add(1, Ordering::Relaxed);
            })
            .or_insert_with(|| AtomicU64::new(1));
    }

    /// Record records dropped during a fold.
    pub fn record_skipped(&self, count: u64) {
        self.records_skipped.fetch_add(count, Ordering::Relaxed);
    }

    /// Record the outcome of a hint.
    pub fn record_hint(&self, decision: PolicyAction) {
        match decision {
            PolicyAction::Allow => self.hint_allows.fetch_add(1, Ordering::Relaxed),
            PolicyAction::Deny => self.hint_denies.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Time of the last successful update.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        match self.last_update_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            update_successes: self.update_successes.load(Ordering::Relaxed),
            update_failures: self.update_failures.load(Ordering::Relaxed),
            records_folded: self.records_folded.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            hint_allows: self.hint_allows.load(Ordering::Relaxed),
            hint_denies: self.hint_denies.load(Ordering::Relaxed),
            last_update: self.last_update(),
            error_counts: self
                .error_counts
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        self.update_successes.store(0, Ordering::Relaxed);
        self.update_failures.store(0, Ordering::Relaxed);
        self.records_folded.store(0, Ordering::Relaxed);
        self.records_skipped.store(0, Ordering::Relaxed);
        self.hint_allows.store(0, Ordering::Relaxed);
        self.hint_denies.store(0, Ordering::Relaxed);
        self.last_update_ms.store(0, Ordering::Relaxed);
        self.update_durations.clear();
        self.error_counts.clear();
    }

    fn duration_to_bucket(&self, duration: Duration) -> String {
        let millis = duration.as_millis();
        match millis {
            0..=9 => "0-9ms".to_string(),
            10..=99 => "10-99ms".to_string(),
            100..=999 => "100-999ms".to_string(),
            1000..=9999 => "1-9s".to_string(),
            _ => "10s+".to_string(),
        }
    }
}

/// Serializable copy of [`CacheMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub update_successes: u64,
    pub update_failures: u64,
    pub records_folded: u64,
    pub records_skipped: u64,
    pub hint_allows: u64,
    pub hint_denies: u64,
    pub last_update: Option<DateTime<Utc>>,
    pub error_counts: HashMap<String, u64>,
}
