//! Webhook processing health
//!
//! Counters are updated from request handlers and the retry worker at the
//! same time, so they are plain atomics. Only an operator reset clears them.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::config::HealthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Critical,
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub level: HealthLevel,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success_at: Option<OffsetDateTime>,
    pub consecutive_failures: u64,
    pub total_processed: u64,
    pub total_failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    /// Unix seconds of the last success; 0 when none
    last_success_at: AtomicI64,
    consecutive_failures: AtomicU64,
    total_processed: AtomicU64,
    total_failed: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct HealthTracker {
    counters: Arc<Counters>,
    config: HealthConfig,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            config,
        }
    }

    pub fn record_success(&self) {
        let c = &self.counters;
        c.total_processed.fetch_add(1, Ordering::Relaxed);
        c.consecutive_failures.store(0, Ordering::Relaxed);
        c.last_success_at
            .store(OffsetDateTime::now_utc().unix_timestamp(), Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        let c = &self.counters;
        c.total_processed.fetch_add(1, Ordering::Relaxed);
        c.total_failed.fetch_add(1, Ordering::Relaxed);
        let failures = c.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

        if failures == self.config.critical_threshold {
            tracing::error!(
                consecutive_failures = failures,
                "Webhook processing health is critical"
            );
        } else if failures == self.config.degraded_threshold {
            tracing::warn!(
                consecutive_failures = failures,
                "Webhook processing health is degraded"
            );
        }
    }

    pub fn level(&self) -> HealthLevel {
        self.classify(self.counters.consecutive_failures.load(Ordering::Relaxed))
    }

    fn classify(&self, consecutive_failures: u64) -> HealthLevel {
        if consecutive_failures >= self.config.critical_threshold {
            HealthLevel::Critical
        } else if consecutive_failures >= self.config.degraded_threshold {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        }
    }

    /// Ready to take traffic unless critical
    pub fn is_ready(&self) -> bool {
        self.level() != HealthLevel::Critical
    }

    pub fn status(&self) -> HealthStatus {
        let c = &self.counters;
        let consecutive_failures = c.consecutive_failures.load(Ordering::Relaxed);
        let last_success = c.last_success_at.load(Ordering::Relaxed);

        HealthStatus {
            level: self.classify(consecutive_failures),
            last_success_at: (last_success > 0)
                .then(|| OffsetDateTime::from_unix_timestamp(last_success).ok())
                .flatten(),
            consecutive_failures,
            total_processed: c.total_processed.load(Ordering::Relaxed),
            total_failed: c.total_failed.load(Ordering::Relaxed),
        }
    }

    /// Operator reset of all counters
    pub fn reset(&self) {
        let c = &self.counters;
        c.last_success_at.store(0, Ordering::Relaxed);
        c.consecutive_failures.store(0, Ordering::Relaxed);
        c.total_processed.store(0, Ordering::Relaxed);
        c.total_failed.store(0, Ordering::Relaxed);
        tracing::info!("Webhook health counters reset");
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_after_failures(n: u64) -> HealthTracker {
        let tracker = HealthTracker::default();
        for _ in 0..n {
            tracker.record_failure();
        }
        tracker
    }

    #[test]
    fn test_classification_thresholds() {
        for n in 0..5 {
            assert_eq!(tracker_after_failures(n).level(), HealthLevel::Healthy, "{}", n);
        }
        for n in 5..10 {
            assert_eq!(tracker_after_failures(n).level(), HealthLevel::Degraded, "{}", n);
        }
        for n in [10, 11, 50] {
            assert_eq!(tracker_after_failures(n).level(), HealthLevel::Critical, "{}", n);
        }
    }

    #[test]
    fn test_success_clears_consecutive_failures_only() {
        let tracker = tracker_after_failures(7);
        tracker.record_success();

        let status = tracker.status();
        assert_eq!(status.level, HealthLevel::Healthy);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.total_failed, 7);
        assert_eq!(status.total_processed, 8);
        assert!(status.last_success_at.is_some());
    }

    #[test]
    fn test_not_ready_when_critical() {
        assert!(tracker_after_failures(9).is_ready());
        assert!(!tracker_after_failures(10).is_ready());
    }

    #[test]
    fn test_reset_clears_everything() {
        let tracker = tracker_after_failures(12);
        tracker.record_success();
        tracker.reset();

        let status = tracker.status();
        assert_eq!(status.total_processed, 0);
        assert_eq!(status.total_failed, 0);
        assert!(status.last_success_at.is_none());
    }

    #[test]
    fn test_clones_share_counters() {
        let tracker = HealthTracker::default();
        let clone = tracker.clone();
        clone.record_failure();
        assert_eq!(tracker.status().total_failed, 1);
    }
}
