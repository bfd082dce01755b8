//! Process-wide gateway counters.
//!
//! Lock-free atomics updated by the orchestrator; a snapshot is exposed on
//! the metrics route next to the drift monitor and registry gauges.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::trinity::tier::Tier;

#[derive(Default)]
pub struct GatewayMetrics {
    requests_total: AtomicU64,
    requests_simple: AtomicU64,
    requests_complex: AtomicU64,
    requests_critical: AtomicU64,
    escalations_total: AtomicU64,
    failures_total: AtomicU64,
    cancellations_total: AtomicU64,
    downgrades_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_simple: u64,
    pub requests_complex: u64,
    pub requests_critical: u64,
    pub escalations_total: u64,
    pub failures_total: u64,
    pub cancellations_total: u64,
    pub downgrades_total: u64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, tier: Tier) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        let counter = match tier {
            Tier::Simple => &self.requests_simple,
            Tier::Complex => &self.requests_complex,
            Tier::Critical => &self.requests_critical,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_escalation(&self) {
        self.escalations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancellation(&self) {
        self.cancellations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_downgrade(&self) {
        self.downgrades_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_simple: self.requests_simple.load(Ordering::Relaxed),
            requests_complex: self.requests_complex.load(Ordering::Relaxed),
            requests_critical: self.requests_critical.load(Ordering::Relaxed),
            escalations_total: self.escalations_total.load(Ordering::Relaxed),
            failures_total: self.failures_total.load(Ordering::Relaxed),
            cancellations_total: self.cancellations_total.load(Ordering::Relaxed),
            downgrades_total: self.downgrades_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_tier() {
        let metrics = GatewayMetrics::new();
        metrics.record_request(Tier::Simple);
        metrics.record_request(Tier::Simple);
        metrics.record_request(Tier::Critical);
        metrics.record_escalation();
        metrics.record_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.requests_total, 3);
        assert_eq!(snap.requests_simple, 2);
        assert_eq!(snap.requests_complex, 0);
        assert_eq!(snap.requests_critical, 1);
        assert_eq!(snap.escalations_total, 1);
        assert_eq!(snap.failures_total, 1);
    }
}
