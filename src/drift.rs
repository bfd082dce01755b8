//! Latency drift monitoring.
//!
//! Keeps a rolling window of end-to-end request latencies next to lifetime
//! aggregates. The gateway flags drift when the recent mean pulls away from
//! the lifetime mean, which usually means the model backend is degrading.

use std::collections::VecDeque;

use tokio::sync::Mutex;

const WINDOW: usize = 100;
/// Recent mean above lifetime mean by this factor counts as drift.
const DRIFT_FACTOR: f64 = 1.5;
/// Don't report drift before the window has a meaningful population.
const MIN_SAMPLES: usize = 10;

#[derive(Debug, Default)]
struct DriftInner {
    window: VecDeque<u64>,
    lifetime_sum: u128,
    lifetime_count: u64,
}

#[derive(Default)]
pub struct LatencyDriftMonitor {
    inner: Mutex<DriftInner>,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftSnapshot {
    pub windowed_mean_ms: f64,
    pub lifetime_mean_ms: f64,
    pub sample_count: u64,
    pub drifting: bool,
}

impl LatencyDriftMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, latency_ms: u64) {
        let mut inner = self.inner.lock().await;
        inner.window.push_back(latency_ms);
        while inner.window.len() > WINDOW {
            inner.window.pop_front();
        }
        inner.lifetime_sum += latency_ms as u128;
        inner.lifetime_count += 1;
    }

    pub async fn snapshot(&self) -> DriftSnapshot {
        let inner = self.inner.lock().await;
        let windowed_mean_ms = if inner.window.is_empty() {
            0.0
        } else {
            inner.window.iter().sum::<u64>() as f64 / inner.window.len() as f64
        };
        let lifetime_mean_ms = if inner.lifetime_count == 0 {
            0.0
        } else {
            inner.lifetime_sum as f64 / inner.lifetime_count as f64
        };
        let drifting = inner.window.len() >= MIN_SAMPLES
            && lifetime_mean_ms > 0.0
            && windowed_mean_ms > lifetime_mean_ms * DRIFT_FACTOR;
        DriftSnapshot {
            windowed_mean_ms,
            lifetime_mean_ms,
            sample_count: inner.lifetime_count,
            drifting,
        }
    }
}
