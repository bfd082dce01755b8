//! Per-session token accounting.
//!
//! Each session carries a running token total plus a bounded history of
//! recent per-request samples, used by the drift telemetry. Single writer
//! via the mutex; telemetry reads take the same short lock.

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;

/// How many recent samples each session keeps.
const SAMPLE_WINDOW: usize = 100;

#[derive(Debug, Default)]
struct SessionCounter {
    total: u64,
    samples: VecDeque<u64>,
}

#[derive(Default)]
pub struct SessionTokenLedger {
    sessions: Mutex<HashMap<String, SessionCounter>>,
}

impl SessionTokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute `tokens` to a session; returns the new running total.
    pub async fn record(&self, session_id: &str, tokens: u64) -> u64 {
        let mut sessions = self.sessions.lock().await;
        let counter = sessions.entry(session_id.to_string()).or_default();
        counter.total += tokens;
        counter.samples.push_back(tokens);
        while counter.samples.len() > SAMPLE_WINDOW {
            counter.samples.pop_front();
        }
        counter.total
    }

    pub async fn total(&self, session_id: &str) -> u64 {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|c| c.total)
            .unwrap_or(0)
    }

    /// Snapshot of the recent samples, oldest first.
    pub async fn recent_samples(&self, session_id: &str) -> Vec<u64> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|c| c.samples.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
