//! Circuit breaker guarding the model backend.
//!
//! When the backend fails repeatedly the circuit opens and calls fail fast
//! with an upstream error instead of burning watchdog time on doomed
//! requests. After a cooldown a half-open probe tests recovery.
//!
//! ```text
//! Closed ──(failure_threshold failures)──► Open
//!   ▲                                        │
//!   └──(success_threshold successes)──── HalfOpen ◄─(cooldown elapsed)──┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// Thread-safe breaker; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<RwLock<BreakerInner>>,
    name: Arc<str>,
    failure_threshold: u32,
    success_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            })),
            name: Arc::from(name),
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(30),
        }
    }

    #[cfg(test)]
    pub fn with_thresholds(name: &str, failures: u32, successes: u32, cooldown: Duration) -> Self {
        let mut cb = Self::new(name);
        cb.failure_threshold = failures;
        cb.success_threshold = successes;
        cb.cooldown = cooldown;
        cb
    }

    /// Whether a call may proceed. Transitions Open → HalfOpen once the
    /// cooldown has elapsed.
    pub async fn is_allowed(&self) -> bool {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown {
                    info!(breaker = %self.name, "cooldown elapsed — probing (half-open)");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.success_threshold {
                    info!(breaker = %self.name, "recovered — circuit closed");
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "failure threshold reached — circuit open"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed — circuit re-opened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Open => {}
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.read().await.state
    }
}
