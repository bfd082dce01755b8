//! Per-request runtime guards: the invocation budget and the watchdog.
//!
//! Both guards are consulted at every suspension point. Each stage calls
//! `watchdog.check()` and then `budget.increment()` before issuing a model
//! call; either failure aborts the request.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::error::GatewayError;
use crate::trinity::tier::Tier;

/// Extra slack granted to an escalated request's watchdog.
const ESCALATION_DEADLINE_FACTOR: f64 = 1.5;

// ─── Invocation budget ────────────────────────────────────────────────────────

/// Bounded counter of model calls for a single request.
///
/// `increment` precedes every model call; exceeding the cap is fatal for the
/// request (advisory stages map it to their own non-fatal failure instead).
#[derive(Debug)]
pub struct InvocationBudget {
    used: AtomicU32,
    limit: u32,
}

impl InvocationBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            used: AtomicU32::new(0),
            limit,
        }
    }

    /// Budget cap derived from the request tier.
    ///
    /// The normal pipeline is four model calls (intake, reasoning, CLEAR
    /// audit, final); critical adds reflection for five.
    pub fn for_tier(tier: Tier) -> Self {
        let limit = match tier {
            Tier::Simple => 4,
            Tier::Complex => 4,
            Tier::Critical => 5,
        };
        Self::new(limit)
    }

    /// Record one model invocation, failing if it would exceed the cap.
    pub fn increment(&self) -> Result<(), GatewayError> {
        let prev = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < self.limit {
                    Some(n + 1)
                } else {
                    None
                }
            });
        match prev {
            Ok(_) => Ok(()),
            Err(used) => Err(GatewayError::BudgetExhausted {
                used,
                limit: self.limit,
            }),
        }
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

// ─── Watchdog ─────────────────────────────────────────────────────────────────

/// Wall-clock deadline enforcer for a single request.
#[derive(Debug, Clone)]
pub struct Watchdog {
    started_at: Instant,
    limit: Duration,
}

impl Watchdog {
    pub fn new(limit: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            limit,
        }
    }

    /// Deadline derived from the request tier.
    pub fn for_tier(tier: Tier) -> Self {
        Self::new(tier_deadline(tier))
    }

    /// Deadline for an escalated re-invocation: 1.5× the original tier's.
    pub fn for_escalation(original: Tier) -> Self {
        Self::new(tier_deadline(original).mul_f64(ESCALATION_DEADLINE_FACTOR))
    }

    /// Fails once the deadline has passed.
    pub fn check(&self) -> Result<(), GatewayError> {
        let elapsed = self.started_at.elapsed();
        if elapsed >= self.limit {
            return Err(GatewayError::DeadlineExceeded {
                elapsed_ms: elapsed.as_millis() as u64,
                limit_ms: self.limit.as_millis() as u64,
            });
        }
        Ok(())
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// Wall-clock budget left; zero once expired. Used as the per-stage soft
    /// timeout for backend calls.
    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.started_at.elapsed())
    }
}

fn tier_deadline(tier: Tier) -> Duration {
    match tier {
        Tier::Simple => Duration::from_secs(30),
        Tier::Complex => Duration::from_secs(60),
        Tier::Critical => Duration::from_secs(120),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_counts_up_to_limit() {
        let b = InvocationBudget::new(2);
        assert!(b.increment().is_ok());
        assert!(b.increment().is_ok());
        let err = b.increment().unwrap_err();
        assert!(matches!(err, GatewayError::BudgetExhausted { used: 2, limit: 2 }));
        // A failed increment does not advance the counter.
        assert_eq!(b.used(), 2);
    }

    #[test]
    fn tier_caps_admit_the_full_pipeline() {
        // intake + reasoning + audit + final
        assert_eq!(InvocationBudget::for_tier(Tier::Simple).limit(), 4);
        assert_eq!(InvocationBudget::for_tier(Tier::Complex).limit(), 4);
        // + reflection
        assert_eq!(InvocationBudget::for_tier(Tier::Critical).limit(), 5);
    }

    #[test]
    fn fresh_watchdog_passes() {
        let w = Watchdog::for_tier(Tier::Simple);
        assert!(w.check().is_ok());
        assert!(w.remaining() > Duration::from_secs(25));
    }

    #[test]
    fn expired_watchdog_fails() {
        let w = Watchdog::new(Duration::from_millis(0));
        assert!(matches!(
            w.check(),
            Err(GatewayError::DeadlineExceeded { .. })
        ));
        assert_eq!(w.remaining(), Duration::ZERO);
    }

    #[test]
    fn escalation_deadline_is_one_and_a_half_times() {
        let w = Watchdog::for_escalation(Tier::Complex);
        assert_eq!(w.limit(), Duration::from_secs(90));
    }
}
