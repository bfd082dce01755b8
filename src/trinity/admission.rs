//! Per-tier admission control.
//!
//! A bounded number of requests per tier may hold a model-backend slot at
//! once. Acquisition suspends until a slot frees up (the watchdog bounds the
//! wait); the returned permit releases its slot on drop, so every exit path
//! — success, fatal error, or escalation hand-off — gives the slot back.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::trinity::tier::Tier;

const SIMPLE_SLOTS: usize = 8;
const COMPLEX_SLOTS: usize = 4;
const CRITICAL_SLOTS: usize = 2;

/// One semaphore per tier, caps fixed at startup.
pub struct TierGates {
    simple: Arc<Semaphore>,
    complex: Arc<Semaphore>,
    critical: Arc<Semaphore>,
}

/// Slot held by an admitted request. Dropping it releases the slot.
pub struct TierPermit {
    tier: Tier,
    _permit: OwnedSemaphorePermit,
}

impl TierPermit {
    pub fn tier(&self) -> Tier {
        self.tier
    }
}

impl Default for TierGates {
    fn default() -> Self {
        Self::new(SIMPLE_SLOTS, COMPLEX_SLOTS, CRITICAL_SLOTS)
    }
}

impl TierGates {
    pub fn new(simple: usize, complex: usize, critical: usize) -> Self {
        Self {
            simple: Arc::new(Semaphore::new(simple)),
            complex: Arc::new(Semaphore::new(complex)),
            critical: Arc::new(Semaphore::new(critical)),
        }
    }

    /// Await a slot for `tier`.
    ///
    /// An escalating request must drop its current permit before calling
    /// this for the next tier, otherwise two tiers' capacity can deadlock
    /// against each other under load.
    pub async fn acquire(&self, tier: Tier) -> TierPermit {
        let sem = self.semaphore(tier);
        // acquire_owned only fails if the semaphore is closed, which never
        // happens: TierGates owns them for the process lifetime.
        let permit = sem
            .acquire_owned()
            .await
            .expect("tier semaphore closed");
        debug!(tier = %tier, available = self.available(tier), "admission slot acquired");
        TierPermit {
            tier,
            _permit: permit,
        }
    }

    /// Snapshot of free slots, for telemetry.
    pub fn available(&self, tier: Tier) -> usize {
        self.semaphore(tier).available_permits()
    }

    fn semaphore(&self, tier: Tier) -> Arc<Semaphore> {
        match tier {
            Tier::Simple => Arc::clone(&self.simple),
            Tier::Complex => Arc::clone(&self.complex),
            Tier::Critical => Arc::clone(&self.critical),
        }
    }
}
