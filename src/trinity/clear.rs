//! CLEAR audit — advisory five-axis scoring of a reasoning ledger.
//!
//! The auditor feeds the serialized ledger back through the model backend
//! and parses a JSON-only verdict. It never fails the request: any backend,
//! budget, or parse problem degrades to the all-zeros fallback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::{ChatMessage, ChatRequest, ModelBackend};
use crate::trinity::guards::{InvocationBudget, Watchdog};
use crate::trinity::ledger::{strip_code_fence, ReasoningLedger};
use crate::trinity::stages::TEMPERATURE_DIAGNOSTIC;

const AXIS_MIN: f64 = 0.0;
const AXIS_MAX: f64 = 5.0;

/// Default escalation threshold; the tuner drifts it from observed scores.
pub const DEFAULT_CLEAR_THRESHOLD: f64 = 3.0;

const SCORING_SYSTEM_PROMPT: &str = "\
You are a reasoning auditor. Score the reasoning ledger you are given on \
five axes, each 0-5: clarity (is the chain of thought legible), leverage \
(does it use the strongest available evidence), efficiency (no wasted or \
circular steps), alignment (does the answer address the request), and \
resilience (does it hold under its own stated assumptions). Respond with \
JSON only, no prose: {\"clarity\":n,\"leverage\":n,\"efficiency\":n,\
\"alignment\":n,\"resilience\":n,\"overall\":n}.";

/// Clamp a raw axis value into [0, 5]. NaN collapses to 0.
pub fn clamp_axis(value: f64) -> f64 {
    if value.is_nan() {
        return AXIS_MIN;
    }
    value.clamp(AXIS_MIN, AXIS_MAX)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClearScore {
    pub clarity: f64,
    pub leverage: f64,
    pub efficiency: f64,
    pub alignment: f64,
    pub resilience: f64,
    pub overall: f64,
}

impl ClearScore {
    /// All-zeros fallback for a failed or malformed audit.
    pub fn fallback() -> Self {
        Self::default()
    }

    /// Clamp every axis and recompute `overall` as the arithmetic mean when
    /// the model reported 0 (or nothing usable).
    pub fn normalized(mut self) -> Self {
        self.clarity = clamp_axis(self.clarity);
        self.leverage = clamp_axis(self.leverage);
        self.efficiency = clamp_axis(self.efficiency);
        self.alignment = clamp_axis(self.alignment);
        self.resilience = clamp_axis(self.resilience);
        self.overall = clamp_axis(self.overall);
        if self.overall == 0.0 {
            self.overall = (self.clarity
                + self.leverage
                + self.efficiency
                + self.alignment
                + self.resilience)
                / 5.0;
        }
        self
    }
}

/// Run the advisory audit. Returns the fallback score on any failure.
pub async fn audit_ledger(
    backend: &dyn ModelBackend,
    budget: &InvocationBudget,
    watchdog: &Watchdog,
    model: &str,
    ledger: &ReasoningLedger,
) -> ClearScore {
    if watchdog.check().is_err() {
        warn!("watchdog expired before audit — using fallback score");
        return ClearScore::fallback();
    }
    // An exhausted budget fails the audit, not the request.
    if let Err(e) = budget.increment() {
        warn!(err = %e, "no budget left for audit — using fallback score");
        return ClearScore::fallback();
    }

    let req = ChatRequest::new(
        model,
        vec![
            ChatMessage::system(SCORING_SYSTEM_PROMPT),
            ChatMessage::user(ledger.to_audit_json()),
        ],
        TEMPERATURE_DIAGNOSTIC,
    );

    match backend.chat(req, watchdog.remaining()).await {
        Ok(outcome) => match serde_json::from_str::<ClearScore>(strip_code_fence(&outcome.content)) {
            Ok(score) => score.normalized(),
            Err(e) => {
                warn!(err = %e, "audit response was not valid JSON — using fallback score");
                ClearScore::fallback()
            }
        },
        Err(e) => {
            warn!(err = %e, "audit backend call failed — using fallback score");
            ClearScore::fallback()
        }
    }
}

// ─── Auto-tuned escalation threshold ──────────────────────────────────────────

/// Process-wide escalation threshold, updated atomically from observed
/// overall scores (exponential moving average, bounded so the gateway never
/// escalates everything or nothing).
pub struct ClearTuner {
    /// f64 bits of the current threshold.
    threshold_bits: AtomicU64,
}

const TUNER_ALPHA: f64 = 0.05;
const TUNER_MARGIN: f64 = 0.5;
const TUNER_MIN: f64 = 2.0;
const TUNER_MAX: f64 = 4.0;

impl ClearTuner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            threshold_bits: AtomicU64::new(DEFAULT_CLEAR_THRESHOLD.to_bits()),
        })
    }

    pub fn threshold(&self) -> f64 {
        f64::from_bits(self.threshold_bits.load(Ordering::Relaxed))
    }

    /// Fold an observed overall score into the threshold.
    ///
    /// Fallback (all-zero) audits carry no signal and are skipped.
    pub fn observe(&self, overall: f64) {
        if overall <= 0.0 {
            return;
        }
        let _ = self
            .threshold_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let current = f64::from_bits(bits);
                let target = (overall - TUNER_MARGIN).clamp(TUNER_MIN, TUNER_MAX);
                let next = current + TUNER_ALPHA * (target - current);
                Some(next.to_bits())
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_is_idempotent() {
        for raw in [-3.0, 0.0, 2.5, 5.0, 17.0, f64::NAN] {
            let once = clamp_axis(raw);
            assert_eq!(clamp_axis(once), once);
            assert!((AXIS_MIN..=AXIS_MAX).contains(&once));
        }
    }

    #[test]
    fn normalized_recomputes_zero_overall_as_mean() {
        let score = ClearScore {
            clarity: 5.0,
            leverage: 4.0,
            efficiency: 3.0,
            alignment: 2.0,
            resilience: 1.0,
            overall: 0.0,
        }
        .normalized();
        assert!((score.overall - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn normalized_keeps_model_overall_when_nonzero() {
        let score = ClearScore {
            clarity: 5.0,
            leverage: 5.0,
            efficiency: 5.0,
            alignment: 5.0,
            resilience: 5.0,
            overall: 4.2,
        }
        .normalized();
        assert!((score.overall - 4.2).abs() < f64::EPSILON);
    }

    #[test]
    fn normalized_clamps_out_of_range_axes() {
        let score = ClearScore {
            clarity: 9.0,
            leverage: -2.0,
            efficiency: 3.0,
            alignment: 3.0,
            resilience: 3.0,
            overall: 7.5,
        }
        .normalized();
        assert_eq!(score.clarity, 5.0);
        assert_eq!(score.leverage, 0.0);
        assert_eq!(score.overall, 5.0);
    }

    #[test]
    fn tuner_drifts_toward_observed_scores_within_bounds() {
        let tuner = ClearTuner::new();
        assert_eq!(tuner.threshold(), DEFAULT_CLEAR_THRESHOLD);

        for _ in 0..500 {
            tuner.observe(5.0);
        }
        let high = tuner.threshold();
        assert!(high > DEFAULT_CLEAR_THRESHOLD);
        assert!(high <= TUNER_MAX);

        for _ in 0..500 {
            tuner.observe(0.5);
        }
        let low = tuner.threshold();
        assert!(low < high);
        assert!(low >= TUNER_MIN);
    }

    #[test]
    fn tuner_ignores_fallback_scores() {
        let tuner = ClearTuner::new();
        tuner.observe(0.0);
        assert_eq!(tuner.threshold(), DEFAULT_CLEAR_THRESHOLD);
    }
}
