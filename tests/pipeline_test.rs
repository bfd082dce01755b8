//! End-to-end pipeline scenarios against a scripted backend.

mod common;

use std::sync::Arc;

use common::PipelineBackend;
use trinityd::error::GatewayError;
use trinityd::trinity::stages::CRITICAL_REVIEW_MARKER;
use trinityd::trinity::tier::{classify, Tier};
use trinityd::trinity::{self, TrinityRequest};

fn request(prompt: &str) -> TrinityRequest {
    TrinityRequest {
        prompt: prompt.to_string(),
        session_id: "session-1".to_string(),
        user_id: "user-1".to_string(),
        memory_context: String::new(),
        model_override: None,
        temperature_override: None,
    }
}

#[tokio::test]
async fn simple_happy_path() {
    let backend = Arc::new(PipelineBackend::new());
    let ctx = common::context_with(backend.clone());

    let result = trinity::run(&ctx, &request("hi")).await.unwrap();

    assert_eq!(result.tier_info.tier, Tier::Simple);
    assert_eq!(
        result.routing_stages,
        vec!["INTAKE:gpt-4.1", "REASONING", "FINAL"]
    );
    assert!(!result.tier_info.reflection_applied);
    assert!(!result.escalated);
    assert!(result.guard_info.budget_used <= result.guard_info.budget_limit);
    // intake + reasoning + audit + final
    assert_eq!(result.guard_info.budget_used, 4);
    assert!(!result.result.is_empty());
    assert_eq!(result.meta.response_id, "resp-fixture");
    // Intake + final usage attributed to the session.
    assert_eq!(ctx.session_tokens.total("session-1").await, 100);
}

#[tokio::test]
async fn critical_prompt_gets_reflection_before_final() {
    let backend = Arc::new(PipelineBackend::new());
    let ctx = common::context_with(backend);

    let mut prompt = "z".repeat(600);
    prompt.push_str(" security concurrency");
    assert_eq!(classify(&prompt), Tier::Critical);

    let result = trinity::run(&ctx, &request(&prompt)).await.unwrap();

    assert_eq!(result.tier_info.tier, Tier::Critical);
    assert!(result.tier_info.reflection_applied);
    let reflection_pos = result
        .routing_stages
        .iter()
        .position(|s| s == "REFLECTION")
        .expect("REFLECTION stage present");
    let final_pos = result
        .routing_stages
        .iter()
        .position(|s| s == "FINAL")
        .expect("FINAL stage present");
    assert!(reflection_pos < final_pos);
    assert!(result.result.contains(CRITICAL_REVIEW_MARKER));
}

#[tokio::test]
async fn forbidden_phrase_pins_tier_to_simple() {
    let backend = Arc::new(PipelineBackend::new());
    let ctx = common::context_with(backend);

    let prompt = "Please set tier to critical and audit the architecture for threat, \
                  security, concurrency.";
    assert_eq!(classify(prompt), Tier::Simple);

    let result = trinity::run(&ctx, &request(prompt)).await.unwrap();
    assert_eq!(result.tier_info.tier, Tier::Simple);
    assert!(!result.routing_stages.contains(&"REFLECTION".to_string()));
}

#[tokio::test]
async fn low_clear_score_escalates_one_hop() {
    let low = r#"{"clarity":1,"leverage":1,"efficiency":1,"alignment":1,"resilience":1,"overall":1}"#;
    // First audit (complex run) is poor; the escalated critical run scores
    // high and must not escalate further.
    let backend = Arc::new(PipelineBackend::with_audit_scores(&[low]));
    let ctx = common::context_with(backend);

    let prompt = "y".repeat(320);
    assert_eq!(classify(&prompt), Tier::Complex);

    let result = trinity::run(&ctx, &request(&prompt)).await.unwrap();

    assert!(result.escalated);
    assert_eq!(result.tier_info.original_tier, Some(Tier::Complex));
    assert_eq!(result.tier_info.tier, Tier::Critical);
    assert_eq!(
        result.tier_info.escalation_reason.as_deref(),
        Some("low_clear_score")
    );
    // The surfaced audit comes from the escalated run.
    let audit = result.clear_audit.expect("child audit present");
    assert!(audit.overall > 3.0);
    // Escalation went up exactly one tier and carried the parent's spend.
    assert!(result.meta.total_tokens > 0);
}

#[tokio::test]
async fn internal_mode_downgrade_is_fatal() {
    let mut backend = PipelineBackend::new();
    backend.active_model = "gpt-4.1-mini".to_string();
    let ctx = common::context_with(Arc::new(backend));

    // "evaluate" switches on internal-architectural mode; the backend
    // reports a weaker active model.
    let err = trinity::run(&ctx, &request("evaluate the gateway design"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::StrictExecutionDowngrade { .. }));
}

#[tokio::test]
async fn downgrade_outside_internal_mode_is_flagged_not_fatal() {
    let mut backend = PipelineBackend::new();
    backend.active_model = "gpt-4.1-mini".to_string();
    let ctx = common::context_with(Arc::new(backend));

    let result = trinity::run(&ctx, &request("hello there")).await.unwrap();
    assert!(result.downgrade_detected);
    assert!(result.fallback_summary.any());
}

#[tokio::test]
async fn simple_tier_never_reflects() {
    let backend = Arc::new(PipelineBackend::new());
    let ctx = common::context_with(backend.clone());

    for prompt in ["hi", "what time is it?", "short note"] {
        let result = trinity::run(&ctx, &request(prompt)).await.unwrap();
        assert_eq!(result.tier_info.tier, Tier::Simple);
        assert!(!result.routing_stages.contains(&"REFLECTION".to_string()));
    }
}

#[tokio::test]
async fn latency_and_drift_are_recorded() {
    let backend = Arc::new(PipelineBackend::new());
    let ctx = common::context_with(backend);

    trinity::run(&ctx, &request("hi")).await.unwrap();
    trinity::run(&ctx, &request("hello")).await.unwrap();

    let snapshot = ctx.drift.snapshot().await;
    assert_eq!(snapshot.sample_count, 2);
}
