//! Gate executor: runs the canonical stage order for a
//! single turn over a flattened [`PipelineState`], short-circuiting on
//! shield vetoes and redirects, and stopping outright on a critical
//! invariant violation.
//!
//! Stage order: intent → shield → lens → stance → capability →
//! [redirect] → generation ↔ personality-validate (≤ [`MAX_REGENERATIONS`]) →
//! spark → invariant → safety-rendering.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use wardline_core_derive::GateStage;

use crate::data_need::{DataNeedClassification, LiveCategory, TruthMode};
use crate::error::{Error, Result};
use crate::intent::{IntentClassification, IntentClassifier};
use crate::invariants::{InvariantCheckInput, InvariantChecker, Violation, MAX_REGENERATIONS};
use crate::kv::KvStore;
use crate::live_data::{EvidencePack, LiveDataOrchestrator, ResponseConstraints};
use crate::llm::{ChatMessage, CompletionRequest, LLMClient};
use crate::redirect::{ModeDetector, RedirectDecision, RedirectInput, SessionMode};
use crate::risk::{RiskAssessment, StakesLevel};
use crate::safety::SafetyRenderer;
use crate::shield::{ShieldEngine, ShieldState};
use crate::spark::{SparkDecision, SparkGate, SparkHistory, SparkInput, Stance, VerificationState};

/// Recommendation-language markers the turn-state builder scans generated
/// text for, so the invariant checker's action-recommendation invariant has
/// a real signal instead of a hardcoded constant.
const ACTION_RECOMMENDATION_PATTERNS: &[&str] = &[
    "you should",
    "i recommend",
    "i suggest",
    "my advice",
    "consider doing",
    "you ought to",
    "i'd recommend",
];

fn detect_action_recommendation(text: &str) -> bool {
    let lower = text.to_lowercase();
    ACTION_RECOMMENDATION_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Options offered to the user when a turn stops short of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserOption {
    Retry,
    Cancel,
    ProceedDegraded,
}

/// Implemented by the marker structs identifying each stage in the fixed
/// pipeline order, via `#[derive(GateStage)]`.
pub trait GateStage: Send + Sync {
    fn stage_id(&self) -> &'static str;
    fn stage_name(&self) -> &'static str;
}

#[derive(GateStage)]
#[gate(id = "intent")]
pub struct IntentGate;

#[derive(GateStage)]
#[gate(id = "shield")]
pub struct ShieldGate;

#[derive(GateStage)]
#[gate(id = "lens")]
pub struct LensGate;

#[derive(GateStage)]
#[gate(id = "stance")]
pub struct StanceGate;

#[derive(GateStage)]
#[gate(id = "capability")]
pub struct CapabilityGate;

#[derive(GateStage)]
#[gate(id = "redirect")]
pub struct RedirectGate;

#[derive(GateStage)]
#[gate(id = "generation")]
pub struct GenerationGate;

#[derive(GateStage)]
#[gate(id = "personality_validate")]
pub struct PersonalityValidateGate;

#[derive(GateStage)]
#[gate(id = "spark")]
pub struct SparkStageGate;

#[derive(GateStage)]
#[gate(id = "invariant")]
pub struct InvariantGate;

#[derive(GateStage)]
#[gate(id = "safety_rendering")]
pub struct SafetyRenderingGate;

/// Flattened per-turn state threaded through the gate sequence. Kept flat
/// (rather than nested/cyclic) so any stage can read any prior stage's
/// output without a reference cycle.
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    pub user_id: String,
    pub message: String,
    pub supplied_ack_token: Option<String>,
    pub intent: Option<IntentClassification>,
    pub shield_state: Option<ShieldState>,
    pub redirect: Option<RedirectDecision>,
    pub classification: Option<DataNeedClassification>,
    pub risk: Option<RiskAssessment>,
    pub evidence: Option<EvidencePack>,
    pub stance: Option<Stance>,
    pub generated_text: Option<String>,
    pub regeneration_count: u8,
    pub spark_decision: Option<SparkDecision>,
    pub violations: Vec<Violation>,
}

/// Final outcome of running the gate executor for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineResult {
    /// Normal completion; `text` is ready to send to the user.
    Success { text: String },
    /// A critical invariant fired, or the shield vetoed generation outright.
    Stopped { reason: String, user_options: Vec<UserOption> },
    /// The shield vetoed generation and is waiting on user acknowledgment.
    AwaitAck { response_text: String, ack_token: String },
    /// A non-critical invariant fired; `text` still renders but is flagged.
    Degraded { text: String, violations: Vec<String> },
    /// The turn was redirected into a different mode before generation ran.
    Redirected { decision: RedirectDecision },
    /// An internal error occurred.
    Error { message: String },
}

/// Ties every gate component together and runs them in the canonical order.
pub struct GateExecutor {
    kv: Arc<dyn KvStore>,
    intent: IntentClassifier,
    shield: ShieldEngine,
    mode_detector: ModeDetector,
    live_data: LiveDataOrchestrator,
    invariant_checker: InvariantChecker,
    spark_gate: SparkGate,
    llm: Arc<dyn LLMClient>,
    max_regenerations: u8,
}

const SESSION_MODE_TTL_SECONDS: u64 = 7 * 86_400;

impl GateExecutor {
    pub fn new(kv: Arc<dyn KvStore>, live_data: LiveDataOrchestrator, llm: Arc<dyn LLMClient>) -> Self {
        Self {
            intent: IntentClassifier::new(),
            shield: ShieldEngine::new(kv.clone()),
            mode_detector: ModeDetector::new(),
            live_data,
            invariant_checker: InvariantChecker::new(),
            spark_gate: SparkGate::new(),
            llm,
            max_regenerations: MAX_REGENERATIONS,
            kv,
        }
    }

    pub fn with_max_regenerations(mut self, max: u8) -> Self {
        self.max_regenerations = max;
        self
    }

    fn session_mode_key(user_id: &str) -> String {
        format!("pipeline:session_mode:{user_id}")
    }

    async fn load_session_mode(&self, user_id: &str) -> SessionMode {
        match self.kv.get(&Self::session_mode_key(user_id)).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or(SessionMode::None),
            _ => SessionMode::None,
        }
    }

    async fn store_session_mode(&self, user_id: &str, mode: SessionMode) {
        if let Ok(serialized) = serde_json::to_string(&mode) {
            let result = self
                .kv
                .set(&Self::session_mode_key(user_id), &serialized, Some(SESSION_MODE_TTL_SECONDS))
                .await;
            if let Err(err) = result {
                tracing::warn!(%user_id, error = %err, "failed to persist session mode");
            }
        }
    }

    /// Run the full pipeline for a single turn.
    pub async fn execute(
        &self,
        user_id: &str,
        message: &str,
        supplied_ack_token: Option<&str>,
    ) -> PipelineResult {
        match self.execute_inner(user_id, message, supplied_ack_token).await {
            Ok(result) => result,
            Err(err) => PipelineResult::Error { message: err.to_string() },
        }
    }

    async fn execute_inner(
        &self,
        user_id: &str,
        message: &str,
        supplied_ack_token: Option<&str>,
    ) -> Result<PipelineResult> {
        let mut state = PipelineState {
            user_id: user_id.to_string(),
            message: message.to_string(),
            supplied_ack_token: supplied_ack_token.map(str::to_string),
            ..Default::default()
        };

        // intent: runs ahead of every other stage so the safety signal and
        // urgency it derives from the raw message are available to the
        // shield (and anything downstream) without re-deriving them.
        let intent = self.intent.classify(message);
        state.intent = Some(intent.clone());

        // shield: both crisis and warn halt the pipeline pending an
        // out-of-band acknowledgment; only the crisis block is held to the
        // structural resource-block invariant.
        let shield_decision = self.shield.check(user_id, intent.safety_signal, supplied_ack_token).await?;
        state.shield_state = Some(shield_decision.state);

        if shield_decision.state == ShieldState::Crisis {
            let crisis_text = shield_decision.response_text.unwrap_or_default();
            if !SafetyRenderer::verify_structure(&crisis_text) {
                return Ok(PipelineResult::Stopped {
                    reason: "crisis response failed structural verification".to_string(),
                    user_options: vec![UserOption::Retry, UserOption::Cancel],
                });
            }
            return Ok(PipelineResult::AwaitAck {
                response_text: crisis_text,
                ack_token: shield_decision.ack_token.unwrap_or_default(),
            });
        }

        if shield_decision.state == ShieldState::Warned {
            return Ok(PipelineResult::AwaitAck {
                response_text: shield_decision.response_text.unwrap_or_default(),
                ack_token: shield_decision.ack_token.unwrap_or_default(),
            });
        }

        // redirect (mode detector), session mode persisted across turns
        let active_session_mode = self.load_session_mode(user_id).await;
        let redirect = self.mode_detector.evaluate(&RedirectInput {
            message,
            active_session_mode,
        });
        state.redirect = Some(redirect);
        let next_mode = next_session_mode(active_session_mode, redirect);
        if next_mode != active_session_mode {
            self.store_session_mode(user_id, next_mode).await;
        }
        if redirect != RedirectDecision::None {
            return Ok(PipelineResult::Redirected { decision: redirect });
        }

        // lens (live-data orchestrator) + risk
        let lens_result = self.live_data.orchestrate(message).await;
        state.classification = Some(lens_result.classification.clone());
        state.risk = Some(lens_result.risk.clone());
        state.evidence = Some(lens_result.evidence.clone());

        // stance: force-high turns operate under "lens" (low stakes,
        // qualify and answer) or "shield" (high stakes, numeric precision
        // demanded); an ack bypass always operates under "control"; anything
        // else is free to operate under "sword".
        let stance = if shield_decision.state == ShieldState::AckBypass {
            Stance::Control
        } else if lens_result.risk.force_high {
            if matches!(lens_result.risk.stakes_level, StakesLevel::High | StakesLevel::Critical) {
                Stance::Shield
            } else {
                Stance::Lens
            }
        } else {
            Stance::Sword
        };
        state.stance = Some(stance);

        if lens_result.evidence.constraints == ResponseConstraints::Refuse {
            let involves_time = lens_result.classification.live_categories.contains(&LiveCategory::Time);
            let user_options = if involves_time {
                vec![UserOption::Retry, UserOption::Cancel]
            } else {
                vec![UserOption::Retry, UserOption::ProceedDegraded]
            };
            return Ok(PipelineResult::Stopped {
                reason: "live data required for this request is unavailable".to_string(),
                user_options,
            });
        }

        // generation <-> personality-validate, bounded by max_regenerations
        let system_prompt = self.build_system_prompt(&lens_result.evidence);
        let mut generated = String::new();
        let mut regenerations = 0u8;
        loop {
            let response = self
                .llm
                .complete(
                    CompletionRequest::new(vec![ChatMessage::user(message.to_string())])
                        .with_system(system_prompt.clone()),
                )
                .await?;
            generated = response.content;

            if self.passes_personality_validation(&generated) || regenerations >= self.max_regenerations {
                break;
            }
            regenerations += 1;
        }
        state.regeneration_count = regenerations;
        state.generated_text = Some(generated.clone());

        // spark
        let spark_input = SparkInput {
            stance,
            shield_intervened: shield_decision.state != ShieldState::Clear,
            is_crisis_or_control: stance == Stance::Control,
            stakes_level: lens_result.risk.stakes_level,
            history: SparkHistory::default(),
            verification: VerificationState::Complete,
        };
        let spark_decision = self.spark_gate.evaluate(&spark_input);
        state.spark_decision = Some(spark_decision);

        // invariant
        let verification_degraded = !matches!(lens_result.evidence.constraints, ResponseConstraints::Unconstrained);
        let action_recommendations_present = detect_action_recommendation(&generated);
        let action_recommendations_have_explicit_source = !action_recommendations_present
            || lens_result.classification.truth_mode == TruthMode::Local
            || lens_result.evidence.results.values().any(|r| r.is_ok());

        let invariant_input = InvariantCheckInput {
            is_crisis: false,
            crisis_response_text: None,
            soft_veto_active: false,
            ack_bypass_granted: shield_decision.state == ShieldState::AckBypass,
            spark_present: spark_decision == SparkDecision::Eligible,
            stance,
            verification_degraded,
            confidence_is_high: lens_result.risk.stakes_level == StakesLevel::Low,
            regeneration_count: state.regeneration_count,
            action_recommendations_present,
            action_recommendations_have_explicit_source,
            live_data_constraints: Some(lens_result.evidence.constraints),
            immediate_domain_fetch_failed: lens_result.evidence.constraints
                == ResponseConstraints::NoNumericClaims,
            allowed_numeric_tokens: &lens_result.evidence.allowed_numeric_tokens,
            response_text: &generated,
        };
        let violations = self.invariant_checker.check(&invariant_input);
        let critical = violations.iter().any(|v| v.critical);
        state.violations = violations.clone();

        if critical {
            let summary = violations
                .iter()
                .filter(|v| v.critical)
                .map(|v| v.detail.clone())
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(PipelineResult::Stopped {
                reason: summary,
                user_options: vec![UserOption::Retry, UserOption::Cancel],
            });
        }

        // safety-rendering: nothing further to prepend on a non-crisis turn.
        if violations.is_empty() {
            Ok(PipelineResult::Success { text: generated })
        } else {
            Ok(PipelineResult::Degraded {
                text: generated,
                violations: violations.into_iter().map(|v| v.detail).collect(),
            })
        }
    }

    fn build_system_prompt(&self, evidence: &EvidencePack) -> String {
        if evidence.system_prompt_additions.is_empty() {
            "You are a careful, honest assistant.".to_string()
        } else {
            format!(
                "You are a careful, honest assistant.\n\n{}",
                evidence.system_prompt_additions.join("\n")
            )
        }
    }

    /// Minimum viable response: non-empty, no leftover prompt scaffolding,
    /// and long enough to be a real answer rather than a single stray token.
    fn passes_personality_validation(&self, text: &str) -> bool {
        const MIN_CHARS: usize = 3;
        const LEAKED_SCAFFOLDING: &[&str] = &["as an ai language model", "system prompt", "[system]"];

        let trimmed = text.trim();
        if trimmed.chars().count() < MIN_CHARS {
            return false;
        }
        let lower = trimmed.to_lowercase();
        if LEAKED_SCAFFOLDING.iter().any(|marker| lower.contains(marker)) {
            return false;
        }
        true
    }
}

fn next_session_mode(current: SessionMode, decision: RedirectDecision) -> SessionMode {
    match decision {
        RedirectDecision::ContinueRunner => SessionMode::PracticeDrill,
        RedirectDecision::ContinueDesigner => SessionMode::Explore,
        RedirectDecision::Designer | RedirectDecision::DesignerBypassExplore => SessionMode::Explore,
        RedirectDecision::None => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use crate::llm::{CompletionResponse, StopReason, TokenUsage};
    use crate::providers::ProviderRegistry;
    use async_trait::async_trait;
    use chrono::Utc;

    struct StubLLM {
        reply: String,
    }

    #[async_trait]
    impl LLMClient for StubLLM {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            Ok(CompletionResponse {
                id: "stub".to_string(),
                model: "stub-model".to_string(),
                content: self.reply.clone(),
                stop_reason: Some(StopReason::EndTurn),
                usage: TokenUsage { input_tokens: 1, output_tokens: 1 },
                timestamp: Utc::now(),
            })
        }

        fn provider_name(&self) -> &str {
            "stub"
        }
    }

    fn executor(reply: &str) -> GateExecutor {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let live_data = LiveDataOrchestrator::new(ProviderRegistry::with_synthetic_defaults());
        let llm: Arc<dyn LLMClient> = Arc::new(StubLLM { reply: reply.to_string() });
        GateExecutor::new(kv, live_data, llm)
    }

    #[tokio::test]
    async fn ordinary_turn_succeeds() {
        let executor = executor("The capital of France is Paris.");
        let result = executor.execute("u1", "what is the capital of France", None).await;
        assert!(matches!(result, PipelineResult::Success { .. }));
    }

    #[tokio::test]
    async fn crisis_message_awaits_acknowledgment() {
        let executor = executor("irrelevant");
        let result = executor.execute("u1", "I want to kill myself", None).await;
        match result {
            PipelineResult::AwaitAck { response_text, .. } => {
                assert!(SafetyRenderer::verify_structure(&response_text));
            }
            other => panic!("expected AwaitAck, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn warn_signal_halts_pending_acknowledgment() {
        let executor = executor("irrelevant");
        let result = executor.execute("u1", "I feel hopeless lately", None).await;
        match result {
            PipelineResult::AwaitAck { response_text, ack_token } => {
                assert!(!response_text.is_empty());
                assert!(!ack_token.is_empty());
            }
            other => panic!("expected AwaitAck, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn goal_statement_redirects_before_generation() {
        let executor = executor("irrelevant");
        let result = executor
            .execute("u1", "I want to learn Rust to build a web server", None)
            .await;
        match result {
            PipelineResult::Redirected { decision } => {
                assert_eq!(decision, RedirectDecision::DesignerBypassExplore);
            }
            other => panic!("expected Redirected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn all_providers_missing_refuses_live_data_query() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let live_data = LiveDataOrchestrator::new(ProviderRegistry::new());
        let llm: Arc<dyn LLMClient> = Arc::new(StubLLM { reply: "AAPL is at $123".to_string() });
        let executor = GateExecutor::new(kv, live_data, llm);

        let result = executor.execute("u1", "What's AAPL trading at?", None).await;
        assert!(matches!(result, PipelineResult::Stopped { .. }));
    }

    #[tokio::test]
    async fn mixed_success_and_failure_still_refuses_on_time_failure() {
        use crate::providers::synthetic::SyntheticStockProvider;

        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let mut registry = ProviderRegistry::new();
        registry.register(crate::data_need::LiveCategory::Stock, Arc::new(SyntheticStockProvider));
        let live_data = LiveDataOrchestrator::new(registry);
        let llm: Arc<dyn LLMClient> = Arc::new(StubLLM { reply: "AAPL is at $123".to_string() });
        let executor = GateExecutor::new(kv, live_data, llm);

        let result = executor
            .execute("u1", "what's AAPL trading at and what time is it in Tokyo", None)
            .await;
        match result {
            PipelineResult::Stopped { user_options, .. } => {
                assert_eq!(user_options, vec![UserOption::Retry, UserOption::Cancel]);
            }
            other => panic!("expected Stopped, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_generation_regenerates_up_to_cap() {
        let executor = executor("");
        let result = executor.execute("u1", "tell me a joke", None).await;
        match result {
            PipelineResult::Success { text } | PipelineResult::Degraded { text, .. } => {
                assert!(text.is_empty());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
