//! Black-box end-to-end tests driving the gate executor's published
//! scenarios through [`GateExecutor::execute`] alone — no internal module
//! is touched directly.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use wardline_core::data_need::LiveCategory;
use wardline_core::kv::{InMemoryKv, KvStore};
use wardline_core::live_data::LiveDataOrchestrator;
use wardline_core::llm::{CompletionRequest, CompletionResponse, LLMClient, StopReason, TokenUsage};
use wardline_core::providers::synthetic::SyntheticStockProvider;
use wardline_core::providers::ProviderRegistry;
use wardline_core::redirect::RedirectDecision;
use wardline_core::safety::SafetyRenderer;
use wardline_core::{Error, GateExecutor, PipelineResult};

struct EchoLLM {
    reply: String,
}

#[async_trait]
impl LLMClient for EchoLLM {
    async fn complete(&self, _request: CompletionRequest) -> wardline_core::Result<CompletionResponse> {
        Ok(CompletionResponse {
            id: "e2e".to_string(),
            model: "e2e-model".to_string(),
            content: self.reply.clone(),
            stop_reason: Some(StopReason::EndTurn),
            usage: TokenUsage { input_tokens: 4, output_tokens: 4 },
            timestamp: Utc::now(),
        })
    }

    fn provider_name(&self) -> &str {
        "echo"
    }
}

fn executor_with(reply: &str, registry: ProviderRegistry) -> GateExecutor {
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
    let live_data = LiveDataOrchestrator::new(registry);
    let llm: Arc<dyn LLMClient> = Arc::new(EchoLLM { reply: reply.to_string() });
    GateExecutor::new(kv, live_data, llm)
}

fn executor(reply: &str) -> GateExecutor {
    executor_with(reply, ProviderRegistry::with_synthetic_defaults())
}

/// A live stock query with working providers succeeds and carries the
/// provider's numeric figure through into the generated text.
#[tokio::test]
async fn stock_query_with_live_data_succeeds() {
    let executor = executor("AAPL is trading around $187.43, up 0.65% today.");
    let result = executor.execute("alice", "What's AAPL trading at?", None).await;
    match result {
        PipelineResult::Success { text } => assert!(text.contains("187.43")),
        other => panic!("expected Success, got {other:?}"),
    }
}

/// A query over a category with no registered provider, whose fallback mode
/// is `Refuse`, stops the turn outright rather than degrading or generating
/// anything.
#[tokio::test]
async fn missing_stock_provider_stops_the_turn() {
    let executor = executor_with("irrelevant", ProviderRegistry::new());
    let result = executor.execute("bob", "What's AAPL trading at?", None).await;
    assert!(matches!(result, PipelineResult::Stopped { .. }), "expected Stopped, got {result:?}");
}

/// Same as above for the time domain, which also refuses rather than
/// qualitatively degrading on a failed fetch.
#[tokio::test]
async fn missing_time_provider_stops_the_turn() {
    let executor = executor_with("irrelevant", ProviderRegistry::new());
    let result = executor.execute("bob", "What time is it in Tokyo?", None).await;
    assert!(matches!(result, PipelineResult::Stopped { .. }), "expected Stopped, got {result:?}");
}

/// A query spanning one working category (stock) and one category with no
/// registered provider (time) stops the turn outright: a failed time fetch
/// poisons the whole response regardless of what else succeeded, and the
/// caller is only offered retry-or-cancel, never "proceed degraded".
#[tokio::test]
async fn mixed_success_and_time_failure_stops_with_retry_or_cancel() {
    let mut registry = ProviderRegistry::new();
    registry.register(LiveCategory::Stock, Arc::new(SyntheticStockProvider));
    let executor = executor_with("AAPL is at $187.43; it's currently unclear what time it is in Tokyo.", registry);

    let result = executor
        .execute("ivan", "what's AAPL trading at and what time is it in Tokyo", None)
        .await;
    match result {
        PipelineResult::Stopped { user_options, .. } => {
            assert_eq!(user_options, vec![wardline_core::pipeline::UserOption::Retry, wardline_core::pipeline::UserOption::Cancel]);
        }
        other => panic!("expected Stopped, got {other:?}"),
    }
}

/// A crisis message never reaches generation; the response begins with the
/// structurally verified crisis block and awaits acknowledgment.
#[tokio::test]
async fn crisis_message_awaits_acknowledgment_before_any_generation() {
    let executor = executor("this text must never be shown");
    let result = executor.execute("carol", "I want to kill myself", None).await;
    match result {
        PipelineResult::AwaitAck { response_text, ack_token } => {
            assert!(SafetyRenderer::verify_structure(&response_text));
            assert!(!ack_token.is_empty());
        }
        other => panic!("expected AwaitAck, got {other:?}"),
    }
}

/// A supplied ack token from a prior crisis turn bypasses the veto exactly
/// once; replaying it a second time re-triggers the crisis hold.
#[tokio::test]
async fn ack_token_bypasses_veto_exactly_once() {
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
    let live_data = LiveDataOrchestrator::new(ProviderRegistry::with_synthetic_defaults());
    let llm: Arc<dyn LLMClient> = Arc::new(EchoLLM { reply: "acknowledged, let's talk.".to_string() });
    let executor = GateExecutor::new(kv, live_data, llm);

    let first = executor.execute("dana", "I want to kill myself", None).await;
    let ack_token = match first {
        PipelineResult::AwaitAck { ack_token, .. } => ack_token,
        other => panic!("expected AwaitAck, got {other:?}"),
    };

    let second = executor.execute("dana", "I want to kill myself", Some(&ack_token)).await;
    assert!(!matches!(second, PipelineResult::AwaitAck { .. }), "token should have bypassed the veto");

    let third = executor.execute("dana", "I want to kill myself", Some(&ack_token)).await;
    assert!(matches!(third, PipelineResult::AwaitAck { .. }), "a consumed token must not work twice");
}

/// An open crisis session blocks every subsequent message for that user,
/// regardless of the new message's own content, until it is acknowledged.
#[tokio::test]
async fn open_crisis_session_blocks_unrelated_messages_until_acknowledged() {
    let executor = executor("should never be returned");

    let first = executor.execute("heidi", "I want to kill myself", None).await;
    assert!(matches!(first, PipelineResult::AwaitAck { .. }));

    let second = executor.execute("heidi", "what's AAPL trading at?", None).await;
    let ack_token = match second {
        PipelineResult::AwaitAck { ack_token, .. } => ack_token,
        other => panic!("expected AwaitAck for an unrelated message mid-session, got {other:?}"),
    };

    let third = executor.execute("heidi", "what's AAPL trading at?", Some(&ack_token)).await;
    assert!(!matches!(third, PipelineResult::AwaitAck { .. }), "ack token should have closed the session");
}

/// An explicit goal statement redirects before any LLM call is made.
#[tokio::test]
async fn goal_statement_redirects_before_generation() {
    let executor = executor("should never be returned");
    let result = executor
        .execute("erin", "I want to learn Rust to build a web server", None)
        .await;
    match result {
        PipelineResult::Redirected { decision } => {
            assert_eq!(decision, RedirectDecision::DesignerBypassExplore);
        }
        other => panic!("expected Redirected, got {other:?}"),
    }
}

/// An ordinary local-knowledge question with no safety or live-data
/// involvement runs the full loop and returns the model's text unmodified.
#[tokio::test]
async fn ordinary_local_query_runs_end_to_end() {
    let executor = executor("Rust's ownership model enforces memory safety without a garbage collector.");
    let result = executor.execute("frank", "explain Rust ownership briefly", None).await;
    match result {
        PipelineResult::Success { text } => assert!(text.contains("ownership")),
        other => panic!("expected Success, got {other:?}"),
    }
}

/// The executor never panics or propagates a raw error out of `execute`,
/// even when nothing downstream is configured to succeed gracefully.
#[tokio::test]
async fn executor_never_panics_on_empty_message() {
    let executor = executor("");
    let result = executor.execute("gary", "", None).await;
    assert!(!matches!(result, PipelineResult::Error { .. }), "unexpected error: {result:?}");
}

/// Sanity check that the crate's error type round-trips through `Display`
/// the way the executor relies on when converting to `PipelineResult::Error`.
#[test]
fn error_display_is_non_empty() {
    let err = Error::invalid_input("bad input");
    assert!(!err.to_string().is_empty());
}
