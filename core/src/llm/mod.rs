//! External LLM interface: the generation gate's view of a
//! language model provider. Grounded on a minimal Anthropic Messages API
//! client; any provider satisfying [`LLMClient`] can be substituted.

pub mod client;
pub mod types;

pub use client::AnthropicClient;
pub use types::{ChatMessage, ChatRole, CompletionRequest, CompletionResponse, StopReason, TokenUsage};

use async_trait::async_trait;

use crate::error::Result;

/// Capability the generation gate depends on to produce a candidate
/// response.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Identifier used in logs and audit metadata.
    fn provider_name(&self) -> &str;
}
