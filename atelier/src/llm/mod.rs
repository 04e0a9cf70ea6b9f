//! LLM client abstraction.
//!
//! The core never calls a model directly; classification, planning, and
//! single-turn replies go through this trait, and agent capabilities wrap it
//! behind their own handlers. Implementations live outside the core (or in
//! [`MockLlm`] / [`ScriptedLlm`] for tests and examples).

mod mock;

pub use mock::{MockLlm, ScriptedLlm};

use async_trait::async_trait;
use thiserror::Error;

use a2a_event::TokenUsage;

#[derive(Debug, Error)]
pub enum LlmError {
    /// Transient transport/provider failure; retryable.
    #[error("llm call failed: {0}")]
    CallFailed(String),
    /// Provider rate limit; retryable after backoff.
    #[error("llm rate limited: {0}")]
    RateLimited(String),
    /// The call did not finish within its deadline.
    #[error("llm call timed out")]
    Timeout,
}

impl LlmError {
    /// Whether a retry with backoff can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::CallFailed(_) | LlmError::RateLimited(_) | LlmError::Timeout
        )
    }
}

/// One completion: text plus the provider's token accounting.
#[derive(Clone, Debug)]
pub struct LlmReply {
    pub text: String,
    pub usage: TokenUsage,
}

impl LlmReply {
    pub fn new(text: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            text: text.into(),
            usage,
        }
    }
}

/// Request/response black box over a model provider.
///
/// **Interaction**: used by the router's classifiers, the planner, the
/// single-turn responder, and `LlmAgent` handlers on the A2A bus.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One prompt in, one reply out. Implementations own their own model
    /// selection, system prompt framing, and transport retries below this
    /// seam; the core applies its own retry policy above it.
    async fn complete(&self, prompt: &str) -> Result<LlmReply, LlmError>;
}
