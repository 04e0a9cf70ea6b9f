//! Mock LLM clients for tests and examples.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use a2a_event::TokenUsage;

use crate::llm::{LlmClient, LlmError, LlmReply};

/// Fixed-reply mock: every call returns the same text and usage.
pub struct MockLlm {
    reply: String,
    usage: TokenUsage,
    calls: AtomicUsize,
}

impl MockLlm {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            usage: TokenUsage::new(10, 10),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Number of `complete` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, _prompt: &str) -> Result<LlmReply, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(LlmReply::new(self.reply.clone(), self.usage))
    }
}

/// Scripted mock: replies (or errors) are popped in order; an exhausted
/// script fails the call so tests notice unexpected extra traffic.
pub struct ScriptedLlm {
    script: Mutex<VecDeque<Result<LlmReply, LlmError>>>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_reply(&self, text: impl Into<String>) {
        self.push(Ok(LlmReply::new(text, TokenUsage::new(10, 10))));
    }

    pub fn push(&self, entry: Result<LlmReply, LlmError>) {
        self.script
            .lock()
            .expect("script lock poisoned")
            .push_back(entry);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _prompt: &str) -> Result<LlmReply, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::CallFailed("script exhausted".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_returns_fixed_reply_and_counts_calls() {
        let llm = MockLlm::new("hello").with_usage(TokenUsage::new(3, 4));
        let reply = llm.complete("anything").await.unwrap();
        assert_eq!(reply.text, "hello");
        assert_eq!(reply.usage.total(), 7);
        let _ = llm.complete("again").await.unwrap();
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn scripted_pops_in_order_then_fails() {
        let llm = ScriptedLlm::new();
        llm.push_reply("first");
        llm.push(Err(LlmError::Timeout));

        assert_eq!(llm.complete("p").await.unwrap().text, "first");
        assert!(matches!(llm.complete("p").await, Err(LlmError::Timeout)));
        assert!(matches!(
            llm.complete("p").await,
            Err(LlmError::CallFailed(_))
        ));
        assert_eq!(llm.calls(), 3);
    }
}
