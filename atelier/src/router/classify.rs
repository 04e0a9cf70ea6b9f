//! Message classification with caching and safe degradation.
//!
//! Both classifiers are pure functions of their normalized inputs, so
//! results are cached by a stable hash with TTL and an LRU bound. Any
//! failure (timeout, circuit open, unparseable output) degrades to the
//! conversational path; a workflow is never started or disturbed by a
//! broken classifier.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::cache::{Cache, LruTtlCache};
use crate::config::CoreConfig;
use crate::llm::LlmClient;
use crate::retry::CircuitBreakerSet;
use crate::state::Phase;
use crate::telemetry::Telemetry;

/// What an in-flight message means for the active workflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageClass {
    Refinement,
    StatusQuery,
    Cancellation,
    NewTask,
    Conversation,
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn cache_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(normalize(part).as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

fn parse_class(reply: &str) -> MessageClass {
    let reply = reply.to_lowercase();
    if reply.contains("cancel") {
        MessageClass::Cancellation
    } else if reply.contains("status") {
        MessageClass::StatusQuery
    } else if reply.contains("refinement") {
        MessageClass::Refinement
    } else if reply.contains("new_task") || reply.contains("new task") {
        MessageClass::NewTask
    } else {
        MessageClass::Conversation
    }
}

/// In-workflow and webapp-intent classification over the LLM seam.
pub struct Classifier {
    llm: Arc<dyn LlmClient>,
    breakers: Arc<CircuitBreakerSet>,
    telemetry: Arc<Telemetry>,
    workflow_cache: LruTtlCache<String, MessageClass>,
    intent_cache: LruTtlCache<String, bool>,
    ttl: Duration,
    timeout: Duration,
}

impl Classifier {
    pub fn new(
        config: &CoreConfig,
        llm: Arc<dyn LlmClient>,
        breakers: Arc<CircuitBreakerSet>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            llm,
            breakers,
            telemetry,
            workflow_cache: LruTtlCache::new(config.classify_cache_capacity),
            intent_cache: LruTtlCache::new(config.classify_cache_capacity),
            ttl: config.classify_ttl,
            timeout: config.classify_timeout,
        }
    }

    /// One bounded, breaker-guarded LLM call; `None` on any failure.
    async fn complete_guarded(&self, prompt: &str) -> Option<String> {
        let breaker = self.breakers.breaker("llm");
        let call = tokio::time::timeout(self.timeout, breaker.call(|| self.llm.complete(prompt)));
        match call.await {
            Ok(Ok(reply)) => Some(reply.text),
            Ok(Err(err)) => {
                warn!(%err, "classifier llm call failed");
                None
            }
            Err(_) => {
                warn!("classifier llm call exceeded soft deadline");
                None
            }
        }
    }

    /// Classifies a message against the active workflow. Failures degrade to
    /// [`MessageClass::Conversation`] and are not cached.
    pub async fn classify_in_workflow(
        &self,
        message: &str,
        workflow_summary: &str,
        phase: Phase,
    ) -> MessageClass {
        let key = cache_key(&[message, workflow_summary, phase.as_str()]);
        if let Some(class) = self.workflow_cache.get(&key).await {
            self.telemetry
                .metrics()
                .counter("atelier_classifier_cache_hits_total")
                .inc();
            return class;
        }

        let prompt = format!(
            "A workflow is active: \"{workflow_summary}\" (phase: {}).\n\
             Classify the user's new message into exactly one of: refinement, status_query, \
             cancellation, new_task, conversation. Answer with the single class name only.\n\
             Message: {message}",
            phase.as_str()
        );
        let class = match self.complete_guarded(&prompt).await {
            Some(reply) => parse_class(&reply),
            None => return MessageClass::Conversation,
        };
        let _ = self
            .workflow_cache
            .set(key, class, Some(self.ttl))
            .await;
        class
    }

    /// Decides whether a first message should start a build workflow.
    /// Failures answer `false`, routing to the single-turn path.
    pub async fn webapp_intent(&self, message: &str) -> bool {
        let key = cache_key(&[message]);
        if let Some(intent) = self.intent_cache.get(&key).await {
            self.telemetry
                .metrics()
                .counter("atelier_classifier_cache_hits_total")
                .inc();
            return intent;
        }

        let prompt = format!(
            "Does this message ask to build, fix, redeploy, or design a web application \
             (as opposed to a question or small talk)? Answer yes or no.\nMessage: {message}"
        );
        let intent = match self.complete_guarded(&prompt).await {
            Some(reply) => reply.to_lowercase().contains("yes"),
            None => return false,
        };
        let _ = self.intent_cache.set(key, intent, Some(self.ttl)).await;
        intent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, ScriptedLlm};

    fn classifier(llm: Arc<ScriptedLlm>) -> Classifier {
        let config = CoreConfig::default();
        Classifier::new(
            &config,
            llm,
            Arc::new(CircuitBreakerSet::new(config.fail_threshold, config.breaker_timeout)),
            Arc::new(Telemetry::new()),
        )
    }

    #[test]
    fn parse_covers_all_classes() {
        assert_eq!(parse_class("refinement"), MessageClass::Refinement);
        assert_eq!(parse_class("Status_query"), MessageClass::StatusQuery);
        assert_eq!(parse_class("CANCELLATION"), MessageClass::Cancellation);
        assert_eq!(parse_class("new_task"), MessageClass::NewTask);
        assert_eq!(parse_class("conversation"), MessageClass::Conversation);
        assert_eq!(parse_class("no idea"), MessageClass::Conversation);
    }

    #[test]
    fn cache_key_normalizes_whitespace_and_case() {
        assert_eq!(
            cache_key(&["Make it  Dark", "app", "design"]),
            cache_key(&["make it dark", "app", "design"])
        );
        assert_ne!(
            cache_key(&["make it dark", "app", "design"]),
            cache_key(&["make it dark", "app", "review"])
        );
    }

    #[tokio::test]
    async fn second_classification_hits_cache() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push_reply("refinement");
        let classifier = classifier(llm.clone());

        let first = classifier
            .classify_in_workflow("make it dark themed", "todo app", Phase::Implementation)
            .await;
        let second = classifier
            .classify_in_workflow("make it dark themed", "todo app", Phase::Implementation)
            .await;
        assert_eq!(first, MessageClass::Refinement);
        assert_eq!(second, MessageClass::Refinement);
        // One LLM call only; the second answer came from the cache.
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn failure_degrades_to_conversation_and_is_not_cached() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push(Err(LlmError::Timeout));
        llm.push_reply("status_query");
        let classifier = classifier(llm.clone());

        let first = classifier
            .classify_in_workflow("how is it going", "todo app", Phase::Review)
            .await;
        assert_eq!(first, MessageClass::Conversation);

        let second = classifier
            .classify_in_workflow("how is it going", "todo app", Phase::Review)
            .await;
        assert_eq!(second, MessageClass::StatusQuery);
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn intent_yes_and_no() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push_reply("Yes, that is a build request.");
        llm.push_reply("no");
        let classifier = classifier(llm.clone());

        assert!(classifier.webapp_intent("Build a todo app").await);
        assert!(!classifier.webapp_intent("Hello").await);
        // Cached on repeat.
        assert!(classifier.webapp_intent("Build a todo app").await);
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn intent_failure_is_negative() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push(Err(LlmError::CallFailed("down".into())));
        let classifier = classifier(llm);
        assert!(!classifier.webapp_intent("Build a todo app").await);
    }
}
