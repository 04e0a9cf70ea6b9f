//! User-visible progress notifications.
//!
//! The workflow never learns whether output lands in a chat thread or a VCS
//! comment; it hands text to [`Notifier::notify`], which chunks to the
//! transport limit, paces parts by the configured delay, and swallows
//! delivery failures (logged, never raised).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::message::MessageKind;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("transport delivery failed: {0}")]
    Delivery(String),
}

/// Delivery seam. One implementation per transport (chat API, comment
/// thread); the core ships only test doubles.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, user_id: &str, text: &str, kind: MessageKind)
        -> Result<(), NotifyError>;
}

/// Transport that records every delivered part, for tests.
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, String, MessageKind)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    pub async fn sent(&self) -> Vec<(String, String, MessageKind)> {
        self.sent.lock().await.clone()
    }

    /// All delivered texts for one user, concatenated in order.
    pub async fn concat_for(&self, user_id: &str) -> String {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(u, _, _)| u == user_id)
            .map(|(_, t, _)| t.as_str())
            .collect()
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver(
        &self,
        user_id: &str,
        text: &str,
        kind: MessageKind,
    ) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .await
            .push((user_id.to_string(), text.to_string(), kind));
        Ok(())
    }
}

/// Returns the byte index of the `n`-th character, or the string length when
/// the text is shorter.
fn byte_at_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

/// Best split index inside `window`, never before `min`. Boundaries in
/// priority order: paragraph, line, sentence terminator, word, hard cut.
fn split_point(window: &str, min: usize) -> usize {
    if let Some(idx) = window.rfind("\n\n") {
        let cut = idx + 2;
        if cut >= min {
            return cut;
        }
    }
    if let Some(idx) = window.rfind('\n') {
        let cut = idx + 1;
        if cut >= min {
            return cut;
        }
    }
    let bytes = window.as_bytes();
    for i in (0..window.len()).rev() {
        if matches!(bytes[i], b'.' | b'!' | b'?') {
            let cut = i + 1;
            // Terminator must end the window or precede whitespace; skip
            // decimals like "3.5".
            if cut >= min && (cut == window.len() || bytes[cut].is_ascii_whitespace()) {
                return cut;
            }
        }
    }
    if let Some(idx) = window.rfind(' ') {
        let cut = idx + 1;
        if cut >= min {
            return cut;
        }
    }
    window.len()
}

/// Splits `text` into parts of at most `max_chars` characters.
///
/// Splits occur only past the 50 %-of-chunk mark, so no boundary produces a
/// tiny fragment. Concatenating the parts reproduces the input exactly; the
/// function drops nothing and trims nothing.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut parts = Vec::new();
    let mut rest = text;
    while rest.chars().count() > max_chars {
        let limit = byte_at_char(rest, max_chars);
        let min = byte_at_char(rest, max_chars / 2);
        let window = &rest[..limit];
        let cut = split_point(window, min.max(1));
        parts.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() || parts.is_empty() {
        parts.push(rest.to_string());
    }
    parts
}

/// Chunked, rate-limited notification channel.
///
/// **Interaction**: owned by the workflow engine and router; `notify` is
/// fire-and-forget from their point of view.
pub struct Notifier {
    transport: Arc<dyn Transport>,
    max_msg_chars: usize,
    chunk_delay: Duration,
}

impl Notifier {
    pub fn new(transport: Arc<dyn Transport>, max_msg_chars: usize, chunk_delay: Duration) -> Self {
        Self {
            transport,
            max_msg_chars,
            chunk_delay,
        }
    }

    /// Delivers `text` to `user_id`, split into transport-sized parts with
    /// the configured delay between consecutive parts. Failures are logged
    /// and swallowed; remaining parts of a failed message are dropped so a
    /// dead transport is not hammered.
    pub async fn notify(&self, user_id: &str, text: &str, kind: MessageKind) {
        let parts = split_message(text, self.max_msg_chars);
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.chunk_delay).await;
            }
            if let Err(err) = self.transport.deliver(user_id, part, kind).await {
                warn!(user = %crate::telemetry::hash_user_id(user_id), %err, "notification dropped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_is_one_chunk() {
        let parts = split_message("hello world", 4096);
        assert_eq!(parts, vec!["hello world".to_string()]);
    }

    #[test]
    fn exactly_max_chars_is_one_chunk() {
        let text = "x".repeat(4096);
        let parts = split_message(&text, 4096);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].chars().count(), 4096);
    }

    #[test]
    fn one_char_over_max_is_two_chunks() {
        let text = "x".repeat(4097);
        let parts = split_message(&text, 4096);
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn empty_input_yields_single_empty_chunk() {
        assert_eq!(split_message("", 10), vec![String::new()]);
    }

    #[test]
    fn prefers_paragraph_boundary() {
        let text = format!("{}\n\n{}", "a".repeat(60), "b".repeat(60));
        let parts = split_message(&text, 100);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].ends_with("\n\n"));
        assert!(parts[1].starts_with('b'));
    }

    #[test]
    fn falls_back_to_line_then_sentence_then_word() {
        let line = format!("{}\n{}", "a".repeat(70), "b".repeat(70));
        let parts = split_message(&line, 100);
        assert!(parts[0].ends_with('\n'));

        let sentence = format!("{}. {}", "a".repeat(70), "b".repeat(70));
        let parts = split_message(&sentence, 100);
        assert!(parts[0].ends_with('.'));

        let words = format!("{} {}", "a".repeat(70), "b".repeat(70));
        let parts = split_message(&words, 100);
        assert!(parts[0].ends_with(' '));
    }

    #[test]
    fn boundary_before_half_mark_is_ignored() {
        // The only newline sits at 10 of 100; a hard split at the limit wins.
        let text = format!("{}\n{}", "a".repeat(10), "b".repeat(150));
        let parts = split_message(&text, 100);
        assert_eq!(parts[0].chars().count(), 100);
    }

    #[test]
    fn split_then_concat_is_identity() {
        let text = format!(
            "{}\n\n{}. And {} end",
            "para one ".repeat(30),
            "sentence two ".repeat(20),
            "word ".repeat(40)
        );
        for max in [50, 100, 333, 4096] {
            let joined: String = split_message(&text, max).concat();
            assert_eq!(joined, text, "max_chars={max}");
        }
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "héllo wörld ".repeat(40);
        let parts = split_message(&text, 50);
        for part in &parts {
            assert!(part.chars().count() <= 50);
        }
        assert_eq!(parts.concat(), text);
    }

    #[tokio::test]
    async fn notifier_delivers_all_parts_in_order() {
        let transport = Arc::new(RecordingTransport::new());
        let notifier = Notifier::new(transport.clone(), 10, Duration::from_millis(1));
        let text = "abcdefghij0123456789xyz";
        notifier.notify("U1", text, MessageKind::Status).await;

        let sent = transport.sent().await;
        assert!(sent.len() >= 3);
        assert_eq!(transport.concat_for("U1").await, text);
        assert!(sent.iter().all(|(_, _, k)| *k == MessageKind::Status));
    }

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn deliver(
            &self,
            _user_id: &str,
            _text: &str,
            _kind: MessageKind,
        ) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery("offline".into()))
        }
    }

    #[tokio::test]
    async fn notify_swallows_transport_failures() {
        let notifier = Notifier::new(Arc::new(FailingTransport), 10, Duration::from_millis(1));
        // Must not panic or return an error.
        notifier.notify("U1", "some text", MessageKind::Error).await;
    }
}
