//! Platform-agnostic edge message types.
//!
//! The transport edge (chat webhook, VCS comment hook, direct API) delivers
//! [`MessageIn`] and accepts [`MessageOut`]; signature verification and
//! provider JSON schemas stay outside the core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Originating surface of a message. Routing key metadata only; the core
/// behaves identically across platforms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Chat,
    VcsComment,
    DirectApi,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Chat => "chat",
            Platform::VcsComment => "vcs-comment",
            Platform::DirectApi => "direct-api",
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Platform::Chat),
            "vcs-comment" => Ok(Platform::VcsComment),
            "direct-api" => Ok(Platform::DirectApi),
            _ => Err(format!("unknown platform: {s}")),
        }
    }
}

/// One inbound user message, already stripped of transport framing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageIn {
    pub user_id: String,
    pub platform: Platform,
    pub text: String,
    /// Attached media, opaque to the core.
    #[serde(default)]
    pub media: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl MessageIn {
    pub fn new(user_id: impl Into<String>, platform: Platform, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            platform,
            text: text.into(),
            media: None,
            timestamp: Utc::now(),
        }
    }
}

/// What kind of reply an outbound message is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Status,
    Result,
    Error,
}

/// One outbound message for the edge to deliver.
///
/// `text` is either a single pre-chunked part from the notification channel
/// or raw text the edge may pass through the splitter itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageOut {
    pub user_id: String,
    pub text: String,
    pub kind: MessageKind,
}

impl MessageOut {
    pub fn status(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            text: text.into(),
            kind: MessageKind::Status,
        }
    }

    pub fn result(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            text: text.into(),
            kind: MessageKind::Result,
        }
    }

    pub fn error(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            text: text.into(),
            kind: MessageKind::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_serde_uses_kebab_case() {
        assert_eq!(
            serde_json::to_string(&Platform::VcsComment).unwrap(),
            "\"vcs-comment\""
        );
        let back: Platform = serde_json::from_str("\"direct-api\"").unwrap();
        assert_eq!(back, Platform::DirectApi);
    }

    #[test]
    fn platform_from_str_roundtrip() {
        for p in [Platform::Chat, Platform::VcsComment, Platform::DirectApi] {
            assert_eq!(p.as_str().parse::<Platform>().unwrap(), p);
        }
        assert!("slack".parse::<Platform>().is_err());
    }

    #[test]
    fn message_out_constructors_set_kind() {
        assert_eq!(MessageOut::status("u", "t").kind, MessageKind::Status);
        assert_eq!(MessageOut::result("u", "t").kind, MessageKind::Result);
        assert_eq!(MessageOut::error("u", "t").kind, MessageKind::Error);
    }

    #[test]
    fn message_in_without_media_deserializes() {
        let json = r#"{"user_id":"u1","platform":"chat","text":"hi","timestamp":"2026-01-01T00:00:00Z"}"#;
        let msg: MessageIn = serde_json::from_str(json).unwrap();
        assert!(msg.media.is_none());
        assert_eq!(msg.platform, Platform::Chat);
    }
}
