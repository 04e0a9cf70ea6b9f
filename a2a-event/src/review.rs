//! Review payload returned by reviewer agents.

use serde::{Deserialize, Serialize};

/// Outcome of a code review round.
///
/// `score` is clamped to 1..=10 on construction and on parse; the quality
/// loop compares it against the configured minimum.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub approved: bool,
    pub score: u8,
    #[serde(default)]
    pub feedback: Vec<String>,
    #[serde(default)]
    pub critical_issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// Which quality-loop iteration produced this review (1-based).
    #[serde(default)]
    pub iteration: u32,
}

impl Review {
    pub fn new(approved: bool, score: u8) -> Self {
        Self {
            approved,
            score: score.clamp(1, 10),
            feedback: Vec::new(),
            critical_issues: Vec::new(),
            suggestions: Vec::new(),
            iteration: 0,
        }
    }

    /// Parses a review from an agent's structured output. Returns `None` when
    /// the payload does not carry the required fields; callers treat that as
    /// a failed review round and retry.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let mut review: Review = serde_json::from_value(value.clone()).ok()?;
        review.score = review.score.clamp(1, 10);
        Some(review)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_is_clamped() {
        assert_eq!(Review::new(true, 0).score, 1);
        assert_eq!(Review::new(true, 12).score, 10);
        assert_eq!(Review::new(true, 7).score, 7);
    }

    #[test]
    fn from_value_accepts_minimal_payload() {
        let value = serde_json::json!({"approved": false, "score": 4});
        let review = Review::from_value(&value).unwrap();
        assert!(!review.approved);
        assert_eq!(review.score, 4);
        assert!(review.feedback.is_empty());
        assert_eq!(review.iteration, 0);
    }

    #[test]
    fn from_value_rejects_garbage() {
        assert!(Review::from_value(&serde_json::json!("not a review")).is_none());
        assert!(Review::from_value(&serde_json::json!({"score": 5})).is_none());
    }

    #[test]
    fn from_value_clamps_out_of_range_score() {
        let value = serde_json::json!({"approved": true, "score": 99});
        assert_eq!(Review::from_value(&value).unwrap().score, 10);
    }
}
