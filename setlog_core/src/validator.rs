//! Validation stage: decides whether the input is a workout at all.

use crate::config::ValidationConfig;
use crate::llm::{complete_with_timeout, extract_json, LlmClient};
use crate::types::{RawInput, ValidationResult};
use crate::{Error, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

pub use crate::config::DEFAULT_CONFIDENCE_THRESHOLD;

#[derive(Debug, Deserialize)]
struct ValidationReply {
    is_workout: bool,
    confidence: f64,
    #[serde(default)]
    reason: Option<String>,
}

/// Classifies raw text as workout / not-workout
pub struct Validator {
    llm: Arc<dyn LlmClient>,
    config: ValidationConfig,
    timeout: Duration,
}

impl Validator {
    pub fn new(llm: Arc<dyn LlmClient>, config: ValidationConfig, timeout: Duration) -> Self {
        Self {
            llm,
            config,
            timeout,
        }
    }

    /// Classify `input`; a rejection is returned as [`Error::NotAWorkout`].
    pub async fn validate(&self, input: &RawInput) -> Result<ValidationResult> {
        let text = input.text.trim();
        if text.is_empty() {
            return Err(Error::NotAWorkout {
                reason: "input is empty".into(),
                confidence: 0.0,
            });
        }
        let chars = text.chars().count();
        if chars > self.config.max_input_chars {
            return Err(Error::NotAWorkout {
                reason: format!(
                    "input is {chars} characters, longer than the {} allowed",
                    self.config.max_input_chars
                ),
                confidence: 0.0,
            });
        }

        let raw = complete_with_timeout(self.llm.as_ref(), &build_prompt(text), self.timeout).await?;
        let reply: ValidationReply = extract_json(&raw)
            .map_err(|e| Error::Llm(format!("unusable validation reply: {e}")))?;

        if !(0.0..=1.0).contains(&reply.confidence) {
            return Err(Error::Llm(format!(
                "validation confidence {} is outside 0..=1",
                reply.confidence
            )));
        }

        let result = ValidationResult {
            is_workout: reply.is_workout,
            confidence: reply.confidence,
            reason: reply.reason.filter(|r| !r.trim().is_empty()),
        };
        apply_threshold(result, self.config.confidence_threshold)
    }
}

/// Accept when the model says workout and confidence is at or above
/// `threshold`.
pub fn apply_threshold(result: ValidationResult, threshold: f64) -> Result<ValidationResult> {
    if result.is_workout && result.confidence >= threshold {
        tracing::debug!(confidence = result.confidence, "Input accepted as workout");
        return Ok(result);
    }

    let reason = result.reason.clone().unwrap_or_else(|| {
        if result.is_workout {
            format!(
                "confidence {:.2} is below threshold {:.2}",
                result.confidence, threshold
            )
        } else {
            "text does not describe a workout".to_string()
        }
    });
    tracing::info!(confidence = result.confidence, %reason, "Input rejected");
    Err(Error::NotAWorkout {
        reason,
        confidence: result.confidence,
    })
}

fn build_prompt(text: &str) -> String {
    format!(
        r#"You are classifying free text written by someone logging exercise.
Decide whether the text below describes a workout that was performed or planned
(exercises, sets, reps, weights, durations).

Reply with a single JSON object and nothing else:
{{"is_workout": true or false, "confidence": number between 0 and 1, "reason": short string or null}}

Text:
"""
{text}
"""
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedLlm {
        reply: String,
        calls: AtomicUsize,
    }

    impl FixedLlm {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.into(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn complete(&self, prompt: &str) -> Result<String> {
            assert!(prompt.contains("is_workout"));
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    fn validator(llm: Arc<FixedLlm>) -> Validator {
        Validator::new(llm, ValidationConfig::default(), Duration::from_secs(5))
    }

    fn verdict(is_workout: bool, confidence: f64) -> ValidationResult {
        ValidationResult {
            is_workout,
            confidence,
            reason: None,
        }
    }

    #[test]
    fn test_threshold_is_inclusive() {
        assert_eq!(DEFAULT_CONFIDENCE_THRESHOLD, 0.5);
        let accepted = apply_threshold(verdict(true, DEFAULT_CONFIDENCE_THRESHOLD), 0.5).unwrap();
        assert_eq!(accepted.confidence, 0.5);

        let err = apply_threshold(verdict(true, 0.499), 0.5).unwrap_err();
        assert!(matches!(err, Error::NotAWorkout { .. }));
    }

    #[test]
    fn test_negative_verdict_rejects_regardless_of_confidence() {
        let err = apply_threshold(verdict(false, 0.95), 0.5).unwrap_err();
        match err {
            Error::NotAWorkout { reason, confidence } => {
                assert_eq!(confidence, 0.95);
                assert!(reason.contains("does not describe"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_accepts_workout_text() {
        let llm = FixedLlm::new(r#"{"is_workout": true, "confidence": 0.9, "reason": null}"#);
        let result = validator(llm.clone())
            .validate(&RawInput::new("Bench Press: 3x8"))
            .await
            .unwrap();
        assert!(result.is_workout);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejection_carries_reason() {
        let llm = FixedLlm::new(
            r#"{"is_workout": false, "confidence": 0.97, "reason": "a grocery list"}"#,
        );
        let err = validator(llm)
            .validate(&RawInput::new("eggs, milk, bread"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotAWorkout { ref reason, .. } if reason == "a grocery list"));
    }

    #[tokio::test]
    async fn test_empty_and_oversized_input_skip_llm() {
        let llm = FixedLlm::new("{}");
        let v = validator(llm.clone());

        let err = v.validate(&RawInput::new("   \n ")).await.unwrap_err();
        assert!(matches!(err, Error::NotAWorkout { .. }));

        let err = v.validate(&RawInput::new("x".repeat(8_001))).await.unwrap_err();
        assert!(matches!(err, Error::NotAWorkout { .. }));

        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_retryable_llm_error() {
        let err = validator(FixedLlm::new("definitely a workout!"))
            .validate(&RawInput::new("Squat 5x5"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Llm(_)));
        assert!(err.is_retryable());

        let err = validator(FixedLlm::new(r#"{"is_workout": true, "confidence": 7}"#))
            .validate(&RawInput::new("Squat 5x5"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Llm(_)));
    }
}
