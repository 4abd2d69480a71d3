//! Error types for the setlog_core library.

use std::io;
use std::time::Duration;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for setlog_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input was classified as something other than a workout
    #[error("Not a workout: {reason}")]
    NotAWorkout { reason: String, confidence: f64 },

    /// The LLM kept returning schema-invalid structure
    #[error("LLM extraction failed after {attempts} attempts: {last_violation}")]
    LlmExtraction {
        attempts: u32,
        last_violation: String,
    },

    /// The persistence transaction did not commit
    #[error("Persistence error: {0}")]
    PipelinePersistence(String),

    /// LLM transport failure or unusable response
    #[error("LLM error: {0}")]
    Llm(String),

    /// LLM call exceeded its deadline
    #[error("LLM call timed out after {0:?}")]
    LlmTimeout(Duration),

    /// Caller cancelled the request
    #[error("Request cancelled")]
    Cancelled,

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catalog validation error
    #[error("Catalog validation error: {0}")]
    CatalogValidation(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::LlmExtraction { .. }
            | Error::PipelinePersistence(_)
            | Error::Llm(_)
            | Error::LlmTimeout(_) => true,
            Error::Database(e) => is_busy(e),
            Error::NotAWorkout { .. }
            | Error::Cancelled
            | Error::Io(_)
            | Error::Json(_)
            | Error::Toml(_)
            | Error::Config(_)
            | Error::CatalogValidation(_)
            | Error::Other(_) => false,
        }
    }
}

/// SQLite reports lock contention as SQLITE_BUSY (5) or SQLITE_LOCKED (6),
/// possibly with extended result bits set.
pub(crate) fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let code_busy = db
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .map(|c| matches!(c & 0xFF, 5 | 6))
                .unwrap_or(false);
            code_busy || db.message().contains("database is locked")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::LlmExtraction {
            attempts: 3,
            last_violation: "no blocks".into()
        }
        .is_retryable());
        assert!(Error::PipelinePersistence("locked".into()).is_retryable());
        assert!(Error::LlmTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!Error::NotAWorkout {
            reason: "grocery list".into(),
            confidence: 0.1
        }
        .is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_display_carries_reason() {
        let err = Error::NotAWorkout {
            reason: "looks like a recipe".into(),
            confidence: 0.2,
        };
        assert_eq!(err.to_string(), "Not a workout: looks like a recipe");
    }
}
