//! Error taxonomies for the store and LLM boundaries.
//!
//! Component-local code uses `anyhow::Result` throughout, following the
//! teacher's convention; these two enums exist only at the seams where a
//! caller needs to match on a specific failure kind instead of treating
//! everything as fatal.

use thiserror::Error;

/// Errors returned by `Store` operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique constraint was violated (duplicate `content_hash`, duplicate
    /// feed url, ...). Dedup-aware callers treat this as success.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Likely to succeed on retry (lock contention, db busy, I/O hiccup).
    #[error("transient store error: {0}")]
    Transient(String),

    /// Not expected to succeed on retry.
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Classify a `sqlx::Error` into our taxonomy the way the teacher's call
    /// sites distinguish "already exists" from genuine failures.
    pub fn from_sqlx(err: sqlx::Error, context: &str) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();
                if msg.contains("UNIQUE constraint failed") {
                    StoreError::Conflict(format!("{context}: {msg}"))
                } else if msg.contains("locked") || msg.contains("busy") {
                    StoreError::Transient(format!("{context}: {msg}"))
                } else {
                    StoreError::Fatal(format!("{context}: {msg}"))
                }
            }
            sqlx::Error::RowNotFound => StoreError::NotFound(context.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                StoreError::Transient(format!("{context}: {err}"))
            }
            other => StoreError::Fatal(format!("{context}: {other}")),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Errors returned by `LlmProvider` calls, used by the worker pool to decide
/// retry vs terminal-failure handling.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider rate limited: {0}")]
    RateLimited(String),

    #[error("provider returned a server error: {0}")]
    Provider5xx(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("response was not valid JSON for the expected schema: {0}")]
    InvalidJson(String),

    #[error("input too large for model context: {0}")]
    InputTooLarge(String),

    #[error("unknown LLM error: {0}")]
    Unknown(String),
}

impl LlmError {
    /// Whether a worker should retry this kind of failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited(_) | LlmError::Provider5xx(_) | LlmError::Timeout(_)
        )
    }

    /// Short machine-readable kind, stored in `analysis_run_items.error_message`
    /// alongside the human-readable text.
    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::RateLimited(_) => "rate_limited",
            LlmError::Provider5xx(_) => "provider_5xx",
            LlmError::Timeout(_) => "timeout",
            LlmError::InvalidJson(_) => "invalid_json",
            LlmError::InputTooLarge(_) => "input_too_large",
            LlmError::Unknown(_) => "unknown",
        }
    }
}
