//! Typed error taxonomy for the discovery pipeline.
//!
//! The happy path propagates `anyhow::Result` with `.context(...)` like the
//! rest of this codebase; `PipelineError` exists for the handful of call
//! sites that need to branch on *kind* (retry vs. fatal, skip vs. halt)
//! rather than just log-and-bail.

use std::fmt;

#[derive(Debug)]
pub enum PipelineError {
    /// Network timeout or transient connection failure. Caller retries once,
    /// then defers to the next scheduler tick.
    ProviderTransient(String),
    /// Unexpected/unparseable payload shape. Treated the same as transient.
    ProviderParse(String),
    /// Auth failure or other non-retryable provider error.
    ProviderFatal(String),
    /// Another worker already holds the bucket's lease.
    LeaseContention(String),
    /// A DB write was rejected by an idempotency guard (unique constraint,
    /// apply-if-newer). Not a failure -- the caller treats this as success.
    WriteConflict(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderTransient(msg) => write!(f, "provider transient error: {msg}"),
            Self::ProviderParse(msg) => write!(f, "provider payload parse error: {msg}"),
            Self::ProviderFatal(msg) => write!(f, "provider fatal error: {msg}"),
            Self::LeaseContention(bucket_id) => {
                write!(f, "lease already held for bucket {bucket_id}")
            }
            Self::WriteConflict(detail) => write!(f, "write conflict (idempotent): {detail}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl PipelineError {
    /// Whether a poll that hit this error is safe to retry immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderTransient(_) | Self::ProviderParse(_))
    }
}
