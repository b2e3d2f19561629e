//! Typed error taxonomy shared by every component.
//!
//! Every fallible operation in this crate returns `Result<T, RagError>` (or
//! wraps one behind `anyhow` at the CLI boundary, as the teacher's `main.rs`
//! already does). Each variant below corresponds to one error kind from the
//! component contracts: callers match on `RagError` to decide retry vs.
//! surface-to-user vs. abort.

use thiserror::Error;

/// The crate-wide error type.
///
/// Variants that can occur mid-stream or mid-ingest carry a correlation id
/// (`document_id` / `session_id`) so a `tracing::warn!` call at the call
/// site can log it without the caller having to thread it through by hand.
#[derive(Debug, Error)]
pub enum RagError {
    /// Caller-supplied input failed validation (empty query, unknown owner,
    /// malformed config). Not retryable; surfaced to the caller as-is.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A state transition was attempted that the object's current state
    /// does not allow (e.g. cancelling an already-completed document).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backing store (SQLite) is unavailable or a query failed for
    /// reasons unrelated to the data itself.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    /// An embedding or reranking model could not be loaded, or the
    /// provider backing it is unreachable.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// A resource ceiling was hit: too many concurrent ingests, an adaptive
    /// batch size that could not shrink further, a provider rate limit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Retrieval could not produce results for reasons other than "zero
    /// matches" (e.g. both candidate sources failed).
    #[error("retrieval failed: {0}")]
    RetrievalFailed(String),

    /// The caller (or an internal timeout) cancelled an in-flight
    /// operation. Carries the id of the document or session affected.
    #[error("cancelled: {correlation_id}")]
    Cancelled { correlation_id: String },

    /// An operation exceeded its allotted soft timeout.
    #[error("timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// A streaming response was interrupted after partial output was
    /// already delivered to the caller.
    #[error("stream terminated for session {session_id}: {reason}")]
    StreamTerminated { session_id: String, reason: String },

    /// The configured or requested LLM provider returned an error.
    #[error("llm provider '{provider}' error: {message}")]
    Provider { provider: String, message: String },
}

impl RagError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn model_unavailable(msg: impl Into<String>) -> Self {
        Self::ModelUnavailable(msg.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    pub fn retrieval_failed(msg: impl Into<String>) -> Self {
        Self::RetrievalFailed(msg.into())
    }

    pub fn provider(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider { provider: provider.into(), message: msg.into() }
    }

    /// True for errors worth a single bounded retry with backoff (§7's
    /// retry policy); false for errors that should surface immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::StoreUnavailable(_) | RagError::ModelUnavailable(_) | RagError::Provider { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
