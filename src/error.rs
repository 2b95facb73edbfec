//! Error types for the research engine
//!
//! Two layers: [`ProviderError`] classifies failures of the external
//! collaborators (search, fetch, model, checkpoint) into transient and
//! permanent, and [`ResearchError`] is the run-level taxonomy the
//! coordinator reports on the event stream.
//!
//! Failures are caught at the narrowest stage that can yield a sensible
//! default. Only the coordinator terminates a run.

use std::time::Duration;

use thiserror::Error;

use crate::provider::ModelRole;

/// Failure of an external collaborator call.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The call exceeded its per-operation timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Non-success HTTP status from the provider.
    #[error("http status {0}")]
    Status(u16),

    /// Rate limited by the provider.
    #[error("rate limited")]
    RateLimited,

    /// Transport-level failure (connect, DNS, TLS, body read).
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider answered but the payload could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Provider is not configured (missing key, missing endpoint binding).
    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Transient failures are retried once; permanent ones are demoted to
    /// empty results and logged on the affected operation.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout(_) | ProviderError::RateLimited => true,
            ProviderError::Status(code) => *code >= 500,
            ProviderError::Transport(_) => true,
            ProviderError::Malformed(_) | ProviderError::NotConfigured(_) => false,
        }
    }
}

/// Run-level error taxonomy.
#[derive(Debug, Error)]
pub enum ResearchError {
    /// Malformed query or options. Surfaced immediately, run not started.
    #[error("invalid input: {0}")]
    Input(String),

    /// Clarify decided the query is too vague. Not a failure: the run
    /// short-circuits with the question payload.
    #[error("clarification requested: {0}")]
    ClarificationRequested(String),

    /// A model call failed after its one retry.
    #[error("model call failed for {role}: {message}")]
    Model { role: ModelRole, message: String },

    /// Report citation validation failed twice. The best-effort report is
    /// still returned alongside this error.
    #[error("citation validation failed: {0}")]
    Citation(String),

    /// The run was cancelled via its cancellation token.
    #[error("run cancelled")]
    Cancelled,

    /// The overall run deadline elapsed.
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// The checkpoint sink failed to persist or load a snapshot.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A provider failure that escaped stage-local handling.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl ResearchError {
    /// Build a model error for a role.
    pub fn model(role: ModelRole, message: impl Into<String>) -> Self {
        ResearchError::Model {
            role,
            message: message.into(),
        }
    }

    /// Short machine-readable kind, used as the `kind` field of `error`
    /// events on the stream.
    pub fn kind(&self) -> &'static str {
        match self {
            ResearchError::Input(_) => "input",
            ResearchError::ClarificationRequested(_) => "clarification",
            ResearchError::Model { .. } => "model",
            ResearchError::Citation(_) => "citation",
            ResearchError::Cancelled => "cancelled",
            ResearchError::DeadlineExceeded(_) => "deadline",
            ResearchError::Checkpoint(_) => "checkpoint",
            ResearchError::Provider(p) => {
                if p.is_transient() {
                    "provider_transient"
                } else {
                    "provider_permanent"
                }
            }
        }
    }
}
