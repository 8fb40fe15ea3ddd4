//! Failure type for LLM endpoint traffic
//!
//! Carries enough structure for callers to pick between retrying,
//! backing off, and giving up without string-matching provider output.
//! The raw HTTP status travels with the error instead of being
//! pre-classified into variants; classification happens at the query
//! methods so new status codes need no new variants.

use thiserror::Error;

/// Failure talking to an LLM endpoint
#[derive(Debug, Error)]
pub enum LlmError {
    /// The endpoint answered with a non-success status
    #[error("LLM endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },

    /// The connection or stream died before a complete response arrived
    #[error("LLM stream failed: {0}")]
    Stream(String),
}

impl LlmError {
    /// Wrap a non-success HTTP response
    pub fn endpoint(status: reqwest::StatusCode, body: String) -> Self {
        Self::Endpoint {
            status: status.as_u16(),
            body,
        }
    }

    /// Whether waiting and re-sending could plausibly succeed
    ///
    /// Throttling (429), server-side failures (5xx), and dead streams
    /// qualify; anything the caller got wrong (4xx) does not.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Endpoint { status, .. } => *status == 429 || *status >= 500,
            Self::Stream(_) => true,
        }
    }

    /// Whether the endpoint asked us to slow down
    pub fn rate_limited(&self) -> bool {
        matches!(self, Self::Endpoint { status: 429, .. })
    }
}
