use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a single enrichment job. Local to that job; never aborts siblings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("attempt timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("rate limited by upstream")]
    RateLimited,
    #[error("upstream returned {status}")]
    Upstream { status: u16, body: String },
    #[error("unexpected join-info response")]
    Malformed,
    #[error("queue overflow: dropped oldest request")]
    QueueOverflow,
    #[error("target temporarily skipped (recent timeout/failure)")]
    TemporarilySkipped,
    #[error("header override capability is unavailable")]
    PermissionMissing,
    #[error("scheduler closed before the job settled")]
    Closed,
}

impl FetchError {
    /// Status code reported to inbound callers.
    pub fn status(&self) -> u16 {
        match self {
            FetchError::PermissionMissing => 403,
            FetchError::RateLimited => 429,
            FetchError::Malformed => 502,
            FetchError::QueueOverflow | FetchError::Closed => 503,
            FetchError::TemporarilySkipped | FetchError::Timeout | FetchError::Transport(_) => 504,
            FetchError::Upstream { status, .. } => *status,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::RateLimited)
    }

    /// Transport-level failures mark the target bad for the TTL window.
    pub fn marks_target_bad(&self) -> bool {
        matches!(self, FetchError::Timeout | FetchError::Transport(_))
    }
}

/// Structured failure returned by the inbound control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub status: u16,
    pub message: String,
}

impl FetchFailure {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<FetchError> for FetchFailure {
    fn from(err: FetchError) -> Self {
        Self {
            status: err.status(),
            message: err.to_string(),
        }
    }
}

/// Failure of one listing page; aborts the current pagination loop only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageError {
    #[error("listing rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("listing rejected credentials ({status})")]
    Auth { status: u16 },
    #[error("listing returned {status}")]
    Upstream { status: u16 },
    #[error("listing body could not be parsed: {0}")]
    Malformed(String),
    #[error("listing transport failure: {0}")]
    Transport(String),
}
