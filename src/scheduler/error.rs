//! Error types returned by lookup drivers

use thiserror::Error;

use crate::error::{ErrorCategory, ErrorClass};

/// Failure reported by a [`LookupProvider`](super::LookupProvider)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// Endpoint, app or network hiccup; retrying may succeed
    #[error("transient lookup failure: {0}")]
    Transient(String),

    /// The provider rejected the number; retrying this provider is pointless
    #[error("terminal lookup failure: {0}")]
    Terminal(String),

    /// The driver did not answer within the per-call timeout
    #[error("lookup timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl LookupError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }
}

impl ErrorClass for LookupError {
    fn is_recoverable(&self) -> bool {
        !self.is_terminal()
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Lookup
    }
}
