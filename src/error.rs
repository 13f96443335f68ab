//! Unified error handling for the phonecheck crate
//!
//! This module provides a unified error type that consolidates all domain-specific
//! errors into a single `Error` enum, while keeping the failure taxonomy the
//! scheduler relies on visible in the variants.
//!
//! # Architecture
//!
//! - [`ErrorClass`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use phonecheck::error::{Error, ErrorClass};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         println!("Retrying: {err}");
//!     } else {
//!         eprintln!("Fatal error: {err}");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

use crate::models::{JobId, Provider};

pub use crate::scheduler::error::LookupError;

/// Common trait for all phonecheck error types
pub trait ErrorClass: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// No endpoint could be leased in time
    Resource,
    /// Lookup driver failures
    Lookup,
    /// Storage and I/O errors
    Storage,
    /// Shared store (Redis) errors
    Coordination,
    /// Configuration and validation errors
    Config,
    /// Caller supplied bad data or an unknown id
    Input,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resource => "resource",
            Self::Lookup => "lookup",
            Self::Storage => "storage",
            Self::Coordination => "coordination",
            Self::Config => "config",
            Self::Input => "input",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the phonecheck crate
#[derive(Error, Debug)]
pub enum Error {
    /// No healthy, unleased endpoint for the provider within the timeout
    #[error("No endpoint available for {provider} after {waited_ms}ms")]
    ResourceUnavailable { provider: Provider, waited_ms: u64 },

    /// Lookup driver failure (transient or terminal)
    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    /// Query for an unknown job id
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Invalid routing table, provider binding or settings
    #[error("Config error: {0}")]
    Config(String),

    /// Malformed submission (empty, oversized, unparseable numbers)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Repository or cache storage failure not covered by a library error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// Redis command errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis connection pool errors
    #[error("Redis pool error: {0}")]
    RedisPool(#[from] deadpool_redis::PoolError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The scheduler is draining and accepts no new work
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ErrorClass for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::ResourceUnavailable { .. } => true,
            Self::Lookup(e) => e.is_recoverable(),
            Self::JobNotFound(_) => false,
            Self::Config(_) => false,
            Self::InvalidInput(_) => false,
            Self::Storage(_) => true,
            Self::Database(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            Self::Redis(_) | Self::RedisPool(_) => true, // connection hiccups are common
            Self::Io(_) => true,
            Self::Json(_) => false,
            Self::ShuttingDown => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::ResourceUnavailable { .. } => ErrorCategory::Resource,
            Self::Lookup(_) => ErrorCategory::Lookup,
            Self::JobNotFound(_) | Self::InvalidInput(_) => ErrorCategory::Input,
            Self::Config(_) => ErrorCategory::Config,
            Self::Storage(_) | Self::Database(_) | Self::Io(_) | Self::Json(_) => {
                ErrorCategory::Storage
            }
            Self::Redis(_) | Self::RedisPool(_) => ErrorCategory::Coordination,
            Self::ShuttingDown | Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }
}

// Conversion from rusqlite::Error
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err)
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: Some(err.into()),
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
