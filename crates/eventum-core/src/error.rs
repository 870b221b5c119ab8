//! Unified error types for Eventum using thiserror.
//!
//! Lifecycle and configuration misuse surface here; per-message outcomes
//! (rejected posts, unknown ids) are ordinary return values on the engine
//! API and never raise.

use thiserror::Error;

/// The unified error type for Eventum operations
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Invalid configuration: {field} - {message}")]
    ConfigInvalid { field: String, message: String },

    // Registration errors
    #[error("Unknown dispatcher: {dispatcher:?}")]
    UnknownDispatcher { dispatcher: String },

    #[error("Duplicate processor id: {id}")]
    DuplicateId { id: String },

    // Lifecycle errors
    #[error("Engine not started")]
    NotStarted,

    #[error("Engine already started")]
    AlreadyStarted,

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    // Generic wrapped error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a configuration error naming the offending field
    pub fn config_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigInvalid {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create an unknown-dispatcher error
    pub fn unknown_dispatcher(dispatcher: impl Into<String>) -> Self {
        Error::UnknownDispatcher {
            dispatcher: dispatcher.into(),
        }
    }

    /// Create a duplicate-id error
    pub fn duplicate_id(id: impl Into<String>) -> Self {
        Error::DuplicateId { id: id.into() }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Whether this error is a configuration problem caught at startup
    pub fn is_config(&self) -> bool {
        matches!(self, Error::ConfigInvalid { .. })
    }
}

/// Result type alias for Eventum operations
pub type Result<T> = std::result::Result<T, Error>;
