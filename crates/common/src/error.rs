//! Common error types for the registry components.

use std::fmt;

/// A specialized Result type for registry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for registry operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("registry service is not running")]
    NotRunning,

    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("validation failed for {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("service group not found: {0}")]
    GroupNotFound(String),

    #[error("service instance not found: {0}")]
    InstanceNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("event error: {0}")]
    Event(String),

    #[error("healthcheck error: {0}")]
    Healthcheck(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("unknown error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new field validation error.
    pub fn validation(field: &'static str, reason: impl fmt::Display) -> Self {
        Error::Validation {
            field,
            reason: reason.to_string(),
        }
    }

    /// Create a new invalid parameter error.
    pub fn invalid_parameter(msg: impl fmt::Display) -> Self {
        Error::InvalidParameter(msg.to_string())
    }

    /// Create a new storage error.
    pub fn storage(msg: impl fmt::Display) -> Self {
        Error::Storage(msg.to_string())
    }

    /// Create a new event error.
    pub fn event(msg: impl fmt::Display) -> Self {
        Error::Event(msg.to_string())
    }

    /// Create a new healthcheck error.
    pub fn healthcheck(msg: impl fmt::Display) -> Self {
        Error::Healthcheck(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new other error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }

    /// Wrap this error with the operation that produced it.
    pub fn context(self, context: impl fmt::Display) -> Self {
        Error::Context {
            context: context.to_string(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, skipping context wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for any of the "not found" lookups, even when wrapped.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            Error::ServiceNotFound(_) | Error::GroupNotFound(_) | Error::InstanceNotFound(_)
        )
    }

    /// True for validation and parameter errors, even when wrapped.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.root(),
            Error::Validation { .. } | Error::InvalidParameter(_)
        )
    }
}

/// Attach operation context to a `Result`.
pub trait ResultExt<T> {
    fn context(self, context: impl fmt::Display) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl fmt::Display) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}
