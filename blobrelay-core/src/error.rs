//! Structured error types for the transfer engine.
//!
//! Every failure a transfer can end with maps onto one [`TransferError`]
//! variant, and every variant maps onto exactly one terminal [`Outcome`].
//! The HTTP layer and the CLI only ever see these types.

use std::fmt;
use std::io;
use thiserror::Error;

/// Main error type for blobrelay-core operations
#[derive(Error, Debug)]
pub enum TransferError {
    /// No connection became available before the acquire timeout
    #[error("connection pool exhausted: {reason}")]
    PoolExhausted { reason: String },

    /// The backing store could not be reached
    #[error("failed to connect to backing store: {reason}")]
    ConnectFailed { reason: String },

    /// Object, file or registered stream is absent
    #[error("{resource} '{id}' not found")]
    NotFound { resource: &'static str, id: String },

    /// The store refused access to the object
    #[error("access denied to {resource} '{id}'")]
    Denied { resource: &'static str, id: String },

    /// I/O failure on either side of a transfer
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// The backing store reported an error mid-transfer
    #[error("backing store error: {reason}")]
    Store { reason: String },

    /// The peer went away before the transfer completed
    #[error("transfer cancelled by peer")]
    Cancelled,

    /// Malformed identifier or parameter; nothing was acquired
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    /// The stream registry refused a new entry
    #[error("stream registry is full ({capacity} entries)")]
    RegistryFull { capacity: usize },
}

/// Result type alias for blobrelay-core operations
pub type Result<T> = std::result::Result<T, TransferError>;

/// Terminal outcome of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    NotFound,
    Denied,
    StreamError,
    Cancelled,
    PoolExhausted,
    ConnectFailed,
    InvalidInput,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NotFound => "not_found",
            Self::Denied => "denied",
            Self::StreamError => "stream_error",
            Self::Cancelled => "cancelled",
            Self::PoolExhausted => "pool_exhausted",
            Self::ConnectFailed => "connect_failed",
            Self::InvalidInput => "invalid_input",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TransferError {
    /// Create a pool exhausted error
    pub fn pool_exhausted(reason: impl Into<String>) -> Self {
        Self::PoolExhausted {
            reason: reason.into(),
        }
    }

    /// Create a connect failure
    pub fn connect_failed(reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            reason: reason.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// Create an access denied error
    pub fn denied(resource: &'static str, id: impl ToString) -> Self {
        Self::Denied {
            resource,
            id: id.to_string(),
        }
    }

    /// Create a store error
    pub fn store(reason: impl Into<String>) -> Self {
        Self::Store {
            reason: reason.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    /// The terminal outcome this error closes a transfer with.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::PoolExhausted { .. } | Self::RegistryFull { .. } => Outcome::PoolExhausted,
            Self::ConnectFailed { .. } => Outcome::ConnectFailed,
            Self::NotFound { .. } => Outcome::NotFound,
            Self::Denied { .. } => Outcome::Denied,
            Self::Io { .. } | Self::Store { .. } => Outcome::StreamError,
            Self::Cancelled => Outcome::Cancelled,
            Self::InvalidInput { .. } => Outcome::InvalidInput,
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::ConnectFailed { .. } | Self::RegistryFull { .. }
        )
    }

    /// Map an I/O error from a filesystem access onto the taxonomy.
    pub fn from_fs(err: io::Error, id: impl ToString) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::not_found("file", id),
            io::ErrorKind::PermissionDenied => Self::denied("file", id),
            _ => Self::Io { source: err },
        }
    }
}
