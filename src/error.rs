use thiserror::Error;

/// The error type shared by every storage adapter, data access
/// implementation and the host transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The requested identifier does not exist in the backend.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend rejected a write (quota, permissions, network).
    #[error("failed to write to storage: {0}")]
    StorageWrite(String),

    /// A backend was selected or built outside of the environment
    /// it can operate in.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The privileged process or network call failed independently
    /// of what was being asked of it.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The caller gave us something we cannot act on, e.g. an empty id.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StorageError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn write(reason: impl std::fmt::Display) -> Self {
        Self::StorageWrite(reason.to_string())
    }

    pub fn transport(reason: impl std::fmt::Display) -> Self {
        Self::Transport(reason.to_string())
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidInput(reason.into())
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    #[inline]
    pub fn is_write_error(&self) -> bool {
        matches!(self, Self::StorageWrite(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
