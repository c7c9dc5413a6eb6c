//! Error kinds shared by the access-control, invitation and session layers.

use thiserror::Error;

pub type Result<T, E = HubError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    /// Durable or cache backend failure. The message is never shown to clients.
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Coarse classification used by transports to pick a status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    StorageFailure,
}

impl HubError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        HubError::InvalidArgument(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        HubError::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        HubError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        HubError::Conflict(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            HubError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            HubError::Forbidden(_) => ErrorKind::Forbidden,
            HubError::NotFound(_) => ErrorKind::NotFound,
            HubError::Conflict(_) => ErrorKind::Conflict,
            HubError::Storage(_) => ErrorKind::StorageFailure,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, HubError::Conflict(_))
    }
}
