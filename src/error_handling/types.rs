//! Error types shared across subsystems.
//!
//! Each subsystem owns one error enum; conversions between them happen at
//! the seams where one subsystem calls into another.

use std::fmt;

/// Errors raised by the container runtime adapter.
#[derive(Debug)]
pub enum ContainerError {
    RuntimeUnavailable(String),
    ImageUnavailable(String),
    ResourceExhausted(String),
    CreationFailed(String),
    StartFailed(String),
    ExecFailed(String),
    NotFound(String),
    ApiError(String),
    IoError(std::io::Error),
}

impl fmt::Display for ContainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerError::RuntimeUnavailable(msg) => {
                write!(f, "Container runtime is not available: {}", msg)
            }
            ContainerError::ImageUnavailable(msg) => write!(f, "Image unavailable: {}", msg),
            ContainerError::ResourceExhausted(msg) => write!(f, "Resources exhausted: {}", msg),
            ContainerError::CreationFailed(msg) => write!(f, "Container creation failed: {}", msg),
            ContainerError::StartFailed(msg) => write!(f, "Container start failed: {}", msg),
            ContainerError::ExecFailed(msg) => write!(f, "Container exec failed: {}", msg),
            ContainerError::NotFound(msg) => write!(f, "Container not found: {}", msg),
            ContainerError::ApiError(msg) => write!(f, "Container API error: {}", msg),
            ContainerError::IoError(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for ContainerError {}

impl From<std::io::Error> for ContainerError {
    fn from(err: std::io::Error) -> Self {
        ContainerError::IoError(err)
    }
}

impl From<bollard::errors::Error> for ContainerError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => ContainerError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 507,
                message,
            } => ContainerError::ResourceExhausted(message),
            other => ContainerError::ApiError(other.to_string()),
        }
    }
}

/// Errors raised by the metadata store.
#[derive(Debug)]
pub enum StorageError {
    ConnectionFailed(String),
    /// Insert collided with an existing row on a unique key.
    Conflict,
    /// A compare-and-set transition lost against a concurrent writer.
    StalePrecondition,
    NotFound,
    QueryFailed(String),
    /// A persisted value could not be decoded back into its domain type.
    CorruptRecord(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ConnectionFailed(msg) => write!(f, "Store connection failed: {}", msg),
            StorageError::Conflict => write!(f, "Row already exists"),
            StorageError::StalePrecondition => write!(f, "Stale precondition on status transition"),
            StorageError::NotFound => write!(f, "Row not found"),
            StorageError::QueryFailed(msg) => write!(f, "Query failed: {}", msg),
            StorageError::CorruptRecord(msg) => write!(f, "Corrupt record: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<sea_orm::DbErr> for StorageError {
    fn from(err: sea_orm::DbErr) -> Self {
        StorageError::QueryFailed(err.to_string())
    }
}

/// Errors surfaced by the session manager to its callers.
#[derive(Debug)]
pub enum SessionError {
    NotFound,
    /// The session is not in a state that permits the requested operation.
    NotAttachable(String),
    QuotaExceeded,
    RateLimited,
    ImageNotAllowed(String),
    InvalidUserId,
    /// Provisioning exceeded the overall create budget.
    CreateTimeout,
    Container(ContainerError),
    Storage(StorageError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotFound => write!(f, "Session not found"),
            SessionError::NotAttachable(status) => {
                write!(f, "Session not attachable in status {}", status)
            }
            SessionError::QuotaExceeded => write!(f, "Session quota exceeded"),
            SessionError::RateLimited => write!(f, "Rate limit exceeded"),
            SessionError::ImageNotAllowed(image) => write!(f, "Image not allowed: {}", image),
            SessionError::InvalidUserId => write!(f, "Invalid user id"),
            SessionError::CreateTimeout => write!(f, "Session creation timed out"),
            SessionError::Container(err) => write!(f, "Container error: {}", err),
            SessionError::Storage(err) => write!(f, "Storage error: {}", err),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ContainerError> for SessionError {
    fn from(err: ContainerError) -> Self {
        SessionError::Container(err)
    }
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        SessionError::Storage(err)
    }
}

/// Errors raised by the anonymizing egress supervisor.
#[derive(Debug)]
pub enum ProxyError {
    SpawnFailed(String),
    /// The SOCKS port did not become reachable within the probe budget.
    NotReady(String),
    IoError(std::io::Error),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::SpawnFailed(msg) => write!(f, "Proxy spawn failed: {}", msg),
            ProxyError::NotReady(msg) => write!(f, "Proxy not ready: {}", msg),
            ProxyError::IoError(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err)
    }
}
