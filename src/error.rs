use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Device unreachable: {0}")]
    DeviceUnreachable(String),

    #[error("Transfer read error: {0}")]
    TransferRead(String),

    #[error("Integrity mismatch: {0}")]
    IntegrityMismatch(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a later attempt at the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::DeviceUnreachable(_) | Error::TransferRead(_) | Error::Io(_)
        )
    }

    /// Map a filesystem error, keeping not-found and permission failures
    /// distinguishable from generic IO errors.
    pub fn from_io(context: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("{}: {}", context, err)),
            std::io::ErrorKind::PermissionDenied => {
                Error::PermissionDenied(format!("{}: {}", context, err))
            }
            _ => Error::Io(format!("{}: {}", context, err)),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::from_io("io", err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(err.to_string())
    }
}
