use thiserror::Error;

/// Errors surfaced by the dedup and restore engines.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("internal storage error: {0}")]
    StorageError(String),
}

impl From<redb::Error> for Error {
    fn from(value: redb::Error) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(value: redb::DatabaseError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(value: redb::TableError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(value: redb::TransactionError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(value: redb::StorageError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(value: redb::CommitError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(value.to_string())
        } else {
            Error::StorageError(value.to_string())
        }
    }
}

impl From<cirrus_wire::FrameError> for Error {
    fn from(value: cirrus_wire::FrameError) -> Self {
        Error::InvalidRequest(value.to_string())
    }
}

impl From<cirrus_wire::metadata::MetadataError> for Error {
    fn from(value: cirrus_wire::metadata::MetadataError) -> Self {
        Error::InvalidRequest(value.to_string())
    }
}

impl From<crate::layout::LayoutError> for Error {
    fn from(value: crate::layout::LayoutError) -> Self {
        Error::Corrupt(value.to_string())
    }
}
