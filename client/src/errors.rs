use thiserror::Error;

use cirrus_dispersal::chunker::ChunkerError;
use cirrus_dispersal::CodecError;
use cirrus_wire::FrameError;

/// Errors surfaced by the client pipelines.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Chunker(#[from] ChunkerError),

    #[error("invalid cluster config: {0}")]
    Config(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("pipeline stage died: {0}")]
    Pipeline(String),
}

impl From<cirrus_wire::metadata::MetadataError> for ClientError {
    fn from(value: cirrus_wire::metadata::MetadataError) -> Self {
        ClientError::Protocol(value.to_string())
    }
}

impl From<tokio::task::JoinError> for ClientError {
    fn from(value: tokio::task::JoinError) -> Self {
        ClientError::Pipeline(value.to_string())
    }
}
