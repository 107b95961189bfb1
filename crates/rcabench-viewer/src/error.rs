use arrow_schema::ArrowError;
use thiserror::Error;

use crate::codec::CodecError;

/// Failure while framing or decoding an Arrow IPC stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("Invalid IPC message: {0}")]
    Flatbuffer(String),
    #[error("Malformed IPC stream: {0}")]
    Malformed(&'static str),
    #[error("Invalid length {0} in IPC stream")]
    InvalidLength(i64),
    #[error("IPC stream ended in the middle of a message ({0} bytes left)")]
    Truncated(usize),
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Server responded with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Response has no body")]
    MissingBody,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Table {0} not found")]
    NotFound(u64),
    #[error("Batch schema does not match table {0}")]
    SchemaMismatch(u64),
    #[error("Table frame contains no schema")]
    EmptyFrame,
    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("Table worker is not running")]
    WorkerGone,
}

#[derive(Debug, Error)]
pub enum ViewerError {
    #[error("Viewer error: {0}")]
    Host(String),
}

/// Everything that can end a load session.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Received empty data. The file may be empty or the server returned no data.")]
    EmptyStream,
    #[error("Failed to decode data stream: {0}")]
    StreamDecode(#[from] DecodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Table engine error: {0}")]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Viewer(#[from] ViewerError),
    #[error("Load cancelled")]
    Cancelled,
}

impl LoadError {
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Hint text shown below the message in the error panel.
    #[must_use]
    pub const fn hint(&self) -> &'static str {
        match self {
            Self::EmptyStream => "Check that the file exists and contains rows.",
            Self::StreamDecode(_) => {
                "The file may be corrupted or use an unsupported compression codec."
            }
            Self::Transport(_) => "Check the network connection and the backend, then retry.",
            Self::Engine(_) | Self::Viewer(_) => "Try reloading the viewer.",
            Self::Cancelled => "",
        }
    }
}

impl From<CodecError> for LoadError {
    fn from(error: CodecError) -> Self {
        Self::StreamDecode(error.into())
    }
}
