//! Errors raised by client-side operations.

use std::io;
use std::path::PathBuf;

use crate::transport::{ResultCode, TransportError};

/// Alias for `Result<T, appdeploy::DeployError>`.
pub type Result<T> = std::result::Result<T, DeployError>;

/// A local failure while talking to a deploy server.
///
/// Every variant maps to the [`ResultCode`] the client exits with.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DeployError {
    /// The source file could not be opened or inspected.
    #[error("source {path}: {source}")]
    Source {
        /// The file that failed.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Reading the source failed after it was opened.
    #[error("read {path}: {source}")]
    Read {
        /// The file that failed.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Enumerating a source directory failed.
    #[error("walk directory: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// The connection failed.
    #[error("socket: {0}")]
    Socket(TransportError),

    /// The server did not answer before the deadline.
    #[error("timed out waiting for server response")]
    Timeout,

    /// TLS material could not be loaded.
    #[error("certificate: {0:#}")]
    Certificate(anyhow::Error),

    /// The server sent something that is not a response.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl DeployError {
    /// Result code reported for this failure.
    pub const fn code(&self) -> ResultCode {
        match self {
            Self::Source { .. } => ResultCode::SourceUnreadable,
            Self::Read { .. } => ResultCode::ReadFailed,
            Self::WalkDir(_) => ResultCode::WalkDirFailed,
            Self::Socket(_) => ResultCode::Socket,
            Self::Timeout => ResultCode::Timeout,
            Self::Certificate(_) => ResultCode::Certificate,
            Self::Malformed(_) => ResultCode::Malformed,
        }
    }
}

impl From<TransportError> for DeployError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => Self::Timeout,
            other => Self::Socket(other),
        }
    }
}
