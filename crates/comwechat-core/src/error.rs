//! Bridge errors

use std::io;
use std::path::PathBuf;

/// Failure reported by the chat-client command sink.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The control interface could not be reached
    #[error("chat client unreachable: {0}")]
    Transport(String),
    /// The control interface answered with an error status
    #[error("chat client rejected {command}: {message}")]
    Rejected { command: &'static str, message: String },
    /// The response did not have the expected shape
    #[error("unexpected chat client response to {command}: {message}")]
    Decode { command: &'static str, message: String },
}

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("config field `{0}` must be set")]
    Missing(&'static str),
}

/// Bridge error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Chat client error
    #[error(transparent)]
    Client(#[from] ClientError),
    /// Config error
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Filesystem error
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    /// JSON error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// No account is logged in on the chat client
    #[error("chat client is not logged in")]
    NotLoggedIn,
    /// Outbound message is missing its attachment
    #[error("outbound {0} message has no file")]
    MissingFile(&'static str),
    /// Command invoked by the master is unknown or malformed
    #[error("invalid command `{0}`")]
    InvalidCommand(String),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
