//! Error types for the indexing core.
//!
//! Filesystem and probe failures are local to a single path and are
//! logged where they happen. Store failures travel up to the DB
//! controller. `Terminated` is the cooperative abort of a long loop and is
//! never reported as a failure.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience type for the agent's fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Things that can go wrong in the agent core.
#[derive(Error, Debug)]
pub enum Error {
    /// A long operation noticed that the term-long counter moved.
    #[error("operation terminated")]
    Terminated,

    /// Every configured root failed to start.
    #[error("no directories to watch")]
    NoDirectories,

    /// A non-reentrant operation was requested while already running.
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("indexing root '{0}' is not a directory")]
    RootNotDirectory(PathBuf),

    #[error("notification error: {0}")]
    Notify(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    /// The private configuration file has unsafe ownership or mode.
    #[error("security violation: {0}")]
    Security(String),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl Error {
    /// True for cooperative aborts, which callers treat as graceful.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Error::Terminated | Error::Store(StoreError::Terminated))
    }
}

/// Failures while resolving a single path into an object record.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// The path vanished before we could stat it.
    #[error("path not found: '{0}'")]
    NotFound(PathBuf),

    #[error("failed to stat '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProbeError {
    /// Classifies an I/O error for the given path.
    pub fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path)
        } else {
            Self::Io { path, source }
        }
    }
}

/// Backend failures surfaced through the store contract.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("LMDB error: {0}")]
    Lmdb(#[from] heed::Error),

    #[error("tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("encoding error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid store location '{0}'")]
    InvalidLocation(String),

    #[error("store has been stopped")]
    Stopped,

    /// A streaming scan was cut short by term-long.
    #[error("scan terminated")]
    Terminated,
}

impl From<tantivy::directory::error::OpenDirectoryError> for StoreError {
    fn from(err: tantivy::directory::error::OpenDirectoryError) -> Self {
        StoreError::Tantivy(err.into())
    }
}
