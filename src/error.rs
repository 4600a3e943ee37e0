//! Typed error values for the query engine.
//!
//! Every fallible library API returns [`QueryError`] through the crate-wide
//! [`Result`] alias. The variants mirror how failures propagate at runtime:
//! per-file problems (`Path`, `Io`, `Index`) are logged and counted but never
//! abort a query, while `Filter`, `Transport` and `Protocol` are fatal and
//! trigger the collective abort. The binary maps `Argument` and `Filter` to
//! exit code 2 and everything else to 1.

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = QueryError> = std::result::Result<T, E>;

/// Failure kinds of a distributed query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Bad option syntax or semantics, raised before anything is broadcast.
    #[error("argument error: {0}")]
    Argument(String),

    /// A path pattern or resolved file is unusable.
    #[error("path {path}: {reason}")]
    Path { path: PathBuf, reason: String },

    /// The filter expression failed to compile.
    #[error("filter error: {0}")]
    Filter(String),

    /// Read error on a flow file. Per-file; the file is skipped.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A Bloom sidecar is unreadable or malformed. The file is processed
    /// without pruning instead.
    #[error("index error: {0}")]
    Index(String),

    /// Send/recv failure on the data or progress channel. Fatal for the
    /// whole query.
    #[error("transport error: {0}")]
    Transport(String),

    /// Invariant violation in the coordinator/worker protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl QueryError {
    /// Process exit code for this error kind.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Argument(_) | Self::Filter(_) => 2,
            _ => 1,
        }
    }

    /// True for errors that abort the query rather than a single file.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Argument(_) | Self::Filter(_) | Self::Transport(_) | Self::Protocol(_)
        )
    }
}

impl From<postcard::Error> for QueryError {
    fn from(e: postcard::Error) -> Self {
        Self::Protocol(format!("codec: {e}"))
    }
}
