use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced by the reversing core.
///
/// Passes recover per-record failures internally; of these, only [Error::Input]
/// and [Error::Invariant] abort a pipeline run.
#[derive(Error, Debug)]
pub enum Error {
    /// Dump or heap metadata is missing or invalid. Fatal.
    #[error("invalid input: {0}")]
    Input(String),

    /// A byte-oracle read fell outside every mapping.
    #[error("read out of range: {addr:#x} len {len}")]
    OutOfRange { addr: u64, len: usize },

    /// A cache file could not be decoded. The file is removed and the
    /// record recomputed; this only propagates when that recovery fails too.
    #[error("corrupt cache file {path:?}: {reason}")]
    CacheCorrupt { path: PathBuf, reason: String },

    /// An internal assertion tripped. Fatal.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("bad layout description: {0}")]
    Layout(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invariant(msg: impl Into<String>) -> Error {
        Error::Invariant(msg.into())
    }

    pub fn input(msg: impl Into<String>) -> Error {
        Error::Input(msg.into())
    }

    /// True for errors a pass may not swallow on a per-record basis.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Input(_) | Error::Invariant(_) => true,
            _ => false,
        }
    }

    /// Process exit code for this failure: 4 for a corrupt cache, 3 for
    /// everything else that aborts a run (bad arguments exit with 2 before
    /// any `Error` exists).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::CacheCorrupt { .. } => 4,
            _ => 3,
        }
    }
}
