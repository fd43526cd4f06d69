use std::{collections::TryReserveError, io, path::PathBuf};

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure a table operation can report.
///
/// `KeyNotExists` and `KeyAlreadyExists` are ordinary outcomes that callers are
/// expected to check for. Everything else means the operation was aborted; no
/// partial rollback happens, so an interrupted insert may leave an unreachable
/// record in the data file while the index stays consistent.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to create '{}': {source}", path.display())]
    Create { path: PathBuf, source: io::Error },

    #[error("failed to open '{}': {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    /// Mapping a window failed and the read emulation failed as well.
    #[error("failed to map {len} bytes at offset {offset}: {source}")]
    Map {
        offset: u64,
        len: usize,
        source: io::Error,
    },

    #[error("out of memory: {0}")]
    Alloc(#[from] TryReserveError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid signature in '{}'", .0.display())]
    Signature(PathBuf),

    #[error("unsupported version {found} in '{}' (expected {expected})", path.display())]
    Version {
        path: PathBuf,
        found: u8,
        expected: u8,
    },

    #[error("corrupted table: {0}")]
    Corrupted(String),

    #[error("access of {len} bytes at offset {offset} exceeds region size {size}")]
    OutOfBounds { offset: u64, len: usize, size: u64 },

    #[error("table is opened read-only")]
    ReadOnly,

    #[error("table is closed")]
    NotInited,

    #[error("{0} does not fit the on-disk format")]
    TooLarge(&'static str),

    #[error("key does not exist")]
    KeyNotExists,

    #[error("key already exists")]
    KeyAlreadyExists,
}

impl Error {
    /// True for the expected "key is absent" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotExists)
    }

    pub(crate) fn create(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Create {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn open(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Open {
            path: path.into(),
            source,
        }
    }
}
