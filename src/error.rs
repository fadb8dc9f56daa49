use std::io;
use std::result;

use thiserror::Error;

/// Custom result type for lumokv operations
pub type Result<T> = result::Result<T, Error>;

/// Engine and retry-layer errors.
///
/// The two recoverable conditions are `MapFull` (the write path grows the
/// arena and retries) and `MapResized` (any path refreshes its view of the
/// map size and retries). Everything else is fatal to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Key/data pair already exists
    #[error("Key/data pair already exists")]
    KeyExist,
    /// Database file is corrupted
    #[error("Database file is corrupted")]
    Corrupted,
    /// Database version mismatch
    #[error("Database version mismatch")]
    VersionMismatch,
    /// File is not a valid lumokv file
    #[error("File is not a valid lumokv file")]
    Invalid,
    /// Environment mapsize limit reached
    #[error("Environment mapsize limit reached")]
    MapFull,
    /// Environment was resized by another handle
    #[error("Database contents grew beyond environment mapsize")]
    MapResized,
    /// Transaction must abort, has already finished, or is invalid
    #[error("Transaction must abort, has a child, or is invalid")]
    BadTxn,
    /// Unsupported size of key or value
    #[error("Unsupported size of key or data")]
    BadValSize,
    /// Environment is read-only
    #[error("Environment is read-only")]
    EnvReadOnly,
    /// Environment is closed
    #[error("Environment is closed")]
    EnvClosed,
    /// Environment map size is invalid
    #[error("Invalid map size: {0}")]
    EnvInvalidMapSize(usize),
    /// Invalid environment configuration
    #[error("Invalid environment configuration: {0}")]
    EnvInvalidConfig(String),
    /// Transaction is read-only
    #[error("Transaction is read-only")]
    TxnReadOnly,
    /// Transaction retry attempts exhausted
    #[error("Transaction retry attempts exhausted: {0}")]
    TxnRetryExhausted(Box<Error>),
    /// Configuration file could not be read or written
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// LMDB-compatible error code, where one exists.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::KeyExist => Some(-30799),
            Error::Corrupted => Some(-30796),
            Error::VersionMismatch => Some(-30794),
            Error::Invalid => Some(-30793),
            Error::MapFull => Some(-30792),
            Error::MapResized => Some(-30785),
            Error::BadTxn => Some(-30782),
            Error::BadValSize => Some(-30781),
            Error::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }

    /// True for the arena-full condition.
    pub fn is_map_full(&self) -> bool {
        matches!(self, Error::MapFull)
    }

    /// True for the resized-by-other condition.
    pub fn is_map_resized(&self) -> bool {
        matches!(self, Error::MapResized)
    }
}
