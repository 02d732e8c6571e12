//! Error type for compound file operations.
use thiserror::Error;

/// Main error type for olestore operations.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error from the backing stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Header or record does not follow the compound file layout
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Allocation tables or directory reference data that cannot be valid
    /// (cycles, out-of-range sector ids, dangling SIDs)
    #[error("Corrupted file: {0}")]
    CorruptedFile(String),

    /// Named entry does not exist, or the handle refers to a deleted entry
    #[error("Entry not found: {0}")]
    NotFound(String),

    /// An entry with the same name already exists in the storage
    #[error("Entry already exists: {0}")]
    Duplicate(String),

    /// Name is empty, too long, or contains a reserved character
    #[error("Invalid entry name: {0}")]
    InvalidName(String),

    /// The owning compound file was closed
    #[error("Compound file has been closed")]
    Disposed,

    /// Stream or file would exceed what the format version can address
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// The file is already opened for writing elsewhere
    #[error("Sharing violation: {0} is locked by another writer")]
    SharingViolation(String),

    /// The compound file was opened read-only
    #[error("Compound file is opened read-only")]
    ReadOnly,

    /// The operation is not allowed in the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    /// Whether the error reports a malformed or corrupted container.
    pub fn is_format_error(&self) -> bool {
        matches!(self, Error::InvalidFormat(_) | Error::CorruptedFile(_))
    }
}

/// Result type for olestore operations.
pub type Result<T> = std::result::Result<T, Error>;
