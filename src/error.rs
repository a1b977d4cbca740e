//! Error types for par-zip

use std::io;

/// Result type for par-zip operations
pub type Result<T> = std::result::Result<T, ZipError>;

/// Stable numeric error codes reported to embedders.
///
/// The values form a contiguous range starting at -10000 and must never be
/// reordered; hosts match on the numbers, not the names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Cancelled = -9999,
    FileNotFound = -9998,
    NoMoreFile = -9997,
    PathTooLong = -9996,
    InvalidArgument = -9995,
    InvalidPath = -9994,
    ZipHasMaliciousPath = -9993,
    InternalError = -9992,
    Mkdir = -9991,
    ZipEntryNotFound = -9990,
    ZipEntryAlreadyExists = -9989,
    FileAlreadyExists = -9988,
}

/// Error types that can occur during archive operations
#[derive(Debug)]
pub enum ZipError {
    /// I/O error
    Io(io::Error),
    /// Invalid ZIP/TAR format or structure
    InvalidFormat(String),
    /// Entry not found in the archive
    EntryNotFound(String),
    /// An entry with this name already exists
    EntryAlreadyExists(String),
    /// Unsupported compression method
    UnsupportedCompression(u16),
    /// Encryption/decryption error
    EncryptionError(String),
    /// Incorrect or missing password
    IncorrectPassword,
    /// The operation was cancelled
    Cancelled,
    /// Invalid argument (bad thread count, empty input list, ...)
    InvalidArgument(&'static str),
    /// Malformed entry base or input path
    InvalidPath(String),
    /// Archive entry name escapes the extraction root
    MaliciousPath(String),
    /// Input file or directory does not exist
    FileNotFound(String),
    /// Failed to create a directory
    Mkdir(String),
    /// Internal invariant violation
    Internal(String),
}

impl ZipError {
    /// The stable numeric code for this error (-10000 range).
    pub fn code(&self) -> i32 {
        let code = match self {
            ZipError::Cancelled => ErrorCode::Cancelled,
            ZipError::FileNotFound(_) => ErrorCode::FileNotFound,
            ZipError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            ZipError::InvalidPath(_) => ErrorCode::InvalidPath,
            ZipError::MaliciousPath(_) => ErrorCode::ZipHasMaliciousPath,
            ZipError::Mkdir(_) => ErrorCode::Mkdir,
            ZipError::EntryNotFound(_) => ErrorCode::ZipEntryNotFound,
            ZipError::EntryAlreadyExists(_) => ErrorCode::ZipEntryAlreadyExists,
            ZipError::Io(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                ErrorCode::FileAlreadyExists
            }
            _ => ErrorCode::InternalError,
        };
        code as i32
    }
}

impl std::fmt::Display for ZipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZipError::Io(e) => write!(f, "I/O error: {}", e),
            ZipError::InvalidFormat(msg) => write!(f, "Invalid archive format: {}", msg),
            ZipError::EntryNotFound(name) => write!(f, "Entry not found: {}", name),
            ZipError::EntryAlreadyExists(name) => write!(f, "Entry already exists: {}", name),
            ZipError::UnsupportedCompression(method) => {
                write!(f, "Unsupported compression method: {}", method)
            }
            ZipError::EncryptionError(msg) => write!(f, "Encryption error: {}", msg),
            ZipError::IncorrectPassword => write!(f, "Incorrect password"),
            ZipError::Cancelled => write!(f, "Operation cancelled"),
            ZipError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            ZipError::InvalidPath(path) => write!(f, "Invalid path: {}", path),
            ZipError::MaliciousPath(path) => write!(f, "Malicious entry path: {}", path),
            ZipError::FileNotFound(path) => write!(f, "File not found: {}", path),
            ZipError::Mkdir(path) => write!(f, "Failed to create directory: {}", path),
            ZipError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ZipError {}

impl From<io::Error> for ZipError {
    fn from(err: io::Error) -> Self {
        ZipError::Io(err)
    }
}

impl From<walkdir::Error> for ZipError {
    fn from(err: walkdir::Error) -> Self {
        match err.io_error() {
            Some(io_err) if io_err.kind() == io::ErrorKind::NotFound => ZipError::FileNotFound(
                err.path().map_or_else(String::new, |p| p.display().to_string()),
            ),
            _ => ZipError::Io(io::Error::other(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ZipError::Cancelled.code(), -9999);
        assert_eq!(ZipError::MaliciousPath("../x".into()).code(), -9993);
        assert_eq!(ZipError::EntryNotFound("a".into()).code(), -9990);
        assert_eq!(ZipError::EntryAlreadyExists("a".into()).code(), -9989);
        assert_eq!(ErrorCode::FileAlreadyExists as i32, -9988);
    }
}
