//! Error types and Result alias for the storage engine.
//!
//! Every fallible operation in this crate returns `Result<T>`. `ErrorCode`
//! enumerates the status categories from the engine's external contract;
//! `Error` wraps a code with whatever context is available (an I/O error, a
//! message, or nothing beyond the code itself).

use std::fmt;
use std::io;

/// Status codes returned across the engine's module boundaries.
///
/// Grouped the way the engine's own error-handling design groups them:
/// invalid argument, not found, conflict, resource, I/O, integrity,
/// recovery, and capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCode {
    // Invalid argument
    InvParameter,
    InvKeysize,
    InvPagesize,
    InvFileHeader,
    InvFileVersion,
    // Not found
    KeyNotFound,
    DatabaseNotFound,
    FilterNotFound,
    // Conflict
    DuplicateKey,
    DatabaseAlreadyExists,
    DatabaseAlreadyOpen,
    CursorStillOpen,
    // Resource
    OutOfMemory,
    CacheFull,
    LimitsReached,
    // I/O
    IoError,
    FileNotFound,
    // Integrity
    IntegrityViolated,
    BlobNotFound,
    LogInvFileHeader,
    // Recovery
    NeedRecovery,
    // Capability
    NotImplemented,
    NotInitialized,
    AlreadyInitialized,
    DbReadOnly,
}

impl ErrorCode {
    /// A short, stable name for this code (used in `Display` and logs).
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvParameter => "invalid parameter",
            ErrorCode::InvKeysize => "invalid key size",
            ErrorCode::InvPagesize => "invalid page size",
            ErrorCode::InvFileHeader => "invalid file header",
            ErrorCode::InvFileVersion => "invalid file version",
            ErrorCode::KeyNotFound => "key not found",
            ErrorCode::DatabaseNotFound => "database not found",
            ErrorCode::FilterNotFound => "filter not found",
            ErrorCode::DuplicateKey => "duplicate key",
            ErrorCode::DatabaseAlreadyExists => "database already exists",
            ErrorCode::DatabaseAlreadyOpen => "database already open",
            ErrorCode::CursorStillOpen => "cursor still open",
            ErrorCode::OutOfMemory => "out of memory",
            ErrorCode::CacheFull => "cache full",
            ErrorCode::LimitsReached => "limits reached",
            ErrorCode::IoError => "I/O error",
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::IntegrityViolated => "integrity violated",
            ErrorCode::BlobNotFound => "blob not found",
            ErrorCode::LogInvFileHeader => "invalid log file header",
            ErrorCode::NeedRecovery => "database needs recovery",
            ErrorCode::NotImplemented => "not implemented",
            ErrorCode::NotInitialized => "not initialized",
            ErrorCode::AlreadyInitialized => "already initialized",
            ErrorCode::DbReadOnly => "database opened read-only",
        }
    }

    /// Whether the caller may sensibly retry this operation after freeing
    /// resources. Only the cache-purge path relies on this.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::CacheFull | ErrorCode::LimitsReached)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The engine's error type: a code plus whatever context was available.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Code(ErrorCode),

    #[error("{code}: {message}")]
    Message { code: ErrorCode, message: String },

    #[error("{code}: {source}")]
    Io {
        code: ErrorCode,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Error::Code(code)
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Message {
            code,
            message: message.into(),
        }
    }

    pub fn io(code: ErrorCode, source: io::Error) -> Self {
        Error::Io { code, source }
    }

    /// The status code this error carries, regardless of variant.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Code(c) => *c,
            Error::Message { code, .. } => *code,
            Error::Io { code, .. } => *code,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        let code = match source.kind() {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            _ => ErrorCode::IoError,
        };
        Error::Io { code, source }
    }
}

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_text() {
        let e = Error::new(ErrorCode::KeyNotFound);
        assert_eq!(e.to_string(), "key not found");
        assert_eq!(e.code(), ErrorCode::KeyNotFound);
    }

    #[test]
    fn cache_full_is_retryable() {
        assert!(ErrorCode::CacheFull.is_retryable());
        assert!(!ErrorCode::IntegrityViolated.is_retryable());
    }

    #[test]
    fn io_error_maps_not_found() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "nope");
        let e: Error = io_err.into();
        assert_eq!(e.code(), ErrorCode::FileNotFound);
    }
}
