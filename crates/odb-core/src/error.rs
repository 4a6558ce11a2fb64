//! Error types for ODB operations
//!
//! All engine errors are represented by the OdbError enum. Variants carry
//! enough context (paths, offsets, sizes) to diagnose the failure without
//! re-running the call. Recoverable conditions are returned to the caller;
//! structural impossibilities inside the engine abort the process instead
//! (see `region::fatal`).

use std::path::PathBuf;

use thiserror::Error;

/// ODB error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum OdbError {
    /// Handle does not refer to a live key inside the index area
    #[error("Invalid handle {handle}")]
    InvalidHandle {
        /// The offending key offset
        handle: u32,
    },

    /// Key name or path is malformed
    #[error("Invalid name \"{name}\": {reason}")]
    InvalidName {
        /// The rejected name or path
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// Path does not resolve to a key
    #[error("Key \"{path}\" not found")]
    NoSuchKey {
        /// Path that was looked up
        path: String,
    },

    /// Access mode forbids the operation (read/write/delete/exclusive)
    #[error("No access to \"{path}\": {reason}")]
    NoAccess {
        /// Path of the protected key
        path: String,
        /// Which permission was missing
        reason: String,
    },

    /// Declared type differs from stored type
    #[error("Type mismatch on \"{path}\": expected {expected}, found {found}")]
    TypeMismatch {
        /// Path of the key
        path: String,
        /// Type requested by the caller
        expected: String,
        /// Type stored in the database
        found: String,
    },

    /// Index or size outside the permitted range
    #[error("{what} {value} out of range (limit {limit})")]
    OutOfRange {
        /// What was out of range (index, size, ...)
        what: String,
        /// The rejected value
        value: u64,
        /// The limit it violated
        limit: u64,
    },

    /// No free block large enough in the index or payload area
    #[error("Region full: cannot allocate {requested} bytes in {area} area")]
    RegionFull {
        /// Area name ("key" or "data")
        area: &'static str,
        /// Requested size in bytes
        requested: u32,
    },

    /// Output buffer too small; the bytes that fit were still copied
    #[error("Buffer truncated: need {needed} bytes, have {available}")]
    Truncated {
        /// Full size of the value
        needed: usize,
        /// Size of the caller's buffer
        available: usize,
    },

    /// Delete or resize blocked by an outstanding hot-link
    #[error("Key \"{path}\" has open records")]
    OpenRecord {
        /// Path of the key holding the open record
        path: String,
    },

    /// Corruption detected that cannot be repaired in place
    #[error("Database corrupted at offset {offset}: {reason}")]
    Corrupted {
        /// Region offset where the corruption was found
        offset: u32,
        /// Description of the corruption
        reason: String,
    },

    /// Region was created by an incompatible engine version
    #[error("Region version mismatch: found {found}, expected {expected}")]
    VersionMismatch {
        /// Version stored in the region header
        found: u32,
        /// Version this engine understands
        expected: u32,
    },

    /// Key already exists with a conflicting definition
    #[error("Key \"{path}\" already exists")]
    KeyExists {
        /// Path of the existing key
        path: String,
    },

    /// Symbolic link cannot be created or resolved
    #[error("Invalid link \"{path}\": {reason}")]
    InvalidLink {
        /// Path of the link key or target
        path: String,
        /// Why the link is invalid
        reason: String,
    },

    /// Local record buffer does not match the subtree layout
    #[error("Record size mismatch: expected {expected} bytes, got {actual}")]
    StructSizeMismatch {
        /// Size computed from the subtree
        expected: usize,
        /// Size supplied by the caller
        actual: usize,
    },

    /// All client slots in the region header are taken
    #[error("Client table full ({max} clients)")]
    ClientTableFull {
        /// Capacity of the client table
        max: usize,
    },

    /// This attachment's client slot was reclaimed by another client's sweep
    #[error("Client slot {slot} was reclaimed; attach again")]
    ClientReclaimed {
        /// Slot the attachment used to own
        slot: usize,
    },

    /// Client already holds the maximum number of open records
    #[error("Too many open records ({max})")]
    TooManyOpenRecords {
        /// Capacity of the per-client open record table
        max: usize,
    },

    /// Snapshot file checksum verification failed
    #[error("Checksum mismatch in {}: expected 0x{expected:08x}, got 0x{actual:08x}", path.display())]
    ChecksumMismatch {
        /// Snapshot file
        path: PathBuf,
        /// Checksum stored in the file
        expected: u32,
        /// Checksum computed over the payload
        actual: u32,
    },

    /// Configuration rejected by `Config::validate`
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind:?})", path.as_ref().map(|p| format!(" in {}", p.display())).unwrap_or_default())]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },
}

impl OdbError {
    /// Recoverable conditions are plain status values for the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OdbError::NoSuchKey { .. }
                | OdbError::TypeMismatch { .. }
                | OdbError::Truncated { .. }
                | OdbError::NoAccess { .. }
                | OdbError::RegionFull { .. }
                | OdbError::KeyExists { .. }
                | OdbError::OutOfRange { .. }
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, err: std::io::Error, what: &str) -> Self {
        OdbError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }
}

/// Convert std::io::Error to OdbError::Io
impl From<std::io::Error> for OdbError {
    fn from(err: std::io::Error) -> Self {
        OdbError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for ODB operations
pub type OdbResult<T> = Result<T, OdbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OdbError::ChecksumMismatch {
            path: PathBuf::from("/tmp/test.odb"),
            expected: 0x12345678,
            actual: 0x87654321,
        };

        let display = format!("{}", err);
        assert!(display.contains("Checksum mismatch"));
        assert!(display.contains("0x12345678"));
        assert!(display.contains("0x87654321"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let odb_err: OdbError = io_err.into();

        match odb_err {
            OdbError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert!(path.is_none());
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(OdbError::NoSuchKey { path: "/a".into() }.is_recoverable());
        assert!(OdbError::RegionFull { area: "data", requested: 8 }.is_recoverable());
        assert!(!OdbError::Corrupted { offset: 0, reason: "x".into() }.is_recoverable());
        assert!(!OdbError::VersionMismatch { found: 1, expected: 2 }.is_recoverable());
    }
}
