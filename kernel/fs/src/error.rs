//! Filesystem error type.

use core::fmt;

/// Errors surfaced by the VFS and its backends.
///
/// The syscall layer folds every variant to -1; the variants exist so that
/// kernel-internal callers can react (and log) precisely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path or component does not exist.
    NotFound,
    /// Creation target already exists.
    AlreadyExists,
    /// Directory operation on a file.
    NotADirectory,
    /// File operation on a directory.
    IsADirectory,
    /// Directory is not empty and the operation was not recursive.
    NotEmpty,
    /// Malformed path or argument (relative path, oversized name, bad
    /// whence, negative offset).
    InvalidArgument,
    /// Descriptor number out of range or not open.
    BadDescriptor,
    /// Descriptor table, name table, or backing store exhausted.
    NoSpace,
    /// The node's operation table does not provide this operation.
    NotSupported,
    /// The backing device failed.
    IoError,
    /// Access mode forbids the operation (e.g. write on a read-only fd).
    AccessDenied,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::NotADirectory => "not a directory",
            Self::IsADirectory => "is a directory",
            Self::NotEmpty => "directory not empty",
            Self::InvalidArgument => "invalid argument",
            Self::BadDescriptor => "bad file descriptor",
            Self::NoSpace => "no space",
            Self::NotSupported => "operation not supported",
            Self::IoError => "I/O error",
            Self::AccessDenied => "access denied",
        };
        f.write_str(msg)
    }
}
