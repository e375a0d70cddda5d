#![forbid(unsafe_code)]
//! Error types for PackFS.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `pfs-types` | Header bytes that do not decode |
//! | Runtime | `PfsError` | `pfs-error` (this crate) | Everything returned to the shell and library callers |
//!
//! `pfs-error` does not depend on `pfs-types`. The `ParseError` → `PfsError`
//! conversion lives in `pfs-core`, which sees both.
//!
//! ## Capacity vs. bounds
//!
//! `NoSpace` and `OutOfBounds` are deliberately separate. `NoSpace` is an
//! expected outcome: the packed region plus the requested payload would not
//! fit, and the operation is refused before any state changes.
//! `OutOfBounds` means a byte-store access left the device, which can only
//! happen if the packing invariants were already broken.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `OutOfBounds` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Metadata` | `EINVAL` |
//! | `InvalidPath` | `EINVAL` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NoSpace` | `ENOSPC` |
//! | `ReadOnly` | `EROFS` |

use thiserror::Error;

/// Unified error type for all PackFS operations.
#[derive(Debug, Error)]
pub enum PfsError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata that contradicts itself or the store layout.
    #[error("corrupt metadata: {0}")]
    Corruption(String),

    /// The store header or geometry is not usable.
    #[error("invalid store format: {0}")]
    Format(String),

    /// The metadata sidecar could not be encoded or decoded.
    #[error("metadata encoding error: {0}")]
    Metadata(String),

    /// Malformed path (empty component, `.`/`..`, operation on root).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("name too long: {0}")]
    NameTooLong(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Create target already present.
    #[error("already exists: {0}")]
    Exists(String),

    /// Expected a directory, found a file.
    #[error("not a directory: {0}")]
    NotDirectory(String),

    /// Expected a file, found a directory.
    #[error("is a directory: {0}")]
    IsDirectory(String),

    /// The packed region cannot grow by the requested amount.
    #[error("capacity exceeded: need {requested} bytes, {available} available")]
    NoSpace { requested: u64, available: u64 },

    /// A byte-store access fell outside the device.
    #[error("store access out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds { offset: u64, len: u64, capacity: u64 },

    /// Write attempted on a store opened without write access.
    #[error("read-only store")]
    ReadOnly,
}

impl PfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The match is exhaustive; a new variant does not compile until it is
    /// assigned an errno here.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption(_) | Self::OutOfBounds { .. } => libc::EIO,
            Self::Format(_) | Self::Metadata(_) | Self::InvalidPath(_) => libc::EINVAL,
            Self::NameTooLong(_) => libc::ENAMETOOLONG,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists(_) => libc::EEXIST,
            Self::NotDirectory(_) => libc::ENOTDIR,
            Self::IsDirectory(_) => libc::EISDIR,
            Self::NoSpace { .. } => libc::ENOSPC,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// File-vs-directory mismatch in either direction.
    #[must_use]
    pub fn is_wrong_kind(&self) -> bool {
        matches!(self, Self::NotDirectory(_) | Self::IsDirectory(_))
    }
}

/// Result alias using `PfsError`.
pub type Result<T> = std::result::Result<T, PfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(PfsError, libc::c_int)> = vec![
            (PfsError::Io(std::io::Error::other("test")), libc::EIO),
            (PfsError::Corruption("test".into()), libc::EIO),
            (PfsError::Format("test".into()), libc::EINVAL),
            (PfsError::Metadata("test".into()), libc::EINVAL),
            (PfsError::InvalidPath("a/../b".into()), libc::EINVAL),
            (PfsError::NameTooLong("x".into()), libc::ENAMETOOLONG),
            (PfsError::NotFound("/a".into()), libc::ENOENT),
            (PfsError::Exists("/a".into()), libc::EEXIST),
            (PfsError::NotDirectory("/a".into()), libc::ENOTDIR),
            (PfsError::IsDirectory("/a".into()), libc::EISDIR),
            (
                PfsError::NoSpace {
                    requested: 10,
                    available: 3,
                },
                libc::ENOSPC,
            ),
            (
                PfsError::OutOfBounds {
                    offset: 99,
                    len: 2,
                    capacity: 100,
                },
                libc::EIO,
            ),
            (PfsError::ReadOnly, libc::EROFS),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(PfsError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn capacity_and_bounds_render_distinctly() {
        let no_space = PfsError::NoSpace {
            requested: 10,
            available: 3,
        };
        assert_eq!(
            no_space.to_string(),
            "capacity exceeded: need 10 bytes, 3 available"
        );

        let oob = PfsError::OutOfBounds {
            offset: 99,
            len: 2,
            capacity: 100,
        };
        assert_eq!(
            oob.to_string(),
            "store access out of bounds: offset=99 len=2 capacity=100"
        );
        assert_ne!(no_space.to_errno(), oob.to_errno());
    }

    #[test]
    fn wrong_kind_groups_both_directions() {
        assert!(PfsError::NotDirectory("/f".into()).is_wrong_kind());
        assert!(PfsError::IsDirectory("/d".into()).is_wrong_kind());
        assert!(!PfsError::NotFound("/x".into()).is_wrong_kind());
    }
}
