#![forbid(unsafe_code)]
//! Shared value types for PackFS.
//!
//! Everything here is plain data: node identifiers, extents, the on-store
//! header and the parse error produced when decoding it. No I/O happens in
//! this crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Magic bytes at offset 0 of every PackFS store.
pub const PFS_MAGIC: [u8; 4] = *b"PKFS";

/// Current on-store format version (byte 4 of the header).
pub const PFS_FORMAT_VERSION: u8 = 3;

/// Reserved header prefix: 4 magic bytes + 1 version byte.
pub const HEADER_SIZE: usize = 5;

/// First byte the allocator may hand out.
///
/// Byte `HEADER_SIZE` is a guard byte; an empty store has its cursor parked
/// on it, so the first extent begins one past the header.
pub const DATA_START: u64 = HEADER_SIZE as u64 + 1;

/// Capacity used when a new image is created without an explicit size.
pub const DEFAULT_CAPACITY: u64 = 1024 * 1024;

/// Longest allowed path component in bytes.
pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic { expected: [u8; 4], actual: [u8; 4] },
    #[error("unsupported format version: expected {expected}, got {actual}")]
    UnsupportedVersion { expected: u8, actual: u8 },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        })?;
    Ok(&data[offset..end])
}

/// Identifier of a namespace node (the PackFS analogue of an inode number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The root directory. It exists in every namespace and is never freed.
    pub const ROOT: Self = Self(1);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Contiguous, inclusive byte range `[begin, end]` holding one file's content.
///
/// A file without content has no extent at all; zero-length extents are not
/// representable through the constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub begin: u64,
    pub end: u64,
}

#[allow(clippy::len_without_is_empty)]
impl Extent {
    /// Build an extent from inclusive bounds. `None` if `begin > end`.
    #[must_use]
    pub fn new(begin: u64, end: u64) -> Option<Self> {
        (begin <= end).then_some(Self { begin, end })
    }

    /// Build an extent of `len` bytes starting at `begin`.
    ///
    /// `None` for `len == 0` or when the end offset overflows.
    #[must_use]
    pub fn with_len(begin: u64, len: u64) -> Option<Self> {
        let last = len.checked_sub(1)?;
        let end = begin.checked_add(last)?;
        Some(Self { begin, end })
    }

    /// Size in bytes (`end - begin + 1`).
    #[must_use]
    pub fn len(self) -> u64 {
        self.end - self.begin + 1
    }

    #[must_use]
    pub fn contains(self, offset: u64) -> bool {
        (self.begin..=self.end).contains(&offset)
    }

    #[must_use]
    pub fn overlaps(self, other: Self) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }

    /// Shift both bounds toward offset zero by `by` bytes.
    #[must_use]
    pub fn shifted_left(self, by: u64) -> Option<Self> {
        Some(Self {
            begin: self.begin.checked_sub(by)?,
            end: self.end.checked_sub(by)?,
        })
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.begin, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => f.write_str("file"),
            Self::Directory => f.write_str("directory"),
        }
    }
}

/// The reserved prefix at offset 0 of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHeader {
    pub version: u8,
}

impl Default for StoreHeader {
    fn default() -> Self {
        Self {
            version: PFS_FORMAT_VERSION,
        }
    }
}

impl StoreHeader {
    /// Decode and validate the header region.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        let magic = ensure_slice(region, 0, PFS_MAGIC.len())?;
        if magic != PFS_MAGIC {
            let mut actual = [0_u8; 4];
            actual.copy_from_slice(magic);
            return Err(ParseError::InvalidMagic {
                expected: PFS_MAGIC,
                actual,
            });
        }
        let version = ensure_slice(region, PFS_MAGIC.len(), 1)?[0];
        if version != PFS_FORMAT_VERSION {
            return Err(ParseError::UnsupportedVersion {
                expected: PFS_FORMAT_VERSION,
                actual: version,
            });
        }
        Ok(Self { version })
    }

    #[must_use]
    pub fn encode(self) -> [u8; HEADER_SIZE] {
        let mut out = [0_u8; HEADER_SIZE];
        out[..PFS_MAGIC.len()].copy_from_slice(&PFS_MAGIC);
        out[PFS_MAGIC.len()] = self.version;
        out
    }
}
