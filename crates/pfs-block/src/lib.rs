#![forbid(unsafe_code)]
//! Byte store layer.
//!
//! Provides the `ByteDevice` trait (fixed capacity, absolute offsets,
//! bounded pread/pwrite semantics), a file-backed implementation, an
//! in-memory implementation, and helpers for the reserved header region.

use parking_lot::Mutex;
use pfs_error::{PfsError, Result};
use pfs_types::HEADER_SIZE;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Verify that `[offset, offset + len)` lies within `capacity`.
///
/// Every device runs this before touching bytes, so an out-of-range access
/// is reported as `OutOfBounds` rather than as an OS error.
pub fn check_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    let len_u64 = u64::try_from(len).map_err(|_| PfsError::OutOfBounds {
        offset,
        len: u64::MAX,
        capacity,
    })?;
    match offset.checked_add(len_u64) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(PfsError::OutOfBounds {
            offset,
            len: len_u64,
            capacity,
        }),
    }
}

/// Byte-addressed store with a fixed capacity.
pub trait ByteDevice: Send + Sync {
    /// Total capacity in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<D: ByteDevice + ?Sized> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

impl<D: ByteDevice + ?Sized> ByteDevice for Box<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// Read `len` bytes at `offset` into a freshly allocated, exactly-sized buffer.
pub fn read_vec(dev: &dyn ByteDevice, offset: u64, len: u64) -> Result<Vec<u8>> {
    let len_usize = usize::try_from(len).map_err(|_| PfsError::OutOfBounds {
        offset,
        len,
        capacity: dev.len_bytes(),
    })?;
    let mut buf = vec![0_u8; len_usize];
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}

/// File-backed byte store using positioned `pread`/`pwrite` I/O.
///
/// `FileExt` does not share a seek position, so `&self` methods are safe to
/// call from several threads.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an existing image, falling back to read-only access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        if len <= HEADER_SIZE as u64 {
            return Err(PfsError::Format(format!(
                "image too small: len_bytes={len} header_size={HEADER_SIZE}"
            )));
        }
        debug!(path = %path.as_ref().display(), len, writable, "opened image");
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create a new zero-filled image of exactly `capacity` bytes.
    ///
    /// Fails with `Exists` if the path is already present.
    pub fn create(path: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        if capacity <= HEADER_SIZE as u64 {
            return Err(PfsError::Format(format!(
                "capacity {capacity} leaves no room after the {HEADER_SIZE}-byte header"
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    PfsError::Exists(path.as_ref().display().to_string())
                } else {
                    PfsError::Io(err)
                }
            })?;
        file.set_len(capacity)?;
        debug!(path = %path.as_ref().display(), capacity, "created image");
        Ok(Self {
            file: Arc::new(file),
            len: capacity,
            writable: true,
        })
    }

    /// Open `path` if it exists, otherwise create it with `capacity` bytes.
    pub fn open_or_create(path: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Self::create(path, capacity)
        }
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(PfsError::ReadOnly);
        }
        check_range(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

/// In-memory byte store.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    /// A zero-filled store of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    /// Copy of the whole store, header included.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let capacity = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        check_range(offset, buf.len(), capacity)?;
        // check_range guarantees offset + len <= bytes.len().
        let start = usize::try_from(offset).map_err(|_| PfsError::OutOfBounds {
            offset,
            len: buf.len() as u64,
            capacity,
        })?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let capacity = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        check_range(offset, buf.len(), capacity)?;
        let start = usize::try_from(offset).map_err(|_| PfsError::OutOfBounds {
            offset,
            len: buf.len() as u64,
            capacity,
        })?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Read the reserved header region at offset 0.
pub fn read_header_region(dev: &dyn ByteDevice) -> Result<[u8; HEADER_SIZE]> {
    let mut buf = [0_u8; HEADER_SIZE];
    dev.read_exact_at(0, &mut buf)?;
    Ok(buf)
}

/// Overwrite the reserved header region at offset 0.
pub fn write_header_region(dev: &dyn ByteDevice, header: &[u8; HEADER_SIZE]) -> Result<()> {
    dev.write_all_at(0, header)
}
