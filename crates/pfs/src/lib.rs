#![forbid(unsafe_code)]
//! PackFS: a filesystem whose file contents live in one gap-free run of
//! bytes inside a single image.
//!
//! A 5-byte header opens the image. Every file's bytes sit back to back
//! after it, and removing or shrinking a file slides later files left so the
//! run never has holes. The namespace (directories, names, extents) is kept
//! in a JSON sidecar next to the image and rewritten after each successful
//! mutation.
//!
//! [`Fs`] is the single-owner handle; [`SharedFs`] wraps it in a mutex for use
//! from several threads. Any [`ByteDevice`] can back the image and any
//! [`MetadataStore`] can hold the namespace. [`Fs::open_path`] pairs a
//! [`FileByteDevice`] with a [`JsonMetadataStore`] at `<image>.json`:
//!
//! ```ignore
//! use pfs::{Fs, FsConfig, NodeKind};
//!
//! let mut fs = Fs::open_path("store.img", None, FsConfig::default())?;
//! fs.create("/notes", NodeKind::File)?;
//! fs.set_content("/notes", b"hello")?;
//! assert_eq!(fs.get_content("/notes")?, b"hello");
//! ```
//!
//! [`MemByteDevice`] and [`MemoryMetadataStore`] keep everything in memory.

pub use pfs_core::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_round_trips_through_shared_handle() {
        let fs = Fs::open(
            MemByteDevice::new(64),
            MemoryMetadataStore::new(),
            FsConfig::default(),
        )
        .unwrap();
        let shared = SharedFs::new(fs);

        shared.create("/docs", NodeKind::Directory).unwrap();
        shared.create("/docs/readme", NodeKind::File).unwrap();
        shared.set_content("/docs/readme", b"packed").unwrap();

        assert_eq!(shared.get_content("/docs/readme").unwrap(), b"packed");
        let names: Vec<String> = shared
            .list("/docs")
            .unwrap()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec!["readme"]);
        shared.with(|fs| fs.check()).unwrap();
    }
}
