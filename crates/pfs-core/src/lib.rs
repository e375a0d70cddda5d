#![forbid(unsafe_code)]
//! PackFS core.
//!
//! [`Fs`] owns every piece of filesystem state: the byte store, the
//! namespace tree, the extent allocator and the metadata store. Each public
//! operation either completes and is committed (device sync plus metadata
//! snapshot) or fails and leaves that state exactly as it was.
//!
//! [`SharedFs`] wraps an `Fs` in a mutex for callers that share one
//! filesystem across threads.

pub mod persist;

pub use persist::{JsonMetadataStore, MemoryMetadataStore, MetadataStore, Snapshot};
pub use pfs_alloc::{Allocation, ExtentAllocator, Relocation};
pub use pfs_block::{ByteDevice, FileByteDevice, MemByteDevice};
pub use pfs_dir::{DirEntry, MetaNode, NamespaceTree};
pub use pfs_error::{PfsError, Result};
pub use pfs_types::{
    DATA_START, DEFAULT_CAPACITY, Extent, HEADER_SIZE, NodeId, NodeKind, PFS_FORMAT_VERSION,
    ParseError, StoreHeader,
};

use parking_lot::Mutex;
use pfs_block::{read_header_region, write_header_region};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Map a header decoding failure onto the runtime error type.
#[must_use]
pub fn parse_error_to_pfs(err: &ParseError) -> PfsError {
    PfsError::Format(err.to_string())
}

/// Decode the header of `dev` without modifying anything.
pub fn probe(dev: &dyn ByteDevice) -> Result<StoreHeader> {
    let region = read_header_region(dev)?;
    StoreHeader::parse(&region).map_err(|err| parse_error_to_pfs(&err))
}

// ── Configuration ───────────────────────────────────────────────────────────

/// Options controlling how a filesystem is opened and committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsConfig {
    /// Size of a newly created image in bytes. Ignored for existing images.
    pub capacity: u64,
    /// Call `ByteDevice::sync` after every mutating operation.
    pub sync_on_commit: bool,
    /// Save a metadata snapshot after every mutating operation.
    pub persist: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            sync_on_commit: true,
            persist: true,
        }
    }
}

// ── Reports ─────────────────────────────────────────────────────────────────

/// Kind, size and placement of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub path: String,
    pub kind: NodeKind,
    /// Content size for files, `None` for directories.
    pub size: Option<u64>,
    pub extent: Option<Extent>,
}

/// Space accounting for the whole store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub capacity: u64,
    pub header_size: u64,
    pub data_start: u64,
    pub high_water_mark: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub files: usize,
    pub directories: usize,
}

// ── Filesystem ──────────────────────────────────────────────────────────────

/// A mounted PackFS store.
pub struct Fs<D: ByteDevice, M: MetadataStore> {
    dev: D,
    meta: M,
    config: FsConfig,
    tree: NamespaceTree,
    alloc: ExtentAllocator,
}

impl<D: ByteDevice, M: MetadataStore> std::fmt::Debug for Fs<D, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fs")
            .field("config", &self.config)
            .field("dev_len", &self.dev.len_bytes())
            .field("high_water_mark", &self.alloc.high_water_mark())
            .field("extents", &self.alloc.len())
            .finish_non_exhaustive()
    }
}

impl<D: ByteDevice, M: MetadataStore> Fs<D, M> {
    /// Mount `dev`.
    ///
    /// A store without a valid header is formatted. Otherwise the latest
    /// metadata snapshot is loaded and validated; a store with a valid header
    /// but no snapshot starts with an empty namespace.
    pub fn open(dev: D, meta: M, config: FsConfig) -> Result<Self> {
        let capacity = check_geometry(&dev)?;
        if let Err(err) = probe(&dev) {
            info!(%err, capacity, "store header not recognised, formatting");
            return Self::format(dev, meta, config);
        }

        let (tree, alloc) = match meta.load()? {
            Some(snapshot) => restore(&snapshot, capacity)?,
            None => {
                warn!(capacity, "no metadata snapshot, starting with an empty namespace");
                (NamespaceTree::new(), ExtentAllocator::new(DATA_START, capacity)?)
            }
        };
        let fs = Self {
            dev,
            meta,
            config,
            tree,
            alloc,
        };
        let (files, directories) = fs.tree.counts();
        info!(
            capacity,
            files,
            directories,
            high_water_mark = fs.alloc.high_water_mark(),
            "opened store"
        );
        Ok(fs)
    }

    /// Write a fresh header and reset the namespace to an empty root.
    pub fn format(dev: D, meta: M, config: FsConfig) -> Result<Self> {
        let capacity = check_geometry(&dev)?;
        match meta.load() {
            Ok(Some(stale)) => warn!(
                high_water_mark = stale.high_water_mark,
                "discarding metadata snapshot of the previous format"
            ),
            Ok(None) => {}
            Err(err) => warn!(%err, "discarding unreadable metadata snapshot"),
        }
        write_header_region(&dev, &StoreHeader::default().encode())?;
        let mut fs = Self {
            dev,
            meta,
            config,
            tree: NamespaceTree::new(),
            alloc: ExtentAllocator::new(DATA_START, capacity)?,
        };
        fs.commit()?;
        info!(capacity, "formatted store");
        Ok(fs)
    }

    #[must_use]
    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    #[must_use]
    pub fn metadata_store(&self) -> &M {
        &self.meta
    }

    #[must_use]
    pub fn tree(&self) -> &NamespaceTree {
        &self.tree
    }

    #[must_use]
    pub fn allocator(&self) -> &ExtentAllocator {
        &self.alloc
    }

    /// The state a metadata store would receive right now.
    pub fn snapshot(&self) -> Result<Snapshot> {
        Ok(Snapshot {
            format_version: PFS_FORMAT_VERSION,
            high_water_mark: self.alloc.high_water_mark(),
            root: self.tree.to_meta()?,
        })
    }

    fn commit(&mut self) -> Result<()> {
        if self.config.sync_on_commit {
            self.dev.sync()?;
        }
        if self.config.persist {
            self.meta.save(&self.snapshot()?)?;
        }
        Ok(())
    }

    fn apply_relocations(&mut self, relocated: &[Relocation]) -> Result<()> {
        for relocation in relocated {
            self.tree.set_extent(relocation.node, Some(relocation.to))?;
        }
        Ok(())
    }

    // ── Operations ──────────────────────────────────────────────────────────

    /// Create an empty file or directory.
    pub fn create(&mut self, path: &str, kind: NodeKind) -> Result<NodeId> {
        let id = self.tree.create(path, kind)?;
        debug!(path, %kind, %id, "created");
        self.commit()?;
        Ok(id)
    }

    /// A file's full content. Unallocated files read as empty.
    pub fn get_content(&self, path: &str) -> Result<Vec<u8>> {
        let id = self.tree.resolve_file(path)?;
        match self.tree.file_extent(id)? {
            Some(extent) => self.alloc.read(&self.dev, extent),
            None => Ok(Vec::new()),
        }
    }

    /// Replace a file's content. An empty payload releases its extent.
    pub fn set_content(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        let id = self.tree.resolve_file(path)?;
        let current = self.tree.file_extent(id)?;
        let placement = self.alloc.set_content(&self.dev, id, current, bytes)?;
        self.apply_relocations(&placement.relocated)?;
        self.tree.set_extent(id, placement.extent)?;
        debug!(
            path,
            len = bytes.len(),
            extent = ?placement.extent,
            relocated = placement.relocated.len(),
            "content set"
        );
        self.commit()
    }

    /// Direct children of a directory, by name.
    pub fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.tree.list(path)
    }

    /// Remove a file and reclaim its bytes.
    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        let id = self.tree.resolve_file(path)?;
        let extent = self.tree.file_extent(id)?;
        if let Some(extent) = extent {
            let relocated = self.alloc.free(&self.dev, id, extent)?;
            self.apply_relocations(&relocated)?;
            self.tree.set_extent(id, None)?;
        }
        self.tree.remove(path)?;
        debug!(path, ?extent, high_water_mark = self.alloc.high_water_mark(), "removed file");
        self.commit()
    }

    /// Remove a directory and everything below it.
    ///
    /// Each descendant file is freed on its own, in pre-order, so every free
    /// compacts the store before the next one starts.
    pub fn remove_dir(&mut self, path: &str) -> Result<()> {
        let id = self.tree.resolve_dir(path)?;
        if id == NodeId::ROOT {
            return Err(PfsError::InvalidPath(
                "cannot remove the root directory".to_owned(),
            ));
        }
        let files = self.tree.files_preorder(id)?;
        let mut freed = 0_usize;
        for (file, _) in &files {
            // Earlier frees may have moved this extent.
            let Some(extent) = self.tree.file_extent(*file)? else {
                continue;
            };
            let relocated = self.alloc.free(&self.dev, *file, extent)?;
            self.apply_relocations(&relocated)?;
            self.tree.set_extent(*file, None)?;
            freed += 1;
        }
        let dropped = self.tree.remove(path)?;
        debug!(
            path,
            files = files.len(),
            freed,
            dropped,
            high_water_mark = self.alloc.high_water_mark(),
            "removed directory"
        );
        self.commit()
    }

    /// Kind, size and extent of the node at `path`.
    pub fn stat(&self, path: &str) -> Result<Stat> {
        let id = self.tree.resolve(path)?;
        let node = self
            .tree
            .get(id)
            .ok_or_else(|| PfsError::Corruption(format!("dangling node reference {id}")))?;
        let extent = match node.kind() {
            NodeKind::File => self.tree.file_extent(id)?,
            NodeKind::Directory => None,
        };
        Ok(Stat {
            path: path.to_owned(),
            kind: node.kind(),
            size: node.size(),
            extent,
        })
    }

    #[must_use]
    pub fn usage(&self) -> Usage {
        let (files, directories) = self.tree.counts();
        Usage {
            capacity: self.alloc.capacity(),
            header_size: HEADER_SIZE as u64,
            data_start: self.alloc.data_start(),
            high_water_mark: self.alloc.high_water_mark(),
            used_bytes: self.alloc.used_bytes(),
            free_bytes: self.alloc.free_bytes(),
            files,
            directories,
        }
    }

    /// Verify the header, the tree structure, the packing of the extent
    /// index and that the tree and the index agree on every extent.
    pub fn check(&self) -> Result<()> {
        probe(&self.dev)?;
        self.tree.check()?;
        self.alloc.check_packing()?;
        verify_agreement(&self.tree, &self.alloc)
    }
}

impl Fs<FileByteDevice, JsonMetadataStore> {
    /// Open the image at `image`, creating it with `config.capacity` bytes if
    /// it does not exist. Metadata lives at `metadata`, or `<image>.json`.
    pub fn open_path(
        image: impl AsRef<Path>,
        metadata: Option<PathBuf>,
        config: FsConfig,
    ) -> Result<Self> {
        let dev = FileByteDevice::open_or_create(image.as_ref(), config.capacity)?;
        let meta = metadata
            .map_or_else(|| JsonMetadataStore::for_image(image.as_ref()), JsonMetadataStore::new)
            .with_sync(config.sync_on_commit);
        Self::open(dev, meta, config)
    }
}

fn check_geometry(dev: &dyn ByteDevice) -> Result<u64> {
    let capacity = dev.len_bytes();
    if capacity <= DATA_START {
        return Err(PfsError::Format(format!(
            "store of {capacity} bytes has no room for data after the header"
        )));
    }
    Ok(capacity)
}

fn restore(snapshot: &Snapshot, capacity: u64) -> Result<(NamespaceTree, ExtentAllocator)> {
    if snapshot.format_version != PFS_FORMAT_VERSION {
        return Err(PfsError::Corruption(format!(
            "metadata format version {} does not match store version {PFS_FORMAT_VERSION}",
            snapshot.format_version
        )));
    }
    let tree = NamespaceTree::from_meta(&snapshot.root)?;
    let allocations = tree
        .allocations()
        .into_iter()
        .map(|(node, extent)| Allocation { node, extent });
    let alloc =
        ExtentAllocator::restore(DATA_START, capacity, snapshot.high_water_mark, allocations)?;
    tree.check()?;
    Ok((tree, alloc))
}

fn verify_agreement(tree: &NamespaceTree, alloc: &ExtentAllocator) -> Result<()> {
    let mut from_tree = tree.allocations();
    from_tree.sort_by_key(|(_, extent)| extent.begin);
    let from_index: Vec<(NodeId, Extent)> = alloc.iter().map(|a| (a.node, a.extent)).collect();
    if from_tree.len() != from_index.len() {
        return Err(PfsError::Corruption(format!(
            "tree records {} extents, index records {}",
            from_tree.len(),
            from_index.len()
        )));
    }
    for (tree_entry, index_entry) in from_tree.iter().zip(&from_index) {
        if tree_entry != index_entry {
            return Err(PfsError::Corruption(format!(
                "tree has {} at {}, index has {} at {}",
                tree_entry.0, tree_entry.1, index_entry.0, index_entry.1
            )));
        }
    }
    Ok(())
}

// ── Shared handle ───────────────────────────────────────────────────────────

/// Thread-safe handle that serializes every operation behind one mutex.
pub struct SharedFs<D: ByteDevice, M: MetadataStore> {
    inner: Arc<Mutex<Fs<D, M>>>,
}

impl<D: ByteDevice, M: MetadataStore> Clone for SharedFs<D, M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: ByteDevice, M: MetadataStore> SharedFs<D, M> {
    #[must_use]
    pub fn new(fs: Fs<D, M>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(fs)),
        }
    }

    /// Run `f` with exclusive access.
    pub fn with<R>(&self, f: impl FnOnce(&mut Fs<D, M>) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn create(&self, path: &str, kind: NodeKind) -> Result<NodeId> {
        self.with(|fs| fs.create(path, kind))
    }

    pub fn get_content(&self, path: &str) -> Result<Vec<u8>> {
        self.with(|fs| fs.get_content(path))
    }

    pub fn set_content(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.with(|fs| fs.set_content(path, bytes))
    }

    pub fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.with(|fs| fs.list(path))
    }

    pub fn remove_file(&self, path: &str) -> Result<()> {
        self.with(|fs| fs.remove_file(path))
    }

    pub fn remove_dir(&self, path: &str) -> Result<()> {
        self.with(|fs| fs.remove_dir(path))
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        self.with(|fs| fs.stat(path))
    }

    pub fn usage(&self) -> Usage {
        self.with(|fs| fs.usage())
    }

    pub fn check(&self) -> Result<()> {
        self.with(|fs| fs.check())
    }
}
