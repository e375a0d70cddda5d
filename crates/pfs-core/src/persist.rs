//! Metadata persistence.
//!
//! The namespace tree and the high-water mark are not stored inside the
//! byte store. After every successful mutation the filesystem hands a
//! [`Snapshot`] to a [`MetadataStore`]; on open the last snapshot is loaded
//! and validated against the store.
//!
//! # Invariants
//!
//! - A snapshot is written only after the operation that produced it has
//!   fully succeeded.
//! - `JsonMetadataStore::save` replaces the sidecar atomically: readers see
//!   either the previous document or the new one, never a torn write.

use parking_lot::Mutex;
use pfs_dir::MetaNode;
use pfs_error::{PfsError, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Everything needed to rebuild the in-memory state of a filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u8,
    pub high_water_mark: u64,
    pub root: MetaNode,
}

/// Where snapshots live between runs.
pub trait MetadataStore: Send + Sync {
    /// The most recent snapshot, or `None` if nothing was ever saved.
    fn load(&self) -> Result<Option<Snapshot>>;

    /// Replace the stored snapshot.
    fn save(&self, snapshot: &Snapshot) -> Result<()>;
}

// ── JSON sidecar ────────────────────────────────────────────────────────────

/// Snapshot stored as a JSON document next to the image.
#[derive(Debug, Clone)]
pub struct JsonMetadataStore {
    path: PathBuf,
    sync: bool,
}

impl JsonMetadataStore {
    /// Store at an explicit path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync: true,
        }
    }

    /// Store at `<image>.json`.
    #[must_use]
    pub fn for_image(image: impl AsRef<Path>) -> Self {
        Self::new(with_suffix(image.as_ref(), ".json"))
    }

    /// Whether saves `fsync` the document before renaming it into place.
    #[must_use]
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

impl MetadataStore for JsonMetadataStore {
    fn load(&self) -> Result<Option<Snapshot>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let snapshot = serde_json::from_slice(&bytes).map_err(|err| {
            PfsError::Metadata(format!("{}: {err}", self.path.display()))
        })?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "loaded metadata");
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let temp_path = with_suffix(&self.path, ".tmp");
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, snapshot)
                .map_err(|err| PfsError::Metadata(format!("encode snapshot: {err}")))?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            let file = writer
                .into_inner()
                .map_err(|err| PfsError::Metadata(format!("metadata write error: {err}")))?;
            if self.sync {
                file.sync_all()?;
            }
        }
        fs::rename(&temp_path, &self.path)?;
        debug!(
            path = %self.path.display(),
            high_water_mark = snapshot.high_water_mark,
            "saved metadata"
        );
        Ok(())
    }
}

// ── In memory ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryState {
    snapshot: Option<Snapshot>,
    saves: u64,
}

/// Snapshot kept in memory. Counts saves so tests can assert when the
/// filesystem commits.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    state: Mutex<MemoryState>,
}

impl MemoryMetadataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `snapshot`.
    #[must_use]
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                snapshot: Some(snapshot),
                saves: 0,
            }),
        }
    }

    /// Number of successful `save` calls.
    #[must_use]
    pub fn saves(&self) -> u64 {
        self.state.lock().saves
    }

    #[must_use]
    pub fn latest(&self) -> Option<Snapshot> {
        self.state.lock().snapshot.clone()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.state.lock().snapshot.clone())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let mut state = self.state.lock();
        state.snapshot = Some(snapshot.clone());
        state.saves += 1;
        drop(state);
        Ok(())
    }
}

impl<M: MetadataStore + ?Sized> MetadataStore for std::sync::Arc<M> {
    fn load(&self) -> Result<Option<Snapshot>> {
        (**self).load()
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        (**self).save(snapshot)
    }
}
