#![forbid(unsafe_code)]
//! Extent allocation and compaction.
//!
//! The store's live data is always one packed run starting at `data_start`.
//! A single cursor, the high-water mark, names the last occupied byte (or
//! `data_start - 1` when nothing is allocated). New content is appended at
//! the cursor; freeing or resizing anything other than the tail extent
//! slides every later byte left so the run stays gap-free.
//!
//! ## Design
//!
//! 1. **Index**: a `BTreeMap` keyed by extent `begin`, holding the owning
//!    node for every live extent. Compaction only visits entries after the
//!    vacated range.
//! 2. **Planning**: every operation computes its target layout and checks
//!    capacity before touching the device or the index.
//! 3. **I/O**: bytes are moved/written next; a device error leaves the
//!    in-memory state untouched.
//! 4. **Commit**: the index and cursor are updated last, and the caller
//!    receives the list of relocated extents so it can patch its own
//!    descriptors.
//!
//! ## Invariants
//!
//! - Extents are pairwise disjoint.
//! - Sorted by `begin`, extents tile `[data_start, high_water_mark]` exactly.
//! - `high_water_mark` is the `end` of the last extent, or `data_start - 1`.

use pfs_block::{ByteDevice, read_vec};
use pfs_error::{PfsError, Result};
use pfs_types::{Extent, NodeId};
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use tracing::{debug, trace};

// ── Result types ────────────────────────────────────────────────────────────

/// A live extent together with the node that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub node: NodeId,
    pub extent: Extent,
}

/// An extent that compaction moved to a lower offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub node: NodeId,
    pub from: Extent,
    pub to: Extent,
}

/// Outcome of [`ExtentAllocator::set_content`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Placement {
    /// The file's extent after the write; `None` when the payload was empty.
    pub extent: Option<Extent>,
    /// Other files whose extents moved during compaction.
    pub relocated: Vec<Relocation>,
}

/// How a content update was carried out. Reported for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// First write of a file with no extent.
    Append,
    /// Same size; bytes overwritten where they are.
    InPlace,
    /// The file was the tail; its end moved with the cursor.
    TailResize,
    /// Vacated and compacted, then re-appended at the tail.
    Migrate,
    /// Empty payload; the extent was released.
    Release,
    /// Empty payload on a file that never had content.
    Noop,
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Cursor-based extent allocator with compaction.
#[derive(Debug, Clone)]
pub struct ExtentAllocator {
    data_start: u64,
    capacity: u64,
    high_water_mark: u64,
    index: BTreeMap<u64, Allocation>,
}

impl ExtentAllocator {
    /// An empty allocator handing out bytes in `[data_start, capacity)`.
    pub fn new(data_start: u64, capacity: u64) -> Result<Self> {
        if data_start == 0 || data_start >= capacity {
            return Err(PfsError::Format(format!(
                "invalid allocator geometry: data_start={data_start} capacity={capacity}"
            )));
        }
        Ok(Self {
            data_start,
            capacity,
            high_water_mark: data_start - 1,
            index: BTreeMap::new(),
        })
    }

    /// Rebuild an allocator from persisted state and verify the packing.
    ///
    /// Fails with `Corruption` if the extents overlap, leave gaps, run past
    /// capacity, or disagree with `high_water_mark`.
    pub fn restore(
        data_start: u64,
        capacity: u64,
        high_water_mark: u64,
        allocations: impl IntoIterator<Item = Allocation>,
    ) -> Result<Self> {
        let mut alloc = Self::new(data_start, capacity)?;
        for allocation in allocations {
            let begin = allocation.extent.begin;
            if let Some(prev) = alloc.index.insert(begin, allocation) {
                return Err(PfsError::Corruption(format!(
                    "extents of {} and {} both begin at {begin}",
                    prev.node, allocation.node
                )));
            }
        }
        alloc.high_water_mark = high_water_mark;
        alloc.check_packing()?;
        debug!(
            extents = alloc.index.len(),
            high_water_mark, "restored extent index"
        );
        Ok(alloc)
    }

    #[must_use]
    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Last occupied byte, or `data_start - 1` when empty.
    #[must_use]
    pub fn high_water_mark(&self) -> u64 {
        self.high_water_mark
    }

    /// Bytes currently held by extents.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.high_water_mark + 1 - self.data_start
    }

    /// Bytes that can still be appended after the tail.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.available_after(self.high_water_mark)
    }

    /// Number of live extents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The extent that ends at the high-water mark.
    #[must_use]
    pub fn tail(&self) -> Option<Allocation> {
        self.index.values().next_back().copied()
    }

    /// All live extents in store order.
    pub fn iter(&self) -> impl Iterator<Item = Allocation> + '_ {
        self.index.values().copied()
    }

    /// Verify that the index exactly tiles `[data_start, high_water_mark]`.
    pub fn check_packing(&self) -> Result<()> {
        if self.high_water_mark < self.data_start - 1 || self.high_water_mark >= self.capacity {
            return Err(PfsError::Corruption(format!(
                "high-water mark {} outside [{}, {})",
                self.high_water_mark,
                self.data_start - 1,
                self.capacity
            )));
        }
        let mut expected = self.data_start;
        for (begin, allocation) in &self.index {
            let extent = allocation.extent;
            if *begin != extent.begin || extent.begin > extent.end {
                return Err(PfsError::Corruption(format!(
                    "malformed extent {extent} for {}",
                    allocation.node
                )));
            }
            if extent.begin != expected {
                return Err(PfsError::Corruption(format!(
                    "extent {extent} of {} should begin at {expected}",
                    allocation.node
                )));
            }
            expected = extent.end + 1;
        }
        if expected - 1 != self.high_water_mark {
            return Err(PfsError::Corruption(format!(
                "high-water mark {} but packed region ends at {}",
                self.high_water_mark,
                expected - 1
            )));
        }
        Ok(())
    }

    /// Read a file's content.
    pub fn read(&self, dev: &dyn ByteDevice, extent: Extent) -> Result<Vec<u8>> {
        read_vec(dev, extent.begin, extent.len())
    }

    /// Replace a file's content with `bytes`.
    ///
    /// `current` is the file's extent as recorded by the caller; it must match
    /// the index. On success the caller stores `Placement::extent` for `node`
    /// and applies every `Placement::relocated` entry to the other nodes.
    pub fn set_content(
        &mut self,
        dev: &dyn ByteDevice,
        node: NodeId,
        current: Option<Extent>,
        bytes: &[u8],
    ) -> Result<Placement> {
        let size = payload_len(bytes)?;
        let (strategy, placement) = match current {
            None if size == 0 => (WriteStrategy::Noop, Placement::default()),
            None => {
                let extent = self.append(dev, node, self.high_water_mark, bytes)?;
                self.high_water_mark = extent.end;
                (
                    WriteStrategy::Append,
                    Placement {
                        extent: Some(extent),
                        relocated: Vec::new(),
                    },
                )
            }
            Some(old) => {
                self.verify_owner(node, old)?;
                if size == 0 {
                    let relocated = self.free(dev, node, old)?;
                    (
                        WriteStrategy::Release,
                        Placement {
                            extent: None,
                            relocated,
                        },
                    )
                } else if size == old.len() {
                    dev.write_all_at(old.begin, bytes)?;
                    (
                        WriteStrategy::InPlace,
                        Placement {
                            extent: Some(old),
                            relocated: Vec::new(),
                        },
                    )
                } else if old.end == self.high_water_mark {
                    let extent = self.resize_tail(dev, node, old, bytes)?;
                    (
                        WriteStrategy::TailResize,
                        Placement {
                            extent: Some(extent),
                            relocated: Vec::new(),
                        },
                    )
                } else {
                    let (extent, relocated) = self.migrate(dev, node, old, bytes)?;
                    (
                        WriteStrategy::Migrate,
                        Placement {
                            extent: Some(extent),
                            relocated,
                        },
                    )
                }
            }
        };
        debug!(
            %node,
            ?strategy,
            size,
            extent = ?placement.extent,
            relocated = placement.relocated.len(),
            high_water_mark = self.high_water_mark,
            "set content"
        );
        Ok(placement)
    }

    /// Vacate `extent` (owned by `node`) and compact everything after it.
    ///
    /// Returns the extents that moved. The caller clears `node`'s own
    /// descriptor.
    pub fn free(
        &mut self,
        dev: &dyn ByteDevice,
        node: NodeId,
        extent: Extent,
    ) -> Result<Vec<Relocation>> {
        self.verify_owner(node, extent)?;
        let size = extent.len();

        if extent.end == self.high_water_mark {
            // Tail: the bytes stay behind and are overwritten by the next append.
            self.index.remove(&extent.begin);
            self.high_water_mark = extent.begin - 1;
            debug!(%node, %extent, high_water_mark = self.high_water_mark, "freed tail extent");
            return Ok(Vec::new());
        }

        let moves = self.plan_shift(extent.begin, size)?;
        self.slide_down(dev, extent.end + 1, extent.begin)?;
        self.index.remove(&extent.begin);
        let relocated = self.apply_shift(&moves);
        self.high_water_mark -= size;
        debug!(
            %node,
            %extent,
            relocated = relocated.len(),
            high_water_mark = self.high_water_mark,
            "freed extent with compaction"
        );
        Ok(relocated)
    }

    // ── internals ───────────────────────────────────────────────────────────

    fn available_after(&self, high_water_mark: u64) -> u64 {
        self.capacity - 1 - high_water_mark
    }

    /// The extent a `len`-byte append would occupy if the cursor were at
    /// `high_water_mark`. `NoSpace` if it would run past `capacity - 1`.
    fn plan_append(&self, high_water_mark: u64, len: u64) -> Result<Extent> {
        let available = self.available_after(high_water_mark);
        if len > available {
            return Err(PfsError::NoSpace {
                requested: len,
                available,
            });
        }
        Extent::with_len(high_water_mark + 1, len).ok_or(PfsError::NoSpace {
            requested: len,
            available,
        })
    }

    /// Write `bytes` right after `high_water_mark` and index the new extent.
    /// The caller moves the cursor.
    fn append(
        &mut self,
        dev: &dyn ByteDevice,
        node: NodeId,
        high_water_mark: u64,
        bytes: &[u8],
    ) -> Result<Extent> {
        let extent = self.plan_append(high_water_mark, payload_len(bytes)?)?;
        dev.write_all_at(extent.begin, bytes)?;
        self.index.insert(extent.begin, Allocation { node, extent });
        Ok(extent)
    }

    fn resize_tail(
        &mut self,
        dev: &dyn ByteDevice,
        node: NodeId,
        old: Extent,
        bytes: &[u8],
    ) -> Result<Extent> {
        let extent = self.plan_append(old.begin - 1, payload_len(bytes)?)?;
        dev.write_all_at(extent.begin, bytes)?;
        self.index.insert(extent.begin, Allocation { node, extent });
        self.high_water_mark = extent.end;
        Ok(extent)
    }

    /// Free-then-append for a file that is neither the tail nor same-size.
    fn migrate(
        &mut self,
        dev: &dyn ByteDevice,
        node: NodeId,
        old: Extent,
        bytes: &[u8],
    ) -> Result<(Extent, Vec<Relocation>)> {
        let compacted_mark = self.high_water_mark - old.len();
        let target = self.plan_append(compacted_mark, payload_len(bytes)?)?;
        let moves = self.plan_shift(old.begin, old.len())?;

        self.slide_down(dev, old.end + 1, old.begin)?;
        dev.write_all_at(target.begin, bytes)?;

        self.index.remove(&old.begin);
        let relocated = self.apply_shift(&moves);
        self.index.insert(
            target.begin,
            Allocation {
                node,
                extent: target,
            },
        );
        self.high_water_mark = target.end;
        Ok((target, relocated))
    }

    /// Copy `[src, high_water_mark]` down to `dst` through one exactly-sized
    /// buffer.
    fn slide_down(&self, dev: &dyn ByteDevice, src: u64, dst: u64) -> Result<()> {
        if src > self.high_water_mark {
            return Ok(());
        }
        let len = self.high_water_mark - src + 1;
        let block = read_vec(dev, src, len)?;
        dev.write_all_at(dst, &block)?;
        trace!(src, dst, len, "slid packed block down");
        Ok(())
    }

    /// Target extents for every allocation after `pivot`, shifted left by `by`.
    fn plan_shift(&self, pivot: u64, by: u64) -> Result<Vec<Relocation>> {
        self.index
            .range((Excluded(pivot), Unbounded))
            .map(|(_, allocation)| {
                let to = allocation.extent.shifted_left(by).ok_or_else(|| {
                    PfsError::Corruption(format!(
                        "cannot shift extent {} of {} left by {by}",
                        allocation.extent, allocation.node
                    ))
                })?;
                Ok(Relocation {
                    node: allocation.node,
                    from: allocation.extent,
                    to,
                })
            })
            .collect()
    }

    /// Re-key planned moves. The vacated entry must already be removed.
    fn apply_shift(&mut self, moves: &[Relocation]) -> Vec<Relocation> {
        for relocation in moves {
            self.index.remove(&relocation.from.begin);
        }
        for relocation in moves {
            trace!(node = %relocation.node, from = %relocation.from, to = %relocation.to, "relocated");
            self.index.insert(
                relocation.to.begin,
                Allocation {
                    node: relocation.node,
                    extent: relocation.to,
                },
            );
        }
        moves.to_vec()
    }

    fn verify_owner(&self, node: NodeId, extent: Extent) -> Result<()> {
        match self.index.get(&extent.begin) {
            Some(allocation) if allocation.node == node && allocation.extent == extent => Ok(()),
            Some(allocation) => Err(PfsError::Corruption(format!(
                "{node} claims {extent} but the index records {} for {}",
                allocation.extent, allocation.node
            ))),
            None => Err(PfsError::Corruption(format!(
                "{node} claims {extent} which is not indexed"
            ))),
        }
    }
}

fn payload_len(bytes: &[u8]) -> Result<u64> {
    u64::try_from(bytes.len())
        .map_err(|_| PfsError::Format("payload length does not fit u64".to_owned()))
}
