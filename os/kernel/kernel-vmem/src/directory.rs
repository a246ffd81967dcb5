//! # Page Directory
//!
//! A [`PageDirectory`] is a handle to one translation root. It does not own
//! the leaf frames it maps (those are refcounted by the frame allocator and
//! released by the VMA layer); it owns the *tables*.
//!
//! ## Table sharing and `free_range`
//!
//! A leaf table covers `ENTRIES` pages (4 MiB on x86, 2 MiB on x86-64), so
//! two neighbouring VMAs frequently share one. [`PageDirectory::free_range`]
//! therefore takes `floor`/`ceil` bounds in addition to the range: a table is
//! released only if everything it covers lies inside `[floor, ceil)`, i.e.
//! no other VMA can still be using it. Tearing down VMAs in address order
//! with `floor = previous.end` and `ceil = next.start` frees every table
//! exactly once, after the last VMA that references it.

use crate::table::Table;
use crate::{FrameAlloc, PageEntryBits, Paging, PhysMapper};
use core::marker::PhantomData;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, align_down};
use log::Level;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory (table at level {0})")]
    OutOfMemory(usize),
    #[error("physical address {0} is out of reach of this paging scheme")]
    PhysicalOutOfRange(PhysicalAddress),
}

/// What a leaf visitor wants done with the entry it was shown.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LeafAction {
    Keep,
    Set(PageEntryBits),
    Clear,
}

#[derive(Copy, Clone)]
struct Bounds {
    start: u64,
    end: u64,
    floor: u64,
    ceil: u64,
}

/// Handle to one translation root of scheme `P`.
#[derive(Debug, PartialEq, Eq)]
pub struct PageDirectory<P: Paging> {
    root: PhysicalAddress,
    _p: PhantomData<P>,
}

impl<P: Paging> PageDirectory<P> {
    /// Wrap an existing root frame.
    #[inline]
    #[must_use]
    pub const fn from_root(root: PhysicalAddress) -> Self {
        Self {
            root,
            _p: PhantomData,
        }
    }

    /// Physical address of the root table (the value loaded into CR3).
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Allocate the kernel's own, initially empty, root directory.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is left.
    pub fn new_kernel<A: FrameAlloc>(alloc: &mut A) -> Result<Self, MapError> {
        let root = alloc
            .alloc_4k()
            .ok_or(MapError::OutOfMemory(P::root_level()))?;
        log::info!("{}: kernel directory at {root}", P::NAME);
        Ok(Self::from_root(root))
    }

    /// Allocate a process directory sharing the kernel half of `kernel`.
    ///
    /// The kernel-half root entries are copied verbatim; the tables they
    /// point to are shared, never freed through the copy. Kernel-half tables
    /// must therefore all exist before the first process directory is created
    /// (see [`preallocate`](Self::preallocate)).
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is left.
    pub fn create<A: FrameAlloc>(alloc: &mut A, kernel: &Self) -> Result<Self, MapError> {
        let root = alloc
            .alloc_4k()
            .ok_or(MapError::OutOfMemory(P::root_level()))?;
        let src = unsafe { Table::<P>::at(alloc, kernel.root) };
        let mut dst = unsafe { Table::<P>::at(alloc, root) };
        for i in P::kernel_root_index()..P::ENTRIES {
            dst.set_raw(i, src.raw(i));
        }
        Ok(Self::from_root(root))
    }

    /// Whether `self` carries exactly the kernel-half root entries of `kernel`.
    #[must_use]
    pub fn shares_kernel_half<M: PhysMapper>(&self, m: &M, kernel: &Self) -> bool {
        let a = unsafe { Table::<P>::at(m, self.root) };
        let b = unsafe { Table::<P>::at(m, kernel.root) };
        (P::kernel_root_index()..P::ENTRIES).all(|i| a.raw(i) == b.raw(i))
    }

    /// Index computation for `level`; pure.
    #[inline]
    #[must_use]
    pub fn level_offset(level: usize, va: VirtualAddress) -> usize {
        P::level_offset(level, va)
    }

    /// Ensure the entry for `va` in the table at `table` (of `level >= 1`)
    /// points to a child table, allocating a zero-filled one if it is empty.
    ///
    /// Returns the child table's frame.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if a child table is needed but no frame is left.
    pub fn level_alloc<A: FrameAlloc>(
        alloc: &mut A,
        table: PhysicalAddress,
        level: usize,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, MapError> {
        debug_assert!(level >= 1 && level < P::LEVELS);
        let i = P::level_offset(level, va);
        let mut t = unsafe { Table::<P>::at(alloc, table) };
        let e = t.get(i);
        if e.present() {
            return Ok(e.physical_address());
        }

        let child = alloc.alloc_4k().ok_or(MapError::OutOfMemory(level - 1))?;
        t.set(i, PageEntryBits::table(child, P::is_user_address(va)));
        Ok(child)
    }

    /// Leaf table for `va`, creating intermediate levels as needed.
    fn leaf_table_alloc<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, MapError> {
        let mut table = self.root;
        for level in (1..P::LEVELS).rev() {
            table = Self::level_alloc(alloc, table, level, va)?;
        }
        Ok(table)
    }

    /// Leaf table for `va`, if every level on the way exists.
    fn leaf_table<M: PhysMapper>(&self, m: &M, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = self.root;
        for level in (1..P::LEVELS).rev() {
            let t = unsafe { Table::<P>::at(m, table) };
            let e = t.get(P::level_offset(level, va));
            if !e.present() {
                return None;
            }
            table = e.physical_address();
        }
        Some(table)
    }

    /// Install `flags` pointing at `pa` as the leaf entry for `va`.
    ///
    /// Returns the previous entry (possibly not present). Does not touch the
    /// TLB; the caller invalidates once it is done with its batch.
    ///
    /// # Errors
    /// - [`MapError::OutOfMemory`] when an intermediate table cannot be allocated.
    /// - [`MapError::PhysicalOutOfRange`] when `pa` is beyond the scheme's reach.
    pub fn entry_set<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<PageEntryBits, MapError> {
        if pa.as_u64() >= P::MAX_PHYS {
            return Err(MapError::PhysicalOutOfRange(pa));
        }
        let leaf = self.leaf_table_alloc(alloc, va)?;
        let mut t = unsafe { Table::<P>::at(alloc, leaf) };
        let i = P::level_offset(0, va);
        let old = t.get(i);
        t.set(i, flags.with_physical_address(pa.page().base()));
        Ok(old)
    }

    /// Clear the leaf entry for `va`, returning it if it was present.
    pub fn entry_clear<M: PhysMapper>(&self, m: &M, va: VirtualAddress) -> Option<PageEntryBits> {
        let leaf = self.leaf_table(m, va)?;
        let mut t = unsafe { Table::<P>::at(m, leaf) };
        let i = P::level_offset(0, va);
        let old = t.get(i);
        t.clear(i);
        old.present().then_some(old)
    }

    /// The present leaf entry for `va`, if any.
    #[must_use]
    pub fn entry_test<M: PhysMapper>(&self, m: &M, va: VirtualAddress) -> Option<PageEntryBits> {
        let leaf = self.leaf_table(m, va)?;
        let t = unsafe { Table::<P>::at(m, leaf) };
        let e = t.get(P::level_offset(0, va));
        e.present().then_some(e)
    }

    /// Rewrite the present leaf entry for `va`; returns the new entry.
    pub fn entry_update<M: PhysMapper>(
        &self,
        m: &M,
        va: VirtualAddress,
        f: impl FnOnce(PageEntryBits) -> PageEntryBits,
    ) -> Option<PageEntryBits> {
        let leaf = self.leaf_table(m, va)?;
        let mut t = unsafe { Table::<P>::at(m, leaf) };
        let i = P::level_offset(0, va);
        let e = t.get(i);
        if !e.present() {
            return None;
        }
        let new = f(e);
        t.set(i, new);
        Some(new)
    }

    /// Translate `va` to a physical address if mapped.
    #[must_use]
    pub fn translate<M: PhysMapper>(&self, m: &M, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.entry_test(m, va)
            .map(|e| e.physical_address() + va.offset())
    }

    /// Visit every present leaf entry in `[start, end)`, skipping absent
    /// tables wholesale. The visitor decides per entry whether to keep,
    /// rewrite or clear it.
    pub fn visit_leaves<M, F>(&self, m: &M, start: VirtualAddress, end: VirtualAddress, mut f: F)
    where
        M: PhysMapper,
        F: FnMut(VirtualAddress, PageEntryBits) -> LeafAction,
    {
        if start >= end {
            return;
        }
        let b = Bounds {
            start: start.as_u64(),
            end: end.as_u64(),
            floor: 0,
            ceil: 0,
        };
        Self::visit_level(m, self.root, P::root_level(), 0, b, &mut f);
    }

    fn visit_level<M, F>(m: &M, table: PhysicalAddress, level: usize, base: u64, b: Bounds, f: &mut F)
    where
        M: PhysMapper,
        F: FnMut(VirtualAddress, PageEntryBits) -> LeafAction,
    {
        let span = P::entry_span(level);
        for i in index_range(base, span, P::ENTRIES, b.start, b.end) {
            let child_base = base + i as u64 * span;
            let mut t = unsafe { Table::<P>::at(m, table) };
            let e = t.get(i);
            if !e.present() {
                continue;
            }
            if level == 0 {
                match f(VirtualAddress::new(child_base), e) {
                    LeafAction::Keep => {}
                    LeafAction::Set(new) => t.set(i, new),
                    LeafAction::Clear => t.clear(i),
                }
            } else {
                Self::visit_level(m, e.physical_address(), level - 1, child_base, b, f);
            }
        }
    }

    /// Release every intermediate and leaf **table** covering `[start, end)`
    /// whose whole coverage lies inside `[floor, ceil)`.
    ///
    /// Leaf entries must already be cleared; a table still holding entries
    /// is kept and reported. The root itself is never freed here. Call
    /// [`Tlb::reload`](crate::Tlb::reload) afterwards if the directory is live.
    pub fn free_range<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        start: VirtualAddress,
        end: VirtualAddress,
        floor: VirtualAddress,
        ceil: VirtualAddress,
    ) {
        let end = end.as_u64().min(P::USER_END);
        if start.as_u64() >= end {
            return;
        }
        let b = Bounds {
            start: start.as_u64(),
            end,
            floor: floor.as_u64(),
            ceil: ceil.as_u64(),
        };
        Self::free_level(alloc, self.root, P::root_level(), 0, b);
    }

    fn free_level<A: FrameAlloc>(alloc: &mut A, table: PhysicalAddress, level: usize, base: u64, b: Bounds) {
        debug_assert!(level >= 1);
        let span = P::entry_span(level);
        for i in index_range(base, span, P::ENTRIES, b.start, b.end) {
            let child_base = base + i as u64 * span;
            let child_end = child_base + span;
            let e = unsafe { Table::<P>::at(alloc, table) }.get(i);
            if !e.present() {
                continue;
            }
            let child = e.physical_address();
            if level > 1 {
                Self::free_level(alloc, child, level - 1, child_base, b);
            }
            if child_base < b.floor || child_end > b.ceil {
                continue;
            }
            if !unsafe { Table::<P>::at(alloc, child) }.is_empty() {
                log::error!(
                    "{}: not freeing level-{} table {child} at {child_base:#x}: still in use",
                    P::NAME,
                    level - 1
                );
                continue;
            }
            unsafe { Table::<P>::at(alloc, table) }.clear(i);
            alloc.free_4k(child);
        }
    }

    /// Populate every table covering `[start, end)` down to the leaf level.
    ///
    /// Used for kernel-half windows (MMIO) whose root entries must exist
    /// before process directories copy them.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if a table cannot be allocated.
    pub fn preallocate<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<(), MapError> {
        let step = P::entry_span(1);
        let mut va = align_down(start.as_u64(), step);
        while va < end.as_u64() {
            self.leaf_table_alloc(alloc, VirtualAddress::new(va))?;
            va = match va.checked_add(step) {
                Some(v) => v,
                None => break,
            };
        }
        Ok(())
    }

    /// Free every user-half table and the root frame.
    ///
    /// The directory must not be active on any CPU and all user mappings
    /// must already be gone.
    pub fn destroy<A: FrameAlloc>(self, alloc: &mut A) {
        let end = VirtualAddress::new(P::USER_END);
        self.free_range(alloc, VirtualAddress::zero(), end, VirtualAddress::zero(), end);
        alloc.free_4k(self.root);
    }

    /// Log every level's entry on the walk to `va`.
    pub fn dump_walk<M: PhysMapper>(&self, m: &M, va: VirtualAddress, lvl: Level) {
        log::log!(lvl, "{} walk for {va}, root {}", P::NAME, self.root);
        let mut table = self.root;
        for level in (0..P::LEVELS).rev() {
            let i = P::level_offset(level, va);
            let t = unsafe { Table::<P>::at(m, table) };
            let e = t.get(i);
            log::log!(
                lvl,
                "  L{}[{i:4}] = {:#018x} P={} RW={} US={} PCD={} G={} NX={}",
                level + 1,
                t.raw(i),
                u8::from(e.present()),
                u8::from(e.writable()),
                u8::from(e.user_access()),
                u8::from(e.cache_disabled()),
                u8::from(e.global_translation()),
                u8::from(e.no_execute()),
            );
            if !e.present() {
                break;
            }
            table = e.physical_address();
        }
    }
}

/// Indices of a table based at `base` whose entries (each `span` bytes)
/// intersect `[start, end)`, limited to the `entries` the table has.
///
/// `[start, end)` may extend past the table's coverage on either side.
#[allow(clippy::cast_possible_truncation)]
fn index_range(base: u64, span: u64, entries: usize, start: u64, end: u64) -> core::ops::Range<usize> {
    let first = (start.max(base) - base) / span;
    let last = ((end - 1).saturating_sub(base) / span).min(entries as u64 - 1);
    if end <= base || first > last {
        return 0..0;
    }
    (first as usize)..(last as usize + 1)
}
