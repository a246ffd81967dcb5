//! # Virtual Memory Areas
//!
//! A [`Vma`] is one contiguous, permission-homogeneous range `[start, end)` of
//! a process's user address space. A [`VmaList`] keeps them sorted and
//! non-overlapping and implements the operations that touch page tables for
//! a whole range at once: unmapping, copy-on-write duplication, and
//! re-applying protection.
//!
//! Nothing is mapped when a VMA is created. Pages appear on first touch via
//! the fault resolver, either zero-filled or supplied by the VMA's
//! [`Backing`] object.

use crate::VmError;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use core::fmt;
use core::ops::Range;
use kernel_alloc::FrameAllocator;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{CachePolicy, LeafAction, PageDirectory, PageEntryBits, Paging, PhysMapper, Tlb};

/// What a VMA is used for. Only informs diagnostics and `brk`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum VmaKind {
    Plain = 0,
    Stack = 1,
    Heap = 2,
    Image = 3,
}

impl VmaKind {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(value: u8) -> Self {
        match value {
            1 => Self::Stack,
            2 => Self::Heap,
            3 => Self::Image,
            _ => Self::Plain,
        }
    }
}

/// Permissions and attributes of a VMA.
///
/// Also used as the access mask for [`AddressSpace::verify`](crate::AddressSpace::verify)
/// and as the protection argument of `mmap`/`mprotect`; only `read`,
/// `write` and `exec` matter there.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct VmFlags {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    /// Writes are visible to every address space sharing the pages; not
    /// copy-on-write across fork.
    pub shared: bool,
    /// Direct mapping of device memory; frames are not refcounted.
    pub io: bool,
    /// Protection and extent can't be changed by the process.
    pub immutable: bool,
    #[bits(2)]
    pub kind: VmaKind,
    #[bits(8)]
    __: u8,
}

impl VmFlags {
    /// Protection-only flags.
    #[must_use]
    pub const fn prot(read: bool, write: bool, exec: bool) -> Self {
        Self::new().with_read(read).with_write(write).with_exec(exec)
    }

    #[must_use]
    pub const fn rw() -> Self {
        Self::prot(true, true, false)
    }

    #[must_use]
    pub const fn rx() -> Self {
        Self::prot(true, false, true)
    }

    #[must_use]
    pub const fn ro() -> Self {
        Self::prot(true, false, false)
    }

    /// Whether every access in `access` is allowed.
    #[must_use]
    pub const fn permits(self, access: Self) -> bool {
        (!access.read() || self.read())
            && (!access.write() || self.write())
            && (!access.exec() || self.exec())
    }

    /// Same flags with the protection bits taken from `prot`.
    #[must_use]
    pub const fn with_protection_of(self, prot: Self) -> Self {
        self.with_read(prot.read())
            .with_write(prot.write())
            .with_exec(prot.exec())
    }
}

impl fmt::Display for VmFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |on: bool, c: char| if on { c } else { '-' };
        write!(
            f,
            "{}{}{}{}",
            bit(self.read(), 'r'),
            bit(self.write(), 'w'),
            bit(self.exec(), 'x'),
            if self.shared() { 's' } else { 'p' }
        )?;
        if self.io() {
            f.write_str(" io")?;
        }
        if self.immutable() {
            f.write_str(" immutable")?;
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum NoPageError {
    #[error("offset {0:#x} is beyond the end of the backing object")]
    OutOfRange(u64),
    #[error("backing object i/o failure")]
    Io,
}

/// A backing object supplying page contents on demand (a file, a device).
pub trait VmaOps: Send + Sync {
    /// Fill `page` with the object's bytes at `offset`.
    ///
    /// `page` is at most one page long; it is shorter when the VMA's data
    /// ends inside the page. Returns the number of bytes written, the
    /// resolver zeroes the remainder of the frame.
    ///
    /// # Errors
    /// Any [`NoPageError`] makes the fault fatal.
    fn nopage(&self, offset: u64, page: &mut [u8]) -> Result<usize, NoPageError>;
}

/// A [`VmaOps`] object plus the object offset at which the VMA starts.
#[derive(Clone)]
pub struct Backing {
    ops: Arc<dyn VmaOps>,
    offset: u64,
}

impl Backing {
    #[must_use]
    pub fn new(ops: Arc<dyn VmaOps>, offset: u64) -> Self {
        Self { ops, offset }
    }

    #[must_use]
    pub fn ops(&self) -> &Arc<dyn VmaOps> {
        &self.ops
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backing")
            .field("offset", &format_args!("{:#x}", self.offset))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct Vma {
    start: VirtualAddress,
    end: VirtualAddress,
    flags: VmFlags,
    backing: Option<Backing>,
    /// Backed bytes end here; anything after reads as zeros.
    actual_end: VirtualAddress,
    io_base: Option<PhysicalAddress>,
}

impl Vma {
    /// A VMA covering `[start, end)`; both bounds must be page aligned.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] for unaligned or empty ranges.
    pub fn new(start: VirtualAddress, end: VirtualAddress, flags: VmFlags) -> Result<Self, VmError> {
        if !start.is_page_aligned() || !end.is_page_aligned() || start >= end {
            return Err(VmError::InvalidArgument);
        }
        Ok(Self {
            start,
            end,
            flags,
            backing: None,
            actual_end: end,
            io_base: None,
        })
    }

    /// Attach a backing object whose data covers `[start, actual_end)`.
    #[must_use]
    pub fn with_backing(mut self, backing: Backing, actual_end: VirtualAddress) -> Self {
        self.backing = Some(backing);
        self.actual_end = actual_end.min(self.end);
        self
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> VmFlags {
        self.flags
    }

    #[must_use]
    pub const fn backing(&self) -> Option<&Backing> {
        self.backing.as_ref()
    }

    #[must_use]
    pub const fn actual_end(&self) -> VirtualAddress {
        self.actual_end
    }

    #[must_use]
    pub const fn io_base(&self) -> Option<PhysicalAddress> {
        self.io_base
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.start <= va && va < self.end
    }

    #[inline]
    #[must_use]
    pub fn overlaps(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.start < end && start < self.end
    }

    /// Leaf entry bits for pages of this VMA (target address not set).
    #[must_use]
    pub fn leaf_bits(&self) -> PageEntryBits {
        let bits = PageEntryBits::new()
            .with_present(true)
            .with_user_access(true)
            .with_writable(self.flags.write())
            .with_no_execute(!self.flags.exec());
        if self.flags.io() {
            bits.with_cache(CachePolicy::Uncached)
        } else {
            bits
        }
    }

    pub(crate) const fn set_flags(&mut self, flags: VmFlags) {
        self.flags = flags;
    }

    pub(crate) const fn set_end(&mut self, end: VirtualAddress) {
        self.end = end;
    }

    /// Cut off `[at, end)` into a new VMA; `at` lies strictly inside.
    fn split_off(&mut self, at: VirtualAddress) -> Self {
        debug_assert!(self.start < at && at < self.end && at.is_page_aligned());
        let delta = at - self.start;
        let mut tail = self.clone();
        tail.start = at;
        if let Some(b) = tail.backing.as_mut() {
            b.offset += delta;
        }
        tail.io_base = self.io_base.map(|pa| pa + delta);
        self.end = at;
        tail
    }

    /// Clear every installed leaf in `[start, end) ∩ self`, dropping one
    /// reference on each RAM frame, and invalidate the pages.
    pub fn unmap_range<P, M, T>(
        &self,
        dir: &PageDirectory<P>,
        frames: &mut FrameAllocator<M>,
        tlb: &T,
        start: VirtualAddress,
        end: VirtualAddress,
    ) where
        P: Paging,
        M: PhysMapper,
        T: Tlb,
    {
        let start = start.max(self.start);
        let end = end.min(self.end);
        if start >= end {
            return;
        }

        let mut cleared = Vec::new();
        dir.visit_leaves(&*frames, start, end, |va, e| {
            cleared.push((va, e.physical_address()));
            LeafAction::Clear
        });

        for (va, pa) in cleared {
            if !self.flags.io() {
                match frames.frame_at(pa) {
                    Some(id) => {
                        frames.free(id);
                    }
                    None => log::error!("{va} maps untracked frame {pa} in a RAM mapping"),
                }
            }
            tlb.invalidate_page(va);
        }
    }

    /// Map the whole VMA directly onto device memory at `paddr`.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] if `paddr` is not page aligned.
    /// - [`VmError::Map`] if a table cannot be allocated.
    pub fn io_apply<P, M, T>(
        &mut self,
        dir: &PageDirectory<P>,
        frames: &mut FrameAllocator<M>,
        tlb: &T,
        paddr: PhysicalAddress,
    ) -> Result<(), VmError>
    where
        P: Paging,
        M: PhysMapper,
        T: Tlb,
    {
        if !paddr.is_page_aligned() {
            return Err(VmError::InvalidArgument);
        }
        self.flags = self.flags.with_io(true);
        self.io_base = Some(paddr);
        let bits = self.leaf_bits();

        let mut va = self.start;
        let mut pa = paddr;
        while va < self.end {
            dir.entry_set(frames, va, pa, bits)?;
            tlb.invalidate_page(va);
            va += PAGE_SIZE;
            pa += PAGE_SIZE;
        }
        log::debug!("io mapping {self} -> {paddr}");
        Ok(())
    }
}

impl fmt::Display for Vma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} {} {:?}",
            self.start,
            self.end,
            self.flags,
            self.flags.kind()
        )?;
        if let Some(b) = &self.backing {
            write!(f, " @{:#x}", b.offset)?;
        }
        Ok(())
    }
}

/// Address-ordered, non-overlapping VMAs of one address space.
#[derive(Clone, Debug, Default)]
pub struct VmaList {
    vmas: Vec<Vma>,
}

impl VmaList {
    #[must_use]
    pub const fn new() -> Self {
        Self { vmas: Vec::new() }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.vmas.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.vmas.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Vma> {
        self.vmas.iter()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Vma> {
        self.vmas.get(index)
    }

    /// Insert keeping address order.
    ///
    /// # Errors
    /// [`VmError::Overlap`] if `vma` intersects an existing VMA.
    pub fn insert(&mut self, vma: Vma) -> Result<(), VmError> {
        let pos = self.vmas.partition_point(|v| v.start < vma.start);
        let clashes_prev = pos > 0 && self.vmas[pos - 1].end > vma.start;
        let clashes_next = self.vmas.get(pos).is_some_and(|n| n.start < vma.end);
        if clashes_prev || clashes_next {
            return Err(VmError::Overlap);
        }
        log::debug!("vma insert {vma}");
        self.vmas.insert(pos, vma);
        Ok(())
    }

    /// Index of the VMA containing `va`.
    #[must_use]
    pub fn find_index(&self, va: VirtualAddress) -> Option<usize> {
        let pos = self.vmas.partition_point(|v| v.end <= va);
        self.vmas
            .get(pos)
            .is_some_and(|v| v.contains(va))
            .then_some(pos)
    }

    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<&Vma> {
        self.find_index(va).map(|i| &self.vmas[i])
    }

    /// Indices of the VMAs intersecting `[start, end)`.
    #[must_use]
    pub fn overlapping(&self, start: VirtualAddress, end: VirtualAddress) -> Range<usize> {
        let first = self.vmas.partition_point(|v| v.end <= start);
        let last = self.vmas.partition_point(|v| v.start < end);
        first..last.max(first)
    }

    /// Whether no VMA intersects `[start, end)`.
    #[must_use]
    pub fn is_free(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.overlapping(start, end).is_empty()
    }

    /// First address in `[start, end)` not covered by any VMA.
    #[must_use]
    pub fn first_hole(&self, start: VirtualAddress, end: VirtualAddress) -> Option<VirtualAddress> {
        let mut cursor = start;
        for vma in &self.vmas[self.overlapping(start, end)] {
            if vma.start > cursor {
                return Some(cursor);
            }
            cursor = vma.end;
        }
        (cursor < end).then_some(cursor)
    }

    /// Split the VMA containing `at` so that a VMA starts exactly at `at`.
    ///
    /// No-op if `at` is not inside any VMA or already a boundary.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] if `at` is not page aligned.
    pub fn split(&mut self, at: VirtualAddress) -> Result<(), VmError> {
        if !at.is_page_aligned() {
            return Err(VmError::InvalidArgument);
        }
        if let Some(i) = self.find_index(at)
            && self.vmas[i].start != at
        {
            let tail = self.vmas[i].split_off(at);
            self.vmas.insert(i + 1, tail);
        }
        Ok(())
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Vma> {
        self.vmas.get_mut(index)
    }

    pub(crate) fn drain(&mut self, range: Range<usize>) -> Vec<Vma> {
        self.vmas.drain(range).collect()
    }

    /// Tear down every VMA: unmap, then release page tables.
    ///
    /// VMAs go in address order; each frees the tables it no longer shares
    /// with the VMA after it.
    pub fn free<P, M, T>(&mut self, dir: &PageDirectory<P>, frames: &mut FrameAllocator<M>, tlb: &T)
    where
        P: Paging,
        M: PhysMapper,
        T: Tlb,
    {
        let vmas = core::mem::take(&mut self.vmas);
        for (i, vma) in vmas.iter().enumerate() {
            vma.unmap_range(dir, frames, tlb, vma.start, vma.end);
            let ceil = vmas
                .get(i + 1)
                .map_or(VirtualAddress::new(P::USER_END), |next| next.start);
            dir.free_range(frames, vma.start, vma.end, VirtualAddress::zero(), ceil);
        }
        tlb.reload();
    }

    /// Duplicate `src` (mapped by `src_dir`) into `self` (mapped by `dest_dir`).
    ///
    /// Private RAM pages become read-only in **both** directories and gain
    /// one reference; the first write on either side then takes a private
    /// copy. Shared and IO mappings are duplicated as they are.
    ///
    /// # Errors
    /// [`VmError::Map`] if a destination table cannot be allocated. The
    /// destination is left partially populated and must be destroyed.
    pub fn copy<P, M, T>(
        &mut self,
        src: &Self,
        dest_dir: &PageDirectory<P>,
        src_dir: &PageDirectory<P>,
        frames: &mut FrameAllocator<M>,
        tlb: &T,
    ) -> Result<(), VmError>
    where
        P: Paging,
        M: PhysMapper,
        T: Tlb,
    {
        let result = self.copy_entries(src, dest_dir, src_dir, frames);
        // Source entries may have lost write access even on failure.
        tlb.reload();
        result
    }

    fn copy_entries<P: Paging, M: PhysMapper>(
        &mut self,
        src: &Self,
        dest_dir: &PageDirectory<P>,
        src_dir: &PageDirectory<P>,
        frames: &mut FrameAllocator<M>,
    ) -> Result<(), VmError> {
        for vma in &src.vmas {
            self.insert(vma.clone())?;
            let cow = !vma.flags.io() && !vma.flags.shared();

            let mut pending = Vec::new();
            src_dir.visit_leaves(&*frames, vma.start, vma.end, |va, e| {
                let e = if cow { e.with_writable(false) } else { e };
                pending.push((va, e));
                if cow { LeafAction::Set(e) } else { LeafAction::Keep }
            });

            for (va, e) in pending {
                let pa = e.physical_address();
                dest_dir.entry_set(frames, va, pa, e)?;
                if !vma.flags.io() {
                    match frames.frame_at(pa) {
                        Some(id) => {
                            frames.get(id);
                        }
                        None => log::error!("{va} maps untracked frame {pa} in a RAM mapping"),
                    }
                }
            }
        }
        Ok(())
    }

    /// Rewrite the protection of installed leaves in `[start, end)` from
    /// their VMA's flags.
    ///
    /// Pages still shared copy-on-write stay read-only.
    pub fn apply<P, M, T>(
        &self,
        dir: &PageDirectory<P>,
        frames: &FrameAllocator<M>,
        tlb: &T,
        start: VirtualAddress,
        end: VirtualAddress,
    ) where
        P: Paging,
        M: PhysMapper,
        T: Tlb,
    {
        for vma in &self.vmas[self.overlapping(start, end)] {
            let prot = vma.leaf_bits();
            let private = !vma.flags.io() && !vma.flags.shared();
            dir.visit_leaves(frames, start.max(vma.start), end.min(vma.end), |_, e| {
                let mut new = e.with_protection(prot);
                let shared_frame = frames
                    .frame_at(e.physical_address())
                    .is_some_and(|id| frames.refcount(id) > 1);
                if new.writable() && private && shared_frame {
                    new = new.with_writable(false);
                }
                LeafAction::Set(new)
            });
        }
        tlb.reload();
    }

    /// Log every VMA at `level`.
    pub fn dump(&self, level: log::Level) {
        for vma in &self.vmas {
            log::log!(level, "  {vma}");
        }
    }
}

impl<'a> IntoIterator for &'a VmaList {
    type Item = &'a Vma;
    type IntoIter = core::slice::Iter<'a, Vma>;

    fn into_iter(self) -> Self::IntoIter {
        self.vmas.iter()
    }
}
