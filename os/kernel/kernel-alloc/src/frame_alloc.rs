//! # Physical Frame Allocator
//!
//! One [`Frame`] record per physical page frame, stored in a flat arena
//! indexed by frame number. Free frames are threaded onto an intrusive
//! doubly-linked list through the arena itself, so that
//!
//! - discontiguous allocation pops from the list head in O(1),
//! - contiguous allocation scans the arena for a run and unlinks its
//!   members in O(1) each.
//!
//! ```text
//!  arena:   [0: N/A][1: used][2: free]<->[5: free]<->[3: free] ...
//!                              ^ free_head
//! ```
//!
//! A frame's refcount counts the page-table leaves (and kernel owners) that
//! reference it. It is handed out with refcount 1; copy-on-write sharing
//! takes extra references with [`FrameAllocator::get`]. At refcount 0 the
//! frame goes back onto the free list.

use alloc::vec;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use core::fmt;
use core::ops::Range;
use kernel_info::memmap::{MemoryMap, RegionKind};
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, VirtualAddress, align_up};
use kernel_vmem::{FrameAlloc, Paging, PhysMapper};

/// Bytes in one frame, as a buffer length.
pub const FRAME_BYTES: usize = 4096;

/// Opaque handle to one physical frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FrameId(usize);

impl FrameId {
    /// Frame number, i.e. the physical address shifted right by 12.
    #[inline]
    #[must_use]
    pub const fn number(self) -> usize {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame #{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("out of memory: {requested} frame(s) requested, {free} free")]
    OutOfMemory { requested: usize, free: usize },
    #[error("cannot allocate zero frames")]
    ZeroCount,
}

/// Whether the frames of one allocation must be physically adjacent.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Contiguity {
    Contiguous,
    Discontiguous,
}

/// Options for [`FrameAllocator::allocate`].
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct AllocFlags {
    /// Don't record a kernel-space address for the frames.
    pub no_kernel_map: bool,
    /// Zero-fill every frame before returning it.
    pub zeroed: bool,
    #[bits(6)]
    __: u8,
}

impl AllocFlags {
    pub const ZEROED: Self = Self::new().with_zeroed(true);
    pub const NO_KERNEL_MAP: Self = Self::new().with_no_kernel_map(true);
}

#[derive(Copy, Clone, Debug, Default)]
struct Frame {
    refcount: u16,
    /// Not RAM, or above the direct map: never handed out.
    unavailable: bool,
    /// Held by the kernel image since boot and not yet reclaimed.
    image: bool,
    kernel_mapping: Option<VirtualAddress>,
    prev: Option<FrameId>,
    next: Option<FrameId>,
}

impl Frame {
    const fn is_free(&self) -> bool {
        self.refcount == 0 && !self.unavailable
    }
}

/// An owned group of frames returned by one allocation.
///
/// Dropping a set does not free its frames; hand it back with
/// [`FrameAllocator::free_set`] or free its members one by one.
#[derive(Debug, Default, PartialEq, Eq)]
#[must_use]
pub struct FrameSet {
    frames: Vec<FrameId>,
}

impl FrameSet {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[must_use]
    pub fn first(&self) -> Option<FrameId> {
        self.frames.first().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = FrameId> + '_ {
        self.frames.iter().copied()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[FrameId] {
        &self.frames
    }

    /// Move the last `count` frames into a new set.
    ///
    /// Splitting off at least the whole set moves everything.
    pub fn split(&mut self, count: usize) -> Self {
        if count >= self.frames.len() {
            return core::mem::take(self);
        }
        let at = self.frames.len() - count;
        Self {
            frames: self.frames.split_off(at),
        }
    }
}

impl IntoIterator for FrameSet {
    type Item = FrameId;
    type IntoIter = vec::IntoIter<FrameId>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.into_iter()
    }
}

/// Frame counts at one point in time.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FrameStats {
    pub used: usize,
    pub free: usize,
    pub unavailable: usize,
}

impl FrameStats {
    #[must_use]
    pub const fn total(&self) -> usize {
        self.used + self.free + self.unavailable
    }
}

impl fmt::Display for FrameStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} KiB used, {} KiB free, {} KiB unavailable",
            self.used * 4,
            self.free * 4,
            self.unavailable * 4
        )
    }
}

/// Refcounting frame allocator over the frames reachable through `M`.
pub struct FrameAllocator<M: PhysMapper> {
    frames: Vec<Frame>,
    free_head: Option<FrameId>,
    free_count: usize,
    unavailable: usize,
    mapper: M,
}

impl<M: PhysMapper> FrameAllocator<M> {
    /// Build the arena from the boot memory map.
    ///
    /// RAM frames become free, frames of the kernel image are taken with
    /// refcount 1, everything else (reserved, low memory, holes) is
    /// unavailable. RAM beyond the direct map of `P` cannot be reached by the
    /// kernel and is ignored.
    pub fn new<P: Paging>(map: &MemoryMap<'_>, mapper: M) -> Self {
        let highest = map.highest_ram_address().as_u64();
        let limit = highest.min(P::DIRECT_MAP_SIZE).min(P::MAX_PHYS);
        if limit < highest {
            log::warn!(
                "ignoring {} MiB of RAM beyond the direct map",
                (highest - limit) >> 20
            );
        }

        #[allow(clippy::cast_possible_truncation)]
        let count = (limit >> PAGE_SHIFT) as usize;
        let mut this = Self {
            frames: vec![Frame::default(); count],
            free_head: None,
            free_count: 0,
            unavailable: 0,
            mapper,
        };

        // Walk downwards so the list ends up in ascending address order.
        for n in (0..count).rev() {
            let id = FrameId(n);
            let pa = this.phys(id);
            let usable = map.kind_of(pa) == RegionKind::Ram
                && map.kind_of(pa + (PAGE_SIZE - 1)) == RegionKind::Ram;
            if !usable {
                this.frames[n].unavailable = true;
                this.unavailable += 1;
            } else if map.kernel.image.contains(&pa.as_u64()) {
                this.frames[n].refcount = 1;
                this.frames[n].image = true;
                this.frames[n].kernel_mapping = Some(this.mapper.phys_to_virt(pa));
            } else {
                this.push_front(id);
            }
        }

        log::info!("frame allocator: {}", this.stats());
        this
    }

    #[inline]
    #[must_use]
    pub const fn phys(&self, id: FrameId) -> PhysicalAddress {
        PhysicalAddress::new((id.0 as u64) << PAGE_SHIFT)
    }

    /// The frame containing `pa`, if the arena tracks it.
    #[must_use]
    pub fn frame_at(&self, pa: PhysicalAddress) -> Option<FrameId> {
        let n = usize::try_from(pa.as_u64() >> PAGE_SHIFT).ok()?;
        (n < self.frames.len()).then_some(FrameId(n))
    }

    #[must_use]
    pub fn refcount(&self, id: FrameId) -> u16 {
        self.frames[id.0].refcount
    }

    /// Kernel-space address recorded for an allocated frame.
    #[must_use]
    pub fn kernel_mapping(&self, id: FrameId) -> Option<VirtualAddress> {
        self.frames[id.0].kernel_mapping
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        FrameStats {
            used: self.frames.len() - self.free_count - self.unavailable,
            free: self.free_count,
            unavailable: self.unavailable,
        }
    }

    /// Allocate `count` frames with refcount 1.
    ///
    /// # Errors
    /// - [`FrameAllocError::ZeroCount`] for `count == 0`.
    /// - [`FrameAllocError::OutOfMemory`] if not enough free frames (or no
    ///   long enough run of them, for contiguous requests) exist.
    pub fn allocate(
        &mut self,
        count: usize,
        contiguity: Contiguity,
        flags: AllocFlags,
    ) -> Result<FrameSet, FrameAllocError> {
        if count == 0 {
            return Err(FrameAllocError::ZeroCount);
        }
        let oom = FrameAllocError::OutOfMemory {
            requested: count,
            free: self.free_count,
        };
        if count > self.free_count {
            return Err(oom);
        }

        let mut frames = Vec::with_capacity(count);
        match contiguity {
            Contiguity::Discontiguous => {
                while frames.len() < count {
                    let Some(id) = self.free_head else { break };
                    self.unlink(id);
                    frames.push(id);
                }
            }
            Contiguity::Contiguous => {
                let first = self.find_run(count).ok_or(oom)?;
                for n in first..first + count {
                    self.unlink(FrameId(n));
                    frames.push(FrameId(n));
                }
            }
        }

        for &id in &frames {
            self.claim(id, flags);
        }
        Ok(FrameSet { frames })
    }

    /// Take another reference to an allocated frame; returns the new count.
    ///
    /// # Panics
    /// If the frame is free or its refcount would overflow.
    pub fn get(&mut self, id: FrameId) -> u16 {
        let pa = self.phys(id);
        let frame = &mut self.frames[id.0];
        assert!(frame.refcount > 0, "reference taken on free frame {pa}");
        frame.refcount = frame
            .refcount
            .checked_add(1)
            .unwrap_or_else(|| panic!("refcount overflow on frame {pa}"));
        frame.refcount
    }

    /// Drop one reference; returns the remaining count.
    ///
    /// At zero the kernel mapping is forgotten and the frame is free again.
    ///
    /// # Panics
    /// On a double free, or when freeing a frame that was never available.
    pub fn free(&mut self, id: FrameId) -> u16 {
        let pa = self.phys(id);
        let frame = &mut self.frames[id.0];
        assert!(!frame.unavailable, "freeing unavailable frame {pa}");
        assert!(frame.refcount > 0, "double free of frame {pa}");
        frame.refcount -= 1;
        let left = frame.refcount;
        if left == 0 {
            frame.kernel_mapping = None;
            self.push_front(id);
        }
        left
    }

    /// Drop one reference to every frame of `set`.
    pub fn free_set(&mut self, set: FrameSet) {
        for id in set {
            self.free(id);
        }
    }

    /// Return the frames of an init-only kernel section to the free list.
    ///
    /// Only frames lying entirely inside `range` that were taken for the
    /// kernel image at boot, and are still held by the image alone, are
    /// released. Each frame is released at most once. Returns how many were.
    pub fn reclaim(&mut self, range: Range<u64>) -> usize {
        let mut released = 0;
        let mut pa = align_up(range.start, PAGE_SIZE);
        while pa + PAGE_SIZE <= range.end {
            if let Some(id) = self.frame_at(PhysicalAddress::new(pa)) {
                let frame = &mut self.frames[id.0];
                if frame.image && frame.refcount == 1 {
                    frame.image = false;
                    frame.refcount = 0;
                    frame.kernel_mapping = None;
                    self.push_front(id);
                    released += 1;
                }
            }
            pa += PAGE_SIZE;
        }
        log::info!("reclaimed {} KiB of init memory", released * 4);
        released
    }

    /// Run `f` on the contents of an allocated frame.
    pub fn with_bytes<R>(&mut self, id: FrameId, f: impl FnOnce(&mut [u8; FRAME_BYTES]) -> R) -> R {
        debug_assert!(self.frames[id.0].refcount > 0);
        // SAFETY: the frame is allocated and `&mut self` keeps any other
        // view through this allocator from existing while `f` runs.
        let bytes = unsafe { self.mapper.phys_to_mut::<[u8; FRAME_BYTES]>(self.phys(id)) };
        f(bytes)
    }

    /// Copy the contents of `from` into `to`.
    ///
    /// # Panics
    /// If `from` and `to` are the same frame.
    pub fn copy(&mut self, from: FrameId, to: FrameId) {
        assert_ne!(from, to, "copying {from} onto itself");
        // SAFETY: distinct frames never overlap, so the two views are disjoint.
        let src = unsafe { self.mapper.phys_to_mut::<[u8; FRAME_BYTES]>(self.phys(from)) };
        let dst = unsafe { self.mapper.phys_to_mut::<[u8; FRAME_BYTES]>(self.phys(to)) };
        dst.copy_from_slice(src);
    }

    fn claim(&mut self, id: FrameId, flags: AllocFlags) {
        let pa = self.phys(id);
        let mapping = (!flags.no_kernel_map()).then(|| self.mapper.phys_to_virt(pa));
        let frame = &mut self.frames[id.0];
        frame.refcount = 1;
        frame.kernel_mapping = mapping;
        if flags.zeroed() {
            // SAFETY: the frame was just claimed and nothing else refers to it.
            unsafe { self.mapper.phys_to_mut::<[u8; FRAME_BYTES]>(pa) }.fill(0);
        }
    }

    fn find_run(&self, count: usize) -> Option<usize> {
        let mut run = 0;
        for (n, frame) in self.frames.iter().enumerate() {
            if frame.is_free() {
                run += 1;
                if run == count {
                    return Some(n + 1 - count);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    fn push_front(&mut self, id: FrameId) {
        let old = self.free_head;
        self.frames[id.0].prev = None;
        self.frames[id.0].next = old;
        if let Some(old) = old {
            self.frames[old.0].prev = Some(id);
        }
        self.free_head = Some(id);
        self.free_count += 1;
    }

    fn unlink(&mut self, id: FrameId) {
        let Frame { prev, next, .. } = self.frames[id.0];
        match prev {
            Some(p) => self.frames[p.0].next = next,
            None => self.free_head = next,
        }
        if let Some(n) = next {
            self.frames[n.0].prev = prev;
        }
        self.frames[id.0].prev = None;
        self.frames[id.0].next = None;
        self.free_count -= 1;
    }
}

impl<M: PhysMapper> PhysMapper for FrameAllocator<M> {
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // SAFETY: forwarded; the caller upholds the mapper's contract.
        unsafe { self.mapper.phys_to_mut(pa) }
    }

    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        self.mapper.phys_to_virt(pa)
    }
}

/// Page-table frames come from the same pool, zeroed, with refcount 1.
impl<M: PhysMapper> FrameAlloc for FrameAllocator<M> {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        let set = self
            .allocate(1, Contiguity::Discontiguous, AllocFlags::ZEROED)
            .ok()?;
        set.first().map(|id| self.phys(id))
    }

    fn free_4k(&mut self, pa: PhysicalAddress) {
        match self.frame_at(pa) {
            Some(id) => {
                self.free(id);
            }
            None => log::error!("table frame {pa} is not tracked by the allocator"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRam;
    use kernel_info::memmap::KernelSections;
    use kernel_vmem::{X86, X86_64};

    fn allocator(frames: usize) -> FrameAllocator<SimRam> {
        let ram = SimRam::new(frames);
        let regions = ram.regions();
        let map = MemoryMap {
            regions: &regions,
            kernel: KernelSections {
                image: 0x1000..0x3000,
                init: 0x2000..0x3000,
            },
        };
        FrameAllocator::new::<X86_64>(&map, ram)
    }

    #[test]
    fn init_classifies_frames() {
        let fa = allocator(16);
        // Frame 0 is reserved, frames 1-2 hold the image.
        assert_eq!(
            fa.stats(),
            FrameStats {
                used: 2,
                free: 13,
                unavailable: 1
            }
        );
        assert_eq!(fa.refcount(FrameId(1)), 1);
        assert_eq!(fa.stats().total(), 16);
    }

    #[test]
    fn discontiguous_hands_out_lowest_first_and_zeroes() {
        let mut fa = allocator(16);
        let set = fa
            .allocate(1, Contiguity::Discontiguous, AllocFlags::new())
            .unwrap();
        let id = set.first().unwrap();
        fa.with_bytes(id, |b| b.fill(0xAA));
        fa.free_set(set);

        let set = fa
            .allocate(1, Contiguity::Discontiguous, AllocFlags::ZEROED)
            .unwrap();
        let again = set.first().unwrap();
        assert_eq!(again, id);
        assert_eq!(fa.phys(again).as_u64(), 0x3000);
        assert!(fa.with_bytes(again, |b| b.iter().all(|&x| x == 0)));
        assert!(fa.kernel_mapping(again).is_some());
    }

    #[test]
    fn contiguous_skips_holes() {
        let mut fa = allocator(16);
        let hole = fa
            .allocate(1, Contiguity::Discontiguous, AllocFlags::new())
            .unwrap();
        let _keep = fa
            .allocate(1, Contiguity::Discontiguous, AllocFlags::new())
            .unwrap();
        fa.free_set(hole);

        let run = fa
            .allocate(4, Contiguity::Contiguous, AllocFlags::NO_KERNEL_MAP)
            .unwrap();
        let numbers: Vec<_> = run.iter().map(FrameId::number).collect();
        assert_eq!(numbers, [5, 6, 7, 8]);
        assert!(fa.kernel_mapping(FrameId(5)).is_none());
    }

    #[test]
    fn exhaustion_and_zero_count_are_errors() {
        let mut fa = allocator(8);
        assert_eq!(
            fa.allocate(0, Contiguity::Discontiguous, AllocFlags::new()),
            Err(FrameAllocError::ZeroCount)
        );
        assert_eq!(
            fa.allocate(6, Contiguity::Discontiguous, AllocFlags::new()),
            Err(FrameAllocError::OutOfMemory {
                requested: 6,
                free: 5
            })
        );
        let all = fa
            .allocate(5, Contiguity::Discontiguous, AllocFlags::new())
            .unwrap();
        assert_eq!(all.len(), 5);
        assert!(fa.alloc_4k().is_none());
    }

    #[test]
    fn refcount_keeps_shared_frame_alive() {
        let mut fa = allocator(8);
        let id = fa
            .allocate(1, Contiguity::Discontiguous, AllocFlags::new())
            .unwrap()
            .first()
            .unwrap();
        assert_eq!(fa.get(id), 2);
        let before = fa.stats();
        assert_eq!(fa.free(id), 1);
        assert_eq!(fa.stats(), before);
        assert_eq!(fa.free(id), 0);
        assert_eq!(fa.stats().free, before.free + 1);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut fa = allocator(8);
        let id = fa
            .allocate(1, Contiguity::Discontiguous, AllocFlags::new())
            .unwrap()
            .first()
            .unwrap();
        fa.free(id);
        fa.free(id);
    }

    #[test]
    fn split_moves_tail() {
        let mut fa = allocator(16);
        let mut set = fa
            .allocate(5, Contiguity::Contiguous, AllocFlags::new())
            .unwrap();
        let tail = set.split(2);
        assert_eq!(set.len(), 3);
        assert_eq!(tail.first(), Some(FrameId(6)));

        let mut rest = set;
        let whole = rest.split(10);
        assert!(rest.is_empty());
        assert_eq!(whole.len(), 3);
        fa.free_set(whole);
        fa.free_set(tail);
    }

    #[test]
    fn reclaim_returns_init_section() {
        let mut fa = allocator(8);
        let free = fa.stats().free;
        assert_eq!(fa.reclaim(0x2000..0x3000), 1);
        assert_eq!(fa.stats().free, free + 1);
        assert_eq!(fa.refcount(FrameId(1)), 1);
    }

    #[test]
    fn reclaim_never_releases_live_allocations() {
        let mut fa = allocator(8);
        assert_eq!(fa.reclaim(0x2000..0x3000), 1);

        // The reclaimed frame is handed out again, first on the free list.
        let set = fa
            .allocate(1, Contiguity::Discontiguous, AllocFlags::new())
            .unwrap();
        assert_eq!(set.first(), Some(FrameId(2)));
        let used = fa.stats().used;

        assert_eq!(fa.reclaim(0x2000..0x3000), 0);
        assert_eq!(fa.refcount(FrameId(2)), 1);
        // Ordinary allocations outside the image are never touched either.
        assert_eq!(fa.reclaim(0x3000..0x8000), 0);
        assert_eq!(fa.stats().used, used);
        fa.free_set(set);
    }

    #[test]
    fn ram_above_direct_map_is_ignored() {
        let ram = SimRam::new(4);
        let regions = [kernel_info::memmap::MemoryRegion::new(
            0x1000,
            X86::DIRECT_MAP_SIZE + 0x10_0000,
            RegionKind::Ram,
        )];
        let map = MemoryMap {
            regions: &regions,
            kernel: KernelSections {
                image: 0..0,
                init: 0..0,
            },
        };
        // Only sizes the arena; no frame is touched.
        let fa = FrameAllocator::new::<X86>(&map, ram);
        let expected = usize::try_from(X86::DIRECT_MAP_SIZE >> PAGE_SHIFT).unwrap();
        assert_eq!(fa.stats().total(), expected);
    }

    #[test]
    fn stats_display() {
        let s = FrameStats {
            used: 1,
            free: 2,
            unavailable: 3,
        };
        assert_eq!(s.to_string(), "4 KiB used, 8 KiB free, 12 KiB unavailable");
    }
}
