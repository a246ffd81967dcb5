//! # Process address spaces
//!
//! An [`AddressSpace`] bundles one page directory with the VMAs describing
//! its user half, the process's kernel stack and the program break.
//!
//! ```text
//! USER_END ─┬──────────────────────┐
//!           │ guard page           │
//! STACK_TOP ├──────────────────────┤
//!           │ user stack (Stack)   │ grows down, demand-paged
//!           ├──────────────────────┤ ◄─ top-down mmap search starts here
//!           │ mmap area            │
//! MMAP_FLOOR├──────────────────────┤
//!           │ heap (Heap)          │ brk
//!           ├──────────────────────┤
//!           │ image segments       │
//!         0 └──────────────────────┘
//! ```
//!
//! Every operation that changes mappings takes the frame allocator and a
//! [`Tlb`] explicitly; the caller holds the frame lock (with interrupts
//! disabled) for the duration.

use crate::VmError;
use crate::vma::{Backing, Vma, VmFlags, VmaKind, VmaList};
use bitfield_struct::bitfield;
use kernel_alloc::{AllocFlags, Contiguity, FRAME_BYTES, FrameAllocator, FrameSet};
use kernel_info::memory::{KERNEL_STACK_SIZE, STACK_MAGIC};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down, checked_align_up};
use kernel_vmem::{PageDirectory, Paging, PhysMapper, Tlb};

/// Flags of a `clone`-style fork request.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct CloneFlags {
    /// Share the whole address space with the parent (threads).
    pub share_vm: bool,
    #[bits(31)]
    __: u32,
}

/// Where `mmap` should place a new mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Placement {
    /// Top-down search below the user stack.
    Anywhere,
    /// Use the address if the range is free, otherwise search.
    Hint(VirtualAddress),
    /// Exactly here, replacing whatever is mapped.
    Fixed(VirtualAddress),
}

/// One loadable program segment.
#[derive(Clone, Debug)]
pub struct Segment {
    pub vaddr: VirtualAddress,
    pub mem_size: u64,
    /// Bytes supplied by the backing object; the rest is zero-filled.
    pub file_size: u64,
    pub flags: VmFlags,
    /// Backing object and the object offset of `vaddr`.
    pub backing: Option<Backing>,
}

/// Program break bounds: the heap VMA spans `[start, align_up(end))`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Brk {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
}

#[derive(Debug)]
pub struct AddressSpace<P: Paging> {
    dir: PageDirectory<P>,
    vmas: VmaList,
    kernel_stack: FrameSet,
    brk: Brk,
}

impl<P: Paging> AddressSpace<P> {
    /// Fresh address space sharing the kernel half of `kernel`, with a
    /// signed kernel stack and no user mappings.
    ///
    /// # Errors
    /// [`VmError::Map`] or [`VmError::Frames`] when memory runs out.
    pub fn create<M: PhysMapper>(
        frames: &mut FrameAllocator<M>,
        kernel: &PageDirectory<P>,
    ) -> Result<Self, VmError> {
        let dir = PageDirectory::create(frames, kernel)?;

        #[allow(clippy::cast_possible_truncation)]
        let pages = (KERNEL_STACK_SIZE / PAGE_SIZE) as usize;
        let kernel_stack = match frames.allocate(pages, Contiguity::Contiguous, AllocFlags::ZEROED) {
            Ok(set) => set,
            Err(e) => {
                dir.destroy(frames);
                return Err(e.into());
            }
        };
        if let Some(bottom) = kernel_stack.first() {
            frames.with_bytes(bottom, |b| b[..8].copy_from_slice(&STACK_MAGIC.to_le_bytes()));
        }

        log::debug!("{}: address space at {}", P::NAME, dir.root());
        Ok(Self {
            dir,
            vmas: VmaList::new(),
            kernel_stack,
            brk: Brk::default(),
        })
    }

    #[inline]
    #[must_use]
    pub const fn directory(&self) -> &PageDirectory<P> {
        &self.dir
    }

    #[inline]
    #[must_use]
    pub const fn vmas(&self) -> &VmaList {
        &self.vmas
    }

    #[must_use]
    pub const fn brk(&self) -> Brk {
        self.brk
    }

    #[must_use]
    pub const fn kernel_stack(&self) -> &FrameSet {
        &self.kernel_stack
    }

    /// Load this directory on the current CPU.
    ///
    /// # Safety
    /// See [`Tlb::activate`].
    pub unsafe fn activate<T: Tlb>(&self, tlb: &T) {
        unsafe { tlb.activate(self.dir.root()) }
    }

    /// Install the program image: one VMA per segment, the user stack below
    /// `USER_STACK_TOP`, and an empty heap right after the highest segment.
    ///
    /// Nothing is mapped yet; pages arrive on first touch.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] for malformed segments.
    /// - [`VmError::Overlap`] if segments collide with each other or the stack.
    pub fn populate_image(&mut self, segments: &[Segment]) -> Result<(), VmError> {
        let mut image_end = 0;
        for seg in segments.iter().filter(|s| s.mem_size > 0) {
            if seg.file_size > seg.mem_size {
                return Err(VmError::InvalidArgument);
            }
            let start = align_down(seg.vaddr.as_u64(), PAGE_SIZE);
            let end = seg
                .vaddr
                .as_u64()
                .checked_add(seg.mem_size)
                .and_then(|e| checked_align_up(e, PAGE_SIZE))
                .filter(|&e| e <= P::USER_END)
                .ok_or(VmError::InvalidArgument)?;

            let flags = seg.flags.with_kind(VmaKind::Image);
            let mut vma = Vma::new(VirtualAddress::new(start), VirtualAddress::new(end), flags)?;
            if let Some(b) = &seg.backing {
                let offset = b
                    .offset()
                    .checked_sub(seg.vaddr.as_u64() - start)
                    .ok_or(VmError::InvalidArgument)?;
                vma = vma.with_backing(Backing::new(b.ops().clone(), offset), seg.vaddr + seg.file_size);
            }
            self.vmas.insert(vma)?;
            image_end = image_end.max(end);
        }

        let top = VirtualAddress::new(P::USER_STACK_TOP);
        let bottom = VirtualAddress::new(P::USER_STACK_TOP - P::USER_STACK_SIZE);
        self.vmas
            .insert(Vma::new(bottom, top, VmFlags::rw().with_kind(VmaKind::Stack))?)?;

        let heap = VirtualAddress::new(image_end);
        self.brk = Brk {
            start: heap,
            end: heap,
        };
        Ok(())
    }

    /// Map `len` bytes at a place chosen by `placement`.
    ///
    /// Anonymous mappings are zero-filled on demand; backed ones read from
    /// `backing` (whose offset corresponds to the returned address).
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] for a zero length or an unusable address.
    /// - [`VmError::NoSpace`] if no gap is large enough.
    /// - Anything `munmap` returns, for fixed placements.
    pub fn mmap<M: PhysMapper, T: Tlb>(
        &mut self,
        placement: Placement,
        len: u64,
        flags: VmFlags,
        backing: Option<Backing>,
        frames: &mut FrameAllocator<M>,
        tlb: &T,
    ) -> Result<VirtualAddress, VmError> {
        if len == 0 {
            return Err(VmError::InvalidArgument);
        }
        let len = checked_align_up(len, PAGE_SIZE).ok_or(VmError::InvalidArgument)?;

        let start = match placement {
            Placement::Fixed(addr) => {
                Self::check_user_range(addr, len)?;
                self.munmap(addr, len, frames, tlb)?;
                addr
            }
            Placement::Hint(addr) => {
                let usable = Self::check_user_range(addr, len).is_ok() && self.vmas.is_free(addr, addr + len);
                if usable { addr } else { self.find_gap(len)? }
            }
            Placement::Anywhere => self.find_gap(len)?,
        };

        let flags = flags
            .with_kind(VmaKind::Plain)
            .with_io(false)
            .with_immutable(false);
        let mut vma = Vma::new(start, start + len, flags)?;
        if let Some(b) = backing {
            vma = vma.with_backing(b, start + len);
        }
        self.vmas.insert(vma)?;
        Ok(start)
    }

    /// Highest free, page-aligned gap of `len` bytes between `MMAP_FLOOR`
    /// and the bottom of the user stack.
    fn find_gap(&self, len: u64) -> Result<VirtualAddress, VmError> {
        let floor = P::MMAP_FLOOR;
        let mut top = P::USER_STACK_TOP - P::USER_STACK_SIZE;
        for vma in self.vmas.iter().rev() {
            let (start, end) = (vma.start().as_u64(), vma.end().as_u64());
            if start >= top {
                continue;
            }
            if end < top {
                let bottom = end.max(floor);
                if top >= bottom + len {
                    return Ok(VirtualAddress::new(top - len));
                }
            }
            top = start;
            if top <= floor {
                break;
            }
        }
        if top >= floor + len {
            return Ok(VirtualAddress::new(top - len));
        }
        Err(VmError::NoSpace(len))
    }

    fn check_user_range(addr: VirtualAddress, len: u64) -> Result<(), VmError> {
        let end = addr.as_u64().checked_add(len).ok_or(VmError::InvalidArgument)?;
        if !addr.is_page_aligned() || end > P::USER_END {
            return Err(VmError::InvalidArgument);
        }
        Ok(())
    }

    /// Remove every mapping in `[addr, addr + len)`, splitting VMAs that
    /// straddle the bounds, and free the page tables nothing else uses.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] for unaligned or out-of-range requests.
    /// - [`VmError::Immutable`] if an immutable VMA is in the way.
    pub fn munmap<M: PhysMapper, T: Tlb>(
        &mut self,
        addr: VirtualAddress,
        len: u64,
        frames: &mut FrameAllocator<M>,
        tlb: &T,
    ) -> Result<(), VmError> {
        if len == 0 {
            return Err(VmError::InvalidArgument);
        }
        let len = checked_align_up(len, PAGE_SIZE).ok_or(VmError::InvalidArgument)?;
        Self::check_user_range(addr, len)?;
        let end = addr + len;

        let range = self.vmas.overlapping(addr, end);
        if self.vmas_in(range).any(|v| v.flags().immutable()) {
            return Err(VmError::Immutable);
        }

        self.vmas.split(addr)?;
        self.vmas.split(end)?;
        let range = self.vmas.overlapping(addr, end);
        if range.is_empty() {
            return Ok(());
        }

        let floor = range
            .start
            .checked_sub(1)
            .and_then(|i| self.vmas.get(i))
            .map_or(VirtualAddress::zero(), Vma::end);
        let ceil = self
            .vmas
            .get(range.end)
            .map_or(VirtualAddress::new(P::USER_END), Vma::start);

        for vma in self.vmas.drain(range) {
            log::debug!("munmap {vma}");
            vma.unmap_range(&self.dir, frames, tlb, vma.start(), vma.end());
        }
        self.dir.free_range(frames, addr, end, floor, ceil);
        tlb.reload();
        Ok(())
    }

    /// Change the protection of `[addr, addr + len)`.
    ///
    /// # Errors
    /// - [`VmError::NotMapped`] if part of the range has no VMA.
    /// - [`VmError::Immutable`] for immutable VMAs.
    pub fn mprotect<M: PhysMapper, T: Tlb>(
        &mut self,
        addr: VirtualAddress,
        len: u64,
        prot: VmFlags,
        frames: &FrameAllocator<M>,
        tlb: &T,
    ) -> Result<(), VmError> {
        if len == 0 {
            return Err(VmError::InvalidArgument);
        }
        let len = checked_align_up(len, PAGE_SIZE).ok_or(VmError::InvalidArgument)?;
        Self::check_user_range(addr, len)?;
        let end = addr + len;

        if let Some(hole) = self.vmas.first_hole(addr, end) {
            return Err(VmError::NotMapped(hole));
        }
        if self
            .vmas_in(self.vmas.overlapping(addr, end))
            .any(|v| v.flags().immutable())
        {
            return Err(VmError::Immutable);
        }

        self.vmas.split(addr)?;
        self.vmas.split(end)?;
        for i in self.vmas.overlapping(addr, end) {
            if let Some(vma) = self.vmas.get_mut(i) {
                vma.set_flags(vma.flags().with_protection_of(prot));
            }
        }
        self.vmas.apply(&self.dir, frames, tlb, addr, end);
        Ok(())
    }

    /// Move the program break to `new_end`; returns the new break.
    ///
    /// Growing extends (or creates) the heap VMA, shrinking unmaps the pages
    /// above the new break.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] below the heap start.
    /// - [`VmError::Overlap`] if the heap would run into another mapping.
    pub fn set_brk<M: PhysMapper, T: Tlb>(
        &mut self,
        new_end: VirtualAddress,
        frames: &mut FrameAllocator<M>,
        tlb: &T,
    ) -> Result<VirtualAddress, VmError> {
        if new_end < self.brk.start || new_end.as_u64() > P::USER_END {
            return Err(VmError::InvalidArgument);
        }
        let old_top = VirtualAddress::new(checked_align_up(self.brk.end.as_u64(), PAGE_SIZE).ok_or(VmError::InvalidArgument)?);
        let new_top = VirtualAddress::new(checked_align_up(new_end.as_u64(), PAGE_SIZE).ok_or(VmError::InvalidArgument)?);

        if new_top > old_top {
            if !self.vmas.is_free(old_top, new_top) {
                return Err(VmError::Overlap);
            }
            let heap = old_top
                .as_u64()
                .checked_sub(1)
                .map(VirtualAddress::new)
                .filter(|&last| last >= self.brk.start)
                .and_then(|last| self.vmas.find_index(last))
                .filter(|&i| self.vmas.get(i).is_some_and(|v| v.flags().kind() == VmaKind::Heap));
            match heap.and_then(|i| self.vmas.get_mut(i)) {
                Some(vma) => vma.set_end(new_top),
                None => self
                    .vmas
                    .insert(Vma::new(old_top, new_top, VmFlags::rw().with_kind(VmaKind::Heap))?)?,
            }
        } else if new_top < old_top {
            self.munmap(new_top, old_top - new_top, frames, tlb)?;
        }

        log::debug!("brk {} -> {new_end}", self.brk.end);
        self.brk.end = new_end;
        Ok(new_end)
    }

    /// Duplicate this address space for a child process.
    ///
    /// # Errors
    /// - [`VmError::Unsupported`] when asked to share the whole address space.
    /// - Allocation failures; the partial child is torn down first.
    pub fn fork<M: PhysMapper, T: Tlb>(
        &self,
        clone: CloneFlags,
        kernel: &PageDirectory<P>,
        frames: &mut FrameAllocator<M>,
        tlb: &T,
    ) -> Result<Self, VmError> {
        if clone.share_vm() {
            return Err(VmError::Unsupported);
        }
        let mut child = Self::create(frames, kernel)?;
        if let Err(e) = child
            .vmas
            .copy(&self.vmas, &child.dir, &self.dir, frames, tlb)
        {
            log::warn!("fork failed: {e}");
            child.destroy(frames, tlb);
            return Err(e);
        }
        child.brk = self.brk;
        Ok(child)
    }

    /// Check that user memory `[addr, addr + len)` is mapped with `access`.
    ///
    /// # Errors
    /// [`VmError::BadAddress`] naming the first offending address.
    pub fn verify(&self, addr: VirtualAddress, len: u64, access: VmFlags) -> Result<(), VmError> {
        if len == 0 {
            return Ok(());
        }
        let end = addr
            .as_u64()
            .checked_add(len)
            .filter(|&e| e <= P::USER_END)
            .ok_or(VmError::BadAddress(addr))?;

        let mut cursor = addr;
        while cursor.as_u64() < end {
            let vma = self.vmas.find(cursor).ok_or(VmError::BadAddress(cursor))?;
            if !vma.flags().permits(access) {
                return Err(VmError::BadAddress(cursor));
            }
            cursor = vma.end();
        }
        Ok(())
    }

    /// Panic if the signature at the bottom of the kernel stack was overwritten.
    ///
    /// # Panics
    /// On a signature mismatch (kernel stack overflow).
    pub fn check_kernel_stack<M: PhysMapper>(&self, frames: &mut FrameAllocator<M>) {
        let Some(bottom) = self.kernel_stack.first() else {
            return;
        };
        let found = frames.with_bytes(bottom, |b: &mut [u8; FRAME_BYTES]| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&b[..8]);
            u64::from_le_bytes(word)
        });
        assert!(
            found == STACK_MAGIC,
            "kernel stack overflow: signature {found:#x}, expected {STACK_MAGIC:#x}"
        );
    }

    /// Release everything: user mappings, page tables, the kernel stack and
    /// the directory itself. The directory must not be active.
    pub fn destroy<M: PhysMapper, T: Tlb>(mut self, frames: &mut FrameAllocator<M>, tlb: &T) {
        self.vmas.free(&self.dir, frames, tlb);
        frames.free_set(self.kernel_stack);
        self.dir.destroy(frames);
    }

    /// Log the VMA list and the table walk for `va`.
    pub fn dump<M: PhysMapper>(&self, m: &M, va: VirtualAddress, level: log::Level) {
        log::log!(level, "address space {}:", self.dir.root());
        self.vmas.dump(level);
        self.dir.dump_walk(m, va, level);
    }

    fn vmas_in(&self, range: core::ops::Range<usize>) -> impl Iterator<Item = &Vma> {
        range.filter_map(|i| self.vmas.get(i))
    }

    /// Install `vma` as a direct mapping of device memory at `paddr`.
    ///
    /// # Errors
    /// - [`VmError::Overlap`] if the range is taken.
    /// - [`VmError::InvalidArgument`] outside user space or for unaligned `paddr`.
    /// - [`VmError::Map`] if a table cannot be allocated; nothing stays mapped.
    pub fn map_io<M: PhysMapper, T: Tlb>(
        &mut self,
        mut vma: Vma,
        paddr: PhysicalAddress,
        frames: &mut FrameAllocator<M>,
        tlb: &T,
    ) -> Result<(), VmError> {
        Self::check_user_range(vma.start(), vma.len())?;
        if !self.vmas.is_free(vma.start(), vma.end()) {
            return Err(VmError::Overlap);
        }
        if let Err(e) = vma.io_apply(&self.dir, frames, tlb, paddr) {
            vma.unmap_range(&self.dir, frames, tlb, vma.start(), vma.end());
            return Err(e);
        }
        self.vmas.insert(vma)
    }
}
