//! # Page-Table Manager
//!
//! Builds and mutates the hardware translation structures for both supported
//! widths through a single implementation parameterized by [`Paging`]:
//!
//! - [`X86`]: two levels of 1024 × 32-bit entries (page directory, page table),
//! - [`X86_64`]: four levels of 512 × 64-bit entries (PML4, PDPT, PD, PT).
//!
//! ## What you get
//! - [`PageEntryBits`], the unified entry bitfield with the exact hardware
//!   layout, plus [`CachePolicy`] for MMIO mappings.
//! - [`PageDirectory`], a handle to one translation root with the per-level
//!   primitives (`level_offset`, `level_alloc`, `entry_set/clear/test`),
//!   directory lifecycle (`create`, `free_range`, `destroy`) and
//!   diagnostics (`dump_walk`).
//! - [`Tlb`], the invalidation interface, with a bare-metal implementation
//!   and a [`RecordingTlb`] for host builds.
//! - The [`PhysMapper`] / [`FrameAlloc`] seams through which tables are
//!   reached and obtained.
//!
//! ## Walk
//!
//! ```text
//!  root (level N-1) ──► ... ──► level 1 ──► level 0 (leaf table) ──► 4 KiB frame
//! ```
//!
//! A 2-level walk is the same loop with two iterations; there are no folded
//! middle levels to special-case.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod bits;
mod directory;
mod paging;
mod table;
mod tlb;

pub use crate::bits::{CachePolicy, PageEntryBits};
pub use crate::directory::{LeafAction, MapError, PageDirectory};
pub use crate::paging::{Paging, X86, X86_64};
pub use crate::table::Table;
#[cfg(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none"))]
pub use crate::tlb::HardwareTlb;
pub use crate::tlb::{RecordingTlb, Tlb};

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space (e.g. via the higher-half direct map).
///
/// Typical patterns:
/// - **Kernel**: adds the direct-map base before returning a pointer.
/// - **Tests**: index into a vector of 4 KiB-aligned host buffers.
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be mapped writable in the current address space.
    /// - The lifetime `'a` is unchecked; the mapping must outlive it.
    /// - `T` must match the bytes at `pa`, and no other live reference may
    ///   alias them.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Kernel virtual address at which `pa` is visible.
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress;
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { (**self).phys_to_mut(pa) }
    }

    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        (**self).phys_to_virt(pa)
    }
}

/// Source of **physical** 4 KiB frames for page tables.
///
/// A frame allocator can always reach the frames it hands out, hence the
/// [`PhysMapper`] supertrait.
pub trait FrameAlloc: PhysMapper {
    /// Allocate one zero-filled, page-aligned frame. `None` on out-of-memory.
    fn alloc_4k(&mut self) -> Option<PhysicalAddress>;

    /// Return a frame previously obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, pa: PhysicalAddress);
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        (**self).alloc_4k()
    }

    #[inline]
    fn free_4k(&mut self, pa: PhysicalAddress) {
        (**self).free_4k(pa);
    }
}

impl<A: FrameAlloc + ?Sized> PhysMapper for &mut A {
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { (**self).phys_to_mut(pa) }
    }

    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        (**self).phys_to_virt(pa)
    }
}
