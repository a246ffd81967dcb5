//! TLB maintenance.
//!
//! Every mutation of a live directory is followed by one of:
//! - [`Tlb::invalidate_page`] for a single leaf change,
//! - [`Tlb::reload`] after tables were freed or many entries changed.
//!
//! Global translations (the kernel half and MMIO window) survive a reload.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

pub trait Tlb {
    /// Drop the cached translation for the page holding `va` on this CPU.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Drop every non-global translation on this CPU.
    fn reload(&self);

    /// Switch this CPU to the directory rooted at `root`.
    ///
    /// # Safety
    /// `root` must be a complete directory mapping the running kernel.
    unsafe fn activate(&self, root: PhysicalAddress);
}

impl<T: Tlb + ?Sized> Tlb for &T {
    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        (**self).invalidate_page(va);
    }

    #[inline]
    fn reload(&self) {
        (**self).reload();
    }

    #[inline]
    unsafe fn activate(&self, root: PhysicalAddress) {
        unsafe { (**self).activate(root) }
    }
}

/// `invlpg` and CR3 based maintenance for the running CPU.
#[cfg(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none"))]
#[derive(Debug, Default, Copy, Clone)]
pub struct HardwareTlb;

#[cfg(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none"))]
#[allow(clippy::cast_possible_truncation)]
impl Tlb for HardwareTlb {
    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        let va = va.as_u64() as usize;
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
        }
    }

    #[inline]
    fn reload(&self) {
        unsafe {
            let cr3: usize;
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }

    #[inline]
    unsafe fn activate(&self, root: PhysicalAddress) {
        let cr3 = root.as_u64() as usize;
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

/// Host-side [`Tlb`] that only counts what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingTlb {
    invalidations: AtomicUsize,
    reloads: AtomicUsize,
    last_page: AtomicU64,
    active_root: AtomicU64,
}

impl RecordingTlb {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            invalidations: AtomicUsize::new(0),
            reloads: AtomicUsize::new(0),
            last_page: AtomicU64::new(0),
            active_root: AtomicU64::new(0),
        }
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::Relaxed)
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::Relaxed)
    }

    /// Page of the most recent single-page invalidation.
    pub fn last_page(&self) -> VirtualAddress {
        VirtualAddress::new(self.last_page.load(Ordering::Relaxed))
    }

    pub fn active_root(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.active_root.load(Ordering::Relaxed))
    }

    /// Reset both counters.
    pub fn clear(&self) {
        self.invalidations.store(0, Ordering::Relaxed);
        self.reloads.store(0, Ordering::Relaxed);
    }
}

impl Tlb for RecordingTlb {
    fn invalidate_page(&self, va: VirtualAddress) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        self.last_page
            .store(va.page().base().as_u64(), Ordering::Relaxed);
    }

    fn reload(&self) {
        self.reloads.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn activate(&self, root: PhysicalAddress) {
        self.active_root.store(root.as_u64(), Ordering::Relaxed);
        self.reload();
    }
}
