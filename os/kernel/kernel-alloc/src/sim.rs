//! Simulated physical memory for host-side tests.
//!
//! Physical address `pa` is byte `pa` of a vector of 4 KiB-aligned host
//! frames. Frame 0 is reported as reserved so that a zero physical address
//! never names a usable frame.

use alloc::vec::Vec;
use core::cell::UnsafeCell;
use kernel_info::memmap::{MemoryRegion, RegionKind};
use kernel_memory_addresses::{PAGE_MASK, PAGE_SHIFT, PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

#[repr(C, align(4096))]
struct SimFrame([u8; 4096]);

pub struct SimRam {
    frames: Vec<UnsafeCell<SimFrame>>,
}

impl SimRam {
    #[must_use]
    pub fn new(frames: usize) -> Self {
        Self {
            frames: (0..frames)
                .map(|_| UnsafeCell::new(SimFrame([0; 4096])))
                .collect(),
        }
    }

    /// Bytes of simulated RAM.
    #[must_use]
    pub fn len(&self) -> u64 {
        (self.frames.len() as u64) << PAGE_SHIFT
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// A memory map describing this RAM: frame 0 reserved, the rest usable.
    #[must_use]
    pub fn regions(&self) -> Vec<MemoryRegion> {
        let mut regions = Vec::from([MemoryRegion::new(0, 0x1000, RegionKind::Reserved)]);
        if self.len() > 0x1000 {
            regions.push(MemoryRegion::new(0x1000, self.len(), RegionKind::Ram));
        }
        regions
    }

    #[allow(clippy::cast_possible_truncation)]
    fn host_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let n = (pa.as_u64() >> PAGE_SHIFT) as usize;
        let off = (pa.as_u64() & PAGE_MASK) as usize;
        assert!(n < self.frames.len(), "{pa} is outside simulated RAM");
        // SAFETY: `n` is in bounds and `off` stays inside the 4 KiB frame.
        unsafe { self.frames[n].get().cast::<u8>().add(off) }
    }
}

impl PhysMapper for SimRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // SAFETY: the caller guarantees `T` fits at `pa` and is not aliased.
        unsafe { &mut *self.host_ptr(pa).cast::<T>() }
    }

    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.host_ptr(pa).addr() as u64)
    }
}
