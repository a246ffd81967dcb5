//! # MMIO Region Allocator
//!
//! Hands out kernel virtual ranges for device registers and framebuffers
//! from the fixed window `[P::MMIO_START, P::MMIO_END)`, highest first.
//!
//! The window's tables are allocated once by [`MmioSpace::init`] in the
//! kernel directory, before any process directory copies the kernel half,
//! so a region mapped later is visible in every address space without
//! touching them. Leaves are global, supervisor-only and never executable.

use alloc::vec::Vec;
use core::fmt;
use core::marker::PhantomData;
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down, checked_align_up,
};
use kernel_vmem::{CachePolicy, FrameAlloc, MapError, PageDirectory, PageEntryBits, Paging, PhysMapper, Tlb};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MmioError {
    #[error("zero-length mmio mapping")]
    ZeroLength,
    #[error("physical range is not mappable")]
    InvalidRange,
    #[error("mmio window has no room for {0:#x} bytes")]
    WindowExhausted(u64),
    #[error("no mmio region at {0}")]
    NotMapped(VirtualAddress),
    #[error(transparent)]
    Map(#[from] MapError),
}

/// One mapped device range. `phys`, `virt` and `len` are page granular.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MmioRegion {
    pub phys: PhysicalAddress,
    pub virt: VirtualAddress,
    pub len: u64,
    pub name: &'static str,
    pub cache: CachePolicy,
}

impl MmioRegion {
    #[must_use]
    pub fn end(&self) -> VirtualAddress {
        self.virt + self.len
    }

    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.virt <= va && va < self.end()
    }
}

impl fmt::Display for MmioRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} -> {} {:?} {}",
            self.virt,
            self.end(),
            self.phys,
            self.cache,
            self.name
        )
    }
}

/// The regions currently mapped in the MMIO window, sorted by address.
#[derive(Debug)]
pub struct MmioSpace<P: Paging> {
    regions: Vec<MmioRegion>,
    _p: PhantomData<P>,
}

impl<P: Paging> MmioSpace<P> {
    /// Allocate the window's tables in `dir` (the kernel directory).
    ///
    /// # Errors
    /// [`MmioError::Map`] if the tables cannot be allocated.
    pub fn init<A: FrameAlloc>(dir: &PageDirectory<P>, alloc: &mut A) -> Result<Self, MmioError> {
        let start = VirtualAddress::new(P::MMIO_START);
        let end = VirtualAddress::new(P::MMIO_END);
        dir.preallocate(alloc, start, end)?;
        log::info!("{}: mmio window {start}-{end}", P::NAME);
        Ok(Self {
            regions: Vec::new(),
            _p: PhantomData,
        })
    }

    /// Map `len` bytes of device memory at `paddr`.
    ///
    /// Returns the virtual address corresponding to `paddr` itself, i.e. the
    /// region base plus `paddr`'s offset within its page.
    ///
    /// # Errors
    /// - [`MmioError::ZeroLength`] for `len == 0`.
    /// - [`MmioError::InvalidRange`] if the range overflows or is beyond reach.
    /// - [`MmioError::WindowExhausted`] if no gap is large enough.
    /// - [`MmioError::Map`] if a table is missing and cannot be allocated.
    #[allow(clippy::too_many_arguments)]
    pub fn map<A: FrameAlloc, T: Tlb>(
        &mut self,
        dir: &PageDirectory<P>,
        alloc: &mut A,
        tlb: &T,
        paddr: PhysicalAddress,
        len: u64,
        cache: CachePolicy,
        name: &'static str,
    ) -> Result<VirtualAddress, MmioError> {
        if len == 0 {
            return Err(MmioError::ZeroLength);
        }
        let base = PhysicalAddress::new(align_down(paddr.as_u64(), PAGE_SIZE));
        let size = paddr
            .offset()
            .checked_add(len)
            .and_then(|l| checked_align_up(l, PAGE_SIZE))
            .ok_or(MmioError::InvalidRange)?;
        if base
            .as_u64()
            .checked_add(size)
            .is_none_or(|end| end > P::MAX_PHYS)
        {
            return Err(MmioError::InvalidRange);
        }

        let virt = self.find_gap(size)?;
        let bits = PageEntryBits::new()
            .with_present(true)
            .with_writable(true)
            .with_global_translation(true)
            .with_no_execute(true)
            .with_cache(cache);

        let mut offset = 0;
        while offset < size {
            if let Err(e) = dir.entry_set(alloc, virt + offset, base + offset, bits) {
                Self::clear(dir, &*alloc, tlb, virt, offset);
                return Err(e.into());
            }
            tlb.invalidate_page(virt + offset);
            offset += PAGE_SIZE;
        }

        let region = MmioRegion {
            phys: base,
            virt,
            len: size,
            name,
            cache,
        };
        log::debug!("mmio map {region}");
        let pos = self.regions.partition_point(|r| r.virt < virt);
        self.regions.insert(pos, region);
        Ok(virt + paddr.offset())
    }

    /// Unmap the region containing `vaddr` and return it.
    ///
    /// # Errors
    /// [`MmioError::NotMapped`] if no region contains `vaddr`.
    pub fn unmap<M: PhysMapper, T: Tlb>(
        &mut self,
        dir: &PageDirectory<P>,
        m: &M,
        tlb: &T,
        vaddr: VirtualAddress,
    ) -> Result<MmioRegion, MmioError> {
        let i = self
            .regions
            .iter()
            .position(|r| r.contains(vaddr))
            .ok_or(MmioError::NotMapped(vaddr))?;
        let region = self.regions.remove(i);
        Self::clear(dir, m, tlb, region.virt, region.len);
        log::debug!("mmio unmap {region}");
        Ok(region)
    }

    #[must_use]
    pub fn find(&self, vaddr: VirtualAddress) -> Option<&MmioRegion> {
        self.regions.iter().find(|r| r.contains(vaddr))
    }

    pub fn regions(&self) -> impl Iterator<Item = &MmioRegion> {
        self.regions.iter()
    }

    /// Highest free range of `size` bytes in the window.
    fn find_gap(&self, size: u64) -> Result<VirtualAddress, MmioError> {
        let mut top = P::MMIO_END;
        for r in self.regions.iter().rev() {
            let end = r.end().as_u64();
            if end <= top && top - end >= size {
                break;
            }
            top = r.virt.as_u64();
        }
        if top - P::MMIO_START < size {
            return Err(MmioError::WindowExhausted(size));
        }
        Ok(VirtualAddress::new(top - size))
    }

    fn clear<M: PhysMapper, T: Tlb>(dir: &PageDirectory<P>, m: &M, tlb: &T, virt: VirtualAddress, len: u64) {
        let mut offset = 0;
        while offset < len {
            dir.entry_clear(m, virt + offset);
            tlb.invalidate_page(virt + offset);
            offset += PAGE_SIZE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_alloc::sim::SimRam;
    use kernel_alloc::FrameAllocator;
    use kernel_info::memmap::{KernelSections, MemoryMap};
    use kernel_vmem::{RecordingTlb, X86, X86_64};

    fn window_fills_top_down<P: Paging>() {
        let ram = SimRam::new(64);
        let regions = ram.regions();
        let map = MemoryMap {
            regions: &regions,
            kernel: KernelSections {
                image: 0..0,
                init: 0..0,
            },
        };
        let mut frames = FrameAllocator::new::<P>(&map, ram);
        let dir = PageDirectory::<P>::new_kernel(&mut frames).unwrap();
        let mut mmio = MmioSpace::<P>::init(&dir, &mut frames).unwrap();
        let tlb = RecordingTlb::new();

        let a = mmio
            .map(&dir, &mut frames, &tlb, PhysicalAddress::new(0x1000), 0x2000, CachePolicy::Uncached, "a")
            .unwrap();
        let b = mmio
            .map(&dir, &mut frames, &tlb, PhysicalAddress::new(0x5000), 0x1000, CachePolicy::Uncached, "b")
            .unwrap();
        assert_eq!(a.as_u64(), P::MMIO_END - 0x2000);
        assert_eq!(b.as_u64(), P::MMIO_END - 0x3000);

        // A hole left by `a` is reused for a request that fits.
        mmio.unmap(&dir, &frames, &tlb, a).unwrap();
        let c = mmio
            .map(&dir, &mut frames, &tlb, PhysicalAddress::new(0x9000), 0x800, CachePolicy::WriteBack, "c")
            .unwrap();
        assert_eq!(c.as_u64(), P::MMIO_END - 0x1000);

        let window = P::MMIO_END - P::MMIO_START;
        assert_eq!(
            mmio.map(&dir, &mut frames, &tlb, PhysicalAddress::new(0), window, CachePolicy::Uncached, "big"),
            Err(MmioError::WindowExhausted(window))
        );
        assert_eq!(
            mmio.map(&dir, &mut frames, &tlb, PhysicalAddress::new(0), 0, CachePolicy::Uncached, "zero"),
            Err(MmioError::ZeroLength)
        );
    }

    #[test]
    fn x86_window_fills_top_down() {
        window_fills_top_down::<X86>();
    }

    #[test]
    fn x86_64_window_fills_top_down() {
        window_fills_top_down::<X86_64>();
    }

    #[test]
    fn leaves_are_global_supervisor_and_uncached() {
        let ram = SimRam::new(32);
        let regions = ram.regions();
        let map = MemoryMap {
            regions: &regions,
            kernel: KernelSections {
                image: 0..0,
                init: 0..0,
            },
        };
        let mut frames = FrameAllocator::new::<X86_64>(&map, ram);
        let dir = PageDirectory::<X86_64>::new_kernel(&mut frames).unwrap();
        let mut mmio = MmioSpace::<X86_64>::init(&dir, &mut frames).unwrap();
        let tlb = RecordingTlb::new();

        let va = mmio
            .map(
                &dir,
                &mut frames,
                &tlb,
                PhysicalAddress::new(0xFEE0_0020),
                4,
                CachePolicy::Uncached,
                "lapic",
            )
            .unwrap();
        assert_eq!(va.offset(), 0x20);
        let e = dir.entry_test(&frames, va).unwrap();
        assert!(e.global_translation() && e.writable() && e.no_execute());
        assert!(!e.user_access());
        assert!(e.cache_disabled() && e.write_through());
        assert_eq!(e.physical_address(), PhysicalAddress::new(0xFEE0_0000));
        assert_eq!(mmio.find(va).map(|r| r.name), Some("lapic"));
        assert_eq!(tlb.last_page(), va.page().base());
    }
}
