//! # Direct-map `PhysMapper`
//!
//! With a higher-half direct map every physical address `pa` is visible to
//! the kernel at `DIRECT_MAP_BASE + pa`, so converting between the two is a
//! single addition.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{Paging, PhysMapper};

/// [`PhysMapper`] for kernels running with a direct map at `base`.
///
/// # Safety
/// The direct map must be installed and cover every frame handed to
/// [`phys_to_mut`](PhysMapper::phys_to_mut).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    base: u64,
}

impl HhdmPhysMapper {
    #[must_use]
    pub const fn new(base: u64) -> Self {
        Self { base }
    }

    /// The direct map of paging scheme `P`.
    #[must_use]
    pub const fn for_paging<P: Paging>() -> Self {
        Self::new(P::DIRECT_MAP_BASE)
    }
}

impl PhysMapper for HhdmPhysMapper {
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = (self.base + pa.as_u64()) as usize as *mut T;
        // SAFETY: the direct map covers every reachable frame; aliasing is
        // the caller's obligation.
        unsafe { &mut *va }
    }

    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.base + pa.as_u64())
    }
}
