use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// One translation entry at any level, in the 64-bit layout.
///
/// This is the **superset** of the fields found in PDEs/PTEs of both the
/// 2-level (32-bit) and the 4-level (64-bit) schemes. Each
/// [`Paging`](crate::Paging) scheme converts it to and from its raw hardware
/// width; the 32-bit encoding keeps bits 0..=31 and drops `no_execute`.
///
/// ### Bit layout
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (leaf only) |
/// | 7         | `PS` / `PAT`      | Large page (unused here), PAT in a PTE |
/// | 8         | `G`               | Global (leaf only) |
/// | 9–11      | OS avail low      | Reserved for OS use |
/// | 12–51     | `addr`            | Physical frame bits [51:12] |
/// | 52–58     | OS avail high     | Reserved for OS use |
/// | 59–62     | `PKU` / OS use    | Protection key or OS use |
/// | 63        | `NX`              | Execute disable (64-bit only) |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::new()
///     .with_present(true)
///     .with_writable(true)
///     .with_physical_address(PhysicalAddress::new(0x12_3000));
/// assert!(e.present());
/// assert_eq!(e.physical_address().as_u64(), 0x12_3000);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Effective write permission is the AND over the whole walk, so
    /// intermediate tables are always created writable and the leaf decides.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6), leaf only. Set by the CPU on first write.
    pub dirty: bool,

    /// Page Size (PS, bit 7) in directory entries; PAT selector in a PTE.
    ///
    /// Huge pages are not used, so this is only ever set on leaves as `PAT`.
    pub pat_or_large: bool,

    /// Global (G, bit 8), leaf only. Survives a root reload.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available_low: u8,

    /// Physical address bits [51:12] (bits 12..=51).
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection Key (bits 59..=62) if supported; otherwise OS use.
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

/// Caching behaviour of a mapping, expressed through `PCD`/`PWT`/`PAT`.
///
/// Assumes the PAT MSR keeps its power-on layout except for slot 1, which
/// the kernel programs as write-combining at boot:
///
/// | PAT | PCD | PWT | slot | type |
/// |-----|-----|-----|------|------|
/// |  0  |  0  |  0  |  0   | WB   |
/// |  0  |  0  |  1  |  1   | WC   |
/// |  0  |  1  |  1  |  3   | UC   |
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CachePolicy {
    /// Strong uncached; device registers.
    Uncached,
    /// Write-combining; framebuffers.
    WriteCombining,
    /// Normal cached memory.
    WriteBack,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(mut self, phys: PhysicalAddress) -> Self {
        self.set_physical_address(phys);
        self
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// Same entry with every permission and cache bit replaced by `prot`'s.
    ///
    /// Keeps the target address and the CPU-maintained accessed/dirty bits.
    #[inline]
    #[must_use]
    pub const fn with_protection(self, prot: Self) -> Self {
        prot.with_physical_address(self.physical_address())
            .with_accessed(self.accessed())
            .with_dirty(self.dirty())
    }

    /// Entry linking to a next-level table.
    ///
    /// Tables are always writable; user tables additionally carry `US` so
    /// that the leaf alone decides what user code may do.
    #[inline]
    #[must_use]
    pub const fn table(phys: PhysicalAddress, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
            .with_physical_address(phys)
    }

    #[inline]
    #[must_use]
    pub const fn with_cache(self, policy: CachePolicy) -> Self {
        match policy {
            CachePolicy::Uncached => self.with_cache_disabled(true).with_write_through(true),
            CachePolicy::WriteCombining => self
                .with_cache_disabled(false)
                .with_write_through(true)
                .with_pat_or_large(false),
            CachePolicy::WriteBack => self
                .with_cache_disabled(false)
                .with_write_through(false)
                .with_pat_or_large(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_protection_keeps_target_and_dirty() {
        let old = PageEntryBits::new()
            .with_present(true)
            .with_writable(true)
            .with_dirty(true)
            .with_physical_address(PhysicalAddress::new(0x5000));
        let ro = PageEntryBits::new().with_present(true).with_user_access(true);
        let e = old.with_protection(ro);
        assert!(!e.writable());
        assert!(e.user_access());
        assert!(e.dirty());
        assert_eq!(e.physical_address().as_u64(), 0x5000);
    }

    #[test]
    fn uncached_sets_pcd_and_pwt() {
        let e = PageEntryBits::new().with_cache(CachePolicy::Uncached);
        assert!(e.cache_disabled());
        assert!(e.write_through());
        let e = e.with_cache(CachePolicy::WriteBack);
        assert!(!e.cache_disabled());
        assert!(!e.write_through());
    }
}
