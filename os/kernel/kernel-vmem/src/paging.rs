//! # Translation schemes
//!
//! A [`Paging`] implementation describes one hardware translation format:
//! how many levels there are, how many index bits each level consumes, how
//! wide an entry is, and where the kernel's fixed regions live. Everything
//! else in this crate is written once against the trait.
//!
//! Levels are numbered from the leaf upwards: level `0` is the leaf table
//! whose entries map 4 KiB pages, level `LEVELS - 1` is the root directory.
//!
//! ```text
//! X86     (2 levels):              | dir:10 | table:10 | offset:12 |
//! X86_64  (4 levels): | pml4:9 | pdpt:9 | pd:9 | pt:9 | offset:12 |
//! ```

use crate::PageEntryBits;
use core::fmt;
use kernel_info::memory::{amd64, i386};
use kernel_memory_addresses::{PAGE_SHIFT, VirtualAddress};

/// A hardware page-table format plus the kernel layout that goes with it.
pub trait Paging: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Human-readable name used in log output.
    const NAME: &'static str;

    /// Number of translation levels (root included).
    const LEVELS: usize;

    /// Index bits consumed per level.
    const INDEX_BITS: u32;

    /// Entries per table; every table occupies exactly one 4 KiB frame.
    const ENTRIES: usize = 1 << Self::INDEX_BITS;

    /// Highest physical address (exclusive) an entry can reference.
    const MAX_PHYS: u64;

    /// First kernel address; root entries from here on are shared.
    const KERNEL_SPLIT: u64;
    /// End (exclusive) of user space.
    const USER_END: u64;
    /// Where physical memory is mapped linearly.
    const DIRECT_MAP_BASE: u64;
    /// Bytes of physical memory covered by the direct map.
    const DIRECT_MAP_SIZE: u64;
    /// Device register window `[MMIO_START, MMIO_END)`.
    const MMIO_START: u64;
    const MMIO_END: u64;
    /// Initial user stack placement.
    const USER_STACK_TOP: u64;
    const USER_STACK_SIZE: u64;
    /// Lowest address handed out by a hint-less `mmap`.
    const MMAP_FLOOR: u64;

    /// The in-memory representation of one entry.
    type Raw: Copy + Default + Eq + fmt::LowerHex + Send + Sync;

    fn encode(bits: PageEntryBits) -> Self::Raw;
    fn decode(raw: Self::Raw) -> PageEntryBits;

    /// Index of the root level.
    #[inline]
    #[must_use]
    fn root_level() -> usize {
        Self::LEVELS - 1
    }

    /// Bit position where the index for `level` starts.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    fn level_shift(level: usize) -> u32 {
        PAGE_SHIFT + Self::INDEX_BITS * level as u32
    }

    /// Bytes covered by one entry of a table at `level`.
    #[inline]
    #[must_use]
    fn entry_span(level: usize) -> u64 {
        1u64 << Self::level_shift(level)
    }

    /// Index into the table at `level` for `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    fn level_offset(level: usize, va: VirtualAddress) -> usize {
        ((va.as_u64() >> Self::level_shift(level)) as usize) & (Self::ENTRIES - 1)
    }

    /// First root index belonging to the kernel.
    #[inline]
    #[must_use]
    fn kernel_root_index() -> usize {
        Self::level_offset(Self::root_level(), VirtualAddress::new(Self::KERNEL_SPLIT))
    }

    #[inline]
    #[must_use]
    fn is_user_address(va: VirtualAddress) -> bool {
        va.as_u64() < Self::USER_END
    }
}

/// 32-bit two-level paging (no PAE): 1024 × 32-bit entries per table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct X86;

impl Paging for X86 {
    const NAME: &'static str = "x86";
    const LEVELS: usize = 2;
    const INDEX_BITS: u32 = 10;
    const MAX_PHYS: u64 = 1 << 32;

    const KERNEL_SPLIT: u64 = i386::KERNEL_SPLIT;
    const USER_END: u64 = i386::USER_END;
    const DIRECT_MAP_BASE: u64 = i386::DIRECT_MAP_BASE;
    const DIRECT_MAP_SIZE: u64 = i386::DIRECT_MAP_SIZE;
    const MMIO_START: u64 = i386::MMIO_START;
    const MMIO_END: u64 = i386::MMIO_END;
    const USER_STACK_TOP: u64 = i386::USER_STACK_TOP;
    const USER_STACK_SIZE: u64 = i386::USER_STACK_SIZE;
    const MMAP_FLOOR: u64 = i386::MMAP_FLOOR;

    type Raw = u32;

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn encode(bits: PageEntryBits) -> u32 {
        debug_assert!(bits.physical_address().as_u64() < Self::MAX_PHYS);
        // Flags live in bits 0..=11, the frame in 12..=31; NX does not exist.
        (bits.into_bits() & 0xFFFF_FFFF) as u32
    }

    #[inline]
    fn decode(raw: u32) -> PageEntryBits {
        PageEntryBits::from_bits(u64::from(raw))
    }
}

/// 64-bit four-level paging: 512 × 64-bit entries per table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct X86_64;

impl Paging for X86_64 {
    const NAME: &'static str = "x86_64";
    const LEVELS: usize = 4;
    const INDEX_BITS: u32 = 9;
    const MAX_PHYS: u64 = 1 << 52;

    const KERNEL_SPLIT: u64 = amd64::KERNEL_SPLIT;
    const USER_END: u64 = amd64::USER_END;
    const DIRECT_MAP_BASE: u64 = amd64::DIRECT_MAP_BASE;
    const DIRECT_MAP_SIZE: u64 = amd64::DIRECT_MAP_SIZE;
    const MMIO_START: u64 = amd64::MMIO_START;
    const MMIO_END: u64 = amd64::MMIO_END;
    const USER_STACK_TOP: u64 = amd64::USER_STACK_TOP;
    const USER_STACK_SIZE: u64 = amd64::USER_STACK_SIZE;
    const MMAP_FLOOR: u64 = amd64::MMAP_FLOOR;

    type Raw = u64;

    #[inline]
    fn encode(bits: PageEntryBits) -> u64 {
        bits.into_bits()
    }

    #[inline]
    fn decode(raw: u64) -> PageEntryBits {
        PageEntryBits::from_bits(raw)
    }
}

const _: () = {
    assert!(core::mem::size_of::<u32>() << X86::INDEX_BITS == 4096);
    assert!(core::mem::size_of::<u64>() << X86_64::INDEX_BITS == 4096);
};

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn x86_64_indices() {
        let va = VirtualAddress::new(0x0000_7fff_ffff_f000);
        assert_eq!(X86_64::level_offset(3, va), 255);
        assert_eq!(X86_64::level_offset(2, va), 511);
        assert_eq!(X86_64::level_offset(1, va), 511);
        assert_eq!(X86_64::level_offset(0, va), 511);
        assert_eq!(X86_64::kernel_root_index(), 256);
        assert_eq!(X86_64::entry_span(1), 2 * 1024 * 1024);
    }

    #[test]
    fn x86_indices() {
        let va = VirtualAddress::new(0xC040_2000);
        assert_eq!(X86::level_offset(1, va), 769);
        assert_eq!(X86::level_offset(0, va), 2);
        assert_eq!(X86::kernel_root_index(), 768);
        assert_eq!(X86::entry_span(1), 4 * 1024 * 1024);
    }

    #[test]
    fn x86_encoding_drops_nx_and_keeps_flags() {
        let bits = PageEntryBits::new()
            .with_present(true)
            .with_writable(true)
            .with_global_translation(true)
            .with_no_execute(true)
            .with_physical_address(PhysicalAddress::new(0xFEE0_0000));
        let raw = X86::encode(bits);
        assert_eq!(raw, 0xFEE0_0103);
        let back = X86::decode(raw);
        assert!(!back.no_execute());
        assert!(back.global_translation());
        assert_eq!(back.physical_address().as_u64(), 0xFEE0_0000);
    }
}
