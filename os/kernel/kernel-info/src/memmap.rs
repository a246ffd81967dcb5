//! # Normalized Physical Memory Map
//!
//! Whatever the firmware reported (multiboot, UEFI, E820) is reduced by the
//! boot layer to a list of [`MemoryRegion`]s plus the kernel image extent.

use core::fmt;
use core::ops::Range;
use kernel_memory_addresses::PhysicalAddress;

/// What a physical range may be used for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionKind {
    /// Usable RAM.
    Ram,
    /// Firmware, ACPI tables, device memory: never handed out.
    Reserved,
    /// Legacy low memory (below 1 MiB); RAM, but kept for real-mode
    /// trampolines and BIOS structures.
    Low,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ram => "AVL",
            Self::Reserved => "DEV",
            Self::Low => "N/A",
        })
    }
}

/// One half-open physical range `[start, end)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
    pub kind: RegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(start: u64, end: u64, kind: RegionKind) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            end: PhysicalAddress::new(end),
            kind,
        }
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64().saturating_sub(self.start.as_u64())
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {} {}", self.start, self.end, self.kind)
    }
}

/// Physical extent of the loaded kernel image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KernelSections {
    /// Whole image (text, data, bss). Stays allocated forever.
    pub image: Range<u64>,
    /// Init-only part inside `image`, reclaimable once boot completes.
    pub init: Range<u64>,
}

/// Everything the frame allocator needs from the boot layer.
#[derive(Clone, Debug)]
pub struct MemoryMap<'a> {
    pub regions: &'a [MemoryRegion],
    pub kernel: KernelSections,
}

impl MemoryMap<'_> {
    /// One past the highest RAM byte, or zero if there is no RAM at all.
    #[must_use]
    pub fn highest_ram_address(&self) -> PhysicalAddress {
        self.regions
            .iter()
            .filter(|r| r.kind == RegionKind::Ram)
            .map(|r| r.end)
            .max()
            .unwrap_or_default()
    }

    /// One past the highest byte of any region.
    #[must_use]
    pub fn highest_address(&self) -> PhysicalAddress {
        self.regions.iter().map(|r| r.end).max().unwrap_or_default()
    }

    /// Kind of the region containing `pa`; holes count as reserved.
    ///
    /// When regions overlap, the most restrictive kind wins.
    #[must_use]
    pub fn kind_of(&self, pa: PhysicalAddress) -> RegionKind {
        let mut kind = None;
        for r in self.regions.iter().filter(|r| r.start <= pa && pa < r.end) {
            kind = match (kind, r.kind) {
                (_, RegionKind::Reserved) | (Some(RegionKind::Reserved), _) => {
                    Some(RegionKind::Reserved)
                }
                (_, RegionKind::Low) | (Some(RegionKind::Low), _) => Some(RegionKind::Low),
                _ => Some(RegionKind::Ram),
            };
        }
        kind.unwrap_or(RegionKind::Reserved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(regions: &[MemoryRegion]) -> MemoryMap<'_> {
        MemoryMap {
            regions,
            kernel: KernelSections {
                image: 0x10_0000..0x20_0000,
                init: 0x1f_0000..0x20_0000,
            },
        }
    }

    #[test]
    fn holes_are_reserved_and_reserved_wins_overlaps() {
        let regions = [
            MemoryRegion::new(0, 0x9_f000, RegionKind::Low),
            MemoryRegion::new(0x10_0000, 0x100_0000, RegionKind::Ram),
            MemoryRegion::new(0x80_0000, 0x80_1000, RegionKind::Reserved),
        ];
        let m = map(&regions);
        assert_eq!(m.kind_of(PhysicalAddress::new(0xA_0000)), RegionKind::Reserved);
        assert_eq!(m.kind_of(PhysicalAddress::new(0x1000)), RegionKind::Low);
        assert_eq!(m.kind_of(PhysicalAddress::new(0x20_0000)), RegionKind::Ram);
        assert_eq!(m.kind_of(PhysicalAddress::new(0x80_0000)), RegionKind::Reserved);
        assert_eq!(m.highest_ram_address().as_u64(), 0x100_0000);
    }

    #[test]
    fn display_uses_short_kind_tags() {
        let r = MemoryRegion::new(0x1000, 0x2000, RegionKind::Reserved);
        assert_eq!(r.to_string(), "0x00001000 - 0x00002000 DEV");
    }
}
