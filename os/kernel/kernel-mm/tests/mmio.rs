mod common;

use common::Machine;
use kernel_memory_addresses::PhysicalAddress;
use kernel_mm::MmioError;
use kernel_vmem::{CachePolicy, Paging, X86, X86_64};

fn vga_and_lapic_regions_are_disjoint<P: Paging>() {
    let mut m = Machine::<P>::new(64);
    let used = m.used();

    let vga = m
        .mmio
        .map(&m.kernel, &mut m.frames, &m.tlb, PhysicalAddress::new(0xB8000), 0x1000, CachePolicy::WriteCombining, "vga")
        .unwrap();
    let lapic = m
        .mmio
        .map(&m.kernel, &mut m.frames, &m.tlb, PhysicalAddress::new(0xFEE0_0000), 0x1000, CachePolicy::Uncached, "lapic")
        .unwrap();
    assert!(vga.as_u64() >= P::MMIO_START && vga.as_u64() < P::MMIO_END);
    assert!(lapic.as_u64() >= P::MMIO_START && lapic.as_u64() < P::MMIO_END);
    assert!(lapic + 0x1000 <= vga || vga + 0x1000 <= lapic);
    // The window's tables exist already.
    assert_eq!(m.used(), used);

    assert_eq!(
        m.kernel.translate(&m.frames, vga + 0x10),
        Some(PhysicalAddress::new(0xB8010))
    );
    let wc = m.kernel.entry_test(&m.frames, vga).unwrap();
    assert!(wc.write_through() && !wc.cache_disabled());

    // Process directories see the same window.
    let space = m.space();
    assert_eq!(
        space.directory().translate(&m.frames, lapic),
        Some(PhysicalAddress::new(0xFEE0_0000))
    );

    let removed = m.mmio.unmap(&m.kernel, &m.frames, &m.tlb, vga + 0x800).unwrap();
    assert_eq!(removed.name, "vga");
    assert!(m.kernel.translate(&m.frames, vga).is_none());
    assert_eq!(
        m.kernel.translate(&m.frames, lapic),
        Some(PhysicalAddress::new(0xFEE0_0000))
    );
    assert_eq!(m.mmio.regions().count(), 1);
    assert_eq!(
        m.mmio.unmap(&m.kernel, &m.frames, &m.tlb, vga),
        Err(MmioError::NotMapped(vga))
    );

    space.destroy(&mut m.frames, &m.tlb);
}

#[test]
fn x86_vga_and_lapic_regions_are_disjoint() {
    vga_and_lapic_regions_are_disjoint::<X86>();
}

#[test]
fn x86_64_vga_and_lapic_regions_are_disjoint() {
    vga_and_lapic_regions_are_disjoint::<X86_64>();
}

#[test]
fn unaligned_request_keeps_the_page_offset() {
    let mut m = Machine::<X86>::new(32);
    let va = m
        .mmio
        .map(&m.kernel, &mut m.frames, &m.tlb, PhysicalAddress::new(0xFEC0_0ff0), 0x20, CachePolicy::Uncached, "ioapic")
        .unwrap();
    assert_eq!(va.offset(), 0xff0);
    let region = m.mmio.find(va).unwrap();
    assert_eq!(region.len, 0x2000);
    assert_eq!(region.phys, PhysicalAddress::new(0xFEC0_0000));
    assert_eq!(
        m.kernel.translate(&m.frames, va + 0x10),
        Some(PhysicalAddress::new(0xFEC0_1000))
    );
}

#[test]
fn physical_range_beyond_reach_is_rejected() {
    let mut m = Machine::<X86>::new(32);
    let err = m
        .mmio
        .map(&m.kernel, &mut m.frames, &m.tlb, PhysicalAddress::new(0xFFFF_F000), 0x2000, CachePolicy::Uncached, "wrap")
        .unwrap_err();
    assert_eq!(err, MmioError::InvalidRange);
}
