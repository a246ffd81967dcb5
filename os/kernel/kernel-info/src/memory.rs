//! # Memory Layout
//!
//! One module per translation width. Values are checked against each other
//! with `const` assertions, so a bad edit fails the build.

/// Size of a kernel stack per process.
pub const KERNEL_STACK_SIZE: u64 = 2 * 4096;

/// Signature written at the lowest word of every kernel stack.
///
/// A kernel stack that overflows clobbers it first; the scheduler checks it
/// on every switch.
pub const STACK_MAGIC: u64 = 0xdead_c0de;

/// 64-bit layout, 4-level translation.
pub mod amd64 {
    /// First address that belongs to the kernel (top-level index 256).
    pub const KERNEL_SPLIT: u64 = 0xffff_8000_0000_0000;

    /// End (exclusive) of the canonical lower half available to user space.
    pub const USER_END: u64 = 0x0000_8000_0000_0000;

    /// A simple Higher Half Direct Map (HHDM) base.
    /// Anything mapped at [`DIRECT_MAP_BASE`] + `pa` lets the kernel
    /// access physical memory via a fixed offset.
    pub const DIRECT_MAP_BASE: u64 = 0xffff_8880_0000_0000;

    /// Physical memory above this size is not direct-mapped.
    pub const DIRECT_MAP_SIZE: u64 = 0x0000_4000_0000_0000; // 64 TiB

    /// Device register window, allocated top-down.
    pub const MMIO_START: u64 = 0xffff_ffff_7000_0000;

    /// End (exclusive) of the device register window.
    pub const MMIO_END: u64 = 0xffff_ffff_7080_0000;

    /// Where the kernel executes, matches the linker script.
    pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

    /// Top (exclusive) of the initial user stack; one guard page below [`USER_END`].
    pub const USER_STACK_TOP: u64 = USER_END - 0x1000;

    /// Reserved size of the user stack VMA.
    pub const USER_STACK_SIZE: u64 = 8 * 1024 * 1024;

    /// Lowest address `mmap` without a hint will hand out.
    pub const MMAP_FLOOR: u64 = 0x0000_0000_4000_0000;

    const _: () = {
        assert!(USER_END <= KERNEL_SPLIT);
        assert!(DIRECT_MAP_BASE >= KERNEL_SPLIT);
        assert!(DIRECT_MAP_BASE + DIRECT_MAP_SIZE <= MMIO_START);
        assert!(MMIO_START < MMIO_END);
        assert!(MMIO_END <= KERNEL_BASE);
        assert!(MMIO_START.is_multiple_of(0x20_0000) && MMIO_END.is_multiple_of(0x20_0000));
        assert!(USER_STACK_SIZE < USER_STACK_TOP - MMAP_FLOOR);
    };
}

/// 32-bit layout, 2-level translation.
pub mod i386 {
    /// First address that belongs to the kernel (directory index 768).
    pub const KERNEL_SPLIT: u64 = 0xC000_0000;

    /// End (exclusive) of user space.
    pub const USER_END: u64 = KERNEL_SPLIT;

    /// Physical memory is mapped linearly at the bottom of kernel space.
    pub const DIRECT_MAP_BASE: u64 = KERNEL_SPLIT;

    /// Physical memory above this size is not direct-mapped.
    pub const DIRECT_MAP_SIZE: u64 = MMIO_START - DIRECT_MAP_BASE;

    /// Device register window, allocated top-down.
    pub const MMIO_START: u64 = 0xFF80_0000;

    /// End (exclusive) of the device register window.
    pub const MMIO_END: u64 = 0xFFC0_0000;

    /// Top (exclusive) of the initial user stack; one guard page below [`USER_END`].
    pub const USER_STACK_TOP: u64 = USER_END - 0x1000;

    /// Reserved size of the user stack VMA.
    pub const USER_STACK_SIZE: u64 = 1024 * 1024;

    /// Lowest address `mmap` without a hint will hand out.
    pub const MMAP_FLOOR: u64 = 0x4000_0000;

    const _: () = {
        assert!(MMIO_END <= 1 << 32);
        assert!(MMIO_START.is_multiple_of(0x40_0000) && MMIO_END.is_multiple_of(0x40_0000));
        assert!(USER_STACK_SIZE < USER_STACK_TOP - MMAP_FLOOR);
    };
}

const _: () = {
    assert!(KERNEL_STACK_SIZE.is_multiple_of(4096));
};
