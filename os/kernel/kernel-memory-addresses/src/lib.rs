//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses and 4 KiB page bases used
//! by the frame allocator, the page-table manager and the VMA code.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] / [`PhysicalPage`] | Physical RAM or device memory. |
//! | [`VirtualAddress`] / [`VirtualPage`] | Page-table translated memory. |
//! | [`VirtualRange`] | A half-open `[start, end)` range of virtual memory. |
//!
//! Both address kinds are `u64` wrappers regardless of the paging width: a
//! 2-level (32-bit) translation scheme simply never produces values above
//! `u32::MAX`. Only 4 KiB pages exist; huge pages are not supported.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0804_8123);
//! let (page, off) = va.split();
//! assert_eq!(page.base().as_u64(), 0x0804_8000);
//! assert_eq!(off, 0x123);
//! assert_eq!(page.base() + off, va);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod page;
mod physical_address;
mod range;
mod virtual_address;

pub use page::{PhysicalPage, VirtualPage};
pub use physical_address::PhysicalAddress;
pub use range::VirtualRange;
pub use virtual_address::VirtualAddress;

/// Size of a page (and of a physical frame) in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`, i.e. the number of in-page offset bits.
pub const PAGE_SHIFT: u32 = 12;

/// Mask selecting the in-page offset bits.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

const _: () = assert!(1 << PAGE_SHIFT == PAGE_SIZE);

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// assert_eq!(align_down(0x12345, 16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two, and `x + a - 1` must not overflow.
/// Use [`checked_align_up`] when `x` comes from an untrusted caller.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// assert_eq!(align_up(4097, 4096), 8192);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Like [`align_up`], but returns `None` instead of overflowing.
#[inline]
#[must_use]
pub const fn checked_align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Number of pages needed to hold `bytes` bytes.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}
