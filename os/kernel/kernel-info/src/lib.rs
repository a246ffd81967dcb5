//! # Kernel Memory Layout and Boot Memory Map
//!
//! Compile-time configuration shared by every part of the memory subsystem,
//! plus the normalized physical memory map handed over by the platform layer.
//!
//! ## Virtual Memory Layout
//!
//! The kernel supports two translation widths and keeps one layout per width
//! in [`memory`]:
//!
//! ```text
//! 32-bit, 2 levels (memory::i386)        64-bit, 4 levels (memory::amd64)
//!
//! 0x0000_0000 ┌──────────────────┐        0x0000_0000_0000_0000 ┌──────────────────┐
//!             │ User space       │                              │ User space       │
//!             │   ... heap ...   │                              │   ... heap ...   │
//!             │ User stack       │                              │ User stack       │
//! 0xC000_0000 ├──────────────────┤        0x0000_8000_0000_0000 ├──────────────────┤
//!             │ Direct map       │                              │ (non-canonical)  │
//! 0xFF80_0000 ├──────────────────┤        0xffff_8000_0000_0000 ├──────────────────┤
//!             │ MMIO window      │                              │ Direct map       │
//! 0xFFC0_0000 ├──────────────────┤        0xffff_ffff_7000_0000 ├──────────────────┤
//!             │ (reserved)       │                              │ MMIO window      │
//! 0xFFFF_FFFF └──────────────────┘        0xffff_ffff_8000_0000 ├──────────────────┤
//!                                                               │ Kernel image     │
//!                                                               └──────────────────┘
//! ```
//!
//! Everything at or above the kernel split is shared by all address spaces:
//! its top-level directory entries are copied into every process directory
//! when the directory is created.
//!
//! ## Physical Memory Map
//!
//! [`memmap`] defines what the boot layer must deliver before the frame
//! allocator can run: RAM/reserved/low regions and the physical extent of the
//! kernel image, including its init-only sections.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memmap;
pub mod memory;
