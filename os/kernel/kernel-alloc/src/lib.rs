//! # Kernel Physical Memory Allocation
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │           Physical Frame Allocator                  │
//! │    • flat refcounted arena, one record per frame    │
//! │    • intrusive free list + contiguous run scan      │
//! │    • table-frame source for kernel-vmem             │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Physical Mapper                        │
//! │    • HHDM: pa ↦ DIRECT_MAP_BASE + pa                │
//! │    • simulated RAM for host tests (`sim` feature)   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! With the `sim` feature enabled:
//!
//! ```rust,ignore
//! use kernel_alloc::frame_alloc::{AllocFlags, Contiguity, FrameAllocator};
//! use kernel_alloc::sim::SimRam;
//! use kernel_info::memmap::{KernelSections, MemoryMap};
//! use kernel_vmem::X86_64;
//!
//! let ram = SimRam::new(32);
//! let regions = ram.regions();
//! let map = MemoryMap {
//!     regions: &regions,
//!     kernel: KernelSections { image: 0x1000..0x2000, init: 0..0 },
//! };
//! let mut frames = FrameAllocator::new::<X86_64>(&map, ram);
//! let set = frames
//!     .allocate(2, Contiguity::Contiguous, AllocFlags::ZEROED)
//!     .unwrap();
//! frames.free_set(set);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod frame_alloc;
pub mod phys_mapper;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use frame_alloc::{
    AllocFlags, Contiguity, FRAME_BYTES, FrameAllocError, FrameAllocator, FrameId, FrameSet,
    FrameStats,
};
pub use phys_mapper::HhdmPhysMapper;
