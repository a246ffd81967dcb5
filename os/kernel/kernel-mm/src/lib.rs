//! # Kernel Memory Management
//!
//! Process-level virtual memory on top of the frame allocator
//! (`kernel-alloc`) and the page-table manager (`kernel-vmem`):
//!
//! - [`VmaList`]: the sorted, non-overlapping areas of one address space,
//!   with range unmap, copy-on-write duplication and protection updates.
//! - [`AddressSpace`]: directory + VMAs + kernel stack + program break, with
//!   `mmap`/`munmap`/`mprotect`/`brk`, `fork` and user pointer checks.
//! - [`FaultResolver`]: demand paging, copy-on-write and fatal fault
//!   classification.
//! - [`MmioSpace`]: the kernel's device register window.
//! - [`global`]: the machine-wide singletons and their accessors.
//!
//! ## Copy-on-write
//!
//! ```text
//!  fork                 parent writes            child writes
//!  P ─┐ ro             P ──► F' rw (copy)       P ──► F'
//!     ├─► F (rc 2)         F (rc 1) ◄── ro C    C ──► F rw (last sharer)
//!  C ─┘ ro
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod address_space;
mod error;
pub mod fault;
pub mod global;
pub mod mmio;
pub mod vma;

pub use crate::address_space::{AddressSpace, Brk, CloneFlags, Placement, Segment};
pub use crate::error::VmError;
pub use crate::fault::{
    FatalFault, FaultError, FaultErrorCode, FaultOutcome, FaultResolver, Resolution, Signal,
    TrapFrame, TrapHost,
};
pub use crate::mmio::{MmioError, MmioRegion, MmioSpace};
pub use crate::vma::{Backing, NoPageError, Vma, VmFlags, VmaKind, VmaList, VmaOps};
