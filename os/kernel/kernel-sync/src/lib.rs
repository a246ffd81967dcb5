//! # Kernel synchronization primitives
//!
//! The memory subsystem shares exactly two structures across CPUs: the frame
//! table and the MMIO region list. Both live in a [`SpinMutex`] inside a
//! [`SyncOnceCell`] and are only ever locked through [`Mutex::lock_irq`],
//! which disables interrupts *before* taking the spin lock. Holding the
//! resulting [`IrqMutex`] therefore encodes the lock order
//! (interrupts off outside, allocator lock inside) in the type.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
mod once;

pub use irq::{IrqGuard, IrqMutex, interrupts_enabled};
pub use mutex::{Mutex, MutexGuard, RawSpin};
pub use once::SyncOnceCell;

/// Spin-lock protected mutex.
pub type SpinMutex<T> = Mutex<T, RawSpin>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

/// Acquire half of a raw lock.
pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

/// Release half of a raw lock.
pub trait RawUnlock {
    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn raw_unlock(&self);
}
