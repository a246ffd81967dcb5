//! Interrupt masking.
//!
//! On bare-metal x86 builds the guards execute `cli`/`sti` and read the `IF`
//! bit from the flags register. Everywhere else (host builds, unit tests) a
//! process-global simulated flag stands in for `IF`, so code that relies on
//! "interrupts are off here" can still be exercised and asserted on.

use crate::{Mutex, MutexGuard, RawLock, RawUnlock};
use core::ops::{Deref, DerefMut};

/// A mutex guard that also disables interrupts while held.
///
/// Created by [`Mutex::lock_irq`]: interrupts are disabled first, then the
/// lock is acquired; drop releases in reverse order. Because the only way to
/// obtain an `IrqMutex` is through `lock_irq`, every holder has interrupts
/// masked *around* the lock and never the other way round.
///
/// # Examples
///
/// ```
/// use kernel_sync::{SpinMutex, interrupts_enabled};
///
/// static M: SpinMutex<u64> = SpinMutex::new(0);
///
/// {
///     let mut g = M.lock_irq();
///     *g += 1;
///     assert!(!interrupts_enabled());
/// }
/// assert_eq!(*M.lock(), 1);
/// ```
pub struct IrqMutex<'a, T, R: RawLock + RawUnlock> {
    // Field order matters: the mutex guard drops before the interrupt guard.
    guard: MutexGuard<'a, T, R>,
    _irq: IrqGuard,
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Acquires the mutex with interrupts disabled for the guard's lifetime.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutex<'_, T, R> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqMutex { guard, _irq: irq }
    }
}

impl<T, R: RawLock + RawUnlock> Deref for IrqMutex<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, R: RawLock + RawUnlock> DerefMut for IrqMutex<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Nesting is fine: an inner guard sees interrupts already disabled and
/// leaves them disabled when it goes away.
pub struct IrqGuard {
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            were_enabled: arch::disable(),
        }
    }

    /// Whether interrupts were enabled when this guard was created.
    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            arch::enable();
        }
    }
}

/// Current state of the interrupt flag.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    arch::enabled()
}

#[cfg(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none"))]
mod arch {
    const IF: usize = 1 << 9;

    #[inline]
    fn flags() -> usize {
        let r: usize;
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) r, options(nomem, preserves_flags));
        }
        #[cfg(target_arch = "x86")]
        unsafe {
            core::arch::asm!("pushfd; pop {}", out(reg) r, options(nomem, preserves_flags));
        }
        r
    }

    #[inline]
    pub fn enabled() -> bool {
        flags() & IF != 0
    }

    /// Disables interrupts, returning whether they were enabled.
    #[inline]
    pub fn disable() -> bool {
        let was = enabled();
        if was {
            unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
        }
        was
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(not(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none")))]
mod arch {
    use core::sync::atomic::{AtomicBool, Ordering};

    static SIMULATED_IF: AtomicBool = AtomicBool::new(true);

    #[inline]
    pub fn enabled() -> bool {
        SIMULATED_IF.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn disable() -> bool {
        SIMULATED_IF.swap(false, Ordering::SeqCst)
    }

    #[inline]
    pub fn enable() {
        SIMULATED_IF.store(true, Ordering::SeqCst);
    }
}
