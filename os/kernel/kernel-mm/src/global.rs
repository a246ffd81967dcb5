//! Kernel-wide memory state.
//!
//! The frame allocator, the kernel directory and the MMIO region list exist
//! once per machine. They are set up by [`init`] and reached only through
//! the accessors below; the two mutable ones are locked with interrupts
//! disabled. When both locks are needed, the MMIO lock is taken first.

use crate::fault::{FaultErrorCode, FaultOutcome, FaultResolver, TrapFrame, TrapHost};
use crate::mmio::{MmioError, MmioSpace};
use crate::{AddressSpace, VmError};
use kernel_alloc::{FrameAllocator, HhdmPhysMapper};
use kernel_info::memmap::MemoryMap;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::{IrqMutex, RawSpin, SpinMutex, SyncOnceCell};
use kernel_vmem::{CachePolicy, PageDirectory};

/// Translation scheme of the running kernel.
#[cfg(target_arch = "x86")]
pub type ActivePaging = kernel_vmem::X86;
/// Translation scheme of the running kernel.
#[cfg(not(target_arch = "x86"))]
pub type ActivePaging = kernel_vmem::X86_64;

#[cfg(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none"))]
pub type KernelTlb = kernel_vmem::HardwareTlb;
#[cfg(not(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none")))]
pub type KernelTlb = kernel_vmem::RecordingTlb;

pub type Frames = FrameAllocator<HhdmPhysMapper>;

#[cfg(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none"))]
static TLB: KernelTlb = kernel_vmem::HardwareTlb;
#[cfg(not(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none")))]
static TLB: KernelTlb = kernel_vmem::RecordingTlb::new();

static FRAMES: SyncOnceCell<SpinMutex<Frames>> = SyncOnceCell::new();
static KERNEL_DIR: SyncOnceCell<PageDirectory<ActivePaging>> = SyncOnceCell::new();
static MMIO: SyncOnceCell<SpinMutex<MmioSpace<ActivePaging>>> = SyncOnceCell::new();

/// Bring up the memory subsystem from the boot memory map.
///
/// `kernel_root` adopts the directory the loader built; without it an empty
/// kernel directory is allocated.
///
/// # Errors
/// - [`VmError::AlreadyInitialized`] on a second call.
/// - Allocation failures while building the kernel directory or MMIO tables.
pub fn init(
    map: &MemoryMap<'_>,
    mapper: HhdmPhysMapper,
    kernel_root: Option<PhysicalAddress>,
) -> Result<(), VmError> {
    if FRAMES.get().is_some() {
        return Err(VmError::AlreadyInitialized);
    }

    let mut frames = FrameAllocator::new::<ActivePaging>(map, mapper);
    let dir = match kernel_root {
        Some(root) => PageDirectory::from_root(root),
        None => PageDirectory::new_kernel(&mut frames)?,
    };
    let mmio = MmioSpace::init(&dir, &mut frames)?;

    FRAMES
        .set(SpinMutex::new(frames))
        .map_err(|_| VmError::AlreadyInitialized)?;
    KERNEL_DIR
        .set(dir)
        .map_err(|_| VmError::AlreadyInitialized)?;
    MMIO.set(SpinMutex::new(mmio))
        .map_err(|_| VmError::AlreadyInitialized)?;
    Ok(())
}

/// Whether [`init`] has completed.
#[must_use]
pub fn is_initialized() -> bool {
    MMIO.get().is_some()
}

/// Lock the frame allocator.
///
/// # Panics
/// Before [`init`].
#[must_use]
pub fn frames() -> IrqMutex<'static, Frames, RawSpin> {
    let Some(frames) = FRAMES.get() else {
        panic!("frame allocator used before memory init");
    };
    frames.lock_irq()
}

/// The kernel's own directory.
///
/// # Panics
/// Before [`init`].
#[must_use]
pub fn kernel_directory() -> &'static PageDirectory<ActivePaging> {
    let Some(dir) = KERNEL_DIR.get() else {
        panic!("kernel directory used before memory init");
    };
    dir
}

#[must_use]
pub fn tlb() -> &'static KernelTlb {
    &TLB
}

fn mmio_space() -> IrqMutex<'static, MmioSpace<ActivePaging>, RawSpin> {
    let Some(mmio) = MMIO.get() else {
        panic!("mmio allocator used before memory init");
    };
    mmio.lock_irq()
}

/// Map device memory into the MMIO window; see [`MmioSpace::map`].
///
/// # Errors
/// As [`MmioSpace::map`].
pub fn mmio_map(
    paddr: PhysicalAddress,
    len: u64,
    cache: CachePolicy,
    name: &'static str,
) -> Result<VirtualAddress, MmioError> {
    let mut mmio = mmio_space();
    let mut frames = frames();
    mmio.map(kernel_directory(), &mut *frames, tlb(), paddr, len, cache, name)
}

/// Unmap the MMIO region containing `vaddr`.
///
/// # Errors
/// [`MmioError::NotMapped`] for an unknown address.
pub fn mmio_unmap(vaddr: VirtualAddress) -> Result<(), MmioError> {
    let mut mmio = mmio_space();
    let frames = frames();
    mmio.unmap(kernel_directory(), &*frames, tlb(), vaddr)
        .map(|_| ())
}

/// A fresh process address space sharing the kernel half.
///
/// # Errors
/// As [`AddressSpace::create`].
pub fn new_address_space() -> Result<AddressSpace<ActivePaging>, VmError> {
    AddressSpace::create(&mut *frames(), kernel_directory())
}

/// Page-fault entry point for the trap dispatcher.
pub fn page_fault<H: TrapHost>(
    resolver: &mut FaultResolver,
    space: &AddressSpace<ActivePaging>,
    host: &mut H,
    frame: &TrapFrame,
    address: VirtualAddress,
    code: FaultErrorCode,
) -> FaultOutcome {
    let mut frames = frames();
    resolver.handle(space, &mut *frames, tlb(), host, frame, address, code)
}
