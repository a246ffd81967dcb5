use kernel_alloc::FrameAllocError;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::MapError;

use crate::mmio::MmioError;

/// Failure of an address-space or VMA operation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("range overlaps an existing mapping")]
    Overlap,
    #[error("invalid address or length")]
    InvalidArgument,
    #[error("no free virtual range of {0:#x} bytes")]
    NoSpace(u64),
    #[error("address {0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("bad user address {0}")]
    BadAddress(VirtualAddress),
    #[error("mapping is immutable")]
    Immutable,
    #[error("operation not supported")]
    Unsupported,
    #[error("memory subsystem already initialized")]
    AlreadyInitialized,
    #[error(transparent)]
    Frames(#[from] FrameAllocError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Mmio(#[from] MmioError),
}
