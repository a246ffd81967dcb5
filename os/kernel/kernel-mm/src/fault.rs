//! # Page-fault resolution
//!
//! The trap dispatcher hands every `#PF` to [`FaultResolver::handle`] together
//! with the trapped registers, the faulting address (CR2) and the error code
//! pushed by the CPU. The resolver either fixes the mapping so the faulting
//! instruction can be retried, or escalates:
//!
//! - faults raised in user mode kill the process with `SIGSEGV`,
//! - faults raised in kernel mode dump state and halt the machine.
//!
//! Resolvable faults, by the state of the leaf entry:
//!
//! | entry     | access | frame refcount | action                              |
//! |-----------|--------|----------------|-------------------------------------|
//! | absent    | any    | n/a            | new frame, zeroed or from backing   |
//! | read-only | write  | > 1            | copy the frame, map the copy rw     |
//! | read-only | write  | 1              | last sharer: make the entry rw      |
//!
//! Anything else is fatal.

use crate::AddressSpace;
use crate::vma::{NoPageError, Vma};
use bitfield_struct::bitfield;
use core::fmt;
use kernel_alloc::{AllocFlags, Contiguity, FrameAllocator, FrameId};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, align_down};
use kernel_sync::IrqGuard;
use kernel_vmem::{MapError, Paging, PhysMapper, Tlb};

/// Page-fault error code layout.
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15.1 “Page-Fault Exception (#PF)”.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct FaultErrorCode {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64, // reserved / ignored bits
}

impl FaultErrorCode {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page (page not mapped or swapped out)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// Register state captured by the trap entry stub.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TrapFrame {
    pub ip: u64,
    pub sp: u64,
    pub flags: u64,
    pub cs: u64,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    /// rax, rbx, rcx, rdx, rsi, rdi, rbp, r8..r15 (the upper eight are zero on x86).
    pub gprs: [u64; 15],
}

impl fmt::Display for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 15] = [
            "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "r8", "r9", "r10", "r11", "r12",
            "r13", "r14", "r15",
        ];
        writeln!(
            f,
            "ip={:#018x} sp={:#018x} flags={:#010x} cs={:#06x}",
            self.ip, self.sp, self.flags, self.cs
        )?;
        writeln!(
            f,
            "cr0={:#010x} cr3={:#018x} cr4={:#010x}",
            self.cr0, self.cr3, self.cr4
        )?;
        for (i, (name, value)) in NAMES.iter().zip(self.gprs).enumerate() {
            write!(f, "{name:>3}={value:#018x}")?;
            f.write_str(if i % 4 == 3 { "\n" } else { " " })?;
        }
        Ok(())
    }
}

/// Signals the resolver can deliver.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Signal {
    Segv,
}

/// Why a fault could not be resolved.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FaultError {
    #[error("no vma covers the address")]
    NoVma,
    #[error("vma is not readable")]
    NotReadable,
    #[error("write to a read-only vma")]
    NotWritable,
    #[error("instruction fetch from a non-executable vma")]
    NotExecutable,
    #[error("backing object failed: {0}")]
    BackingFailed(#[from] NoPageError),
    #[error("out of memory")]
    OutOfMemory,
    #[error("access violates the installed mapping")]
    ProtectionViolation,
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Everything known about a fault that could not be resolved.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FatalFault {
    pub address: VirtualAddress,
    pub code: FaultErrorCode,
    pub reason: FaultError,
    pub ip: u64,
}

impl fmt::Display for FatalFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} page fault at {} from ip {:#x}: {} (err={:#x}: {})",
            if self.code.user() { "user" } else { "kernel" },
            self.address,
            self.ip,
            self.reason,
            self.code.into_bits(),
            self.code.explain()
        )
    }
}

/// The environment a fault is raised in: the current process and the machine.
pub trait TrapHost {
    /// Deliver `signal` to the current process.
    fn kill(&mut self, signal: Signal);

    /// Stop the machine after an unrecoverable kernel fault.
    fn halt(&mut self, fault: &FatalFault) -> !;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Resolution {
    /// A fresh zero-filled frame was mapped.
    DemandZero,
    /// A fresh frame was filled from the VMA's backing object.
    DemandBacked,
    /// A shared frame was copied for the faulting side.
    CopyOnWrite,
    /// The faulting side was the last sharer and got write access back.
    Reclaimed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultOutcome {
    /// The mapping was fixed; retry the instruction.
    Resolved(Resolution),
    /// Same address as the fault just before; returned without resolving.
    Spurious,
    /// The process was signalled.
    Killed(Signal),
}

/// Page-fault handler state of one flow of control.
#[derive(Debug, Default)]
pub struct FaultResolver {
    #[cfg(feature = "spurious-fault-guard")]
    last: Option<VirtualAddress>,
}

impl FaultResolver {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            #[cfg(feature = "spurious-fault-guard")]
            last: None,
        }
    }

    /// Resolve or escalate one page fault in `space`.
    ///
    /// Kernel-mode faults that cannot be resolved end in [`TrapHost::halt`]
    /// and never return.
    #[allow(clippy::too_many_arguments)]
    pub fn handle<P, M, T, H>(
        &mut self,
        space: &AddressSpace<P>,
        frames: &mut FrameAllocator<M>,
        tlb: &T,
        host: &mut H,
        frame: &TrapFrame,
        address: VirtualAddress,
        code: FaultErrorCode,
    ) -> FaultOutcome
    where
        P: Paging,
        M: PhysMapper,
        T: Tlb,
        H: TrapHost,
    {
        let irq = IrqGuard::new();

        #[cfg(feature = "spurious-fault-guard")]
        {
            if self.last.take() == Some(address) {
                log::warn!("spurious page fault at {address}, err={:#x}", code.into_bits());
                return FaultOutcome::Spurious;
            }
            self.last = Some(address);
        }

        let page = VirtualAddress::new(align_down(address.as_u64(), PAGE_SIZE));
        let reason = match resolve(space, frames, page, code) {
            Ok(resolution) => {
                tlb.invalidate_page(page);
                log::debug!("page fault at {address}: {resolution:?}");
                return FaultOutcome::Resolved(resolution);
            }
            Err(reason) => reason,
        };

        let fatal = FatalFault {
            address,
            code,
            reason,
            ip: frame.ip,
        };
        if code.user() {
            log::debug!("{fatal}");
            space.dump(&*frames, address, log::Level::Debug);
            drop(irq);
            host.kill(Signal::Segv);
            return FaultOutcome::Killed(Signal::Segv);
        }

        log::error!("{fatal}");
        log::error!("registers:\n{frame}");
        space.dump(&*frames, address, log::Level::Error);
        host.halt(&fatal)
    }
}

fn resolve<P: Paging, M: PhysMapper>(
    space: &AddressSpace<P>,
    frames: &mut FrameAllocator<M>,
    page: VirtualAddress,
    code: FaultErrorCode,
) -> Result<Resolution, FaultError> {
    let vma = space.vmas().find(page).ok_or(FaultError::NoVma)?;
    let flags = vma.flags();
    if !flags.read() {
        return Err(FaultError::NotReadable);
    }
    if code.write() && !flags.write() {
        return Err(FaultError::NotWritable);
    }
    if code.instruction_fetch() && !flags.exec() {
        return Err(FaultError::NotExecutable);
    }

    let dir = space.directory();
    let Some(entry) = dir.entry_test(&*frames, page) else {
        if flags.io() {
            return Err(FaultError::ProtectionViolation);
        }
        return demand_page(space, vma, frames, page);
    };

    if !code.write() || entry.writable() || flags.io() {
        return Err(FaultError::ProtectionViolation);
    }
    let old = frames
        .frame_at(entry.physical_address())
        .ok_or(FaultError::ProtectionViolation)?;

    match frames.refcount(old) {
        0 => Err(FaultError::ProtectionViolation),
        1 => {
            dir.entry_update(&*frames, page, |e| e.with_writable(true));
            Ok(Resolution::Reclaimed)
        }
        _ => {
            let copy = allocate(frames, AllocFlags::new())?;
            frames.copy(old, copy);
            let pa = frames.phys(copy);
            if let Err(e) = dir.entry_set(frames, page, pa, entry.with_writable(true)) {
                frames.free(copy);
                return Err(e.into());
            }
            frames.free(old);
            Ok(Resolution::CopyOnWrite)
        }
    }
}

fn demand_page<P: Paging, M: PhysMapper>(
    space: &AddressSpace<P>,
    vma: &Vma,
    frames: &mut FrameAllocator<M>,
    page: VirtualAddress,
) -> Result<Resolution, FaultError> {
    let id = allocate(frames, AllocFlags::ZEROED)?;

    let resolution = match vma.backing() {
        None => Resolution::DemandZero,
        Some(backing) => {
            let offset = backing.offset() + (page - vma.start());
            #[allow(clippy::cast_possible_truncation)]
            let valid = vma
                .actual_end()
                .as_u64()
                .saturating_sub(page.as_u64())
                .min(PAGE_SIZE) as usize;
            let filled = frames.with_bytes(id, |bytes| -> Result<usize, NoPageError> {
                let data = &mut bytes[..valid];
                if data.is_empty() {
                    return Ok(0);
                }
                let n = backing.ops().nopage(offset, data)?.min(valid);
                data[n..].fill(0);
                Ok(n)
            });
            if let Err(e) = filled {
                log::warn!("backing object failed at {page} (offset {offset:#x}): {e}");
                frames.free(id);
                return Err(FaultError::BackingFailed(e));
            }
            Resolution::DemandBacked
        }
    };

    let pa = frames.phys(id);
    if let Err(e) = space
        .directory()
        .entry_set(frames, page, pa, vma.leaf_bits())
    {
        frames.free(id);
        return Err(e.into());
    }
    Ok(resolution)
}

fn allocate<M: PhysMapper>(
    frames: &mut FrameAllocator<M>,
    flags: AllocFlags,
) -> Result<FrameId, FaultError> {
    frames
        .allocate(1, Contiguity::Discontiguous, flags)
        .ok()
        .and_then(|set| set.first())
        .ok_or(FaultError::OutOfMemory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_bits_match_hardware() {
        let code = FaultErrorCode::from_bits(0b10111);
        assert!(code.present() && code.write() && code.user() && code.instruction_fetch());
        assert!(!code.reserved_bit());
        assert_eq!(code.explain(), "User-mode instruction fetch on protected page (likely NX or SMEP)");
        assert_eq!(
            FaultErrorCode::new().explain(),
            "Non-present page (page not mapped or swapped out)"
        );
    }

    #[test]
    fn fatal_fault_mentions_mode_and_reason() {
        let fatal = FatalFault {
            address: VirtualAddress::new(0xdead_0000),
            code: FaultErrorCode::new().with_user(true).with_write(true),
            reason: FaultError::NoVma,
            ip: 0x40_1000,
        };
        let text = fatal.to_string();
        assert!(text.starts_with("user page fault at"));
        assert!(text.contains("no vma covers the address"));
        assert!(text.contains("err=0x6"));
    }

    #[test]
    fn trap_frame_dump_lists_registers() {
        let frame = TrapFrame {
            ip: 0x1000,
            gprs: [7; 15],
            ..TrapFrame::default()
        };
        let text = frame.to_string();
        assert!(text.contains("ip=0x0000000000001000"));
        assert!(text.contains("r15=0x0000000000000007"));
    }
}
