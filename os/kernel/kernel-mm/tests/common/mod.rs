#![allow(dead_code)]

use kernel_alloc::FrameAllocator;
use kernel_alloc::sim::SimRam;
use kernel_info::memmap::{KernelSections, MemoryMap};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_mm::{
    AddressSpace, FatalFault, FaultErrorCode, FaultOutcome, FaultResolver, MmioSpace,
    NoPageError, Signal, TrapFrame, TrapHost, VmaOps,
};
use kernel_vmem::{PageDirectory, Paging, RecordingTlb};
use std::sync::Mutex;

/// Simulated RAM, a kernel directory with its MMIO window, and a TLB.
pub struct Machine<P: Paging> {
    pub frames: FrameAllocator<SimRam>,
    pub kernel: PageDirectory<P>,
    pub mmio: MmioSpace<P>,
    pub tlb: RecordingTlb,
}

impl<P: Paging> Machine<P> {
    pub fn new(frames: usize) -> Self {
        let ram = SimRam::new(frames);
        let regions = ram.regions();
        let map = MemoryMap {
            regions: &regions,
            kernel: KernelSections {
                image: 0..0,
                init: 0..0,
            },
        };
        let mut frames = FrameAllocator::new::<P>(&map, ram);
        let kernel = PageDirectory::new_kernel(&mut frames).unwrap();
        let mmio = MmioSpace::init(&kernel, &mut frames).unwrap();
        Self {
            frames,
            kernel,
            mmio,
            tlb: RecordingTlb::new(),
        }
    }

    pub fn space(&mut self) -> AddressSpace<P> {
        AddressSpace::create(&mut self.frames, &self.kernel).unwrap()
    }

    pub fn used(&self) -> usize {
        self.frames.stats().used
    }

    /// Deliver one fault at `va` to a fresh resolver.
    pub fn fault(
        &mut self,
        space: &AddressSpace<P>,
        host: &mut TestHost,
        va: u64,
        code: FaultErrorCode,
    ) -> FaultOutcome {
        FaultResolver::new().handle(
            space,
            &mut self.frames,
            &self.tlb,
            host,
            &TrapFrame::default(),
            VirtualAddress::new(va),
            code,
        )
    }

    /// What a user store to `va` would do: fault if needed, then write.
    pub fn store(&mut self, space: &AddressSpace<P>, va: u64, byte: u8) {
        let writable = space
            .directory()
            .entry_test(&self.frames, VirtualAddress::new(va))
            .is_some_and(|e| e.writable());
        if !writable {
            let present = space
                .directory()
                .entry_test(&self.frames, VirtualAddress::new(va))
                .is_some();
            let code = user_write().with_present(present);
            let outcome = self.fault(space, &mut TestHost::default(), va, code);
            assert!(matches!(outcome, FaultOutcome::Resolved(_)), "{outcome:?}");
        }
        self.poke(space, va, byte);
    }

    pub fn poke(&mut self, space: &AddressSpace<P>, va: u64, byte: u8) {
        let pa = space
            .directory()
            .translate(&self.frames, VirtualAddress::new(va))
            .unwrap();
        let id = self.frames.frame_at(pa).unwrap();
        self.frames
            .with_bytes(id, |b| b[(va % PAGE_SIZE) as usize] = byte);
    }

    pub fn peek(&mut self, space: &AddressSpace<P>, va: u64) -> u8 {
        let pa = space
            .directory()
            .translate(&self.frames, VirtualAddress::new(va))
            .unwrap();
        let id = self.frames.frame_at(pa).unwrap();
        self.frames.with_bytes(id, |b| b[(va % PAGE_SIZE) as usize])
    }

    pub fn refcount_at(&self, space: &AddressSpace<P>, va: u64) -> u16 {
        let pa = space
            .directory()
            .translate(&self.frames, VirtualAddress::new(va))
            .unwrap();
        self.frames.refcount(self.frames.frame_at(pa).unwrap())
    }
}

pub fn user_read() -> FaultErrorCode {
    FaultErrorCode::new().with_user(true)
}

pub fn user_write() -> FaultErrorCode {
    FaultErrorCode::new().with_user(true).with_write(true)
}

pub fn kernel_read() -> FaultErrorCode {
    FaultErrorCode::new()
}

/// Records signals; halting panics so kernel faults can be `should_panic`.
#[derive(Default)]
pub struct TestHost {
    pub signals: Vec<Signal>,
}

impl TrapHost for TestHost {
    fn kill(&mut self, signal: Signal) {
        self.signals.push(signal);
    }

    fn halt(&mut self, fault: &FatalFault) -> ! {
        panic!("machine halted: {fault}");
    }
}

/// A backing object whose byte at offset `o` is `o as u8`.
#[derive(Default)]
pub struct Pattern {
    pub requests: Mutex<Vec<(u64, usize)>>,
}

impl VmaOps for Pattern {
    fn nopage(&self, offset: u64, page: &mut [u8]) -> Result<usize, NoPageError> {
        self.requests.lock().unwrap().push((offset, page.len()));
        for (i, b) in page.iter_mut().enumerate() {
            *b = (offset + i as u64) as u8;
        }
        Ok(page.len())
    }
}

/// A backing object that always fails.
pub struct Broken;

impl VmaOps for Broken {
    fn nopage(&self, _: u64, _: &mut [u8]) -> Result<usize, NoPageError> {
        Err(NoPageError::Io)
    }
}
