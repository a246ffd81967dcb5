use crate::{PageEntryBits, Paging, PhysMapper};
use core::marker::PhantomData;
use kernel_memory_addresses::PhysicalAddress;

/// Mutable view of one page-table frame as `P::ENTRIES` raw entries.
pub struct Table<'a, P: Paging> {
    entries: &'a mut [P::Raw],
    _p: PhantomData<P>,
}

/// One 4 KiB frame, the unit the mapper hands out.
#[repr(C, align(4096))]
pub(crate) struct FrameBytes(pub(crate) [u8; 4096]);

impl<'a, P: Paging> Table<'a, P> {
    /// Borrow the table stored in frame `pa`.
    ///
    /// # Safety
    /// - `pa` must be a page-aligned frame that holds a table of scheme `P`.
    /// - No other live `Table` may alias the same frame.
    #[inline]
    pub unsafe fn at<M: PhysMapper + ?Sized>(mapper: &M, pa: PhysicalAddress) -> Self {
        debug_assert!(pa.is_page_aligned());
        let frame: &'a mut FrameBytes = unsafe { mapper.phys_to_mut(pa) };
        // Frames are 4096-aligned and entries are 4 or 8 bytes wide.
        #[allow(clippy::cast_ptr_alignment)]
        let ptr = frame.0.as_mut_ptr().cast::<P::Raw>();
        let entries = unsafe { core::slice::from_raw_parts_mut(ptr, P::ENTRIES) };
        Self {
            entries,
            _p: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> PageEntryBits {
        P::decode(self.entries[index])
    }

    #[inline]
    pub fn set(&mut self, index: usize, bits: PageEntryBits) {
        self.entries[index] = P::encode(bits);
    }

    #[inline]
    pub fn clear(&mut self, index: usize) {
        self.entries[index] = P::Raw::default();
    }

    #[inline]
    #[must_use]
    pub fn raw(&self, index: usize) -> P::Raw {
        self.entries[index]
    }

    #[inline]
    pub fn set_raw(&mut self, index: usize, raw: P::Raw) {
        self.entries[index] = raw;
    }

    /// True if no entry holds anything at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| *e == P::Raw::default())
    }

    /// Zero every entry.
    pub fn zero(&mut self) {
        self.entries.fill(P::Raw::default());
    }
}
