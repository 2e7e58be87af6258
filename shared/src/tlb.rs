//! TLB refill entry encodings.
//!
//! The TLB is software-refilled: on a miss the fault handler builds the two
//! refill words itself and hands them to the hardware. The layouts here are
//! fixed by the architecture.

use crate::memory::{Frame, Page, DIRECT_MAP_BASE, PAGE_BITS, PAGE_SIZE};

use static_assertions as sa;

/// Number of TLB slots.
pub const NUM_TLB: u32 = 64;

bitflags::bitflags! {
    /// Flag bits of [`EntryLo`]. Bits 31..12 hold the frame number; the low
    /// eight bits are unused and always zero.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct EntryLoFlags: u32 {
        /// Entry applies regardless of the address-space id. Never set here;
        /// the TLB is flushed on context switch instead.
        const GLOBAL = 1 << 8;
        /// Entry may be used for translation.
        const VALID = 1 << 9;
        /// Write-enable. Despite the name this is not a "page was written"
        /// marker: a store through a mapping with the bit clear traps.
        const DIRTY = 1 << 10;
        /// Bypass the cache for this page. Never set for RAM pages.
        const NOCACHE = 1 << 11;
    }
}

/// The low word of a TLB entry: physical frame number plus control bits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct EntryLo(u32);

sa::assert_eq_size!(EntryLo, u32);

impl EntryLo {
    /// The all-zero entry: not valid, matches nothing.
    pub const INVALID: EntryLo = EntryLo(0);

    /// A valid mapping of `frame`, writable iff `writable`.
    pub fn new(frame: Frame, writable: bool) -> EntryLo {
        let mut flags = EntryLoFlags::VALID;
        if writable {
            flags |= EntryLoFlags::DIRTY;
        }
        EntryLo(frame.index() << PAGE_BITS | flags.bits())
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn frame(self) -> Frame {
        Frame::from_index(self.0 >> PAGE_BITS)
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(EntryLoFlags::VALID)
    }

    /// Whether stores through this mapping are permitted.
    pub fn is_writable(self) -> bool {
        self.flags().contains(EntryLoFlags::DIRTY)
    }

    pub fn set_writable(&mut self, writable: bool) {
        let mut flags = self.flags();
        flags.set(EntryLoFlags::DIRTY, writable);
        self.0 = (self.0 & !EntryLoFlags::all().bits()) | flags.bits();
    }

    /// Repoint the mapping at `frame`, keeping the control bits.
    pub fn set_frame(&mut self, frame: Frame) {
        self.0 = frame.index() << PAGE_BITS | (self.0 & EntryLoFlags::all().bits());
    }

    fn flags(self) -> EntryLoFlags {
        EntryLoFlags::from_bits_truncate(self.0)
    }
}

/// The high word of a TLB entry: the virtual page number. The address-space
/// id field (bits 11..6) is always zero; the TLB is flushed on context
/// switch instead of tagged.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct EntryHi(u32);

sa::assert_eq_size!(EntryHi, u32);

impl EntryHi {
    pub fn new(page: Page) -> EntryHi {
        EntryHi(page.index() << PAGE_BITS)
    }

    /// The value used to invalidate slot `slot` when flushing. Kernel-segment
    /// addresses can never match a user translation, so one per slot keeps
    /// the flushed entries distinct (duplicate TLB entries are a hardware
    /// error).
    pub fn invalid(slot: u32) -> EntryHi {
        EntryHi(DIRECT_MAP_BASE.as_raw() + slot * PAGE_SIZE.as_raw())
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}
