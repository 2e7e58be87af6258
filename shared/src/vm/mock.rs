//! A software machine for the unit tests.
//!
//! RAM is a byte buffer, the bump allocator is a watermark into it, and the
//! TLB is a log of the writes the core performed. TLB methods assert the
//! interrupt-mask discipline the real hardware requires.

use crate::machine::{Machine, Spl};
use crate::memory::{Frame, Length, PhysAddress, PAGE_SIZE};

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

#[derive(Default)]
pub(crate) struct TlbLog {
    /// `(entryhi, entrylo)` pairs handed to `tlb_random`, in order.
    pub(crate) random_writes: Vec<(u32, u32)>,
    /// `(entryhi, entrylo, slot)` triples handed to `tlb_write`, in order.
    pub(crate) slot_writes: Vec<(u32, u32, u32)>,
}

pub(crate) struct MockMachine {
    /// All accesses to "RAM" go through this one pointer, exactly as frame
    /// memory is reached through the direct map on the real machine.
    ram_base: *mut u8,
    ram_len: u32,
    /// Bump watermark, in bytes.
    first_free: AtomicU32,
    /// Interrupt-mask nesting depth on the (only) CPU.
    spl_depth: AtomicU32,
    pub(crate) tlb: Mutex<TlbLog>,
}

// SAFETY: the buffer is only reached through raw pointers handed out under
// the same rules as real frame memory.
unsafe impl Sync for MockMachine {}
unsafe impl Send for MockMachine {}

impl MockMachine {
    /// A machine with `ram_bytes` of RAM whose first `boot_pages` pages are
    /// already claimed, standing in for the kernel image and early boot
    /// allocations.
    pub(crate) fn new(ram_bytes: u32, boot_pages: u32) -> MockMachine {
        assert!(ram_bytes % PAGE_SIZE.as_raw() == 0);
        assert!(boot_pages * PAGE_SIZE.as_raw() < ram_bytes);
        let ram = vec![0u8; ram_bytes as usize].into_boxed_slice();
        MockMachine {
            ram_base: Box::into_raw(ram) as *mut u8,
            ram_len: ram_bytes,
            first_free: AtomicU32::new(boot_pages * PAGE_SIZE.as_raw()),
            spl_depth: AtomicU32::new(0),
            tlb: Mutex::new(TlbLog::default()),
        }
    }

    pub(crate) fn peek(&self, addr: PhysAddress) -> u8 {
        assert!(addr.as_raw() < self.ram_len);
        unsafe { *self.ram_base.add(addr.as_raw() as usize) }
    }

    pub(crate) fn poke(&self, addr: PhysAddress, value: u8) {
        assert!(addr.as_raw() < self.ram_len);
        unsafe {
            *self.ram_base.add(addr.as_raw() as usize) = value;
        }
    }

    pub(crate) fn last_random_write(&self) -> Option<(u32, u32)> {
        self.tlb.lock().random_writes.last().copied()
    }

    pub(crate) fn random_write_count(&self) -> usize {
        self.tlb.lock().random_writes.len()
    }

    pub(crate) fn slot_write_count(&self) -> usize {
        self.tlb.lock().slot_writes.len()
    }
}

impl Drop for MockMachine {
    fn drop(&mut self) {
        // The VM borrows the machine, so by the time we drop, nothing
        // points into the buffer any more.
        unsafe {
            drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                self.ram_base,
                self.ram_len as usize,
            )));
        }
    }
}

unsafe impl Machine for MockMachine {
    fn ram_size(&self) -> Length {
        Length::from_raw(self.ram_len)
    }

    fn first_free(&self) -> PhysAddress {
        PhysAddress::from_raw(self.first_free.load(Ordering::SeqCst))
    }

    fn steal_pages(&self, npages: u32) -> PhysAddress {
        assert!(npages > 0);
        let bytes = npages * PAGE_SIZE.as_raw();
        let old = self.first_free.fetch_add(bytes, Ordering::SeqCst);
        assert!(
            old + bytes <= self.ram_len,
            "bump allocation past the end of RAM"
        );
        PhysAddress::from_raw(old)
    }

    fn frame_ptr(&self, frame: Frame) -> *mut u8 {
        let start = frame.start().as_raw();
        assert!(start + PAGE_SIZE.as_raw() <= self.ram_len);
        unsafe { self.ram_base.add(start as usize) }
    }

    fn tlb_random(&self, entryhi: u32, entrylo: u32) {
        assert!(
            self.spl_depth.load(Ordering::SeqCst) > 0,
            "TLB write with interrupts enabled"
        );
        self.tlb.lock().random_writes.push((entryhi, entrylo));
    }

    fn tlb_write(&self, entryhi: u32, entrylo: u32, slot: u32) {
        assert!(
            self.spl_depth.load(Ordering::SeqCst) > 0,
            "TLB write with interrupts enabled"
        );
        self.tlb.lock().slot_writes.push((entryhi, entrylo, slot));
    }

    fn splhigh(&self) -> Spl {
        Spl(self.spl_depth.fetch_add(1, Ordering::SeqCst))
    }

    fn splx(&self, old: Spl) {
        let prev = self.spl_depth.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "splx without splhigh");
        assert_eq!(prev - 1, old.0, "unbalanced splhigh/splx nesting");
    }
}
