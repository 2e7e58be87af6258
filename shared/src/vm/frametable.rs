//! The physical frame table.
//!
//! One descriptor per frame of RAM, with a free list threaded through the
//! descriptors by frame index. A frame's index in the table *is* its frame
//! number. Descriptors also carry a reference count so that frames can be
//! shared read-only between address spaces after a fork.
//!
//! The table itself lives in memory claimed from the boot bump allocator;
//! see [`Vm::bootstrap`](super::Vm::bootstrap). Everything here expects to
//! run under the frame-table lock.

use crate::memory::Frame;

use static_assertions as sa;

/// Free-list terminator / "no successor" marker.
const NO_FRAME: u32 = u32::MAX;

/// Descriptor for one physical frame.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub(crate) struct FrameEntry {
    /// Index of the next free frame. Meaningful only while the frame is on
    /// the free list.
    next_free: u32,
    /// Number of page-table entries referencing this frame. Zero iff the
    /// frame is unused.
    ref_count: u32,
    used: bool,
}

sa::assert_eq_size!(FrameEntry, [u8; 12]);

impl FrameEntry {
    pub(crate) const VACANT: FrameEntry = FrameEntry {
        next_free: NO_FRAME,
        ref_count: 0,
        used: false,
    };
}

/// Snapshot of frame usage, for boot reporting and diagnostics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameStats {
    /// Frames of RAM tracked by the table.
    pub total: u32,
    /// Frames permanently claimed by boot-time allocation.
    pub reserved: u32,
    /// Frames currently on the free list.
    pub free: u32,
}

pub(crate) struct FrameTable<'m> {
    entries: &'m mut [FrameEntry],
    /// Head of the free list, or `NO_FRAME`.
    first_free: u32,
    free_count: u32,
    /// Frames below this index were claimed by the boot bump allocator.
    /// They are permanently used and never enter the free list.
    reserved: u32,
}

impl<'m> FrameTable<'m> {
    /// Builds the table over `entries`, marking the first `reserved` frames
    /// as permanently used and threading the rest into an ascending free
    /// list.
    ///
    /// # Panics
    ///
    /// Panics if the reserved prefix covers the whole of RAM.
    pub(crate) fn new(entries: &'m mut [FrameEntry], reserved: u32) -> FrameTable<'m> {
        let total = entries.len() as u32;
        assert!(reserved < total, "boot allocations consumed all of RAM");

        for entry in entries[..reserved as usize].iter_mut() {
            *entry = FrameEntry {
                next_free: NO_FRAME,
                ref_count: 1,
                used: true,
            };
        }

        for (i, entry) in entries.iter_mut().enumerate().skip(reserved as usize) {
            let next = i as u32 + 1;
            *entry = FrameEntry {
                next_free: if next < total { next } else { NO_FRAME },
                ref_count: 0,
                used: false,
            };
        }

        FrameTable {
            entries,
            first_free: reserved,
            free_count: total - reserved,
            reserved,
        }
    }

    /// Takes the lowest free frame, or `None` if RAM is exhausted. The
    /// frame's contents are whatever its last owner left there; callers
    /// zero or overwrite it.
    pub(crate) fn allocate(&mut self) -> Option<Frame> {
        let index = self.first_free;
        if index == NO_FRAME {
            return None;
        }

        let entry = &mut self.entries[index as usize];
        debug_assert!(!entry.used);
        self.first_free = entry.next_free;
        self.free_count -= 1;
        *entry = FrameEntry {
            next_free: NO_FRAME,
            ref_count: 1,
            used: true,
        };

        Some(Frame::from_index(index))
    }

    /// Drops one reference to `frame`. The last reference returns the frame
    /// to the free list.
    ///
    /// Releasing an unused frame is a silent no-op; releasing a
    /// boot-reserved frame is refused. Neither happens in a correct kernel,
    /// but a bad address from a broken caller must not corrupt the table.
    pub(crate) fn release(&mut self, frame: Frame) {
        let index = frame.index();
        if index >= self.entries.len() as u32 {
            log::warn!("release of out-of-range frame {}", index);
            return;
        }
        if index < self.reserved {
            log::warn!("release of boot-reserved frame {}", index);
            return;
        }

        let entry = &mut self.entries[index as usize];
        if !entry.used {
            return;
        }

        debug_assert!(entry.ref_count > 0);
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            *entry = FrameEntry {
                next_free: self.first_free,
                ref_count: 0,
                used: false,
            };
            self.first_free = index;
            self.free_count += 1;
        }
    }

    /// Adds a reference to `frame`, which must be in use.
    pub(crate) fn ref_inc(&mut self, frame: Frame) {
        let entry = &mut self.entries[frame.index() as usize];
        assert!(entry.used, "ref_inc of unused frame {}", frame.index());
        entry.ref_count += 1;
    }

    /// Current reference count of `frame`; zero for a free frame.
    pub(crate) fn ref_count(&self, frame: Frame) -> u32 {
        self.entries[frame.index() as usize].ref_count
    }

    pub(crate) fn is_used(&self, frame: Frame) -> bool {
        self.entries[frame.index() as usize].used
    }

    pub(crate) fn stats(&self) -> FrameStats {
        FrameStats {
            total: self.entries.len() as u32,
            reserved: self.reserved,
            free: self.free_count,
        }
    }
}
