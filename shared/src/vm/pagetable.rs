//! The hashed page table.
//!
//! One global, inverted table shared by every address space: buckets are
//! selected by hashing the owning address space's id with the virtual page
//! number, and collisions chain. The bucket-head array is sized at boot
//! (two heads per frame of RAM) and lives in memory claimed from the bump
//! allocator; chain nodes come from a growable arena and are linked by
//! index, so a node never moves once allocated.
//!
//! All operations here expect to run under the page-table lock.

use super::addrspace::AsId;
use super::frametable::FrameTable;
use super::VmError;
use crate::memory::{Page, VirtExtent};
use crate::tlb::EntryLo;

use alloc::vec::Vec;

use spin::Mutex;

/// Index of a chain node in the arena. The null value terminates chains and
/// the arena free list.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub(crate) struct PteRef(u32);

impl PteRef {
    pub(crate) const NONE: PteRef = PteRef(u32::MAX);

    pub(crate) fn is_none(self) -> bool {
        self == Self::NONE
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One translation: `owner` maps `page` with the permissions and frame
/// packed in `lo`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Pte {
    pub(crate) owner: AsId,
    pub(crate) page: Page,
    pub(crate) lo: EntryLo,
    next: PteRef,
}

impl Pte {
    const VACANT: Pte = Pte {
        owner: AsId::NONE,
        page: Page::from_index(0),
        lo: EntryLo::INVALID,
        next: PteRef::NONE,
    };
}

pub(crate) struct PageTable<'m> {
    heads: &'m mut [PteRef],
    slots: Vec<Pte>,
    /// Head of the vacant-slot list, threaded through `Pte::next`.
    free: PteRef,
}

impl<'m> PageTable<'m> {
    /// Builds the table over `heads`, which must all be [`PteRef::NONE`].
    pub(crate) fn new(heads: &'m mut [PteRef]) -> PageTable<'m> {
        debug_assert!(heads.iter().all(|h| h.is_none()));
        PageTable {
            heads,
            slots: Vec::new(),
            free: PteRef::NONE,
        }
    }

    /// The bucket `owner`'s mapping of `page` hashes to.
    pub(crate) fn bucket_of(&self, owner: AsId, page: Page) -> usize {
        ((owner.raw() ^ page.index()) % self.heads.len() as u32) as usize
    }

    pub(crate) fn buckets(&self) -> usize {
        self.heads.len()
    }

    /// Finds the valid translation for `(owner, page)`, if any.
    pub(crate) fn find(&self, owner: AsId, page: Page) -> Option<PteRef> {
        let mut cur = self.heads[self.bucket_of(owner, page)];
        while !cur.is_none() {
            let pte = &self.slots[cur.index()];
            if pte.owner == owner && pte.page == page && pte.lo.is_valid() {
                return Some(cur);
            }
            cur = pte.next;
        }
        None
    }

    pub(crate) fn pte(&self, r: PteRef) -> &Pte {
        &self.slots[r.index()]
    }

    pub(crate) fn pte_mut(&mut self, r: PteRef) -> &mut Pte {
        &mut self.slots[r.index()]
    }

    /// Reserves a chain node without linking it, so callers can fail before
    /// the table is touched. Surfaces the kernel heap's allocation failure
    /// as out-of-memory.
    pub(crate) fn try_alloc(&mut self) -> Result<PteRef, VmError> {
        if !self.free.is_none() {
            let r = self.free;
            self.free = self.slots[r.index()].next;
            return Ok(r);
        }

        if self.slots.len() >= u32::MAX as usize {
            return Err(VmError::OutOfMemory);
        }
        self.slots
            .try_reserve(1)
            .map_err(|_| VmError::OutOfMemory)?;
        let r = PteRef(self.slots.len() as u32);
        self.slots.push(Pte::VACANT);
        Ok(r)
    }

    /// Returns an unlinked node to the arena.
    pub(crate) fn free_slot(&mut self, r: PteRef) {
        self.slots[r.index()] = Pte {
            next: self.free,
            ..Pte::VACANT
        };
        self.free = r;
    }

    /// Fills node `r` and pushes it at the head of its bucket's chain.
    pub(crate) fn link(&mut self, r: PteRef, owner: AsId, page: Page, lo: EntryLo) {
        let bucket = self.bucket_of(owner, page);
        self.slots[r.index()] = Pte {
            owner,
            page,
            lo,
            next: self.heads[bucket],
        };
        self.heads[bucket] = r;
    }

    /// Duplicates every present translation of `old` for `new`, sharing the
    /// underlying frames. Each shared frame gains a reference, and *both*
    /// sides lose write permission, so the first store from either address
    /// space takes a protection fault and copies the frame privately.
    ///
    /// On failure some of `new`'s entries exist; the caller unwinds by
    /// destroying `new` (which evicts them and drops the references).
    pub(crate) fn copy_pages(
        &mut self,
        old: AsId,
        new: AsId,
        frames: &Mutex<FrameTable<'_>>,
    ) -> Result<(), VmError> {
        for bucket in 0..self.heads.len() {
            let mut cur = self.heads[bucket];
            while !cur.is_none() {
                let Pte {
                    owner,
                    page,
                    lo,
                    next,
                } = self.slots[cur.index()];
                // Entries inserted for `new` along the way hash to arbitrary
                // buckets, possibly ones this walk still has to visit; the
                // owner check skips them.
                if owner == old && lo.is_valid() {
                    let slot = self.try_alloc()?;
                    let mut shared = lo;
                    shared.set_writable(false);
                    self.slots[cur.index()].lo = shared;
                    frames.lock().ref_inc(lo.frame());
                    self.link(slot, new, page, shared);
                }
                cur = next;
            }
        }
        Ok(())
    }

    /// Unlinks and frees every translation owned by `owner`, dropping one
    /// frame reference each.
    pub(crate) fn evict_owner(&mut self, owner: AsId, frames: &Mutex<FrameTable<'_>>) {
        for bucket in 0..self.heads.len() {
            let mut prev = PteRef::NONE;
            let mut cur = self.heads[bucket];
            while !cur.is_none() {
                let next = self.slots[cur.index()].next;
                if self.slots[cur.index()].owner == owner {
                    if prev.is_none() {
                        self.heads[bucket] = next;
                    } else {
                        self.slots[prev.index()].next = next;
                    }
                    let frame = self.slots[cur.index()].lo.frame();
                    frames.lock().release(frame);
                    self.free_slot(cur);
                } else {
                    prev = cur;
                }
                cur = next;
            }
        }
    }

    /// Revokes write permission on every translation of `owner` whose page
    /// lies in one of `demoted`. Used when load-time write grants are taken
    /// back.
    pub(crate) fn clear_writable(&mut self, owner: AsId, demoted: &[VirtExtent]) {
        for bucket in 0..self.heads.len() {
            let mut cur = self.heads[bucket];
            while !cur.is_none() {
                let pte = &mut self.slots[cur.index()];
                if pte.owner == owner
                    && demoted.iter().any(|e| e.contains_address(pte.page.start()))
                {
                    pte.lo.set_writable(false);
                }
                cur = pte.next;
            }
        }
    }

    /// Iterates the chain of one bucket.
    pub(crate) fn chain(&self, bucket: usize) -> impl Iterator<Item = &Pte> + '_ {
        let mut cur = self.heads[bucket];
        core::iter::from_fn(move || {
            if cur.is_none() {
                return None;
            }
            let pte = &self.slots[cur.index()];
            cur = pte.next;
            Some(pte)
        })
    }
}
