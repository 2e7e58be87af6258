//! The virtual memory system.
//!
//! Three cooperating pieces, all owned by [`Vm`]:
//!
//! - the frame table ([`frametable`]): one refcounted descriptor per frame
//!   of physical RAM, with a free list;
//! - the hashed page table ([`pagetable`]): a single inverted table shared
//!   by every address space, mapping `(address space, page)` to a frame;
//! - the fault handler ([`Vm::fault`]): refills the software-managed TLB on
//!   miss and resolves copy-on-write protection faults.
//!
//! Lock order: the page-table lock is the outer lock and the frame-table
//! lock the inner one, because the fault handler allocates frames from
//! inside its page-table critical section. Nothing may take the page-table
//! lock while holding the frame-table lock.

mod addrspace;
mod frametable;
mod pagetable;

#[cfg(test)]
mod mock;

pub use addrspace::{AddressSpace, AsId, Perms, Region, STACK_SIZE, USER_STACK_TOP};
pub use frametable::FrameStats;

use frametable::{FrameEntry, FrameTable};
use pagetable::{PageTable, PteRef};

use crate::machine::Machine;
use crate::memory::{kvaddr_to_paddr, paddr_to_kvaddr, Frame, Page, VirtAddress, PAGE_SIZE};
use crate::tlb::{EntryHi, EntryLo, NUM_TLB};

use core::sync::atomic::{AtomicU32, Ordering};

use num_traits::FromPrimitive;
use spin::{Mutex, Once};

/// Fault classification passed in from the trap handler.
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum FaultKind {
    /// A load missed in the TLB.
    Read = 0,
    /// A store missed in the TLB.
    Write = 1,
    /// A store hit a mapping without write permission.
    ReadOnly = 2,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VmError {
    /// The faulting address is outside every region, the access violates
    /// the region's permissions, or there is no address space to fault
    /// against.
    BadFault,
    /// Malformed request: an unknown fault code or an impossible region.
    BadArg,
    /// No free frame, or no memory for VM bookkeeping.
    OutOfMemory,
}

pub struct Vm<'m> {
    machine: &'m dyn Machine,
    frames: Mutex<FrameTable<'m>>,
    pages: Mutex<PageTable<'m>>,
    next_as_id: AtomicU32,
}

impl<'m> Vm<'m> {
    /// Brings the VM up.
    ///
    /// The page-table bucket array (two buckets per frame of RAM) is
    /// claimed from the boot bump allocator first, then the frame table
    /// itself. Only after both are placed is the bump watermark read, so
    /// the tables land inside the permanently reserved prefix their own
    /// frame table describes.
    pub fn bootstrap(machine: &'m dyn Machine) -> Vm<'m> {
        let nframes = machine.ram_size().as_raw() / PAGE_SIZE.as_raw();
        assert!(nframes > 0, "machine reported no RAM");

        // SAFETY: the bump allocator hands over exclusive ownership of the
        // stolen pages, and the direct map is linear across them.
        let heads = unsafe { steal_array(machine, nframes as usize * 2, PteRef::NONE) };
        let entries = unsafe { steal_array(machine, nframes as usize, FrameEntry::VACANT) };

        // Everything below the watermark (kernel image, early boot
        // allocations, and the two arrays just claimed) stays allocated
        // forever.
        let reserved = machine
            .first_free()
            .align_up(PAGE_SIZE.as_raw())
            .as_raw()
            / PAGE_SIZE.as_raw();

        let frames = FrameTable::new(entries, reserved);
        let stats = frames.stats();
        log::info!(
            "vm: {} frames of RAM, {} reserved at boot, {} free",
            stats.total,
            stats.reserved,
            stats.free
        );

        Vm {
            machine,
            frames: Mutex::new(frames),
            pages: Mutex::new(PageTable::new(heads)),
            next_as_id: AtomicU32::new(1),
        }
    }

    /// Allocates kernel memory, returning its address in the kernel's
    /// direct-mapped segment. Once the VM is up only single pages can be
    /// allocated; anything larger is reported as out-of-memory.
    pub fn alloc_kpages(&self, npages: u32) -> Result<VirtAddress, VmError> {
        if npages != 1 {
            return Err(VmError::OutOfMemory);
        }
        let frame = self.alloc_zeroed_frame()?;
        Ok(paddr_to_kvaddr(frame.start()))
    }

    /// Returns a kernel page obtained from [`alloc_kpages`](Vm::alloc_kpages).
    pub fn free_kpages(&self, kvaddr: VirtAddress) {
        let Some(paddr) = kvaddr_to_paddr(kvaddr) else {
            log::warn!("free of non-kernel address {:#010x}", kvaddr.as_raw());
            return;
        };
        self.frames.lock().release(Frame::containing(paddr));
    }

    /// Reference count of a frame; zero if the frame is free.
    pub fn frame_ref_count(&self, frame: Frame) -> u32 {
        self.frames.lock().ref_count(frame)
    }

    /// Adds a reference to an in-use frame, keeping it alive across an
    /// extra holder.
    pub fn frame_ref_inc(&self, frame: Frame) {
        self.frames.lock().ref_inc(frame)
    }

    /// Drops a reference to a frame; the last one frees it.
    pub fn frame_ref_dec(&self, frame: Frame) {
        self.frames.lock().release(frame)
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.frames.lock().stats()
    }

    /// A fresh, empty address space with a never-before-used identity.
    pub fn create_addrspace(&self) -> AddressSpace {
        AddressSpace::new(AsId::from_raw(self.next_as_id.fetch_add(1, Ordering::Relaxed)))
    }

    /// Forks `old`: the new address space has the same regions and shares
    /// every present page read-only. The first store from either side
    /// faults and gets a private copy.
    ///
    /// On failure all partial work is undone and the frame counts are back
    /// where they started.
    pub fn copy_addrspace(&self, old: &AddressSpace) -> Result<AddressSpace, VmError> {
        let mut new = self.create_addrspace();
        for region in old.regions() {
            if let Err(e) = new.push_region(region.forked()) {
                self.destroy_addrspace(new);
                return Err(e);
            }
        }

        let result = self
            .pages
            .lock()
            .copy_pages(old.id(), new.id(), &self.frames);
        match result {
            // The parent's mappings just lost write permission; its stale
            // TLB entries must not keep granting it.
            Ok(()) => {
                self.tlb_flush();
                Ok(new)
            }
            Err(e) => {
                self.destroy_addrspace(new);
                Err(e)
            }
        }
    }

    /// Tears down an address space, releasing every page it maps.
    pub fn destroy_addrspace(&self, space: AddressSpace) {
        self.pages.lock().evict_owner(space.id(), &self.frames);
        self.tlb_flush();
    }

    /// Called when a process is switched onto this CPU. TLB entries carry
    /// no address-space tag, so the whole TLB is flushed.
    pub fn activate(&self) {
        self.tlb_flush();
    }

    /// Called when a process is switched off this CPU.
    pub fn deactivate(&self) {
        self.tlb_flush();
    }

    /// Ends the load-time write window opened by
    /// [`AddressSpace::prepare_load`]: regions get their real permissions
    /// back, pages already materialized in those regions lose write
    /// permission, and the TLB is flushed so no stale writable entry
    /// survives.
    pub fn complete_load(&self, space: &mut AddressSpace) {
        let demoted = space.take_load_demotions();
        if !demoted.is_empty() {
            self.pages.lock().clear_writable(space.id(), &demoted);
        }
        self.tlb_flush();
    }

    /// Handles a TLB refill or write-protection fault at `faultaddress`.
    ///
    /// On success a translation for the faulting page has been installed in
    /// the TLB and the instruction can be retried. On error nothing was
    /// installed and the page table is unchanged.
    pub fn fault(
        &self,
        current: Option<&AddressSpace>,
        faulttype: u32,
        faultaddress: VirtAddress,
    ) -> Result<(), VmError> {
        let kind = FaultKind::from_u32(faulttype).ok_or(VmError::BadArg)?;
        // No address space means a kernel fault in early boot; failing it
        // turns an infinite fault loop into a panic upstream.
        let space = current.ok_or(VmError::BadFault)?;

        let page = Page::containing(faultaddress);
        let wants_write = matches!(kind, FaultKind::Write | FaultKind::ReadOnly);

        let mut pages = self.pages.lock();
        let lo = match pages.find(space.id(), page) {
            Some(r) => {
                if wants_write && !pages.pte(r).lo.is_writable() {
                    // Either a store to a genuinely read-only page, or the
                    // first store to a copy-on-write page.
                    let region = space
                        .region_containing(faultaddress)
                        .ok_or(VmError::BadFault)?;
                    if !region.is_writable() {
                        return Err(VmError::BadFault);
                    }
                    self.resolve_cow(&mut pages, r)?;
                }
                pages.pte(r).lo
            }
            None => {
                let region = space
                    .region_containing(faultaddress)
                    .ok_or(VmError::BadFault)?;

                // Reserve the chain node before the frame so that a
                // failure on either leaves the table untouched.
                let slot = pages.try_alloc()?;
                let frame = match self.alloc_zeroed_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        pages.free_slot(slot);
                        return Err(e);
                    }
                };

                // Note a store to a read-only region lands here too and
                // installs a non-writable mapping: the retried store then
                // raises the protection fault that reports the error.
                let lo = EntryLo::new(frame, region.is_writable());
                pages.link(slot, space.id(), page, lo);
                lo
            }
        };

        let spl = self.machine.splhigh();
        self.machine
            .tlb_random(EntryHi::new(page).raw(), lo.raw());
        self.machine.splx(spl);
        Ok(())
    }

    /// Makes the translation at `r` privately writable. The sole owner of
    /// the underlying frame just gains the write bit; a shared frame is
    /// copied into a fresh one first and one reference on the original is
    /// dropped.
    ///
    /// The caller holds the page-table lock, which serializes every
    /// operation that could change the frame's reference count.
    fn resolve_cow(&self, pages: &mut PageTable<'m>, r: PteRef) -> Result<(), VmError> {
        let old = pages.pte(r).lo.frame();
        if self.frames.lock().ref_count(old) == 1 {
            pages.pte_mut(r).lo.set_writable(true);
            return Ok(());
        }

        let new = self
            .frames
            .lock()
            .allocate()
            .ok_or(VmError::OutOfMemory)?;
        // Copy outside the frame-table lock; both frames are ours to touch.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.machine.frame_ptr(old),
                self.machine.frame_ptr(new),
                PAGE_SIZE.as_raw() as usize,
            );
        }

        let lo = &mut pages.pte_mut(r).lo;
        lo.set_frame(new);
        lo.set_writable(true);
        self.frames.lock().release(old);
        Ok(())
    }

    fn alloc_zeroed_frame(&self) -> Result<Frame, VmError> {
        let frame = self
            .frames
            .lock()
            .allocate()
            .ok_or(VmError::OutOfMemory)?;
        // Zero outside the lock; the frame already belongs to us.
        unsafe {
            core::ptr::write_bytes(
                self.machine.frame_ptr(frame),
                0,
                PAGE_SIZE.as_raw() as usize,
            );
        }
        Ok(frame)
    }

    fn tlb_flush(&self) {
        let spl = self.machine.splhigh();
        for slot in 0..NUM_TLB {
            self.machine
                .tlb_write(EntryHi::invalid(slot).raw(), EntryLo::INVALID.raw(), slot);
        }
        self.machine.splx(spl);
    }
}

/// Claims room for `len` copies of `init` from the boot bump allocator and
/// initializes them through the direct map.
///
/// # Safety
///
/// Must only be called while the bump allocator is still live, with a
/// machine honoring the [`Machine`] contract.
unsafe fn steal_array<'m, T: Copy>(machine: &'m dyn Machine, len: usize, init: T) -> &'m mut [T] {
    let bytes = len * core::mem::size_of::<T>();
    let npages = bytes.div_ceil(PAGE_SIZE.as_raw() as usize) as u32;
    let pa = machine.steal_pages(npages);
    assert!(pa.is_aligned_to(PAGE_SIZE.as_raw()));

    let base = machine.frame_ptr(Frame::containing(pa)) as *mut T;
    unsafe {
        for i in 0..len {
            base.add(i).write(init);
        }
        core::slice::from_raw_parts_mut(base, len)
    }
}

/// The kernel's one VM instance, plus the pre-VM fallback.
///
/// Boot-time code allocates kernel pages before the VM exists. Until
/// [`bootstrap`](VmCell::bootstrap) runs, allocation falls through to the
/// machine's bump allocator and frees are quietly leaked; everything
/// allocated that early is a kernel structure that lives forever anyway.
pub struct VmCell<'m> {
    machine: &'m dyn Machine,
    vm: Once<Vm<'m>>,
}

impl<'m> VmCell<'m> {
    pub const fn new(machine: &'m dyn Machine) -> VmCell<'m> {
        VmCell {
            machine,
            vm: Once::new(),
        }
    }

    /// Brings the VM up. Later calls return the existing instance.
    pub fn bootstrap(&self) -> &Vm<'m> {
        self.vm.call_once(|| Vm::bootstrap(self.machine))
    }

    /// The VM, which must have been bootstrapped.
    ///
    /// # Panics
    ///
    /// Panics before [`bootstrap`](VmCell::bootstrap) has run.
    pub fn vm(&self) -> &Vm<'m> {
        self.vm.get().expect("vm not bootstrapped")
    }

    pub fn alloc_kpages(&self, npages: u32) -> Result<VirtAddress, VmError> {
        if npages == 0 {
            return Err(VmError::BadArg);
        }
        match self.vm.get() {
            Some(vm) => vm.alloc_kpages(npages),
            None => Ok(paddr_to_kvaddr(self.machine.steal_pages(npages))),
        }
    }

    pub fn free_kpages(&self, kvaddr: VirtAddress) {
        if let Some(vm) = self.vm.get() {
            vm.free_kpages(kvaddr);
        }
        // Pre-bootstrap allocations are never returned.
    }

    pub fn fault(
        &self,
        current: Option<&AddressSpace>,
        faulttype: u32,
        faultaddress: VirtAddress,
    ) -> Result<(), VmError> {
        match self.vm.get() {
            Some(vm) => vm.fault(current, faulttype, faultaddress),
            // Early boot: no VM, so no mapping could ever exist.
            None => Err(VmError::BadFault),
        }
    }
}
