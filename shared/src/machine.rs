//! The seam between the VM core and the machine it runs on.
//!
//! The kernel supplies an implementation backed by the real CPU and RAM
//! primitives; the unit tests supply a mock with buffer-backed RAM and a
//! recording TLB. The VM core never touches hardware except through this
//! trait.

use crate::memory::{Frame, Length, PhysAddress};

/// Opaque interrupt level returned by [`Machine::splhigh`] and handed back
/// to [`Machine::splx`].
#[derive(Clone, Copy, Debug)]
pub struct Spl(pub u32);

/// Machine-dependent services the VM is built on.
///
/// # Safety
///
/// The VM trusts implementations on all of the following; a violation is
/// undefined behavior in the core:
///
/// - [`ram_size`](Machine::ram_size) and
///   [`first_free`](Machine::first_free) describe real, exclusively owned
///   physical memory, and `first_free` never decreases.
/// - [`steal_pages`](Machine::steal_pages) returns page-aligned memory below
///   `ram_size` that will never be handed out again.
/// - [`frame_ptr`](Machine::frame_ptr) returns a pointer through which the
///   whole frame may be read and written, and the mapping is linear:
///   `frame_ptr(f.next(1)) == frame_ptr(f).add(PAGE_SIZE)`.
/// - The TLB methods only require that interrupts are masked on the calling
///   CPU (the core brackets them with `splhigh`/`splx`).
pub unsafe trait Machine: Sync {
    /// Total physical RAM, in bytes.
    fn ram_size(&self) -> Length;

    /// First physical address not claimed by boot-time bump allocation.
    /// Everything below is kernel code and boot structures that live forever.
    fn first_free(&self) -> PhysAddress;

    /// Bump-allocate `npages` pages of physical memory. Only legal before
    /// the frame table is published; the memory can never be returned.
    fn steal_pages(&self, npages: u32) -> PhysAddress;

    /// Pointer to `frame`'s memory through the kernel's direct map.
    fn frame_ptr(&self, frame: Frame) -> *mut u8;

    /// Install an entry into a hardware-chosen TLB slot. Interrupts must be
    /// masked.
    fn tlb_random(&self, entryhi: u32, entrylo: u32);

    /// Install an entry into TLB slot `slot`. Interrupts must be masked.
    fn tlb_write(&self, entryhi: u32, entrylo: u32, slot: u32);

    /// Mask interrupts on the current CPU, returning the previous level.
    fn splhigh(&self) -> Spl;

    /// Restore the interrupt level saved by [`splhigh`](Machine::splhigh).
    fn splx(&self, old: Spl);
}
