//! Kernel-facing surface of the virtual memory subsystem.
//!
//! Thin wrappers around the one [`VmCell`] instance. The process layer owns
//! each [`AddressSpace`] value and passes the current one in; the VM keys
//! its global page table by the address space's identity.

use crate::mips::MipsMachine;

use shared::memory::{Frame, Length, VirtAddress};
use shared::vm::{AddressSpace, FrameStats, VmCell, VmError};

static MACHINE: MipsMachine = MipsMachine::new();
static VM: VmCell<'static> = VmCell::new(&MACHINE);

/// Brings the VM up. Called once from boot, after the platform layer knows
/// the RAM size; every kernel allocation before this point bump-allocates.
pub fn bootstrap() {
    VM.bootstrap();
    log::info!("vm: online");
}

/// TLB miss and write-protection handler, called from the trap code with
/// the raw fault code.
pub fn fault(
    current: Option<&AddressSpace>,
    faulttype: u32,
    faultaddress: u32,
) -> Result<(), VmError> {
    VM.fault(current, faulttype, VirtAddress::from_raw(faultaddress))
}

/// Cross-CPU TLB invalidation request. This kernel runs uniprocessor and
/// flushes on context switch, so nothing should ever send one.
pub fn tlb_shootdown() -> ! {
    panic!("vm: unexpected TLB shootdown request");
}

/// Allocates kernel pages; the backing store for the kernel heap.
pub fn alloc_kpages(npages: u32) -> Result<VirtAddress, VmError> {
    VM.alloc_kpages(npages)
}

pub fn free_kpages(kvaddr: VirtAddress) {
    VM.free_kpages(kvaddr)
}

pub fn frame_ref_count(frame: Frame) -> u32 {
    VM.vm().frame_ref_count(frame)
}

/// Adjusts a frame's reference count by `delta`. Dropping the last
/// reference frees the frame.
pub fn frame_ref_mod(frame: Frame, delta: i32) {
    let vm = VM.vm();
    for _ in 0..delta.unsigned_abs() {
        if delta > 0 {
            vm.frame_ref_inc(frame);
        } else {
            vm.frame_ref_dec(frame);
        }
    }
}

pub fn frame_stats() -> FrameStats {
    VM.vm().frame_stats()
}

pub fn as_create() -> AddressSpace {
    VM.vm().create_addrspace()
}

pub fn as_copy(old: &AddressSpace) -> Result<AddressSpace, VmError> {
    VM.vm().copy_addrspace(old)
}

pub fn as_destroy(space: AddressSpace) {
    VM.vm().destroy_addrspace(space)
}

pub fn as_activate() {
    VM.vm().activate()
}

pub fn as_deactivate() {
    VM.vm().deactivate()
}

pub fn as_define_region(
    space: &mut AddressSpace,
    vaddr: u32,
    size: u32,
    readable: bool,
    writable: bool,
    executable: bool,
) -> Result<(), VmError> {
    space.define_region(
        VirtAddress::from_raw(vaddr),
        Length::from_raw(size),
        readable,
        writable,
        executable,
    )
}

/// Defines the stack region and returns the initial stack pointer.
pub fn as_define_stack(space: &mut AddressSpace) -> Result<VirtAddress, VmError> {
    space.define_stack()
}

pub fn as_prepare_load(space: &mut AddressSpace) {
    space.prepare_load()
}

pub fn as_complete_load(space: &mut AddressSpace) {
    VM.vm().complete_load(space)
}
