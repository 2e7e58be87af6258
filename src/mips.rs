//! Bindings to the machine-dependent primitives.
//!
//! The CPU and RAM services the VM builds on are implemented by the
//! platform layer (TLB access, interrupt masking, and the boot-time RAM
//! accounting). This module wraps them as a [`Machine`] for the VM core.

use shared::machine::{Machine, Spl};
use shared::memory::{Frame, Length, PhysAddress, DIRECT_MAP_BASE};

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "mips", target_arch = "mips64"))] {
        extern "C" {
            fn ram_getsize() -> u32;
            fn ram_getfirstfree() -> u32;
            fn ram_stealmem(npages: u32) -> u32;
            fn tlb_random(entryhi: u32, entrylo: u32);
            fn tlb_write(entryhi: u32, entrylo: u32, index: u32);
            fn splhigh() -> u32;
            fn splx(level: u32);
        }
    } else {
        // Host builds (static analysis, the workspace test run) never talk
        // to the hardware; these definitions exist so the crate still
        // links there.
        unsafe fn ram_getsize() -> u32 {
            unimplemented!("host build")
        }
        unsafe fn ram_getfirstfree() -> u32 {
            unimplemented!("host build")
        }
        unsafe fn ram_stealmem(_npages: u32) -> u32 {
            unimplemented!("host build")
        }
        unsafe fn tlb_random(_entryhi: u32, _entrylo: u32) {
            unimplemented!("host build")
        }
        unsafe fn tlb_write(_entryhi: u32, _entrylo: u32, _index: u32) {
            unimplemented!("host build")
        }
        unsafe fn splhigh() -> u32 {
            unimplemented!("host build")
        }
        unsafe fn splx(_level: u32) {
            unimplemented!("host build")
        }
    }
}

/// The real machine.
pub struct MipsMachine(());

impl MipsMachine {
    pub const fn new() -> MipsMachine {
        MipsMachine(())
    }
}

// SAFETY: the platform primitives report RAM truthfully and `ram_stealmem`
// hands out pages exactly once; the kernel segment maps all of physical
// memory linearly at `DIRECT_MAP_BASE`, which makes `frame_ptr` valid and
// linear across frames.
unsafe impl Machine for MipsMachine {
    fn ram_size(&self) -> Length {
        Length::from_raw(unsafe { ram_getsize() })
    }

    fn first_free(&self) -> PhysAddress {
        PhysAddress::from_raw(unsafe { ram_getfirstfree() })
    }

    fn steal_pages(&self, npages: u32) -> PhysAddress {
        PhysAddress::from_raw(unsafe { ram_stealmem(npages) })
    }

    fn frame_ptr(&self, frame: Frame) -> *mut u8 {
        let kvaddr = DIRECT_MAP_BASE.as_raw() + frame.start().as_raw();
        kvaddr as usize as *mut u8
    }

    fn tlb_random(&self, entryhi: u32, entrylo: u32) {
        unsafe { tlb_random(entryhi, entrylo) }
    }

    fn tlb_write(&self, entryhi: u32, entrylo: u32, slot: u32) {
        unsafe { tlb_write(entryhi, entrylo, slot) }
    }

    fn splhigh(&self) -> Spl {
        Spl(unsafe { splhigh() })
    }

    fn splx(&self, old: Spl) {
        unsafe { splx(old.0) }
    }
}
