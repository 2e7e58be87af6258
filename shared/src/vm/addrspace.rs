//! Per-process address spaces.
//!
//! An address space is just an id plus a list of virtual regions; its pages
//! live in the global page table, keyed by the id. The process layer owns
//! the `AddressSpace` value itself and hands it to the VM on every call, so
//! no lock is needed here: region lists are only touched by their owning
//! process.

use super::VmError;
use crate::memory::{Length, VirtAddress, VirtExtent, PAGE_SIZE, USER_TOP};

use alloc::vec::Vec;

/// Initial user stack pointer; the stack grows down from the top of user
/// space.
pub const USER_STACK_TOP: VirtAddress = USER_TOP;

/// Fixed size of the user stack region.
pub const STACK_SIZE: Length = Length::from_raw(64 * 4096);

/// Identity of an address space, used as the page-table hash key.
///
/// Ids are assigned from a counter and never reused, so a translation left
/// behind by a dead address space can never be mistaken for a live one's.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AsId(u32);

impl AsId {
    /// Owner of vacant page-table slots; no real address space has this id.
    pub(crate) const NONE: AsId = AsId(0);

    pub(crate) const fn from_raw(raw: u32) -> AsId {
        AsId(raw)
    }

    pub(crate) const fn raw(self) -> u32 {
        self.0
    }
}

bitflags::bitflags! {
    /// Region permissions. The values match ELF segment flags.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Perms: u32 {
        const EXEC = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
        /// Write permission was granted temporarily so the executable
        /// loader can fill a read-only region; taken back (along with
        /// `WRITE`) once the load completes.
        const LOAD_OVERLAY = 1 << 3;
    }
}

/// A contiguous range of user pages with one set of permissions. Never
/// resized or split once defined.
#[derive(Clone, Copy, Debug)]
pub struct Region {
    extent: VirtExtent,
    perms: Perms,
}

impl Region {
    pub fn extent(&self) -> VirtExtent {
        self.extent
    }

    pub fn perms(&self) -> Perms {
        self.perms
    }

    pub fn is_writable(&self) -> bool {
        self.perms.contains(Perms::WRITE)
    }

    /// The region as inherited by a forked child: identical, except that a
    /// load-time write grant is not carried over.
    pub(crate) fn forked(self) -> Region {
        let mut perms = self.perms;
        if perms.contains(Perms::LOAD_OVERLAY) {
            perms.remove(Perms::WRITE | Perms::LOAD_OVERLAY);
        }
        Region {
            extent: self.extent,
            perms,
        }
    }
}

pub struct AddressSpace {
    id: AsId,
    regions: Vec<Region>,
}

impl AddressSpace {
    pub(crate) fn new(id: AsId) -> AddressSpace {
        AddressSpace {
            id,
            regions: Vec::new(),
        }
    }

    pub fn id(&self) -> AsId {
        self.id
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Defines a region covering `[vaddr, vaddr + size)`, expanded outward
    /// to page boundaries.
    ///
    /// Fails with `BadArg` for an empty region, a region reaching past the
    /// top of user space, or one overlapping an existing region.
    pub fn define_region(
        &mut self,
        vaddr: VirtAddress,
        size: Length,
        readable: bool,
        writable: bool,
        executable: bool,
    ) -> Result<(), VmError> {
        if size.is_zero() {
            return Err(VmError::BadArg);
        }

        // Align the region. First the base, folding the cut-off head into
        // the length, then the length itself.
        let head = vaddr.as_raw() & (PAGE_SIZE.as_raw() - 1);
        let base = vaddr.align_down(PAGE_SIZE.as_raw());
        let length = size
            .as_raw()
            .checked_add(head)
            .and_then(|l| l.checked_add(PAGE_SIZE.as_raw() - 1))
            .ok_or(VmError::BadArg)?
            & !(PAGE_SIZE.as_raw() - 1);

        let end = base.as_raw().checked_add(length).ok_or(VmError::BadArg)?;
        if end > USER_TOP.as_raw() {
            return Err(VmError::BadArg);
        }

        let extent = VirtExtent::new(base, Length::from_raw(length));
        if self.regions.iter().any(|r| r.extent.has_overlap(extent)) {
            return Err(VmError::BadArg);
        }

        let mut perms = Perms::empty();
        if readable {
            perms |= Perms::READ;
        }
        if writable {
            perms |= Perms::WRITE;
        }
        if executable {
            perms |= Perms::EXEC;
        }

        self.push_region(Region { extent, perms })
    }

    /// Defines the fixed-size stack region and returns the initial stack
    /// pointer.
    pub fn define_stack(&mut self) -> Result<VirtAddress, VmError> {
        self.define_region(USER_STACK_TOP - STACK_SIZE, STACK_SIZE, true, true, false)?;
        Ok(USER_STACK_TOP)
    }

    /// Temporarily makes every read-only region writable so the executable
    /// loader can fill it. Regions already writable are untouched.
    pub fn prepare_load(&mut self) {
        for region in &mut self.regions {
            if !region.perms.contains(Perms::WRITE) {
                region.perms |= Perms::WRITE | Perms::LOAD_OVERLAY;
            }
        }
    }

    /// The region containing `vaddr`, if any. The most recently defined
    /// region is checked first.
    pub fn region_containing(&self, vaddr: VirtAddress) -> Option<&Region> {
        self.regions
            .iter()
            .rev()
            .find(|r| r.extent.contains_address(vaddr))
    }

    pub(crate) fn push_region(&mut self, region: Region) -> Result<(), VmError> {
        self.regions
            .try_reserve(1)
            .map_err(|_| VmError::OutOfMemory)?;
        self.regions.push(region);
        Ok(())
    }

    /// Takes back every load-time write grant, restoring the regions'
    /// original permissions. Returns the extents that were demoted so the
    /// caller can revoke write access on their page-table entries too.
    pub(crate) fn take_load_demotions(&mut self) -> Vec<VirtExtent> {
        let mut demoted = Vec::new();
        for region in &mut self.regions {
            if region.perms.contains(Perms::LOAD_OVERLAY) {
                region.perms.remove(Perms::WRITE | Perms::LOAD_OVERLAY);
                demoted.push(region.extent);
            }
        }
        demoted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> AddressSpace {
        AddressSpace::new(AsId::from_raw(1))
    }

    #[test]
    fn regions_are_expanded_to_page_boundaries() {
        let mut space = space();
        space
            .define_region(
                VirtAddress::from_raw(0x0040_0123),
                Length::from_raw(0x2000),
                true,
                false,
                true,
            )
            .unwrap();

        let region = space
            .region_containing(VirtAddress::from_raw(0x0040_0000))
            .unwrap();
        assert_eq!(region.extent().address(), VirtAddress::from_raw(0x0040_0000));
        // 0x123 + 0x2000 rounds up to three pages.
        assert_eq!(region.extent().length(), Length::from_raw(0x3000));
        assert_eq!(region.perms(), Perms::READ | Perms::EXEC);
    }

    #[test]
    fn containment_is_per_byte() {
        let mut space = space();
        space
            .define_region(
                VirtAddress::from_raw(0x0040_0000),
                Length::from_raw(0x1000),
                true,
                true,
                false,
            )
            .unwrap();

        assert!(space
            .region_containing(VirtAddress::from_raw(0x0040_0FFF))
            .is_some());
        assert!(space
            .region_containing(VirtAddress::from_raw(0x0040_1000))
            .is_none());
        assert!(space
            .region_containing(VirtAddress::from_raw(0x003F_FFFF))
            .is_none());
    }

    #[test]
    fn empty_and_overflowing_regions_are_rejected() {
        let mut space = space();
        assert_eq!(
            space.define_region(
                VirtAddress::from_raw(0x1000),
                Length::from_raw(0),
                true,
                true,
                false
            ),
            Err(VmError::BadArg)
        );
        // Reaches past the top of user space.
        assert_eq!(
            space.define_region(
                VirtAddress::from_raw(0x7FFF_F000),
                Length::from_raw(0x2000),
                true,
                true,
                false
            ),
            Err(VmError::BadArg)
        );
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let mut space = space();
        space
            .define_region(
                VirtAddress::from_raw(0x0040_0000),
                Length::from_raw(0x3000),
                true,
                false,
                true,
            )
            .unwrap();

        assert_eq!(
            space.define_region(
                VirtAddress::from_raw(0x0040_2000),
                Length::from_raw(0x1000),
                true,
                true,
                false
            ),
            Err(VmError::BadArg)
        );
        // Adjacent is fine.
        space
            .define_region(
                VirtAddress::from_raw(0x0040_3000),
                Length::from_raw(0x1000),
                true,
                true,
                false
            )
            .unwrap();
    }

    #[test]
    fn stack_sits_just_below_the_top_of_user_space() {
        let mut space = space();
        let sp = space.define_stack().unwrap();
        assert_eq!(sp, VirtAddress::from_raw(0x8000_0000));

        let region = space
            .region_containing(VirtAddress::from_raw(0x7FFF_FFFC))
            .unwrap();
        assert_eq!(region.extent().address(), VirtAddress::from_raw(0x7FC0_0000));
        assert_eq!(region.extent().length(), STACK_SIZE);
        assert_eq!(region.perms(), Perms::READ | Perms::WRITE);
    }

    #[test]
    fn load_grant_round_trip_restores_permissions() {
        let mut space = space();
        space
            .define_region(
                VirtAddress::from_raw(0x0040_0000),
                Length::from_raw(0x1000),
                true,
                false,
                true,
            )
            .unwrap();
        space
            .define_region(
                VirtAddress::from_raw(0x1000_0000),
                Length::from_raw(0x1000),
                true,
                true,
                false,
            )
            .unwrap();

        space.prepare_load();
        let text = space
            .region_containing(VirtAddress::from_raw(0x0040_0000))
            .unwrap();
        assert!(text.perms().contains(Perms::WRITE | Perms::LOAD_OVERLAY));
        let data = space
            .region_containing(VirtAddress::from_raw(0x1000_0000))
            .unwrap();
        assert_eq!(data.perms(), Perms::READ | Perms::WRITE);

        let demoted = space.take_load_demotions();
        assert_eq!(demoted.len(), 1);
        assert_eq!(demoted[0].address(), VirtAddress::from_raw(0x0040_0000));
        let text = space
            .region_containing(VirtAddress::from_raw(0x0040_0000))
            .unwrap();
        assert_eq!(text.perms(), Perms::READ | Perms::EXEC);
    }

    #[test]
    fn forked_regions_do_not_inherit_load_grants() {
        let mut space = space();
        space
            .define_region(
                VirtAddress::from_raw(0x0040_0000),
                Length::from_raw(0x1000),
                true,
                false,
                true,
            )
            .unwrap();
        space.prepare_load();

        let forked = space.regions()[0].forked();
        assert_eq!(forked.perms(), Perms::READ | Perms::EXEC);
    }
}
