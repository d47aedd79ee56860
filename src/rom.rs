// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! ROM ranges and the built-in ROM write handler.
//!
//! A ROM range carries its image in privately allocated pages. A shadowed
//! ROM additionally keeps one RAM page per ROM page; the protection mode
//! decides which of the two descriptors is installed in the directory for
//! reads and where writes go. The descriptor that is not installed is
//! parked here and swapped in on protection changes, so firmware can flip
//! between the pristine image and its shadowed copy without recopying.

use log::{debug, trace};
use vm_memory::{Address, GuestAddress};

use crate::handler::{HandlerCallback, HandlerEntry, HandlerKind};
use crate::page::{
    HandlerActivity, Page, PageState, PageType, WritePromotion, PAGE_OFFSET_MASK, PAGE_SHIFT,
    PAGE_SIZE,
};
use crate::physmem::PhysInner;
use crate::range::RamRange;
use crate::status::AccessStatus;
use crate::Error;

/// Per-range ROM protection mode: what reads return and where writes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RomProt {
    /// Reads return the ROM image; writes are dropped silently.
    ReadRomWriteIgnore,
    /// Reads return the shadow RAM; writes are dropped silently.
    ReadRamWriteIgnore,
    /// Reads return the ROM image; writes land in the shadow RAM.
    ReadRomWriteRam,
    /// Reads return the shadow RAM; writes land in the shadow RAM.
    ReadRamWriteRam,
}

impl RomProt {
    /// True when the shadow RAM descriptor is the one installed for reads.
    pub fn reads_shadow(self) -> bool {
        matches!(self, RomProt::ReadRamWriteIgnore | RomProt::ReadRamWriteRam)
    }

    /// True when writes are routed to the shadow RAM instead of dropped.
    pub fn writes_shadow(self) -> bool {
        matches!(self, RomProt::ReadRomWriteRam | RomProt::ReadRamWriteRam)
    }

    /// True when the mode requires a shadowed registration at all.
    pub fn needs_shadow(self) -> bool {
        self.reads_shadow() || self.writes_shadow()
    }
}

/// Strategy for stepping over an instruction whose only effect is a write
/// that the current ROM protection drops anyway. Returning `None` sends
/// the instruction to the emulator.
pub trait InstructionSkipper: Send + Sync {
    /// Length of the instruction in `instr` when it is simple enough to
    /// skip without emulation.
    fn try_fast_skip(&self, instr: &[u8]) -> Option<usize>;
}

/// Skipper for configurations that always emulate.
pub struct NullSkipper;

impl InstructionSkipper for NullSkipper {
    fn try_fast_skip(&self, _instr: &[u8]) -> Option<usize> {
        None
    }
}

/// Per-page ROM tracking.
pub(crate) struct RomPage {
    /// The descriptor currently not installed in the directory: the shadow
    /// RAM page while reads come from the ROM, the ROM page otherwise.
    pub parked: Page,
    /// The shadow has been written to since registration.
    pub written_to: bool,
}

/// One registered ROM.
pub(crate) struct RomRange {
    pub base: u64,
    pub size: u64,
    pub desc: String,
    pub shadowed: bool,
    pub prot: RomProt,
    pub pages: Vec<RomPage>,
}

impl RomRange {
    pub fn contains(&self, addr: u64) -> bool {
        addr.wrapping_sub(self.base) < self.size
    }

    pub fn page_index(&self, addr: u64) -> usize {
        debug_assert!(self.contains(addr));
        (addr.wrapping_sub(self.base) >> PAGE_SHIFT) as usize
    }
}

impl PhysInner {
    /// Register a ROM at `base` with the given image. The image is copied
    /// into privately allocated pages; `shadowed` additionally prepares a
    /// parked RAM page per ROM page for protection modes that need one.
    /// Starts out in [`RomProt::ReadRomWriteIgnore`].
    pub(crate) fn register_rom(
        &mut self,
        base: GuestAddress,
        image: &[u8],
        shadowed: bool,
        desc: &str,
    ) -> Result<(), Error> {
        if image.is_empty() || image.len() as u64 & PAGE_OFFSET_MASK != 0 {
            return Err(Error::InvalidParameter);
        }
        let size = image.len() as u64;
        let count = (size >> PAGE_SHIFT) as usize;

        self.directory
            .insert(RamRange::new(base, size, PageType::Rom, desc)?)?;

        let rom_index = self.roms.len();
        if let Err(e) = self.handlers.register(HandlerEntry {
            first: base.raw_value(),
            last: base.raw_value() + size - 1,
            kind: HandlerKind::Write,
            keep_lock: true,
            user: rom_index as u64,
            desc: desc.to_owned(),
            callback: HandlerCallback::RomWrite { rom_index },
        }) {
            self.directory.remove(base.raw_value());
            return Err(e);
        }

        // Copy the image into private pages. On exhaustion the whole
        // registration is unwound; a half-populated ROM is useless.
        for i in 0..count {
            let id = match self.take_handy_page() {
                Ok(id) => id,
                Err(e) => {
                    let _ = self.handlers.unregister(base);
                    self.directory.remove(base.raw_value());
                    self.counters.private_pages -= i as u64;
                    return Err(e);
                }
            };
            let frame_start = i * PAGE_SIZE as usize;
            self.store
                .frame_mut(id)
                .copy_from_slice(&image[frame_start..frame_start + PAGE_SIZE as usize]);
            self.counters.private_pages += 1;

            let addr = base.raw_value() + (i as u64) * PAGE_SIZE;
            let page = self
                .directory
                .find_page_mut(addr)
                .expect("range registered above");
            page.set_backing(id, PageState::Allocated);
            page.set_handler_activity(HandlerActivity::Write);
            self.notify_nem_for_page(addr);
        }

        let pages = (0..count)
            .map(|_| {
                let mut parked = Page::new_zero(PageType::RomShadow);
                parked.set_handler_activity(HandlerActivity::Write);
                RomPage {
                    parked,
                    written_to: false,
                }
            })
            .collect();
        if shadowed {
            // Shadow pages stay zero pages until first written.
            self.counters.zero_pages += count as u64;
        }
        self.roms.push(RomRange {
            base: base.raw_value(),
            size,
            desc: desc.to_owned(),
            shadowed,
            prot: RomProt::ReadRomWriteIgnore,
            pages,
        });
        debug!("registered {count}-page ROM '{desc}' at {:#x}", base.raw_value());
        Ok(())
    }

    /// The built-in write handler for ROM ranges. Runs under the global
    /// lock. Depending on the protection the bytes are dropped or routed
    /// to the shadow RAM page, allocating it on first touch.
    pub(crate) fn rom_write(
        &mut self,
        rom_index: usize,
        gc_phys: u64,
        src: &[u8],
    ) -> Result<AccessStatus, Error> {
        let (prot, base) = {
            let rom = &self.roms[rom_index];
            debug_assert!(rom.contains(gc_phys));
            (rom.prot, rom.base)
        };
        if !prot.writes_shadow() {
            trace!("write to ROM at {gc_phys:#x} dropped ({prot:?})");
            return Ok(AccessStatus::Ok);
        }

        let idx = ((gc_phys - base) >> PAGE_SHIFT) as usize;
        let reads_shadow = prot.reads_shadow();

        // The shadow descriptor is either installed in the directory or
        // parked on the ROM range.
        let mut page = if reads_shadow {
            self.directory
                .find_page(gc_phys)
                .ok_or(Error::InvalidGuestAddress)?
                .clone()
        } else {
            self.roms[rom_index].pages[idx].parked.clone()
        };
        debug_assert_eq!(page.page_type(), PageType::RomShadow);

        let mut status = AccessStatus::Ok;
        match page.write_promotion()? {
            WritePromotion::Replace => {
                status = self.replace_page_backing(&mut page, gc_phys, reads_shadow)?;
            }
            WritePromotion::LiftWriteMonitor => page.set_state(PageState::Allocated),
            WritePromotion::None => {}
        }

        let id = page.id().expect("shadow page allocated above");
        let off = (gc_phys & PAGE_OFFSET_MASK) as usize;
        self.store.frame_mut(id)[off..off + src.len()].copy_from_slice(src);

        if reads_shadow {
            *self
                .directory
                .find_page_mut(gc_phys)
                .expect("page looked up above") = page;
            self.directory.invalidate_page(gc_phys);
        } else {
            self.roms[rom_index].pages[idx].parked = page;
        }
        self.roms[rom_index].pages[idx].written_to = true;
        Ok(status)
    }

    /// Change the protection of the ROM registered at `base`. Flipping the
    /// read source swaps the installed and parked descriptors page by page
    /// and notifies the translation layers.
    pub(crate) fn set_rom_protection(
        &mut self,
        base: GuestAddress,
        prot: RomProt,
    ) -> Result<AccessStatus, Error> {
        let rom_index = self
            .roms
            .iter()
            .position(|r| r.base == base.raw_value())
            .ok_or(Error::InvalidGuestAddress)?;
        let (old, shadowed, size) = {
            let rom = &self.roms[rom_index];
            (rom.prot, rom.shadowed, rom.size)
        };
        if prot == old {
            return Ok(AccessStatus::Ok);
        }
        if !shadowed && prot.needs_shadow() {
            return Err(Error::InvalidParameter);
        }

        let mut status = AccessStatus::Ok;
        if prot.reads_shadow() != old.reads_shadow() {
            let count = (size >> PAGE_SHIFT) as usize;
            for i in 0..count {
                let addr = base.raw_value() + (i as u64) * PAGE_SIZE;
                {
                    let installed = self
                        .directory
                        .find_page_mut(addr)
                        .expect("ROM range is registered");
                    std::mem::swap(installed, &mut self.roms[rom_index].pages[i].parked);
                }
                self.directory.invalidate_page(addr);
                if self.shadow_pool.on_identity_changing(GuestAddress(addr)) {
                    status = status.merge(AccessStatus::ShadowSyncPending);
                }
                self.notify_nem_for_page(addr);
            }
        }
        self.roms[rom_index].prot = prot;
        debug!(
            "ROM at {:#x} protection {:?} -> {:?}",
            base.raw_value(),
            old,
            prot
        );
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protection_mode_properties() {
        assert!(!RomProt::ReadRomWriteIgnore.reads_shadow());
        assert!(!RomProt::ReadRomWriteIgnore.writes_shadow());
        assert!(!RomProt::ReadRomWriteIgnore.needs_shadow());
        assert!(RomProt::ReadRomWriteRam.writes_shadow());
        assert!(!RomProt::ReadRomWriteRam.reads_shadow());
        assert!(RomProt::ReadRamWriteRam.reads_shadow());
        assert!(RomProt::ReadRamWriteRam.writes_shadow());
        assert!(RomProt::ReadRamWriteIgnore.needs_shadow());
    }

    #[test]
    fn null_skipper_always_emulates() {
        assert!(NullSkipper.try_fast_skip(&[0x88, 0x07]).is_none());
    }
}
