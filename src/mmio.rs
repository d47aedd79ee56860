// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! MMIO and MMIO2 region registration, plus the built-in dirty tracker.
//!
//! Plain MMIO is trapped programmed I/O: the pages are placeholders and
//! every access goes to the registered device handler. MMIO2 is
//! memory-backed device memory (framebuffers and the like): pages are
//! allocated eagerly and accessed like RAM, optionally through a write
//! tracker that keeps a per-page dirty bitmap for display refresh or
//! migration.

use std::sync::Arc;

use log::debug;
use vm_memory::{Address, GuestAddress};

use crate::handler::{HandlerCallback, HandlerEntry, HandlerKind, PhysHandler};
use crate::page::{HandlerActivity, PageState, PageType, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE};
use crate::physmem::PhysInner;
use crate::range::RamRange;
use crate::Error;

/// One registered MMIO2 region.
pub(crate) struct Mmio2Region {
    pub base: u64,
    pub size: u64,
    pub desc: String,
    pub track_dirty: bool,
    /// Per-page dirty flags, maintained by the built-in write tracker.
    pub dirty: Vec<bool>,
}

impl Mmio2Region {
    pub fn contains(&self, addr: u64) -> bool {
        addr.wrapping_sub(self.base) < self.size
    }

    pub fn page_index(&self, addr: u64) -> usize {
        debug_assert!(self.contains(addr));
        (addr.wrapping_sub(self.base) >> PAGE_SHIFT) as usize
    }
}

impl PhysInner {
    /// Register a trapped MMIO range serviced by `handler`. The pages stay
    /// unbacked placeholders; the handler sees every read and write.
    pub(crate) fn register_mmio(
        &mut self,
        base: GuestAddress,
        size: u64,
        handler: Arc<dyn PhysHandler>,
        user: u64,
        desc: &str,
    ) -> Result<(), Error> {
        self.directory
            .insert(RamRange::new(base, size, PageType::Mmio, desc)?)?;
        if let Err(e) = self.handlers.register(HandlerEntry {
            first: base.raw_value(),
            last: base.raw_value() + size - 1,
            kind: HandlerKind::All,
            keep_lock: false,
            user,
            desc: desc.to_owned(),
            callback: HandlerCallback::External(handler),
        }) {
            self.directory.remove(base.raw_value());
            return Err(e);
        }

        let count = (size >> PAGE_SHIFT) as usize;
        self.counters.zero_pages += count as u64;
        for i in 0..count {
            let addr = base.raw_value() + (i as u64) * PAGE_SIZE;
            self.directory
                .find_page_mut(addr)
                .expect("range registered above")
                .set_handler_activity(HandlerActivity::All);
            self.notify_nem_for_page(addr);
        }
        debug!("registered MMIO '{desc}' at {:#x}", base.raw_value());
        Ok(())
    }

    /// Register a memory-backed MMIO2 region, eagerly allocating every
    /// page. With `track_dirty` the built-in write tracker is armed and
    /// maintains the region's dirty bitmap.
    pub(crate) fn register_mmio2(
        &mut self,
        base: GuestAddress,
        size: u64,
        track_dirty: bool,
        desc: &str,
    ) -> Result<(), Error> {
        self.directory
            .insert(RamRange::new(base, size, PageType::Mmio2, desc)?)?;
        let count = (size >> PAGE_SHIFT) as usize;

        let region_index = self.mmio2.len();
        if track_dirty {
            if let Err(e) = self.handlers.register(HandlerEntry {
                first: base.raw_value(),
                last: base.raw_value() + size - 1,
                kind: HandlerKind::Write,
                keep_lock: true,
                user: region_index as u64,
                desc: desc.to_owned(),
                callback: HandlerCallback::Mmio2Dirty { region_index },
            }) {
                self.directory.remove(base.raw_value());
                return Err(e);
            }
        }

        // Device memory has no lazy-allocation semantics; back it now.
        for i in 0..count {
            let id = match self.take_handy_page() {
                Ok(id) => id,
                Err(e) => {
                    if track_dirty {
                        let _ = self.handlers.unregister(base);
                    }
                    self.directory.remove(base.raw_value());
                    self.counters.private_pages -= i as u64;
                    return Err(e);
                }
            };
            self.counters.private_pages += 1;
            let addr = base.raw_value() + (i as u64) * PAGE_SIZE;
            let page = self
                .directory
                .find_page_mut(addr)
                .expect("range registered above");
            page.set_backing(id, PageState::Allocated);
            if track_dirty {
                page.set_handler_activity(HandlerActivity::Write);
            }
            self.notify_nem_for_page(addr);
        }

        self.mmio2.push(Mmio2Region {
            base: base.raw_value(),
            size,
            desc: desc.to_owned(),
            track_dirty,
            dirty: vec![false; count],
        });
        debug!(
            "registered {count}-page MMIO2 '{desc}' at {:#x}, dirty tracking {}",
            base.raw_value(),
            if track_dirty { "on" } else { "off" }
        );
        Ok(())
    }

    /// The built-in MMIO2 write tracker. Marks the touched page dirty and
    /// disarms interception for it, so subsequent writes to the same page
    /// go straight to the backing until the bitmap is harvested. The
    /// caller performs the actual copy.
    pub(crate) fn mmio2_mark_dirty(&mut self, region_index: usize, gc_phys: u64) {
        let region = &mut self.mmio2[region_index];
        debug_assert!(region.contains(gc_phys));
        let idx = region.page_index(gc_phys);
        region.dirty[idx] = true;

        let page_base = gc_phys & !PAGE_OFFSET_MASK;
        if let Some(page) = self.directory.find_page_mut(page_base) {
            if page.handler_activity() == HandlerActivity::Write {
                page.set_handler_activity(HandlerActivity::Disabled);
                self.notify_nem_for_page(page_base);
            }
        }
    }

    /// Harvest and clear the dirty bitmap of the MMIO2 region at `base`,
    /// re-arming the write tracker for every disarmed page.
    pub(crate) fn query_and_reset_dirty(
        &mut self,
        base: GuestAddress,
    ) -> Result<Vec<bool>, Error> {
        let region_index = self
            .mmio2
            .iter()
            .position(|r| r.base == base.raw_value())
            .ok_or(Error::InvalidGuestAddress)?;
        if !self.mmio2[region_index].track_dirty {
            return Err(Error::InvalidParameter);
        }
        let count = self.mmio2[region_index].dirty.len();
        let bitmap = std::mem::replace(&mut self.mmio2[region_index].dirty, vec![false; count]);

        for i in 0..count {
            let addr = base.raw_value() + (i as u64) * PAGE_SIZE;
            let disarmed = self
                .directory
                .find_page(addr)
                .map(|p| p.handler_activity() == HandlerActivity::Disabled)
                .unwrap_or(false);
            if disarmed {
                self.directory
                    .find_page_mut(addr)
                    .unwrap()
                    .set_handler_activity(HandlerActivity::Write);
                self.notify_nem_for_page(addr);
            }
        }
        Ok(bitmap)
    }
}
