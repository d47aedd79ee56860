// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! The physical memory manager: the read/write façade over ranges, page
//! states and handlers, plus the page mapping lock manager.
//!
//! All mutable state lives in [`PhysInner`] behind one mutex. The copy
//! loops hold it for the duration of an access and drop it only around
//! external handler callbacks that did not ask to keep it; every iteration
//! re-resolves the page it touches, so nothing is assumed to survive such
//! a window.

use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, trace};
use vm_memory::{Address, GuestAddress};

use crate::chunk::{ChunkStore, PageId};
use crate::config::PhysConfig;
use crate::handler::{HandlerCallback, HandlerEntry, HandlerKind, HandlerRegistry, PhysHandler};
use crate::mmio::Mmio2Region;
use crate::nem::{NemBridge, NullNemBridge};
use crate::page::{
    HandlerActivity, PageState, PageType, WritePromotion, LARGE_PAGE_SIZE, PAGE_OFFSET_MASK,
    PAGE_SHIFT, PAGE_SIZE,
};
use crate::pool::{HandyPages, HostPageProvider, NullShadowPool, ShadowPageTablePool};
use crate::range::{RamRange, RangeDirectory};
use crate::rom::{InstructionSkipper, NullSkipper, RomProt, RomRange};
use crate::status::{AccessOrigin, AccessStatus, HandlerOutcome};
use crate::{nem, Error};

/// Yield the global lock after this many pages during bulk releases.
const BULK_RELEASE_YIELD_EVERY: usize = 1024;

/// Guest virtual to guest physical translation, injected by the paging
/// unit. The walker maintains accessed/dirty bits itself.
pub trait GuestWalker: Send + Sync {
    fn translate(&self, gva: u64, write: bool) -> Result<GuestAddress, Error>;
}

/// Walker for flat configurations without guest paging.
pub struct IdentityWalker;

impl GuestWalker for IdentityWalker {
    fn translate(&self, gva: u64, _write: bool) -> Result<GuestAddress, Error> {
        Ok(GuestAddress(gva))
    }
}

/// Page accounting, one instance per manager.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PhysCounters {
    pub zero_pages: u64,
    pub private_pages: u64,
    pub shared_pages: u64,
    pub ballooned_pages: u64,
    pub monitored_pages: u64,
    pub written_to_pages: u64,
    pub large_pages: u64,
    pub locked_pages: u64,
}

/// Everything behind the global lock.
pub(crate) struct PhysInner {
    pub(crate) directory: RangeDirectory,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) store: ChunkStore,
    pub(crate) pool: HandyPages,
    pub(crate) counters: PhysCounters,
    pub(crate) config: PhysConfig,
    pub(crate) roms: Vec<RomRange>,
    pub(crate) mmio2: Vec<Mmio2Region>,
    pub(crate) provider: Box<dyn HostPageProvider>,
    pub(crate) shadow_pool: Box<dyn ShadowPageTablePool>,
    pub(crate) nem: Box<dyn NemBridge>,
}

impl PhysInner {
    pub(crate) fn register_ram(
        &mut self,
        base: GuestAddress,
        size: u64,
        desc: &str,
    ) -> Result<(), Error> {
        self.directory
            .insert(RamRange::new(base, size, PageType::Ram, desc)?)?;
        self.counters.zero_pages += size >> PAGE_SHIFT;
        debug!(
            "registered {:#x} byte RAM range '{desc}' at {:#x}",
            size,
            base.raw_value()
        );
        Ok(())
    }

    /// Recompute and push the backend protection for one page after its
    /// activity or backing changed.
    pub(crate) fn notify_nem_for_page(&mut self, page_base: u64) {
        debug_assert_eq!(page_base & PAGE_OFFSET_MASK, 0);
        let Some(page) = self.directory.find_page(page_base) else {
            return;
        };
        let (ty, activity, host, state) = (
            page.page_type(),
            page.handler_activity(),
            page.host_addr(),
            page.nem_state(),
        );
        let new_state = self.nem.notify_mapping_changed(
            GuestAddress(page_base),
            host,
            nem::protection_for(ty, activity),
            ty,
            state,
        );
        self.directory
            .find_page_mut(page_base)
            .unwrap()
            .set_nem_state(new_state);
    }

    /// Whatever the page at `gc_phys` needs before a plain write can land:
    /// nothing, lifting a write monitor, or replacing the backing.
    pub(crate) fn make_writable(&mut self, gc_phys: u64) -> Result<AccessStatus, Error> {
        let promotion = self
            .directory
            .find_page(gc_phys)
            .ok_or(Error::InvalidGuestAddress)?
            .write_promotion()?;
        match promotion {
            WritePromotion::None => Ok(AccessStatus::Ok),
            WritePromotion::LiftWriteMonitor => {
                self.lift_write_monitor(gc_phys & !PAGE_OFFSET_MASK);
                Ok(AccessStatus::Ok)
            }
            WritePromotion::Replace => self.allocate_page_for_write(gc_phys),
        }
    }

    /// WriteMonitored -> Allocated. The backing is untouched; only the
    /// monitor and the accounting change.
    pub(crate) fn lift_write_monitor(&mut self, page_base: u64) {
        let page = self
            .directory
            .find_page_mut(page_base)
            .expect("monitored page exists");
        debug_assert_eq!(page.state(), PageState::WriteMonitored);
        page.set_state(PageState::Allocated);
        self.counters.monitored_pages -= 1;
        self.counters.written_to_pages += 1;
        self.notify_nem_for_page(page_base);
        trace!("write monitor lifted at {page_base:#x}");
    }

    /// Copy out of the page backing. Unbacked states read as zeros, except
    /// MMIO placeholders which read as all ones like unassigned space.
    pub(crate) fn read_from_backing(&mut self, gc_phys: u64, dest: &mut [u8]) {
        let off = (gc_phys & PAGE_OFFSET_MASK) as usize;
        debug_assert!(off + dest.len() <= PAGE_SIZE as usize);
        let Some(page) = self.directory.find_page(gc_phys) else {
            dest.fill(0xff);
            return;
        };
        let (ty, state, id) = (page.page_type(), page.state(), page.id());
        match state {
            PageState::Zero | PageState::Ballooned => {
                if ty.is_mmio_or_alias() {
                    dest.fill(0xff);
                } else {
                    dest.fill(0);
                }
            }
            _ => {
                let id = id.expect("backed state has an identity");
                dest.copy_from_slice(&self.store.frame(id)[off..off + dest.len()]);
            }
        }
    }

    /// Promote if needed, then copy into the page backing.
    pub(crate) fn write_to_backing(
        &mut self,
        gc_phys: u64,
        src: &[u8],
    ) -> Result<AccessStatus, Error> {
        let off = (gc_phys & PAGE_OFFSET_MASK) as usize;
        debug_assert!(off + src.len() <= PAGE_SIZE as usize);
        let status = self.make_writable(gc_phys)?;
        let id = self
            .directory
            .find_page(gc_phys)
            .expect("page made writable")
            .id()
            .expect("writable page has a backing");
        self.store.frame_mut(id)[off..off + src.len()].copy_from_slice(src);
        Ok(status)
    }

    /// Apply `activity` to every existing page in the interval and tell
    /// the translation layers. Arming a handler breaks up any large
    /// mapping it touches.
    pub(crate) fn update_handler_coverage(
        &mut self,
        first: u64,
        last: u64,
        activity: HandlerActivity,
    ) {
        let mut addr = first;
        let mut demoted_window = None;
        while addr <= last {
            if self.directory.find_page(addr).is_some() {
                if activity != HandlerActivity::None {
                    let window = addr & !(LARGE_PAGE_SIZE - 1);
                    if demoted_window != Some(window) {
                        self.demote_large_page(addr);
                        demoted_window = Some(window);
                    }
                }
                self.directory
                    .find_page_mut(addr)
                    .unwrap()
                    .set_handler_activity(activity);
                self.notify_nem_for_page(addr);
            }
            match addr.checked_add(PAGE_SIZE) {
                Some(next) => addr = next,
                None => break,
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn register_external_handler(
        &mut self,
        first: GuestAddress,
        last: GuestAddress,
        kind: HandlerKind,
        keep_lock: bool,
        user: u64,
        desc: &str,
        handler: Arc<dyn PhysHandler>,
    ) -> Result<(), Error> {
        self.handlers.register(HandlerEntry {
            first: first.raw_value(),
            last: last.raw_value(),
            kind,
            keep_lock,
            user,
            desc: desc.to_owned(),
            callback: HandlerCallback::External(handler),
        })?;
        self.update_handler_coverage(first.raw_value(), last.raw_value(), kind.activity());
        debug!(
            "registered {kind:?} handler '{desc}' for {:#x}..={:#x}",
            first.raw_value(),
            last.raw_value()
        );
        Ok(())
    }

    pub(crate) fn unregister_external_handler(&mut self, first: GuestAddress) -> Result<(), Error> {
        let entry = self.handlers.unregister(first)?;
        self.update_handler_coverage(entry.first, entry.last, HandlerActivity::None);
        debug!(
            "unregistered handler '{}' for {:#x}..={:#x}",
            entry.desc, entry.first, entry.last
        );
        Ok(())
    }

    /// Disable interception for one page of a registration. The page goes
    /// back to direct access until the registration is reset.
    pub(crate) fn handler_temp_off(
        &mut self,
        first: GuestAddress,
        page_addr: GuestAddress,
    ) -> Result<(), Error> {
        let entry = self
            .handlers
            .get(first.raw_value())
            .ok_or(Error::HandlerNotFound)?;
        if !entry.covers(page_addr.raw_value()) {
            return Err(Error::InvalidParameter);
        }
        let page_base = page_addr.raw_value() & !PAGE_OFFSET_MASK;
        let page = self
            .directory
            .find_page_mut(page_base)
            .ok_or(Error::InvalidGuestAddress)?;
        if page.handler_activity() != HandlerActivity::Disabled {
            page.set_handler_activity(HandlerActivity::Disabled);
            self.notify_nem_for_page(page_base);
        }
        Ok(())
    }

    /// Re-arm every page of a registration, undoing any temp-offs.
    pub(crate) fn handler_reset(&mut self, first: GuestAddress) -> Result<(), Error> {
        let (efirst, elast, activity) = {
            let entry = self
                .handlers
                .get(first.raw_value())
                .ok_or(Error::HandlerNotFound)?;
            (entry.first, entry.last, entry.kind.activity())
        };
        self.update_handler_coverage(efirst, elast, activity);
        Ok(())
    }

    pub(crate) fn write_monitor_page(&mut self, addr: GuestAddress) -> Result<(), Error> {
        let page_base = addr.raw_value() & !PAGE_OFFSET_MASK;
        let state = self
            .directory
            .find_page(page_base)
            .ok_or(Error::InvalidGuestAddress)?
            .state();
        match state {
            PageState::WriteMonitored => Ok(()),
            PageState::Allocated => {
                self.directory
                    .find_page_mut(page_base)
                    .unwrap()
                    .set_state(PageState::WriteMonitored);
                self.counters.monitored_pages += 1;
                self.demote_large_page(page_base);
                self.notify_nem_for_page(page_base);
                Ok(())
            }
            _ => Err(Error::InvalidParameter),
        }
    }

    pub(crate) fn balloon_pages(&mut self, pages: &[GuestAddress]) -> Result<AccessStatus, Error> {
        // Validate everything first; a bad entry must leave every page
        // untouched.
        for addr in pages {
            let page = self
                .directory
                .find_page(addr.raw_value())
                .ok_or(Error::InvalidGuestAddress)?;
            if page.page_type() != PageType::Ram
                || page.is_locked()
                || !matches!(page.state(), PageState::Zero | PageState::Allocated)
            {
                return Err(Error::InvalidParameter);
            }
        }
        let mut status = AccessStatus::Ok;
        for addr in pages {
            let page_base = addr.raw_value() & !PAGE_OFFSET_MASK;
            let page = self.directory.find_page_mut(page_base).unwrap();
            match page.state() {
                PageState::Zero => self.counters.zero_pages -= 1,
                PageState::Allocated => self.counters.private_pages -= 1,
                _ => unreachable!("validated above"),
            }
            page.clear_backing(PageState::Ballooned);
            self.counters.ballooned_pages += 1;
            self.directory.invalidate_page(page_base);
            if self.shadow_pool.on_identity_changing(GuestAddress(page_base)) {
                status = status.merge(AccessStatus::ShadowSyncPending);
            }
            self.notify_nem_for_page(page_base);
        }
        debug!("ballooned {} pages", pages.len());
        Ok(status)
    }

    pub(crate) fn deflate_pages(&mut self, pages: &[GuestAddress]) -> Result<(), Error> {
        for addr in pages {
            let page = self
                .directory
                .find_page(addr.raw_value())
                .ok_or(Error::InvalidGuestAddress)?;
            if page.state() != PageState::Ballooned {
                return Err(Error::InvalidParameter);
            }
        }
        for addr in pages {
            let page_base = addr.raw_value() & !PAGE_OFFSET_MASK;
            self.directory
                .find_page_mut(page_base)
                .unwrap()
                .clear_backing(PageState::Zero);
            self.counters.ballooned_pages -= 1;
            self.counters.zero_pages += 1;
            self.directory.invalidate_page(page_base);
            self.notify_nem_for_page(page_base);
        }
        debug!("deflated {} pages", pages.len());
        Ok(())
    }

    /// Swap the private backing of a RAM page for a host-deduplicated
    /// shared page. The deduplication module owns `id`.
    pub(crate) fn install_shared_page(
        &mut self,
        addr: GuestAddress,
        id: PageId,
    ) -> Result<AccessStatus, Error> {
        let page_base = addr.raw_value() & !PAGE_OFFSET_MASK;
        let page = self
            .directory
            .find_page(page_base)
            .ok_or(Error::InvalidGuestAddress)?;
        if page.page_type() != PageType::Ram || page.is_locked() {
            return Err(Error::InvalidParameter);
        }
        match page.state() {
            PageState::Allocated => self.counters.private_pages -= 1,
            PageState::Zero => self.counters.zero_pages -= 1,
            _ => return Err(Error::InvalidParameter),
        }
        self.store.ensure_chunk(id);
        self.directory
            .find_page_mut(page_base)
            .unwrap()
            .set_backing(id, PageState::Shared);
        self.counters.shared_pages += 1;
        self.directory.invalidate_page(page_base);
        let mut status = AccessStatus::Ok;
        if self.shadow_pool.on_identity_changing(GuestAddress(page_base)) {
            status = AccessStatus::ShadowSyncPending;
        }
        self.notify_nem_for_page(page_base);
        Ok(status)
    }

    pub(crate) fn release_read_mapping_locked(&mut self, mapping: &PageReadMapping) {
        if let Some(page) = self.directory.find_page_mut(mapping.page_base) {
            let was_locked = page.is_locked();
            page.unlock_read();
            if was_locked && !page.is_locked() {
                self.counters.locked_pages -= 1;
            }
        } else {
            error!(
                "read mapping released for unknown page {:#x}",
                mapping.page_base
            );
        }
        if let Some(id) = mapping.id {
            self.store.release(id);
        }
    }

    pub(crate) fn release_write_mapping_locked(&mut self, mapping: &PageWriteMapping) {
        let mut lift = false;
        if let Some(page) = self.directory.find_page_mut(mapping.page_base) {
            let was_locked = page.is_locked();
            let write_unlocked = page.unlock_write();
            if was_locked && !page.is_locked() {
                self.counters.locked_pages -= 1;
            }
            // A monitor armed while the mapping was out was bypassed by
            // every store through it; account the page as written.
            lift = write_unlocked && page.state() == PageState::WriteMonitored;
        } else {
            error!(
                "write mapping released for unknown page {:#x}",
                mapping.page_base
            );
        }
        if lift {
            self.lift_write_monitor(mapping.page_base);
        }
        self.store.release(mapping.id);
    }
}

/// A held read mapping of one guest page. Must be given back through
/// [`PhysMemoryManager::release_read_mapping`]; consuming it there makes a
/// double release unrepresentable.
pub struct PageReadMapping {
    page_base: u64,
    id: Option<PageId>,
    ptr: NonNull<u8>,
}

// SAFETY: the pointer targets either the static zero frame or a chunk
// buffer pinned by the mapping reference taken at creation.
unsafe impl Send for PageReadMapping {}

impl PageReadMapping {
    pub fn address(&self) -> GuestAddress {
        GuestAddress(self.page_base)
    }

    /// The mapped page contents. Valid until the mapping is released.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the backing is pinned for the lifetime of the mapping.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), PAGE_SIZE as usize) }
    }
}

/// A held write mapping of one guest page. The page was made writable
/// before the mapping was handed out.
pub struct PageWriteMapping {
    page_base: u64,
    id: PageId,
    ptr: NonNull<u8>,
}

// SAFETY: see PageReadMapping; write mappings never target the zero frame.
unsafe impl Send for PageWriteMapping {}

impl PageWriteMapping {
    pub fn address(&self) -> GuestAddress {
        GuestAddress(self.page_base)
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the backing is pinned for the lifetime of the mapping.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), PAGE_SIZE as usize) }
    }

    /// Mutable view of the mapped page. Mappings of the same page alias;
    /// callers coordinate concurrent writers the same way the guest does.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the backing is pinned and this mapping holds a write
        // lock on the page.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), PAGE_SIZE as usize) }
    }
}

/// How an intercepting entry is dispatched, resolved under the lock.
enum Dispatch {
    External(Arc<dyn PhysHandler>, u64, bool),
    Rom(usize),
    Mmio2(usize),
}

/// The guest physical memory manager.
pub struct PhysMemoryManager {
    inner: Mutex<PhysInner>,
    walker: Box<dyn GuestWalker>,
    skipper: Box<dyn InstructionSkipper>,
}

impl PhysMemoryManager {
    pub fn new(
        config: PhysConfig,
        provider: Box<dyn HostPageProvider>,
        shadow_pool: Box<dyn ShadowPageTablePool>,
        nem: Box<dyn NemBridge>,
        walker: Box<dyn GuestWalker>,
        skipper: Box<dyn InstructionSkipper>,
    ) -> Self {
        PhysMemoryManager {
            inner: Mutex::new(PhysInner {
                directory: RangeDirectory::new(),
                handlers: HandlerRegistry::new(),
                store: ChunkStore::new(),
                pool: HandyPages::new(&config),
                counters: PhysCounters::default(),
                config,
                roms: Vec::new(),
                mmio2: Vec::new(),
                provider,
                shadow_pool,
                nem,
            }),
            walker,
            skipper,
        }
    }

    /// Manager with no-op collaborators for the backends that are absent.
    pub fn with_defaults(config: PhysConfig, provider: Box<dyn HostPageProvider>) -> Self {
        Self::new(
            config,
            provider,
            Box::new(NullShadowPool),
            Box::new(NullNemBridge),
            Box::new(IdentityWalker),
            Box::new(NullSkipper),
        )
    }

    fn lock(&self) -> MutexGuard<'_, PhysInner> {
        self.inner.lock().unwrap()
    }

    pub fn register_ram(&self, base: GuestAddress, size: u64, desc: &str) -> Result<(), Error> {
        self.lock().register_ram(base, size, desc)
    }

    pub fn register_rom(
        &self,
        base: GuestAddress,
        image: &[u8],
        shadowed: bool,
        desc: &str,
    ) -> Result<(), Error> {
        self.lock().register_rom(base, image, shadowed, desc)
    }

    pub fn set_rom_protection(
        &self,
        base: GuestAddress,
        prot: RomProt,
    ) -> Result<AccessStatus, Error> {
        self.lock().set_rom_protection(base, prot)
    }

    pub fn register_mmio(
        &self,
        base: GuestAddress,
        size: u64,
        handler: Arc<dyn PhysHandler>,
        user: u64,
        desc: &str,
    ) -> Result<(), Error> {
        self.lock().register_mmio(base, size, handler, user, desc)
    }

    pub fn register_mmio2(
        &self,
        base: GuestAddress,
        size: u64,
        track_dirty: bool,
        desc: &str,
    ) -> Result<(), Error> {
        self.lock().register_mmio2(base, size, track_dirty, desc)
    }

    pub fn query_and_reset_dirty(&self, base: GuestAddress) -> Result<Vec<bool>, Error> {
        self.lock().query_and_reset_dirty(base)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn register_handler(
        &self,
        first: GuestAddress,
        last: GuestAddress,
        kind: HandlerKind,
        keep_lock: bool,
        user: u64,
        desc: &str,
        handler: Arc<dyn PhysHandler>,
    ) -> Result<(), Error> {
        self.lock()
            .register_external_handler(first, last, kind, keep_lock, user, desc, handler)
    }

    pub fn unregister_handler(&self, first: GuestAddress) -> Result<(), Error> {
        self.lock().unregister_external_handler(first)
    }

    pub fn handler_temp_off(
        &self,
        first: GuestAddress,
        page_addr: GuestAddress,
    ) -> Result<(), Error> {
        self.lock().handler_temp_off(first, page_addr)
    }

    pub fn handler_reset(&self, first: GuestAddress) -> Result<(), Error> {
        self.lock().handler_reset(first)
    }

    /// Read guest physical memory. Unassigned space reads as all ones;
    /// handler statuses are merged worst-wins and an interrupting status
    /// stops the walk with the rest of `dest` set to ones.
    pub fn phys_read(
        &self,
        addr: GuestAddress,
        dest: &mut [u8],
        origin: AccessOrigin,
    ) -> Result<AccessStatus, Error> {
        if dest.is_empty() {
            return Ok(AccessStatus::Ok);
        }
        let mut status = AccessStatus::Ok;
        let mut cursor = addr.raw_value();
        let mut off = 0usize;
        let mut inner = self.lock();
        while off < dest.len() {
            let remaining = dest.len() - off;

            if inner.directory.find_range(cursor).is_none() {
                let gap = match inner.directory.find_range_at_or_above(cursor) {
                    Some(r) => ((r.base().raw_value() - cursor).min(remaining as u64)) as usize,
                    None => remaining,
                };
                dest[off..off + gap].fill(0xff);
                off += gap;
                match cursor.checked_add(gap as u64) {
                    Some(next) => cursor = next,
                    None => {
                        dest[off..].fill(0xff);
                        break;
                    }
                }
                continue;
            }

            let in_page = ((PAGE_SIZE - (cursor & PAGE_OFFSET_MASK)) as usize).min(remaining);
            let activity = inner
                .directory
                .find_page(cursor)
                .expect("range resolved")
                .handler_activity();

            if activity.intercepts_reads() {
                if !origin.tolerates_deferred_status() {
                    return Err(Error::AccessHandlerHit);
                }
                // Built-in handlers never intercept reads, so only an
                // external registration can get here.
                let dispatch = inner.handlers.lookup(cursor).and_then(|e| match &e.callback {
                    HandlerCallback::External(h) => {
                        Some((h.clone(), e.user, e.keep_lock))
                    }
                    _ => None,
                });
                if let Some((handler, user, keep_lock)) = dispatch {
                    let outcome = if keep_lock {
                        handler.read(
                            GuestAddress(cursor),
                            &mut dest[off..off + in_page],
                            origin,
                            user,
                        )
                    } else {
                        drop(inner);
                        let outcome = handler.read(
                            GuestAddress(cursor),
                            &mut dest[off..off + in_page],
                            origin,
                            user,
                        );
                        inner = self.lock();
                        outcome
                    };
                    match outcome {
                        HandlerOutcome::UseDefault => {
                            inner.read_from_backing(cursor, &mut dest[off..off + in_page])
                        }
                        HandlerOutcome::Done(s) => {
                            if !s.valid_for_read() {
                                debug_assert!(false, "invalid read handler status {s:?}");
                                error!(
                                    "handler returned invalid read status {s:?} at {cursor:#x}"
                                );
                                return Err(Error::InvalidHandlerStatus);
                            }
                            status = status.merge(s);
                            if s.interrupts_access() {
                                dest[off + in_page..].fill(0xff);
                                return Ok(status);
                            }
                        }
                    }
                } else {
                    inner.read_from_backing(cursor, &mut dest[off..off + in_page]);
                }
            } else {
                inner.read_from_backing(cursor, &mut dest[off..off + in_page]);
            }

            off += in_page;
            match cursor.checked_add(in_page as u64) {
                Some(next) => cursor = next,
                None => {
                    if off < dest.len() {
                        dest[off..].fill(0xff);
                    }
                    break;
                }
            }
        }
        Ok(status)
    }

    /// Write guest physical memory. Writes to unassigned space are
    /// discarded; the walk splits at page and handler interval boundaries
    /// and merges the statuses worst-wins.
    pub fn phys_write(
        &self,
        addr: GuestAddress,
        src: &[u8],
        origin: AccessOrigin,
    ) -> Result<AccessStatus, Error> {
        if src.is_empty() {
            return Ok(AccessStatus::Ok);
        }
        let mut status = AccessStatus::Ok;
        let mut cursor = addr.raw_value();
        let mut off = 0usize;
        let mut inner = self.lock();
        while off < src.len() {
            let remaining = src.len() - off;

            if inner.directory.find_range(cursor).is_none() {
                let gap = match inner.directory.find_range_at_or_above(cursor) {
                    Some(r) => ((r.base().raw_value() - cursor).min(remaining as u64)) as usize,
                    None => remaining,
                };
                trace!("write to unassigned {cursor:#x} discarded ({gap} bytes)");
                off += gap;
                match cursor.checked_add(gap as u64) {
                    Some(next) => cursor = next,
                    None => break,
                }
                continue;
            }

            let in_page = ((PAGE_SIZE - (cursor & PAGE_OFFSET_MASK)) as usize).min(remaining);
            let activity = inner
                .directory
                .find_page(cursor)
                .expect("range resolved")
                .handler_activity();
            let mut chunk_len = in_page;

            if activity.intercepts_writes() {
                // The interval ahead of the cursor decides how far this
                // iteration reaches: up to the end of the covering entry,
                // or plainly up to where the next entry starts.
                let ahead = inner
                    .handlers
                    .lookup_at_or_above(cursor)
                    .map(|e| (e.first, e.last));
                match ahead {
                    Some((first, last)) if first <= cursor => {
                        chunk_len = (((last - cursor) + 1).min(in_page as u64)) as usize;
                        let entry = inner.handlers.get(first).expect("entry just looked up");
                        let dispatch = match &entry.callback {
                            HandlerCallback::External(h) => {
                                Dispatch::External(h.clone(), entry.user, entry.keep_lock)
                            }
                            HandlerCallback::RomWrite { rom_index } => Dispatch::Rom(*rom_index),
                            HandlerCallback::Mmio2Dirty { region_index } => {
                                Dispatch::Mmio2(*region_index)
                            }
                        };
                        match dispatch {
                            Dispatch::External(handler, user, keep_lock) => {
                                if !origin.tolerates_deferred_status() {
                                    return Err(Error::AccessHandlerHit);
                                }
                                let outcome = if keep_lock {
                                    handler.write(
                                        GuestAddress(cursor),
                                        &src[off..off + chunk_len],
                                        origin,
                                        user,
                                    )
                                } else {
                                    drop(inner);
                                    let outcome = handler.write(
                                        GuestAddress(cursor),
                                        &src[off..off + chunk_len],
                                        origin,
                                        user,
                                    );
                                    inner = self.lock();
                                    outcome
                                };
                                match outcome {
                                    HandlerOutcome::UseDefault => {
                                        let s = inner
                                            .write_to_backing(cursor, &src[off..off + chunk_len])?;
                                        status = status.merge(s);
                                    }
                                    HandlerOutcome::Done(s) => {
                                        if !s.valid_for_write() {
                                            debug_assert!(
                                                false,
                                                "invalid write handler status {s:?}"
                                            );
                                            error!(
                                                "handler returned invalid write status {s:?} at {cursor:#x}"
                                            );
                                            return Err(Error::InvalidHandlerStatus);
                                        }
                                        status = status.merge(s);
                                        if s.interrupts_access() {
                                            return Ok(status);
                                        }
                                    }
                                }
                            }
                            Dispatch::Rom(rom_index) => {
                                let s =
                                    inner.rom_write(rom_index, cursor, &src[off..off + chunk_len])?;
                                status = status.merge(s);
                            }
                            Dispatch::Mmio2(region_index) => {
                                inner.mmio2_mark_dirty(region_index, cursor);
                                let s =
                                    inner.write_to_backing(cursor, &src[off..off + chunk_len])?;
                                status = status.merge(s);
                            }
                        }
                    }
                    Some((first, _)) if first - cursor < in_page as u64 => {
                        // Plain part up to where the interval starts.
                        chunk_len = (first - cursor) as usize;
                        let s = inner.write_to_backing(cursor, &src[off..off + chunk_len])?;
                        status = status.merge(s);
                    }
                    _ => {
                        // Stale summary; no entry actually covers this page.
                        let s = inner.write_to_backing(cursor, &src[off..off + in_page])?;
                        status = status.merge(s);
                    }
                }
            } else {
                let s = inner.write_to_backing(cursor, &src[off..off + in_page])?;
                status = status.merge(s);
            }

            off += chunk_len;
            match cursor.checked_add(chunk_len as u64) {
                Some(next) => cursor = next,
                None => break,
            }
        }
        Ok(status)
    }

    /// Read through a guest virtual address, translating per crossed page.
    pub fn phys_read_gva(
        &self,
        gva: u64,
        dest: &mut [u8],
        origin: AccessOrigin,
    ) -> Result<AccessStatus, Error> {
        let mut status = AccessStatus::Ok;
        let mut off = 0usize;
        while off < dest.len() {
            let va = gva
                .checked_add(off as u64)
                .ok_or(Error::InvalidGuestAddress)?;
            let pa = self.walker.translate(va, false)?;
            let in_page = ((PAGE_SIZE - (pa.raw_value() & PAGE_OFFSET_MASK)) as usize)
                .min(dest.len() - off);
            let s = self.phys_read(pa, &mut dest[off..off + in_page], origin)?;
            status = status.merge(s);
            if s.interrupts_access() {
                dest[off + in_page..].fill(0xff);
                return Ok(status);
            }
            off += in_page;
        }
        Ok(status)
    }

    /// Write through a guest virtual address, translating per crossed page.
    pub fn phys_write_gva(
        &self,
        gva: u64,
        src: &[u8],
        origin: AccessOrigin,
    ) -> Result<AccessStatus, Error> {
        let mut status = AccessStatus::Ok;
        let mut off = 0usize;
        while off < src.len() {
            let va = gva
                .checked_add(off as u64)
                .ok_or(Error::InvalidGuestAddress)?;
            let pa = self.walker.translate(va, true)?;
            let in_page =
                ((PAGE_SIZE - (pa.raw_value() & PAGE_OFFSET_MASK)) as usize).min(src.len() - off);
            let s = self.phys_write(pa, &src[off..off + in_page], origin)?;
            status = status.merge(s);
            if s.interrupts_access() {
                return Ok(status);
            }
            off += in_page;
        }
        Ok(status)
    }

    /// Fast path for a write fault on a ROM page. When the current
    /// protection drops writes anyway, skipping the faulting instruction
    /// is all there is to do; everything else goes to the emulator, which
    /// redoes the access through [`Self::phys_write`].
    pub fn handle_rom_write_fault(
        &self,
        gc_phys: GuestAddress,
        instr: &[u8],
    ) -> Result<AccessStatus, Error> {
        {
            let inner = self.lock();
            let rom = inner
                .roms
                .iter()
                .find(|r| r.contains(gc_phys.raw_value()))
                .ok_or(Error::InvalidGuestAddress)?;
            if rom.prot.writes_shadow() {
                return Ok(AccessStatus::EmulateInstruction);
            }
        }
        match self.skipper.try_fast_skip(instr) {
            Some(len) => {
                trace!(
                    "skipped {len}-byte write to protected ROM at {:#x}",
                    gc_phys.raw_value()
                );
                Ok(AccessStatus::Ok)
            }
            None => Ok(AccessStatus::EmulateInstruction),
        }
    }

    /// Map one page for reading. Zero and ballooned pages map the shared
    /// zero frame.
    pub fn map_for_read(&self, addr: GuestAddress) -> Result<PageReadMapping, Error> {
        let mut inner = self.lock();
        let page_base = addr.raw_value() & !PAGE_OFFSET_MASK;
        let (ty, state, id) = {
            let page = inner
                .directory
                .find_page(page_base)
                .ok_or(Error::InvalidGuestAddress)?;
            (page.page_type(), page.state(), page.id())
        };
        if ty.is_mmio_or_alias() {
            return Err(Error::PageReserved);
        }
        let (ptr, id) = match state {
            PageState::Zero | PageState::Ballooned => (ChunkStore::zero_frame_ptr(), None),
            _ => {
                let id = id.expect("backed page");
                inner.store.retain(id);
                (inner.store.frame_ptr(id), Some(id))
            }
        };
        let page = inner.directory.find_page_mut(page_base).unwrap();
        let was_locked = page.is_locked();
        page.lock_for_read();
        if !was_locked {
            inner.counters.locked_pages += 1;
        }
        Ok(PageReadMapping { page_base, id, ptr })
    }

    /// Map one page for writing, promoting its backing first if needed.
    pub fn map_for_write(
        &self,
        addr: GuestAddress,
    ) -> Result<(PageWriteMapping, AccessStatus), Error> {
        let mut inner = self.lock();
        let page_base = addr.raw_value() & !PAGE_OFFSET_MASK;
        let ty = inner
            .directory
            .find_page(page_base)
            .ok_or(Error::InvalidGuestAddress)?
            .page_type();
        if ty.is_mmio_or_alias() {
            return Err(Error::PageReserved);
        }
        let status = inner.make_writable(page_base)?;
        let id = inner
            .directory
            .find_page(page_base)
            .unwrap()
            .id()
            .expect("writable page has a backing");
        inner.store.retain(id);
        let ptr = inner.store.frame_ptr(id);
        let page = inner.directory.find_page_mut(page_base).unwrap();
        let was_locked = page.is_locked();
        page.lock_for_write();
        if !was_locked {
            inner.counters.locked_pages += 1;
        }
        Ok((PageWriteMapping { page_base, id, ptr }, status))
    }

    pub fn release_read_mapping(&self, mapping: PageReadMapping) {
        self.lock().release_read_mapping_locked(&mapping);
    }

    pub fn release_write_mapping(&self, mapping: PageWriteMapping) {
        self.lock().release_write_mapping_locked(&mapping);
    }

    /// Release many read mappings, yielding the global lock periodically
    /// so long teardowns do not starve the access paths.
    pub fn bulk_release_read_mappings(&self, mappings: Vec<PageReadMapping>) {
        let mut inner = self.lock();
        for (i, mapping) in mappings.iter().enumerate() {
            if i != 0 && i % BULK_RELEASE_YIELD_EVERY == 0 {
                drop(inner);
                inner = self.lock();
            }
            inner.release_read_mapping_locked(mapping);
        }
    }

    pub fn bulk_release_write_mappings(&self, mappings: Vec<PageWriteMapping>) {
        let mut inner = self.lock();
        for (i, mapping) in mappings.iter().enumerate() {
            if i != 0 && i % BULK_RELEASE_YIELD_EVERY == 0 {
                drop(inner);
                inner = self.lock();
            }
            inner.release_write_mapping_locked(mapping);
        }
    }

    /// Return RAM pages to the host. Pages must be plain unlocked RAM.
    pub fn balloon_pages(&self, pages: &[GuestAddress]) -> Result<AccessStatus, Error> {
        self.lock().balloon_pages(pages)
    }

    /// Take ballooned pages back; they come back as zero pages.
    pub fn deflate_pages(&self, pages: &[GuestAddress]) -> Result<(), Error> {
        self.lock().deflate_pages(pages)
    }

    /// Arm write monitoring on an allocated RAM page.
    pub fn write_monitor_page(&self, addr: GuestAddress) -> Result<(), Error> {
        self.lock().write_monitor_page(addr)
    }

    /// Swap a RAM page's private backing for a deduplicated shared page.
    pub fn install_shared_page(
        &self,
        addr: GuestAddress,
        id: PageId,
    ) -> Result<AccessStatus, Error> {
        self.lock().install_shared_page(addr, id)
    }

    /// Re-enable a large mapping that monitoring forced apart, if every
    /// page of the window is eligible again.
    pub fn recheck_large_page(&self, addr: GuestAddress) -> bool {
        self.lock().recheck_large_page(addr.raw_value())
    }

    /// True when some registered range covers `addr`.
    pub fn is_gc_phys_valid(&self, addr: GuestAddress) -> bool {
        self.lock().directory.find_page(addr.raw_value()).is_some()
    }

    /// True when `addr` is plain RAM (not ROM, MMIO or an alias).
    pub fn is_gc_phys_normal(&self, addr: GuestAddress) -> bool {
        self.lock()
            .directory
            .find_page(addr.raw_value())
            .map(|p| p.page_type() == PageType::Ram)
            .unwrap_or(false)
    }

    pub fn counters(&self) -> PhysCounters {
        self.lock().counters
    }
}
