// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! The replacement/allocation engine.
//!
//! Zero, shared and write-monitored pages are promoted to private
//! allocated pages on first write. Promotions draw from a bounded pool of
//! pre-zeroed "handy" pages so the write-fault hot path never waits on the
//! host allocator; the pool is replenished from the [`HostPageProvider`]
//! when it drops below its low-water mark. A 2MB window of all-Zero RAM
//! can be promoted in one step to a large page.

use log::{debug, error, trace, warn};
use vm_memory::GuestAddress;

use crate::chunk::PageId;
use crate::config::PhysConfig;
use crate::nem;
use crate::page::{
    HandlerActivity, Page, PageState, PageType, PdeType, LARGE_PAGE_SIZE, PAGES_PER_LARGE_PAGE,
    PAGE_OFFSET_MASK, PAGE_SIZE,
};
use crate::physmem::PhysInner;
use crate::status::AccessStatus;
use crate::Error;

/// Why the host page provider could not deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider needs the caller to leave the current execution
    /// context (and retry) before it can allocate.
    MustYield,
    /// The host is out of memory.
    OutOfMemory,
}

/// Supplies zero-filled host pages, identified by [`PageId`].
pub trait HostPageProvider: Send {
    /// Hand out up to `count` pre-zeroed pages.
    fn replenish(&mut self, count: usize) -> Result<Vec<PageId>, ProviderError>;

    /// Hand out one chunk-aligned run of 512 contiguous pages for a large
    /// page. Providers without large page support report out-of-memory.
    fn allocate_large(&mut self) -> Result<PageId, ProviderError> {
        Err(ProviderError::OutOfMemory)
    }
}

/// The shadow/nested page table pool. It must drop any mapping of a page
/// whose backing identity is about to change.
pub trait ShadowPageTablePool: Send {
    /// Returns true when dependent translation caches must be flushed.
    fn on_identity_changing(&mut self, gc_phys: GuestAddress) -> bool;
}

/// Pool implementation for configurations without shadow paging.
pub struct NullShadowPool;

impl ShadowPageTablePool for NullShadowPool {
    fn on_identity_changing(&mut self, _gc_phys: GuestAddress) -> bool {
        false
    }
}

/// The bounded pool of ready pages.
pub(crate) struct HandyPages {
    pages: Vec<PageId>,
    capacity: usize,
    low_water: usize,
    no_memory_logged: bool,
}

impl HandyPages {
    pub fn new(config: &PhysConfig) -> Self {
        HandyPages {
            pages: Vec::with_capacity(config.handy_pages),
            capacity: config.handy_pages.max(1),
            low_water: config.handy_low_water,
            no_memory_logged: false,
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Make sure at least one handy page is available, replenishing from
    /// the provider when at or below the low-water mark. One attempt only;
    /// exhaustion is the scheduler's problem, not ours to retry.
    pub fn ensure(&mut self, provider: &mut dyn HostPageProvider) -> Result<(), Error> {
        if self.pages.len() > self.low_water {
            return Ok(());
        }
        match provider.replenish(self.capacity - self.pages.len()) {
            Ok(new) => {
                self.pages.extend(new);
                self.pages.truncate(self.capacity);
            }
            Err(ProviderError::MustYield) => {
                if self.pages.is_empty() {
                    debug!("handy page pool empty, yielding to replenish");
                    return Err(Error::MustYield);
                }
                // Still got some in reserve; the caller will be sent out
                // to replenish before they run out.
                trace!("handy page replenish deferred, {} left", self.pages.len());
            }
            Err(ProviderError::OutOfMemory) => {
                if self.pages.is_empty() {
                    if !self.no_memory_logged {
                        error!("no more handy pages, host is out of memory");
                        self.no_memory_logged = true;
                    }
                    return Err(Error::NoMemory);
                }
                warn!(
                    "host allocator failing, {} handy pages left",
                    self.pages.len()
                );
            }
        }
        if self.pages.is_empty() {
            if !self.no_memory_logged {
                error!("no more handy pages, host is out of memory");
                self.no_memory_logged = true;
            }
            return Err(Error::NoMemory);
        }
        self.no_memory_logged = false;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<PageId> {
        self.pages.pop()
    }
}

impl PhysInner {
    /// Pop one pre-zeroed page from the pool, replenishing first if
    /// needed, and make sure its chunk is mapped.
    pub(crate) fn take_handy_page(&mut self) -> Result<PageId, Error> {
        self.pool.ensure(self.provider.as_mut())?;
        let id = self.pool.pop().expect("pool ensured non-empty");
        self.store.ensure_chunk(id);
        Ok(id)
    }

    /// Replace the zero or shared backing of `page` (which lives at
    /// `gc_phys`) with a fresh private page. The descriptor is detached
    /// from whatever owns it; the caller writes it back and invalidates
    /// lookup caches on success. `visible` is false for descriptors that
    /// are not currently installed at `gc_phys` (a parked ROM shadow);
    /// those need no shadow pool or backend notification.
    pub(crate) fn replace_page_backing(
        &mut self,
        page: &mut Page,
        gc_phys: u64,
        visible: bool,
    ) -> Result<AccessStatus, Error> {
        debug_assert!(matches!(
            page.state(),
            PageState::Zero | PageState::Shared
        ));
        debug_assert!(!page.page_type().is_mmio_or_alias());

        // The backing is about to change; stale shadow mappings must go.
        let needs_flush = visible
            && self
                .shadow_pool
                .on_identity_changing(GuestAddress(gc_phys & !PAGE_OFFSET_MASK));

        if let Err(e) = self.pool.ensure(self.provider.as_mut()) {
            if needs_flush {
                trace!("flushing guest TLBs after aborted replacement");
            }
            return Err(e);
        }
        let new_id = self.pool.pop().expect("pool ensured non-empty");
        self.store.ensure_chunk(new_id);

        // Record what the previous identity was for the bookkeeping, and
        // grab shared content before the reference is dropped.
        let shared_copy = if page.state() == PageState::Shared {
            self.counters.shared_pages -= 1;
            debug!(
                "replacing shared page {:?} at {:#x} with {:?}",
                page.id(),
                gc_phys,
                new_id
            );
            page.id().map(|old| self.store.frame(old).to_vec())
        } else {
            self.counters.zero_pages -= 1;
            trace!("replacing zero page at {:#x} with {:?}", gc_phys, new_id);
            None
        };

        page.set_backing(new_id, PageState::Allocated);
        self.counters.private_pages += 1;

        // The writer must see the prior content.
        if let Some(content) = shared_copy {
            self.store.frame_mut(new_id).copy_from_slice(&content);
        }

        if needs_flush {
            trace!("flushing guest TLBs after page replacement");
        }

        if visible {
            let ty = page.page_type();
            let prot = nem::protection_for(ty, page.handler_activity());
            let nem_state = self.nem.notify_mapping_changed(
                GuestAddress(gc_phys & !PAGE_OFFSET_MASK),
                Some(new_id.host_addr()),
                prot,
                ty,
                page.nem_state(),
            );
            page.set_nem_state(nem_state);
        }

        Ok(if needs_flush {
            AccessStatus::ShadowSyncPending
        } else {
            AccessStatus::Ok
        })
    }

    /// Promote the page at `gc_phys` for writing: large page attempt first
    /// for eligible RAM, then single page replacement.
    pub(crate) fn allocate_page_for_write(&mut self, gc_phys: u64) -> Result<AccessStatus, Error> {
        let page_base = gc_phys & !PAGE_OFFSET_MASK;
        let ty = self
            .directory
            .find_page(gc_phys)
            .ok_or(Error::InvalidGuestAddress)?
            .page_type();

        if self.config.large_pages && ty == PageType::Ram {
            let window = gc_phys & !(LARGE_PAGE_SIZE - 1);
            let window_pde = self.directory.find_page(window).map(|p| p.pde_type());
            if window_pde == Some(PdeType::DontCare) {
                if let Some(status) = self.try_allocate_large_page(window) {
                    return Ok(status);
                }
                // Remember that this window cannot be a large page so we
                // don't rescan it on every fault.
                if let Some(base) = self.directory.find_page_mut(window) {
                    base.set_pde_type(PdeType::PageTable);
                }
            }
        }

        let mut page = self
            .directory
            .find_page(page_base)
            .ok_or(Error::InvalidGuestAddress)?
            .clone();
        let status = self.replace_page_backing(&mut page, page_base, true)?;
        page.set_pde_type(PdeType::PageTable);
        *self
            .directory
            .find_page_mut(page_base)
            .expect("page just looked up") = page;
        self.directory.invalidate_page(page_base);
        Ok(status)
    }

    /// Try to back a whole aligned 2MB window with one large page. Every
    /// one of the 512 pages must be RAM in state Zero; any violation
    /// aborts without touching a single descriptor.
    pub(crate) fn try_allocate_large_page(&mut self, window: u64) -> Option<AccessStatus> {
        debug_assert_eq!(window & (LARGE_PAGE_SIZE - 1), 0);

        for i in 0..PAGES_PER_LARGE_PAGE {
            let addr = window + (i as u64) * PAGE_SIZE;
            let page = self.directory.find_page(addr)?;
            if page.page_type() != PageType::Ram || page.state() != PageState::Zero {
                trace!(
                    "large page scan at {window:#x}: page {addr:#x} has wrong type/state, cancel"
                );
                return None;
            }
        }

        let base_id = match self.provider.allocate_large() {
            Ok(id) if id.is_chunk_aligned() => id,
            Ok(id) => {
                warn!("provider returned unaligned large page base {id:?}");
                return None;
            }
            Err(e) => {
                debug!("large page allocation failed ({e:?}), falling back to 4KB");
                return None;
            }
        };
        self.store.ensure_chunk(base_id);

        for i in 0..PAGES_PER_LARGE_PAGE {
            let addr = window + (i as u64) * PAGE_SIZE;
            let page = self
                .directory
                .find_page_mut(addr)
                .expect("window scanned above");
            page.set_backing(PageId::new(base_id.raw() + i as u32), PageState::Allocated);
            if i == 0 {
                page.set_pde_type(PdeType::LargePage);
            }
        }
        self.counters.zero_pages -= PAGES_PER_LARGE_PAGE as u64;
        self.counters.private_pages += PAGES_PER_LARGE_PAGE as u64;
        self.counters.large_pages += 1;
        self.directory.flush_tlbs();

        for i in 0..PAGES_PER_LARGE_PAGE {
            let addr = window + (i as u64) * PAGE_SIZE;
            let (ty, activity, state) = {
                let page = self.directory.find_page(addr).unwrap();
                (page.page_type(), page.handler_activity(), page.nem_state())
            };
            let new_state = self.nem.notify_mapping_changed(
                GuestAddress(addr),
                Some(PageId::new(base_id.raw() + i as u32).host_addr()),
                nem::protection_for(ty, activity),
                ty,
                state,
            );
            self.directory
                .find_page_mut(addr)
                .unwrap()
                .set_nem_state(new_state);
        }

        debug!("large page allocated for window {window:#x}");
        Some(AccessStatus::Ok)
    }

    /// Re-validate a window whose large mapping was disabled by
    /// fine-grained write monitoring: all 512 pages must be privately
    /// allocated with no active handlers before the large mapping may be
    /// re-enabled. Returns true when re-enabled.
    pub(crate) fn recheck_large_page(&mut self, gc_phys: u64) -> bool {
        let window = gc_phys & !(LARGE_PAGE_SIZE - 1);
        let Some(base) = self.directory.find_page(window) else {
            return false;
        };
        if base.pde_type() != PdeType::LargePageDisabled {
            return false;
        }
        for i in 0..PAGES_PER_LARGE_PAGE {
            let addr = window + (i as u64) * PAGE_SIZE;
            let Some(page) = self.directory.find_page(addr) else {
                return false;
            };
            if page.page_type() != PageType::Ram
                || page.state() != PageState::Allocated
                || page.handler_activity() != HandlerActivity::None
            {
                trace!("large page recheck at {window:#x}: page {addr:#x} not eligible");
                return false;
            }
        }
        self.directory
            .find_page_mut(window)
            .expect("checked above")
            .set_pde_type(PdeType::LargePage);
        debug!("large page re-enabled for window {window:#x}");
        true
    }

    /// Tear a large window apart because one of its pages needs
    /// fine-grained treatment (write monitoring, handler coverage).
    pub(crate) fn demote_large_page(&mut self, gc_phys: u64) {
        let window = gc_phys & !(LARGE_PAGE_SIZE - 1);
        if let Some(base) = self.directory.find_page_mut(window) {
            if base.pde_type() == PdeType::LargePage {
                base.set_pde_type(PdeType::LargePageDisabled);
                debug!("large page disabled for window {window:#x}");
            }
        }
        self.directory.flush_tlbs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingProvider {
        next: u32,
        budget: usize,
        yield_once: bool,
    }

    impl HostPageProvider for CountingProvider {
        fn replenish(&mut self, count: usize) -> Result<Vec<PageId>, ProviderError> {
            if self.yield_once {
                self.yield_once = false;
                return Err(ProviderError::MustYield);
            }
            let give = count.min(self.budget);
            if give == 0 {
                return Err(ProviderError::OutOfMemory);
            }
            self.budget -= give;
            let pages = (0..give as u32).map(|i| PageId::new(self.next + i)).collect();
            self.next += give as u32;
            Ok(pages)
        }
    }

    fn config() -> PhysConfig {
        PhysConfig {
            large_pages: false,
            handy_pages: 8,
            handy_low_water: 2,
        }
    }

    #[test]
    fn pool_replenishes_at_low_water() {
        let mut provider = CountingProvider {
            next: 0,
            budget: 1024,
            yield_once: false,
        };
        let mut pool = HandyPages::new(&config());
        pool.ensure(&mut provider).unwrap();
        assert_eq!(pool.len(), 8);
        for _ in 0..6 {
            pool.pop().unwrap();
        }
        assert_eq!(pool.len(), 2);
        pool.ensure(&mut provider).unwrap();
        assert_eq!(pool.len(), 8);
    }

    #[test]
    fn pool_exhaustion_is_a_distinct_error() {
        let mut provider = CountingProvider {
            next: 0,
            budget: 3,
            yield_once: false,
        };
        let mut pool = HandyPages::new(&config());
        pool.ensure(&mut provider).unwrap();
        assert_eq!(pool.len(), 3);
        for _ in 0..3 {
            pool.ensure(&mut provider).unwrap();
            pool.pop().unwrap();
        }
        assert!(matches!(
            pool.ensure(&mut provider),
            Err(Error::NoMemory)
        ));
    }

    #[test]
    fn pool_propagates_yield_only_when_empty() {
        let mut provider = CountingProvider {
            next: 0,
            budget: 1024,
            yield_once: true,
        };
        let mut pool = HandyPages::new(&config());
        // Empty pool and a provider that wants us to leave this context.
        assert!(matches!(
            pool.ensure(&mut provider),
            Err(Error::MustYield)
        ));
        // Retry after the yield succeeds.
        pool.ensure(&mut provider).unwrap();
        assert_eq!(pool.len(), 8);
    }
}
