// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Per-page tracking: backing type, state machine, handler summary and
//! mapping lock counts.

use log::error;

use crate::chunk::PageId;
use crate::Error;

/// Size of a guest page in bytes.
pub const PAGE_SIZE: u64 = 0x1000;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u64 = 12;
/// Offset mask within a guest page.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;
/// Size of a large (PDE-mapped) page.
pub const LARGE_PAGE_SIZE: u64 = 0x20_0000;
/// Number of small pages backing one large page.
pub const PAGES_PER_LARGE_PAGE: usize = (LARGE_PAGE_SIZE / PAGE_SIZE) as usize;

/// Mapping lock counters saturate here; a page that reaches this value is
/// considered permanently locked and the counter is never decremented again.
pub const MAX_PAGE_LOCKS: u8 = 254;

/// The kind of backing a guest physical page has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Plain guest RAM.
    Ram,
    /// Read-only memory with a registered image.
    Rom,
    /// The RAM page shadowing a ROM page while shadowing is active.
    RomShadow,
    /// Trapped programmed I/O; never has regular backing.
    Mmio,
    /// Memory-backed I/O region (e.g. video RAM).
    Mmio2,
    /// An MMIO page aliased over an MMIO2 page.
    Mmio2Alias,
    /// An MMIO page aliased over special memory.
    SpecialAlias,
}

impl PageType {
    /// MMIO or one of the alias types: pages that must never be handed to
    /// the replacement engine.
    pub fn is_mmio_or_alias(self) -> bool {
        matches!(
            self,
            PageType::Mmio | PageType::Mmio2Alias | PageType::SpecialAlias
        )
    }
}

/// Backing state of a guest physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Backed by the shared all-zeros page; allocated on first write.
    Zero,
    /// Backed by a private host page.
    Allocated,
    /// Private backing, but writes are intercepted (dirty tracking, page
    /// sharing candidates, ...).
    WriteMonitored,
    /// Backed by a host-deduplicated copy-on-write page.
    Shared,
    /// Voluntarily returned to the host by the balloon; no backing at all.
    Ballooned,
}

/// Summary of access handler coverage for one page. Lets the read/write
/// paths skip the handler table for the common unmonitored case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerActivity {
    /// No handler covers the page.
    None,
    /// A write-only handler covers the page; reads go straight through.
    Write,
    /// A read/write handler covers the page.
    All,
    /// A handler covers the page but is temporarily disabled for it.
    Disabled,
}

impl HandlerActivity {
    /// True when writes to the page must go through handler dispatch.
    pub fn intercepts_writes(self) -> bool {
        matches!(self, HandlerActivity::Write | HandlerActivity::All)
    }

    /// True when reads from the page must go through handler dispatch.
    pub fn intercepts_reads(self) -> bool {
        matches!(self, HandlerActivity::All)
    }
}

/// Large page disposition of the 2MB window a page belongs to. Tracked on
/// the window's base page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdeType {
    /// Never scanned; a large page attempt is worthwhile.
    DontCare,
    /// The window cannot be a large page; do not rescan.
    PageTable,
    /// The window is mapped by a large page.
    LargePage,
    /// The window was a large page but fine-grained monitoring forced it
    /// apart; a recheck may re-enable it.
    LargePageDisabled,
}

/// Opaque 2-bit state owned by the hardware-virtualization backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NemState(u8);

impl NemState {
    pub fn new(raw: u8) -> Self {
        NemState(raw & 0x3)
    }

    pub fn raw(self) -> u8 {
        self.0
    }
}

/// What a write access to a page requires before the bytes can land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePromotion {
    /// Already writable.
    None,
    /// Write monitoring must be lifted; no replacement needed.
    LiftWriteMonitor,
    /// The zero or shared backing must be replaced with a private page.
    Replace,
}

/// Tracking record for one guest physical page.
#[derive(Debug, Clone)]
pub struct Page {
    ty: PageType,
    state: PageState,
    id: Option<PageId>,
    handlers: HandlerActivity,
    pde: PdeType,
    nem: NemState,
    read_locks: u8,
    write_locks: u8,
}

impl Page {
    /// A new page in the Zero state with the given backing type.
    pub fn new_zero(ty: PageType) -> Self {
        Page {
            ty,
            state: PageState::Zero,
            id: None,
            handlers: HandlerActivity::None,
            pde: PdeType::DontCare,
            nem: NemState::default(),
            read_locks: 0,
            write_locks: 0,
        }
    }

    pub fn page_type(&self) -> PageType {
        self.ty
    }

    pub fn state(&self) -> PageState {
        self.state
    }

    pub fn id(&self) -> Option<PageId> {
        self.id
    }

    /// Host address of the backing, derived from the page identity.
    pub fn host_addr(&self) -> Option<u64> {
        self.id.map(PageId::host_addr)
    }

    pub fn handler_activity(&self) -> HandlerActivity {
        self.handlers
    }

    pub fn set_handler_activity(&mut self, activity: HandlerActivity) {
        self.handlers = activity;
    }

    pub fn pde_type(&self) -> PdeType {
        self.pde
    }

    pub fn set_pde_type(&mut self, pde: PdeType) {
        self.pde = pde;
    }

    pub fn nem_state(&self) -> NemState {
        self.nem
    }

    pub fn set_nem_state(&mut self, state: NemState) {
        self.nem = state;
    }

    /// Give the page a new private backing. Only the replacement engine and
    /// the region registration paths may call this.
    pub(crate) fn set_backing(&mut self, id: PageId, state: PageState) {
        self.id = Some(id);
        self.state = state;
    }

    /// Drop the backing, entering `state` (Zero or Ballooned).
    pub(crate) fn clear_backing(&mut self, state: PageState) {
        debug_assert!(matches!(state, PageState::Zero | PageState::Ballooned));
        self.id = None;
        self.state = state;
    }

    pub(crate) fn set_state(&mut self, state: PageState) {
        self.state = state;
    }

    /// Decide what has to happen before this page can be written through a
    /// plain mapping. This is the page state machine's legal-transition
    /// table for the write path; everything else is rejected.
    pub fn write_promotion(&self) -> Result<WritePromotion, Error> {
        match self.state {
            PageState::Allocated => Ok(WritePromotion::None),
            PageState::WriteMonitored => Ok(WritePromotion::LiftWriteMonitor),
            // Zero pages double as placeholders for MMIO and reserved
            // memory; those must never be promoted to private RAM.
            PageState::Zero if self.ty.is_mmio_or_alias() => Err(Error::PageReserved),
            PageState::Zero | PageState::Shared => Ok(WritePromotion::Replace),
            PageState::Ballooned => Err(Error::PageBallooned),
        }
    }

    pub fn read_locks(&self) -> u8 {
        self.read_locks
    }

    pub fn write_locks(&self) -> u8 {
        self.write_locks
    }

    pub fn is_locked(&self) -> bool {
        self.read_locks != 0 || self.write_locks != 0
    }

    /// Take one read lock. Returns true when this was the first lock on the
    /// page (for the global locked-page accounting).
    pub(crate) fn lock_for_read(&mut self) -> bool {
        if self.read_locks >= MAX_PAGE_LOCKS {
            error!("page entering permanently read-locked state");
            return false;
        }
        self.read_locks += 1;
        self.read_locks == 1
    }

    /// Take one write lock. Returns true when this was the first lock.
    pub(crate) fn lock_for_write(&mut self) -> bool {
        if self.write_locks >= MAX_PAGE_LOCKS {
            error!("page entering permanently write-locked state");
            return false;
        }
        self.write_locks += 1;
        self.write_locks == 1
    }

    /// Release one read lock. Returns true when the page became unlocked.
    /// A saturated counter is never decremented.
    pub(crate) fn unlock_read(&mut self) -> bool {
        if self.read_locks == 0 {
            error!("read lock released on unlocked page");
            return false;
        }
        if self.read_locks >= MAX_PAGE_LOCKS {
            return false;
        }
        self.read_locks -= 1;
        self.read_locks == 0
    }

    /// Release one write lock. Returns true when the page became unlocked.
    pub(crate) fn unlock_write(&mut self) -> bool {
        if self.write_locks == 0 {
            error!("write lock released on unlocked page");
            return false;
        }
        if self.write_locks >= MAX_PAGE_LOCKS {
            return false;
        }
        self.write_locks -= 1;
        self.write_locks == 0
    }
}
