// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Notification bridge towards the hardware-virtualization backend.
//!
//! Every backing or protection change is pushed through [`NemBridge`] so
//! the backend can keep its second-level translation tables in sync
//! without this core knowing anything about them. The backend owns two
//! bits of per-page state which it may rewrite on every notification;
//! callers persist the returned value on the page descriptor.

use bitflags::bitflags;
use vm_memory::GuestAddress;

use crate::page::{HandlerActivity, NemState, PageType};

bitflags! {
    /// Page protection as seen by the hardware-virtualization backend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NemPageProt: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Compute the backend protection for a page from its type and handler
/// coverage summary.
pub fn protection_for(ty: PageType, activity: HandlerActivity) -> NemPageProt {
    match activity {
        HandlerActivity::None | HandlerActivity::Disabled => match ty {
            PageType::Ram | PageType::RomShadow | PageType::Mmio2 => {
                NemPageProt::READ | NemPageProt::WRITE | NemPageProt::EXECUTE
            }
            PageType::Rom => NemPageProt::READ | NemPageProt::EXECUTE,
            PageType::Mmio | PageType::Mmio2Alias | PageType::SpecialAlias => {
                NemPageProt::empty()
            }
        },
        HandlerActivity::Write => NemPageProt::READ | NemPageProt::EXECUTE,
        HandlerActivity::All => NemPageProt::empty(),
    }
}

/// The hardware-virtualization backend's view of mapping changes.
pub trait NemBridge: Send {
    /// Called after every allocation, replacement, large page promotion or
    /// demotion, and protection change. Returns the backend's new private
    /// state for the page.
    fn notify_mapping_changed(
        &mut self,
        gc_phys: GuestAddress,
        host_addr: Option<u64>,
        prot: NemPageProt,
        ty: PageType,
        state: NemState,
    ) -> NemState;
}

/// Bridge for configurations without a hardware backend.
pub struct NullNemBridge;

impl NemBridge for NullNemBridge {
    fn notify_mapping_changed(
        &mut self,
        _gc_phys: GuestAddress,
        _host_addr: Option<u64>,
        _prot: NemPageProt,
        _ty: PageType,
        state: NemState,
    ) -> NemState {
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmonitored_ram_is_fully_mapped() {
        let prot = protection_for(PageType::Ram, HandlerActivity::None);
        assert_eq!(
            prot,
            NemPageProt::READ | NemPageProt::WRITE | NemPageProt::EXECUTE
        );
    }

    #[test]
    fn rom_is_never_writable() {
        let prot = protection_for(PageType::Rom, HandlerActivity::None);
        assert!(!prot.contains(NemPageProt::WRITE));
        assert!(prot.contains(NemPageProt::READ));
    }

    #[test]
    fn handler_summary_strips_access() {
        assert!(!protection_for(PageType::Ram, HandlerActivity::Write)
            .contains(NemPageProt::WRITE));
        assert_eq!(
            protection_for(PageType::Ram, HandlerActivity::All),
            NemPageProt::empty()
        );
        // A temporarily disabled handler restores direct access.
        assert!(protection_for(PageType::Mmio2, HandlerActivity::Disabled)
            .contains(NemPageProt::WRITE));
    }

    #[test]
    fn mmio_is_always_trapped() {
        assert_eq!(
            protection_for(PageType::Mmio, HandlerActivity::None),
            NemPageProt::empty()
        );
    }
}
