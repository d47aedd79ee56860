// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Guest physical memory virtualization.
//!
//! This crate tracks what backs every guest physical page (RAM, ROM,
//! device memory, nothing yet), allocates backing lazily on first write
//! from a pre-zeroed pool, intercepts accesses through registered
//! handlers, and keeps the hardware-virtualization backend informed of
//! every mapping change. [`PhysMemoryManager`] is the entry point; the
//! host side plugs in through the [`pool::HostPageProvider`] and the
//! other collaborator traits.

use thiserror::Error as ThisError;

pub mod chunk;
pub mod config;
pub mod handler;
pub mod mmio;
pub mod nem;
pub mod page;
pub mod physmem;
pub mod pool;
pub mod range;
pub mod rom;
pub mod status;

pub use chunk::PageId;
pub use config::PhysConfig;
pub use handler::{HandlerKind, PhysHandler};
pub use nem::{NemBridge, NemPageProt, NullNemBridge};
pub use physmem::{
    GuestWalker, IdentityWalker, PageReadMapping, PageWriteMapping, PhysCounters,
    PhysMemoryManager,
};
pub use pool::{HostPageProvider, NullShadowPool, ProviderError, ShadowPageTablePool};
pub use rom::{InstructionSkipper, NullSkipper, RomProt};
pub use status::{AccessOrigin, AccessStatus, HandlerOutcome};

/// Hard failures of the physical memory core. Informational outcomes are
/// [`AccessStatus`] values carried in `Ok`.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("guest physical address is not backed by any registered range")]
    InvalidGuestAddress,

    #[error("page is a reserved MMIO placeholder and cannot be allocated")]
    PageReserved,

    #[error("page was ballooned out to the host")]
    PageBallooned,

    #[error("host is out of memory for guest pages")]
    NoMemory,

    #[error("allocation requires leaving the current execution context")]
    MustYield,

    #[error("access hits a handler the calling context cannot run")]
    AccessHandlerHit,

    #[error("handler returned a status that is invalid for the access")]
    InvalidHandlerStatus,

    #[error("handler interval overlaps an existing registration")]
    HandlerConflict,

    #[error("no handler registered at this address")]
    HandlerNotFound,

    #[error("range overlaps an existing registration")]
    RangeConflict,

    #[error("invalid parameter")]
    InvalidParameter,
}
