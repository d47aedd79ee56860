// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Interval-keyed access handler table.
//!
//! Handlers intercept guest accesses to page-aligned physical intervals.
//! The table only stores and finds them; the read/write façade does the
//! actual dispatch, including splitting accesses at interval boundaries.

use std::collections::BTreeMap;
use std::sync::Arc;

use vm_memory::{Address, GuestAddress};

use crate::page::{HandlerActivity, PAGE_OFFSET_MASK};
use crate::status::{AccessOrigin, HandlerOutcome};
use crate::Error;

/// What accesses a handler registration intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Writes only; reads are served from the page backing directly.
    Write,
    /// Reads and writes.
    All,
}

impl HandlerKind {
    pub(crate) fn activity(self) -> HandlerActivity {
        match self {
            HandlerKind::Write => HandlerActivity::Write,
            HandlerKind::All => HandlerActivity::All,
        }
    }
}

/// A registered access interceptor.
///
/// Callbacks run with the global lock released unless the registration
/// asked to keep it (low-latency trackers that touch nothing outside this
/// core). Handlers that may re-enter other subsystems must not keep it.
pub trait PhysHandler: Send + Sync {
    /// Service a read of `dest.len()` bytes at `gc_phys`.
    fn read(
        &self,
        gc_phys: GuestAddress,
        dest: &mut [u8],
        origin: AccessOrigin,
        user: u64,
    ) -> HandlerOutcome {
        let _ = (gc_phys, dest, origin, user);
        HandlerOutcome::UseDefault
    }

    /// Service a write of `src` at `gc_phys`.
    fn write(
        &self,
        gc_phys: GuestAddress,
        src: &[u8],
        origin: AccessOrigin,
        user: u64,
    ) -> HandlerOutcome;
}

/// How an entry's callback is dispatched.
pub(crate) enum HandlerCallback {
    /// Externally registered handler; may have to run unlocked.
    External(Arc<dyn PhysHandler>),
    /// The built-in ROM shadow handler; always runs under the lock.
    RomWrite { rom_index: usize },
    /// The built-in MMIO2 dirty tracker; always runs under the lock.
    Mmio2Dirty { region_index: usize },
}

pub(crate) struct HandlerEntry {
    pub first: u64,
    pub last: u64,
    pub kind: HandlerKind,
    pub keep_lock: bool,
    pub user: u64,
    pub desc: String,
    pub callback: HandlerCallback,
}

impl HandlerEntry {
    pub fn covers(&self, addr: u64) -> bool {
        addr >= self.first && addr <= self.last
    }
}

/// The interval table, keyed by first covered byte.
pub(crate) struct HandlerRegistry {
    entries: BTreeMap<u64, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            entries: BTreeMap::new(),
        }
    }

    /// Insert a registration. Intervals are page aligned (first at a page
    /// boundary, last at the final byte of a page) and must not overlap an
    /// existing registration.
    pub fn register(&mut self, entry: HandlerEntry) -> Result<(), Error> {
        if entry.first & PAGE_OFFSET_MASK != 0
            || entry.last & PAGE_OFFSET_MASK != PAGE_OFFSET_MASK
            || entry.first > entry.last
        {
            return Err(Error::InvalidParameter);
        }
        if let Some((_, prev)) = self.entries.range(..=entry.first).next_back() {
            if prev.last >= entry.first {
                return Err(Error::HandlerConflict);
            }
        }
        if let Some((_, next)) = self.entries.range(entry.first..).next() {
            if next.first <= entry.last {
                return Err(Error::HandlerConflict);
            }
        }
        self.entries.insert(entry.first, entry);
        Ok(())
    }

    pub fn unregister(&mut self, first: GuestAddress) -> Result<HandlerEntry, Error> {
        self.entries
            .remove(&first.raw_value())
            .ok_or(Error::HandlerNotFound)
    }

    /// The registration covering `addr`, if any.
    pub fn lookup(&self, addr: u64) -> Option<&HandlerEntry> {
        let (_, entry) = self.entries.range(..=addr).next_back()?;
        entry.covers(addr).then_some(entry)
    }

    /// The registration covering `addr`, or the nearest one starting above
    /// it. The write path uses this to discover partial overlaps ahead of
    /// the cursor.
    pub fn lookup_at_or_above(&self, addr: u64) -> Option<&HandlerEntry> {
        if let Some(entry) = self.lookup(addr) {
            return Some(entry);
        }
        self.entries.range(addr..).next().map(|(_, e)| e)
    }

    pub fn get(&self, first: u64) -> Option<&HandlerEntry> {
        self.entries.get(&first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(first: u64, last: u64) -> HandlerEntry {
        struct Sink;
        impl PhysHandler for Sink {
            fn write(
                &self,
                _gc_phys: GuestAddress,
                _src: &[u8],
                _origin: AccessOrigin,
                _user: u64,
            ) -> HandlerOutcome {
                HandlerOutcome::UseDefault
            }
        }
        HandlerEntry {
            first,
            last,
            kind: HandlerKind::Write,
            keep_lock: false,
            user: 0,
            desc: "test".to_owned(),
            callback: HandlerCallback::External(Arc::new(Sink)),
        }
    }

    #[test]
    fn rejects_unaligned_intervals() {
        let mut reg = HandlerRegistry::new();
        assert!(matches!(
            reg.register(entry(0x1004, 0x1fff)),
            Err(Error::InvalidParameter)
        ));
        assert!(matches!(
            reg.register(entry(0x1000, 0x1ffe)),
            Err(Error::InvalidParameter)
        ));
    }

    #[test]
    fn rejects_overlap() {
        let mut reg = HandlerRegistry::new();
        reg.register(entry(0x1000, 0x2fff)).unwrap();
        assert!(matches!(
            reg.register(entry(0x2000, 0x3fff)),
            Err(Error::HandlerConflict)
        ));
        assert!(matches!(
            reg.register(entry(0x0000, 0x1fff)),
            Err(Error::HandlerConflict)
        ));
        reg.register(entry(0x3000, 0x3fff)).unwrap();
    }

    #[test]
    fn point_lookup() {
        let mut reg = HandlerRegistry::new();
        reg.register(entry(0x1000, 0x1fff)).unwrap();
        assert!(reg.lookup(0x0fff).is_none());
        assert_eq!(reg.lookup(0x1000).unwrap().first, 0x1000);
        assert_eq!(reg.lookup(0x1fff).unwrap().first, 0x1000);
        assert!(reg.lookup(0x2000).is_none());
    }

    #[test]
    fn at_or_above_finds_partial_overlaps() {
        let mut reg = HandlerRegistry::new();
        reg.register(entry(0x3000, 0x3fff)).unwrap();
        let e = reg.lookup_at_or_above(0x1000).unwrap();
        assert_eq!(e.first, 0x3000);
        let e = reg.lookup_at_or_above(0x3800).unwrap();
        assert_eq!(e.first, 0x3000);
        assert!(reg.lookup_at_or_above(0x4000).is_none());
    }

    #[test]
    fn unregister_round_trip() {
        let mut reg = HandlerRegistry::new();
        reg.register(entry(0x1000, 0x1fff)).unwrap();
        assert!(reg.unregister(GuestAddress(0x1000)).is_ok());
        assert!(matches!(
            reg.unregister(GuestAddress(0x1000)),
            Err(Error::HandlerNotFound)
        ));
        assert!(reg.lookup(0x1000).is_none());
    }
}
