// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! The range directory: ordered, non-overlapping guest physical ranges,
//! each owning the descriptors of its pages, with small direct-mapped
//! lookup caches in front of the ordered walk.

use std::collections::BTreeMap;

use vm_memory::{Address, GuestAddress, GuestUsize};

use crate::page::{Page, PageType, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE};
use crate::Error;

const RANGE_TLB_ENTRIES: usize = 8;
const PAGE_TLB_ENTRIES: usize = 64;

/// One contiguous guest physical range. The extent is fixed once the range
/// is registered; only the page descriptors inside mutate afterwards.
pub struct RamRange {
    base: u64,
    size: u64,
    desc: String,
    pages: Vec<Page>,
}

impl RamRange {
    pub fn new(
        base: GuestAddress,
        size: GuestUsize,
        ty: PageType,
        desc: &str,
    ) -> Result<Self, Error> {
        if size == 0
            || base.raw_value() & PAGE_OFFSET_MASK != 0
            || size & PAGE_OFFSET_MASK != 0
            || base.raw_value().checked_add(size - 1).is_none()
        {
            return Err(Error::InvalidParameter);
        }
        let count = (size >> PAGE_SHIFT) as usize;
        Ok(RamRange {
            base: base.raw_value(),
            size,
            desc: desc.to_owned(),
            pages: vec![Page::new_zero(ty); count],
        })
    }

    pub fn base(&self) -> GuestAddress {
        GuestAddress(self.base)
    }

    pub fn size(&self) -> GuestUsize {
        self.size
    }

    /// Last byte covered by the range.
    pub fn last(&self) -> u64 {
        self.base + self.size - 1
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    /// Containment test using unsigned wrap-around: an address below the
    /// base wraps to a huge offset, so a single unsigned compare covers
    /// both bounds.
    pub fn contains(&self, addr: u64) -> bool {
        addr.wrapping_sub(self.base) < self.size
    }

    pub fn page_index(&self, addr: u64) -> usize {
        debug_assert!(self.contains(addr));
        (addr.wrapping_sub(self.base) >> PAGE_SHIFT) as usize
    }

    pub fn page(&self, addr: u64) -> &Page {
        &self.pages[self.page_index(addr)]
    }

    pub fn page_mut(&mut self, addr: u64) -> &mut Page {
        let idx = self.page_index(addr);
        &mut self.pages[idx]
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn pages_mut(&mut self) -> &mut [Page] {
        &mut self.pages
    }
}

#[derive(Clone, Copy)]
struct PageTlbEntry {
    page_base: u64,
    range_base: u64,
    index: usize,
}

fn range_tlb_slot(addr: u64) -> usize {
    ((addr >> 20) as usize) & (RANGE_TLB_ENTRIES - 1)
}

fn page_tlb_slot(addr: u64) -> usize {
    ((addr >> PAGE_SHIFT) as usize) & (PAGE_TLB_ENTRIES - 1)
}

/// Ordered collection of ranges keyed by base address, with the range and
/// page lookup caches.
pub(crate) struct RangeDirectory {
    ranges: BTreeMap<u64, RamRange>,
    range_tlb: [Option<u64>; RANGE_TLB_ENTRIES],
    page_tlb: [Option<PageTlbEntry>; PAGE_TLB_ENTRIES],
}

impl RangeDirectory {
    pub fn new() -> Self {
        RangeDirectory {
            ranges: BTreeMap::new(),
            range_tlb: [None; RANGE_TLB_ENTRIES],
            page_tlb: [None; PAGE_TLB_ENTRIES],
        }
    }

    /// Register a range. Ranges never overlap; the caches are flushed
    /// wholesale since slot contents may now be stale.
    pub fn insert(&mut self, range: RamRange) -> Result<(), Error> {
        if let Some((_, prev)) = self.ranges.range(..=range.base).next_back() {
            if prev.last() >= range.base {
                return Err(Error::RangeConflict);
            }
        }
        if let Some((_, next)) = self.ranges.range(range.base..).next() {
            if next.base <= range.last() {
                return Err(Error::RangeConflict);
            }
        }
        self.ranges.insert(range.base, range);
        self.flush_tlbs();
        Ok(())
    }

    /// Remove the range starting exactly at `base`. Only the registration
    /// unwind paths use this; established ranges are permanent.
    pub fn remove(&mut self, base: u64) -> Option<RamRange> {
        let removed = self.ranges.remove(&base);
        if removed.is_some() {
            self.flush_tlbs();
        }
        removed
    }

    pub fn flush_tlbs(&mut self) {
        self.range_tlb = [None; RANGE_TLB_ENTRIES];
        self.page_tlb = [None; PAGE_TLB_ENTRIES];
    }

    /// Drop the page cache entry for one page; called whenever the page's
    /// identity changes (replacement, large page work, ballooning).
    pub fn invalidate_page(&mut self, addr: u64) {
        let slot = page_tlb_slot(addr);
        if let Some(entry) = self.page_tlb[slot] {
            if entry.page_base == addr & !PAGE_OFFSET_MASK {
                self.page_tlb[slot] = None;
            }
        }
    }

    fn find_base(&mut self, addr: u64) -> Option<u64> {
        let slot = range_tlb_slot(addr);
        if let Some(base) = self.range_tlb[slot] {
            if let Some(range) = self.ranges.get(&base) {
                if range.contains(addr) {
                    return Some(base);
                }
            }
        }
        // Slow path: the predecessor by base is the only candidate, the
        // unsigned containment test rejects everything else.
        let (base, range) = self.ranges.range(..=addr).next_back()?;
        if !range.contains(addr) {
            return None;
        }
        let base = *base;
        self.range_tlb[slot] = Some(base);
        Some(base)
    }

    pub fn find_range(&mut self, addr: u64) -> Option<&RamRange> {
        let base = self.find_base(addr)?;
        self.ranges.get(&base)
    }

    pub fn find_range_mut(&mut self, addr: u64) -> Option<&mut RamRange> {
        let base = self.find_base(addr)?;
        self.ranges.get_mut(&base)
    }

    /// The range containing `addr`, or the nearest one above it. Drives
    /// the copy loops across unassigned gaps.
    pub fn find_range_at_or_above(&self, addr: u64) -> Option<&RamRange> {
        if let Some((_, range)) = self.ranges.range(..=addr).next_back() {
            if range.contains(addr) {
                return Some(range);
            }
        }
        self.ranges.range(addr..).next().map(|(_, r)| r)
    }

    fn find_page_slot(&mut self, addr: u64) -> Option<(u64, usize)> {
        let page_base = addr & !PAGE_OFFSET_MASK;
        let slot = page_tlb_slot(addr);
        if let Some(entry) = self.page_tlb[slot] {
            if entry.page_base == page_base {
                return Some((entry.range_base, entry.index));
            }
        }
        let base = self.find_base(addr)?;
        let index = self.ranges[&base].page_index(addr);
        self.page_tlb[slot] = Some(PageTlbEntry {
            page_base,
            range_base: base,
            index,
        });
        Some((base, index))
    }

    pub fn find_page(&mut self, addr: u64) -> Option<&Page> {
        let (base, index) = self.find_page_slot(addr)?;
        Some(&self.ranges[&base].pages[index])
    }

    pub fn find_page_mut(&mut self, addr: u64) -> Option<&mut Page> {
        let (base, index) = self.find_page_slot(addr)?;
        Some(&mut self.ranges.get_mut(&base).unwrap().pages[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &RamRange> {
        self.ranges.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RamRange> {
        self.ranges.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> RangeDirectory {
        let mut dir = RangeDirectory::new();
        dir.insert(
            RamRange::new(GuestAddress(0), 0x10000, PageType::Ram, "low").unwrap(),
        )
        .unwrap();
        dir.insert(
            RamRange::new(GuestAddress(0x100000), 0x200000, PageType::Ram, "high").unwrap(),
        )
        .unwrap();
        dir
    }

    #[test]
    fn rejects_unaligned_and_empty_ranges() {
        assert!(RamRange::new(GuestAddress(0x10), 0x1000, PageType::Ram, "x").is_err());
        assert!(RamRange::new(GuestAddress(0), 0x800, PageType::Ram, "x").is_err());
        assert!(RamRange::new(GuestAddress(0), 0, PageType::Ram, "x").is_err());
        assert!(
            RamRange::new(GuestAddress(u64::MAX & !PAGE_OFFSET_MASK), 0x2000, PageType::Ram, "x")
                .is_err()
        );
    }

    #[test]
    fn rejects_overlap() {
        let mut dir = directory();
        assert!(matches!(
            dir.insert(RamRange::new(GuestAddress(0xf000), 0x2000, PageType::Ram, "o").unwrap()),
            Err(Error::RangeConflict)
        ));
        assert!(matches!(
            dir.insert(
                RamRange::new(GuestAddress(0xff000), 0x2000, PageType::Ram, "o").unwrap()
            ),
            Err(Error::RangeConflict)
        ));
    }

    #[test]
    fn inside_addresses_always_resolve() {
        let mut dir = directory();
        for addr in [0u64, 0x123, 0xffff, 0x100000, 0x2fffff] {
            assert!(dir.find_range(addr).is_some(), "addr {addr:#x}");
            assert!(dir.find_page(addr).is_some(), "addr {addr:#x}");
        }
        // Repeat through the now-populated caches.
        for addr in [0u64, 0x123, 0xffff, 0x100000, 0x2fffff] {
            assert!(dir.find_range(addr).is_some(), "addr {addr:#x}");
        }
    }

    #[test]
    fn outside_addresses_never_resolve() {
        let mut dir = directory();
        for addr in [0x10000u64, 0xfffff, 0x300000, u64::MAX] {
            assert!(dir.find_range(addr).is_none(), "addr {addr:#x}");
            assert!(dir.find_page(addr).is_none(), "addr {addr:#x}");
        }
    }

    #[test]
    fn at_or_above_crosses_gaps() {
        let dir = directory();
        let r = dir.find_range_at_or_above(0x20000).unwrap();
        assert_eq!(r.base().raw_value(), 0x100000);
        let r = dir.find_range_at_or_above(0x100).unwrap();
        assert_eq!(r.base().raw_value(), 0);
        assert!(dir.find_range_at_or_above(0x300000).is_none());
    }

    #[test]
    fn containment_uses_wraparound() {
        let range = RamRange::new(GuestAddress(0x100000), 0x1000, PageType::Ram, "x").unwrap();
        assert!(range.contains(0x100000));
        assert!(range.contains(0x100fff));
        assert!(!range.contains(0xfffff));
        assert!(!range.contains(0x101000));
    }
}
