// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Backing store for allocated pages.
//!
//! Host pages are identified by a compact [`PageId`] handed out by the host
//! page provider. Identities are grouped into 2MB chunks; each chunk owns
//! one stable heap buffer, so a pointer into a chunk stays valid for as
//! long as the chunk exists. Chunks are never torn down while a mapping
//! reference is outstanding.
//!
//! A small direct-mapped TLB sits in front of the chunk directory to keep
//! the id-to-pointer translation cheap on the copy paths.

use std::collections::HashMap;
use std::ptr::NonNull;

use crate::page::{PAGE_SHIFT, PAGE_SIZE};

/// Pages per chunk; chunk granularity matches the large page size.
pub const PAGES_PER_CHUNK: u32 = 512;
const CHUNK_SHIFT: u32 = 9;
const CHUNK_SIZE: usize = (PAGES_PER_CHUNK as usize) * PAGE_SIZE as usize;
const CHUNK_TLB_ENTRIES: usize = 32;

/// The shared all-zeros frame backing every Zero-state read mapping.
static ZERO_FRAME: [u8; PAGE_SIZE as usize] = [0; PAGE_SIZE as usize];

/// Compact identity of a host backing page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId(u32);

impl PageId {
    pub fn new(raw: u32) -> Self {
        PageId(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Chunk this identity lives in.
    pub fn chunk(self) -> u32 {
        self.0 >> CHUNK_SHIFT
    }

    /// Frame index within the chunk.
    pub fn index(self) -> usize {
        (self.0 & (PAGES_PER_CHUNK - 1)) as usize
    }

    /// True when the identity is the first frame of its chunk, i.e. usable
    /// as the base of a large page.
    pub fn is_chunk_aligned(self) -> bool {
        self.index() == 0
    }

    /// Synthetic host physical address of the frame, derived from the
    /// identity. Reported to the hardware-virtualization backend.
    pub fn host_addr(self) -> u64 {
        (self.0 as u64) << PAGE_SHIFT
    }
}

struct MemChunk {
    buf: Box<[u8]>,
    /// Outstanding mapping references; the chunk must not be unmapped
    /// while this is non-zero.
    refs: u32,
}

#[derive(Clone, Copy)]
struct ChunkTlbEntry {
    id: u32,
    base: NonNull<u8>,
}

/// Directory of mapped chunks plus the direct-mapped translation cache.
pub(crate) struct ChunkStore {
    chunks: HashMap<u32, MemChunk>,
    tlb: [Option<ChunkTlbEntry>; CHUNK_TLB_ENTRIES],
}

// SAFETY: the cached pointers target heap buffers owned by `chunks`; the
// store is only ever used under the manager's global lock.
unsafe impl Send for ChunkStore {}

impl ChunkStore {
    pub fn new() -> Self {
        ChunkStore {
            chunks: HashMap::new(),
            tlb: [None; CHUNK_TLB_ENTRIES],
        }
    }

    /// Shared zero frame.
    pub fn zero_frame() -> &'static [u8] {
        &ZERO_FRAME
    }

    /// Pointer to the zero frame, for read-only mappings of Zero pages.
    pub fn zero_frame_ptr() -> NonNull<u8> {
        NonNull::new(ZERO_FRAME.as_ptr() as *mut u8).unwrap()
    }

    /// Make sure the chunk containing `id` is mapped. New chunks come up
    /// zero-filled, which is what the provider contract promises for every
    /// handed-out page.
    pub fn ensure_chunk(&mut self, id: PageId) {
        self.chunks
            .entry(id.chunk())
            .or_insert_with(|| MemChunk {
                buf: vec![0u8; CHUNK_SIZE].into_boxed_slice(),
                refs: 0,
            });
    }

    fn chunk_base(&mut self, chunk: u32) -> NonNull<u8> {
        let slot = (chunk as usize) & (CHUNK_TLB_ENTRIES - 1);
        if let Some(entry) = self.tlb[slot] {
            if entry.id == chunk {
                return entry.base;
            }
        }
        let mem = self
            .chunks
            .entry(chunk)
            .or_insert_with(|| MemChunk {
                buf: vec![0u8; CHUNK_SIZE].into_boxed_slice(),
                refs: 0,
            });
        let base = NonNull::new(mem.buf.as_mut_ptr()).unwrap();
        self.tlb[slot] = Some(ChunkTlbEntry { id: chunk, base });
        base
    }

    /// Pointer to the frame backing `id`. Valid until the chunk is torn
    /// down, which mapping references prevent.
    pub fn frame_ptr(&mut self, id: PageId) -> NonNull<u8> {
        let base = self.chunk_base(id.chunk());
        // SAFETY: index is bounded by the chunk size by construction.
        unsafe { NonNull::new_unchecked(base.as_ptr().add(id.index() * PAGE_SIZE as usize)) }
    }

    /// Borrow the frame backing `id`.
    pub fn frame(&self, id: PageId) -> &[u8] {
        let mem = self.chunks.get(&id.chunk()).expect("chunk not mapped");
        let off = id.index() * PAGE_SIZE as usize;
        &mem.buf[off..off + PAGE_SIZE as usize]
    }

    /// Mutably borrow the frame backing `id`.
    pub fn frame_mut(&mut self, id: PageId) -> &mut [u8] {
        self.ensure_chunk(id);
        let mem = self.chunks.get_mut(&id.chunk()).expect("chunk not mapped");
        let off = id.index() * PAGE_SIZE as usize;
        &mut mem.buf[off..off + PAGE_SIZE as usize]
    }

    /// Take a mapping reference on the chunk backing `id`.
    pub fn retain(&mut self, id: PageId) {
        self.ensure_chunk(id);
        let mem = self.chunks.get_mut(&id.chunk()).expect("chunk not mapped");
        mem.refs += 1;
    }

    /// Drop a mapping reference on the chunk backing `id`.
    pub fn release(&mut self, id: PageId) {
        if let Some(mem) = self.chunks.get_mut(&id.chunk()) {
            debug_assert!(mem.refs > 0);
            mem.refs = mem.refs.saturating_sub(1);
        }
    }

    /// Outstanding mapping references on the chunk backing `id`.
    pub fn refs(&self, id: PageId) -> u32 {
        self.chunks.get(&id.chunk()).map_or(0, |c| c.refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_decomposition() {
        let id = PageId::new(0x0000_0a07);
        assert_eq!(id.chunk(), 0xa07 >> 9);
        assert_eq!(id.index(), (0xa07 & 511) as usize);
        assert_eq!(id.host_addr(), 0xa07 << 12);
        assert!(!id.is_chunk_aligned());
        assert!(PageId::new(512).is_chunk_aligned());
    }

    #[test]
    fn frames_come_up_zeroed() {
        let mut store = ChunkStore::new();
        let id = PageId::new(3);
        store.ensure_chunk(id);
        assert!(store.frame(id).iter().all(|&b| b == 0));
    }

    #[test]
    fn frame_contents_are_stable_across_chunk_growth() {
        let mut store = ChunkStore::new();
        let a = PageId::new(1);
        store.frame_mut(a).fill(0x5a);
        // Map a bunch of other chunks to force directory growth.
        for chunk in 1..64u32 {
            store.ensure_chunk(PageId::new(chunk * PAGES_PER_CHUNK));
        }
        assert!(store.frame(a).iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn frame_ptr_matches_frame() {
        let mut store = ChunkStore::new();
        let id = PageId::new(600);
        store.frame_mut(id)[0] = 0xee;
        let ptr = store.frame_ptr(id);
        // SAFETY: frame is mapped and unaliased here.
        assert_eq!(unsafe { *ptr.as_ptr() }, 0xee);
        // A second translation of the same id hits the TLB.
        assert_eq!(store.frame_ptr(id), ptr);
    }

    #[test]
    fn mapping_references_count() {
        let mut store = ChunkStore::new();
        let id = PageId::new(42);
        assert_eq!(store.refs(id), 0);
        store.retain(id);
        store.retain(id);
        assert_eq!(store.refs(id), 2);
        store.release(id);
        assert_eq!(store.refs(id), 1);
        store.release(id);
        assert_eq!(store.refs(id), 0);
    }
}
