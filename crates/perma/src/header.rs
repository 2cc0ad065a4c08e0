use bytemuck::{Pod, Zeroable};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Compatibility tag written at offset 0 of every heap and backup file.
///
/// Bump the low half whenever the header layout or any allocator structure
/// stored in the heap changes shape.
pub const MAGIC: u64 = 0x5045_524D_2013_0411;

/// LAYOUT:
///
/// The header is the first structure of the mapped heap, so it sits at heap
/// offset 0 and at file offset 0 of both the backing file and every backup.
///
/// `SessionHeader` is the live view inside the mapping. Every field is an
/// `AtomicU64` so the allocators can update their cursors through a shared
/// reference while holding their own locks. `HeaderRecord` is the plain copy
/// used for snapshots, on-disk decoding and validation. Both are 128 bytes with
/// identical field order; `AtomicU64` has the same in-memory representation as
/// `u64`, so a restore may overwrite the live header with raw bytes.
///
/// Addresses are absolute. They are only meaningful while the heap is mapped
/// at `heap_base`.
#[repr(C, align(64))]
pub struct SessionHeader {
    pub magic: AtomicU64,
    pub heap_base: AtomicU64,
    pub heap_end: AtomicU64,
    pub heap_max: AtomicU64,
    pub metadata_base: AtomicU64,
    pub metadata_next: AtomicU64,
    pub metadata_limit: AtomicU64,
    pub roots_blob_ptr: AtomicU64,
    pub roots_blob_len: AtomicU64,
    pub node_free_head: AtomicU64,
    pub arena: ArenaCursor,
    _reserved: [u64; 4],
}

/// Bump cursor of the reference allocator, persisted with the heap.
#[repr(C)]
pub struct ArenaCursor {
    pub next: AtomicU64,
    pub limit: AtomicU64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Serialize)]
pub struct HeaderRecord {
    pub magic: u64,
    pub heap_base: u64,
    pub heap_end: u64,
    pub heap_max: u64,
    pub metadata_base: u64,
    pub metadata_next: u64,
    pub metadata_limit: u64,
    pub roots_blob_ptr: u64,
    pub roots_blob_len: u64,
    pub node_free_head: u64,
    pub arena_next: u64,
    pub arena_limit: u64,
    #[serde(skip)]
    pub reserved: [u64; 4],
}

impl SessionHeader {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Writes `record` over the header at `base`.
    ///
    /// # Safety
    /// `base` must point to at least `SIZE` writable, 64-byte aligned bytes
    /// that no live reference currently observes as anything but a header.
    pub(crate) unsafe fn format(base: *mut u8, record: &HeaderRecord) -> &'static SessionHeader {
        unsafe {
            base.cast::<HeaderRecord>().write(*record);
            &*base.cast::<SessionHeader>()
        }
    }

    /// Reinterprets the start of a mapped heap as its header.
    ///
    /// # Safety
    /// `base` must be the start of a heap mapping that is never unmapped.
    pub(crate) unsafe fn at(base: *mut u8) -> &'static SessionHeader {
        unsafe { &*base.cast::<SessionHeader>() }
    }

    pub fn snapshot(&self) -> HeaderRecord {
        HeaderRecord {
            magic: self.magic.load(Ordering::Acquire),
            heap_base: self.heap_base.load(Ordering::Acquire),
            heap_end: self.heap_end.load(Ordering::Acquire),
            heap_max: self.heap_max.load(Ordering::Acquire),
            metadata_base: self.metadata_base.load(Ordering::Acquire),
            metadata_next: self.metadata_next.load(Ordering::Acquire),
            metadata_limit: self.metadata_limit.load(Ordering::Acquire),
            roots_blob_ptr: self.roots_blob_ptr.load(Ordering::Acquire),
            roots_blob_len: self.roots_blob_len.load(Ordering::Acquire),
            node_free_head: self.node_free_head.load(Ordering::Acquire),
            arena_next: self.arena.next.load(Ordering::Acquire),
            arena_limit: self.arena.limit.load(Ordering::Acquire),
            reserved: [0; 4],
        }
    }

    pub fn base(&self) -> usize {
        self.heap_base.load(Ordering::Acquire) as usize
    }

    pub fn end(&self) -> usize {
        self.heap_end.load(Ordering::Acquire) as usize
    }

    pub fn max(&self) -> usize {
        self.heap_max.load(Ordering::Acquire) as usize
    }
}

impl HeaderRecord {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Header of a freshly created heap. The first `first_chunk` bytes are
    /// committed and the metadata cursor starts right after the header.
    pub fn fresh(base: usize, capacity: usize, first_chunk: usize) -> Self {
        let base = base as u64;
        Self {
            magic: MAGIC,
            heap_base: base,
            heap_end: base + first_chunk as u64,
            heap_max: base + capacity as u64,
            metadata_base: base,
            metadata_next: base + SessionHeader::SIZE as u64,
            metadata_limit: base + first_chunk as u64,
            ..Self::zeroed()
        }
    }

    /// Decodes a header from the first `SIZE` bytes of `bytes`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bytes
            .get(..Self::SIZE)
            .map(bytemuck::pod_read_unaligned::<HeaderRecord>)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn committed_len(&self) -> usize {
        self.heap_end.saturating_sub(self.heap_base) as usize
    }

    pub fn capacity(&self) -> usize {
        self.heap_max.saturating_sub(self.heap_base) as usize
    }
}
