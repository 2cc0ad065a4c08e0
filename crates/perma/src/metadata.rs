use crate::allocator::ExternalAllocator;
use crate::errors::PermError;
use crate::header::SessionHeader;
use std::num::NonZeroU64;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Metadata records are padded to whole cache lines so that records used by
/// different threads never share one.
pub const CACHELINE: usize = 64;

/// Fixed-size bookkeeping record handed out by [`MetadataAllocator::node_alloc`].
///
/// `next_free` links recycled nodes. It is a dedicated field, so a free node
/// never reuses payload bytes as a pointer.
#[repr(C, align(64))]
pub struct MetaNode {
    next_free: AtomicU64,
    pub payload: [u64; 7],
}

/// Address of a [`MetaNode`] inside the heap. Stable across restarts, since the
/// heap is always mapped at the same base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(NonZeroU64);

impl NodeHandle {
    pub fn address(self) -> u64 {
        self.0.get()
    }
}

/// Bump allocator for small, never-freed structures living in the heap.
///
/// The cursor (`metadata_base/next/limit`) and the head of the node free list
/// are stored in the session header, so a restore rolls them back along with
/// the records they describe.
pub struct MetadataAllocator {
    header: &'static SessionHeader,
    chunks: Arc<dyn ExternalAllocator>,
    lock: Mutex<()>,
}

impl MetadataAllocator {
    /// Attaches to the header of an open heap.
    ///
    /// A `fresh` heap gets its cursor reset to the space right after the
    /// header in the first chunk and an empty free list. A restored heap keeps
    /// both, since the records they point at are already on disk.
    pub fn boot(
        header: &'static SessionHeader,
        chunks: Arc<dyn ExternalAllocator>,
        fresh: bool,
    ) -> Self {
        if fresh {
            let base = header.heap_base.load(Ordering::Acquire);
            let first_chunk_end = base + chunks.chunk_size() as u64;
            header.metadata_base.store(base, Ordering::Release);
            header
                .metadata_next
                .store(base + SessionHeader::SIZE as u64, Ordering::Release);
            header.metadata_limit.store(first_chunk_end, Ordering::Release);
            header.node_free_head.store(0, Ordering::Release);
        }
        Self {
            header,
            chunks,
            lock: Mutex::new(()),
        }
    }

    /// Allocates `size` bytes, rounded up to a cache line.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, PermError> {
        let _guard = self.freeze();
        self.allocate_locked(size)
    }

    /// Holds off every metadata allocation until the guard is dropped.
    ///
    /// Checkpoints take this before the allocator pause: a metadata
    /// allocation may itself wait on the pause for a new chunk.
    pub(crate) fn freeze(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_locked(&self, size: usize) -> Result<NonNull<u8>, PermError> {
        let csize = size
            .checked_next_multiple_of(CACHELINE)
            .ok_or(PermError::OutOfMemory {
                op: "base_alloc",
                requested: size,
            })?;

        let mut next = self.header.metadata_next.load(Ordering::Acquire) as usize;
        let limit = self.header.metadata_limit.load(Ordering::Acquire) as usize;

        if next + csize > limit {
            let chunk = self.chunks.acquire_chunk(csize.max(1)).inspect_err(|e| {
                tracing::error!("base_alloc: no chunk for {csize} bytes: {e}");
            })?;
            tracing::debug!(
                "base_alloc: new metadata chunk {:#x}+{:#x}",
                chunk.address(),
                chunk.len()
            );
            next = chunk.address();
            self.header
                .metadata_base
                .store(chunk.address() as u64, Ordering::Release);
            self.header
                .metadata_limit
                .store(chunk.end() as u64, Ordering::Release);
        }

        self.header
            .metadata_next
            .store((next + csize) as u64, Ordering::Release);
        NonNull::new(next as *mut u8).ok_or(PermError::OutOfMemory {
            op: "base_alloc",
            requested: size,
        })
    }

    /// Takes a node from the free list, or carves a new one.
    pub fn node_alloc(&self) -> Result<NodeHandle, PermError> {
        let _guard = self.freeze();

        if let Some(head) = NonZeroU64::new(self.header.node_free_head.load(Ordering::Acquire)) {
            let node = NodeHandle(head);
            let next = self.node(node).next_free.swap(0, Ordering::AcqRel);
            self.header.node_free_head.store(next, Ordering::Release);
            return Ok(node);
        }

        let ptr = self.allocate_locked(std::mem::size_of::<MetaNode>())?;
        // SAFETY: fresh, cache-line aligned metadata space of node size.
        unsafe {
            ptr.cast::<MetaNode>().write(MetaNode {
                next_free: AtomicU64::new(0),
                payload: [0; 7],
            });
        }
        NonZeroU64::new(ptr.as_ptr() as u64)
            .map(NodeHandle)
            .ok_or(PermError::OutOfMemory {
                op: "base_node_alloc",
                requested: std::mem::size_of::<MetaNode>(),
            })
    }

    /// Pushes `node` onto the free list. The payload is left as it was.
    pub fn node_dealloc(&self, node: NodeHandle) {
        let _guard = self.freeze();
        let head = self.header.node_free_head.load(Ordering::Acquire);
        self.node(node).next_free.store(head, Ordering::Release);
        self.header
            .node_free_head
            .store(node.address(), Ordering::Release);
    }

    /// The record behind `node`.
    pub fn node(&self, node: NodeHandle) -> &MetaNode {
        // SAFETY: handles only come from node_alloc on this heap, whose
        // mapping is permanent.
        unsafe { &*(node.address() as *const MetaNode) }
    }

    /// Mutable payload of `node`.
    ///
    /// # Safety
    /// No other reference to this node's payload may be alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn payload_mut(&self, node: NodeHandle) -> &mut [u64; 7] {
        unsafe { &mut (*(node.address() as *mut MetaNode)).payload }
    }

    pub fn cursor(&self) -> (u64, u64, u64) {
        (
            self.header.metadata_base.load(Ordering::Acquire),
            self.header.metadata_next.load(Ordering::Acquire),
            self.header.metadata_limit.load(Ordering::Acquire),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::ChunkSource;
    use crate::header::HeaderRecord;
    use crate::scatter::Region;

    const CHUNK: usize = 4096;

    /// Chunks carved from a leaked, aligned buffer.
    struct FixedChunks {
        next: Mutex<usize>,
        end: usize,
    }

    impl ExternalAllocator for FixedChunks {
        fn chunk_size(&self) -> usize {
            CHUNK
        }

        fn acquire_chunk(&self, size: usize) -> Result<Region, PermError> {
            let size = size.next_multiple_of(CHUNK);
            let mut next = self.next.lock().unwrap();
            if *next + size > self.end {
                return Err(PermError::OutOfMemory {
                    op: "chunk_alloc",
                    requested: size,
                });
            }
            let region = unsafe { Region::new(*next as *mut u8, size) };
            *next += size;
            Ok(region)
        }

        fn begin_global_pause(&self) -> Result<(), PermError> {
            Ok(())
        }

        fn end_global_pause(&self) -> Result<(), PermError> {
            Ok(())
        }

        fn has_allocation_occurred(&self) -> bool {
            false
        }

        fn rebind_chunk_source(&self, _source: Arc<dyn ChunkSource>) -> Result<(), PermError> {
            Ok(())
        }
    }

    /// A heap of `chunks` chunks with the first one already holding the header.
    fn heap(chunks: usize) -> (&'static SessionHeader, Arc<FixedChunks>) {
        let layout = std::alloc::Layout::from_size_align(chunks * CHUNK, CHUNK).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());

        let record = HeaderRecord::fresh(base as usize, chunks * CHUNK, CHUNK);
        let header = unsafe { SessionHeader::format(base, &record) };
        let allocator = Arc::new(FixedChunks {
            next: Mutex::new(base as usize + CHUNK),
            end: base as usize + chunks * CHUNK,
        });
        (header, allocator)
    }

    #[test]
    fn test_allocations_are_cacheline_rounded() {
        let (header, chunks) = heap(4);
        let meta = MetadataAllocator::boot(header, chunks, true);

        let a = meta.allocate(1).unwrap().as_ptr() as usize;
        let b = meta.allocate(65).unwrap().as_ptr() as usize;
        let c = meta.allocate(64).unwrap().as_ptr() as usize;

        assert_eq!(a, header.base() + SessionHeader::SIZE, "first record follows the header");
        assert_eq!(b - a, 64);
        assert_eq!(c - b, 128);
        assert_eq!(a % CACHELINE, 0);
    }

    #[test]
    fn test_exhausted_chunk_rebases_cursor() {
        let (header, chunks) = heap(4);
        let meta = MetadataAllocator::boot(header, chunks, true);

        let room = CHUNK - SessionHeader::SIZE;
        meta.allocate(room).unwrap();
        let (_, next, limit) = meta.cursor();
        assert_eq!(next, limit, "first chunk is full");

        let p = meta.allocate(100).unwrap().as_ptr() as usize;
        assert_eq!(p, header.base() + CHUNK);
        let (base, next, limit) = meta.cursor();
        assert_eq!(base as usize, header.base() + CHUNK);
        assert_eq!(next as usize, p + 128);
        assert_eq!(limit as usize, header.base() + 2 * CHUNK);
    }

    #[test]
    fn test_large_request_takes_several_chunks() {
        let (header, chunks) = heap(8);
        let meta = MetadataAllocator::boot(header, chunks, true);

        let p = meta.allocate(3 * CHUNK - 10).unwrap().as_ptr() as usize;
        let (_, _, limit) = meta.cursor();
        assert_eq!(limit as usize, p + 3 * CHUNK);
    }

    #[test]
    fn test_out_of_chunks_is_reported() {
        let (header, chunks) = heap(2);
        let meta = MetadataAllocator::boot(header, chunks, true);

        let err = meta.allocate(4 * CHUNK).unwrap_err();
        assert!(matches!(err, PermError::OutOfMemory { .. }));
    }

    #[test]
    fn test_nodes_are_recycled_before_new_space() {
        let (header, chunks) = heap(4);
        let meta = MetadataAllocator::boot(header, chunks, true);

        let a = meta.node_alloc().unwrap();
        let b = meta.node_alloc().unwrap();
        assert_ne!(a, b);
        unsafe { meta.payload_mut(a)[0] = 11 };

        let (_, next_before, _) = meta.cursor();
        meta.node_dealloc(a);
        meta.node_dealloc(b);
        assert_eq!(header.node_free_head.load(Ordering::Acquire), b.address());

        assert_eq!(meta.node_alloc().unwrap(), b, "free list is LIFO");
        assert_eq!(meta.node_alloc().unwrap(), a);
        assert_eq!(meta.node(a).payload[0], 11);
        assert_eq!(meta.cursor().1, next_before, "recycling does not bump");

        let c = meta.node_alloc().unwrap();
        assert_eq!(c.address(), next_before);
    }

    #[test]
    fn test_restored_boot_keeps_cursor_and_free_list() {
        let (header, chunks) = heap(4);
        let meta = MetadataAllocator::boot(header, chunks.clone(), true);
        let node = meta.node_alloc().unwrap();
        meta.allocate(500).unwrap();
        meta.node_dealloc(node);
        let cursor = meta.cursor();

        let again = MetadataAllocator::boot(header, chunks, false);
        assert_eq!(again.cursor(), cursor);
        assert_eq!(again.node_alloc().unwrap(), node);
    }
}
