use crate::allocator::{ChunkSource, ExternalAllocator};
use crate::errors::PermError;
use crate::scatter::Region;
use allocator_api2::alloc::{AllocError, Allocator};
use memmap2::{MmapMut, MmapOptions};
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Default chunk size, also the alignment required of heap base addresses.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// A chunked bump allocator that can be moved onto a persistent heap.
///
/// Before a session opens, chunks come from anonymous memory and every
/// allocation marks the arena as used, which later stops a session from
/// opening. Once a session rebinds the arena, chunks are committed from the
/// heap and the bump cursor is kept in the heap header.
///
/// Freed memory is not reused; this arena only exists to serve a persistent
/// heap and its tests.
pub struct BumpArena {
    chunk_size: usize,
    state: Mutex<ArenaState>,
    resumed: Condvar,
    allocated: AtomicBool,
}

struct ArenaState {
    paused: bool,
    source: Option<Arc<dyn ChunkSource>>,
    /// Chunks handed out before any session existed.
    anon: Vec<MmapMut>,
    anon_next: usize,
    anon_limit: usize,
}

impl BumpArena {
    /// `chunk_size` is rounded up to a power of two.
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1).next_power_of_two();
        Self {
            chunk_size,
            state: Mutex::new(ArenaState {
                paused: false,
                source: None,
                anon: Vec::new(),
                anon_next: 0,
                anon_limit: 0,
            }),
            resumed: Condvar::new(),
            allocated: AtomicBool::new(false),
        }
    }

    /// Allocates `layout`, waiting while a checkpoint holds the global pause.
    pub fn alloc(&self, layout: Layout) -> Result<NonNull<u8>, PermError> {
        if layout.align() > self.chunk_size {
            return Err(PermError::OutOfMemory {
                op: "malloc",
                requested: layout.size(),
            });
        }
        let mut state = self.unpaused()?;
        let addr = match state.source.clone() {
            Some(source) => self.bump_heap(source.as_ref(), layout)?,
            None => self.bump_anon(&mut state, layout)?,
        };
        NonNull::new(addr as *mut u8).ok_or(PermError::OutOfMemory {
            op: "malloc",
            requested: layout.size(),
        })
    }

    /// Allocates `len` bytes aligned to 16.
    pub fn alloc_bytes(&self, len: usize) -> Result<NonNull<u8>, PermError> {
        let layout = Layout::from_size_align(len.max(1), 16).map_err(|_| PermError::OutOfMemory {
            op: "malloc",
            requested: len,
        })?;
        self.alloc(layout)
    }

    /// Allocates and initializes a `T`. The value is never dropped.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_value<T: Copy>(&self, value: T) -> Result<&mut T, PermError> {
        let ptr = self.alloc(Layout::new::<T>())?.cast::<T>();
        // SAFETY: fresh allocation with T's layout, never handed out again.
        unsafe {
            ptr.as_ptr().write(value);
            Ok(&mut *ptr.as_ptr())
        }
    }

    pub fn is_bound(&self) -> bool {
        self.lock().source.is_some()
    }

    fn bump_heap(&self, source: &dyn ChunkSource, layout: Layout) -> Result<usize, PermError> {
        let cursor = source.arena_cursor();
        let next = cursor.next.load(Ordering::Acquire) as usize;
        let limit = cursor.limit.load(Ordering::Acquire) as usize;

        let start = next.next_multiple_of(layout.align());
        if next != 0 && start + layout.size() <= limit {
            cursor
                .next
                .store((start + layout.size()) as u64, Ordering::Release);
            return Ok(start);
        }

        let chunk = source.grow(self.chunk_ceiling(layout.size())?)?;
        cursor
            .next
            .store((chunk.address() + layout.size()) as u64, Ordering::Release);
        cursor.limit.store(chunk.end() as u64, Ordering::Release);
        Ok(chunk.address())
    }

    fn bump_anon(&self, state: &mut ArenaState, layout: Layout) -> Result<usize, PermError> {
        self.allocated.store(true, Ordering::Release);

        let start = state.anon_next.next_multiple_of(layout.align());
        if state.anon_next != 0 && start + layout.size() <= state.anon_limit {
            state.anon_next = start + layout.size();
            return Ok(start);
        }

        // Anonymous maps are only page aligned.
        let chunk = Self::anon_chunk(state, self.chunk_ceiling(layout.size() + layout.align())?)?;
        let start = chunk.address().next_multiple_of(layout.align());
        state.anon_next = start + layout.size();
        state.anon_limit = chunk.end();
        Ok(start)
    }

    fn anon_chunk(state: &mut ArenaState, size: usize) -> Result<Region, PermError> {
        let mut map = MmapOptions::new()
            .len(size)
            .map_anon()
            .map_err(|e| PermError::io("chunk_alloc", "error mapping anonymous chunk", e))?;
        // SAFETY: the map is kept alive in `anon` for the arena's lifetime.
        let region = unsafe { Region::new(map.as_mut_ptr(), size) };
        state.anon.push(map);
        Ok(region)
    }

    fn chunk_ceiling(&self, size: usize) -> Result<usize, PermError> {
        size.max(1)
            .checked_next_multiple_of(self.chunk_size)
            .ok_or(PermError::OutOfMemory {
                op: "chunk_alloc",
                requested: size,
            })
    }

    fn lock(&self) -> MutexGuard<'_, ArenaState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn unpaused(&self) -> Result<MutexGuard<'_, ArenaState>, PermError> {
        let state = self.lock();
        self.resumed
            .wait_while(state, |s| s.paused)
            .map_err(|_| PermError::Pause {
                op: "malloc",
                reason: "arena lock poisoned",
            })
    }
}

impl Default for BumpArena {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ExternalAllocator for BumpArena {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn acquire_chunk(&self, size: usize) -> Result<Region, PermError> {
        let mut state = self.unpaused()?;
        let size = self.chunk_ceiling(size)?;
        match state.source.clone() {
            Some(source) => source.grow(size),
            None => {
                self.allocated.store(true, Ordering::Release);
                Self::anon_chunk(&mut state, size)
            }
        }
    }

    fn begin_global_pause(&self) -> Result<(), PermError> {
        let mut state = self.lock();
        if state.paused {
            return Err(PermError::Pause {
                op: "begin_global_pause",
                reason: "allocator already paused",
            });
        }
        // Allocations run entirely under the state lock, so none is in flight.
        state.paused = true;
        Ok(())
    }

    fn end_global_pause(&self) -> Result<(), PermError> {
        let mut state = self.lock();
        if !state.paused {
            return Err(PermError::Pause {
                op: "end_global_pause",
                reason: "allocator not paused",
            });
        }
        state.paused = false;
        self.resumed.notify_all();
        Ok(())
    }

    fn has_allocation_occurred(&self) -> bool {
        self.allocated.load(Ordering::Acquire)
    }

    fn rebind_chunk_source(&self, source: Arc<dyn ChunkSource>) -> Result<(), PermError> {
        let mut state = self.lock();
        if state.source.is_some() {
            return Err(PermError::OneTimeConstraint {
                op: "chunk_swap_enable",
                reason: "chunk source already bound to a persistent heap",
            });
        }
        if self.has_allocation_occurred() {
            return Err(PermError::OneTimeConstraint {
                op: "chunk_swap_enable",
                reason: "must be called before malloc",
            });
        }
        state.source = Some(source);
        Ok(())
    }
}

/// Lets standard containers live in the heap, e.g.
/// `allocator_api2::vec::Vec<u64, &BumpArena>`.
///
/// Only their buffers are persistent: a container's own fields must be kept
/// in the heap or in a root to survive a restart.
unsafe impl Allocator for BumpArena {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = self.alloc(layout).map_err(|e| {
            tracing::debug!("malloc: {e}");
            AllocError
        })?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {
        // Bump memory is only reclaimed by a restore.
    }
}
