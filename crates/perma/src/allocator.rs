//! Interface between the persistent heap and the allocator that serves
//! application allocations from it.
//!
//! The session never hands out application memory itself. It maps the heap,
//! then rebinds the allocator's chunk source to that mapping, and from then on
//! relies on the allocator for three things: chunks for its own metadata, a
//! global pause during checkpoints, and the promise that nothing was allocated
//! before the heap existed.

use crate::errors::PermError;
use crate::header::ArenaCursor;
use crate::scatter::Region;
use std::sync::Arc;

/// Where an allocator's chunks come from once a session is open.
pub trait ChunkSource: Send + Sync {
    /// Commits `size` more bytes at the end of the heap and returns them.
    fn grow(&self, size: usize) -> Result<Region, PermError>;

    /// Cursor the allocator keeps inside the heap header so that it is rolled
    /// back together with the heap on restore.
    fn arena_cursor(&self) -> &ArenaCursor;
}

pub trait ExternalAllocator: Send + Sync {
    /// Alignment and granularity of chunks. Heap base addresses must be
    /// multiples of this.
    fn chunk_size(&self) -> usize;

    /// Preferred heap base when the caller does not pick one.
    fn default_base(&self) -> Option<usize> {
        None
    }

    /// Hands out at least `size` bytes, rounded up to whole chunks.
    fn acquire_chunk(&self, size: usize) -> Result<Region, PermError>;

    /// Takes every internal lock; no allocation may make progress until
    /// [`end_global_pause`](Self::end_global_pause).
    fn begin_global_pause(&self) -> Result<(), PermError>;

    fn end_global_pause(&self) -> Result<(), PermError>;

    /// True once anything was allocated from memory that is not a session heap.
    fn has_allocation_occurred(&self) -> bool;

    /// Backs every future chunk with `source`. One-time: a second call fails
    /// with `OneTimeConstraint`.
    fn rebind_chunk_source(&self, source: Arc<dyn ChunkSource>) -> Result<(), PermError>;
}

/// Holds an allocator's global pause and releases it when dropped.
///
/// Prefer [`GlobalPause::end`], which reports a failed release; dropping only
/// logs it.
pub struct GlobalPause<'a> {
    allocator: &'a dyn ExternalAllocator,
    op: &'static str,
    active: bool,
}

impl<'a> GlobalPause<'a> {
    pub fn begin(allocator: &'a dyn ExternalAllocator, op: &'static str) -> Result<Self, PermError> {
        allocator.begin_global_pause().inspect_err(|e| {
            tracing::error!("{op}: could not pause allocator: {e}");
        })?;
        Ok(Self {
            allocator,
            op,
            active: true,
        })
    }

    pub fn end(mut self) -> Result<(), PermError> {
        self.active = false;
        self.allocator.end_global_pause().inspect_err(|e| {
            tracing::error!("{}: could not resume allocator: {e}", self.op);
        })
    }
}

impl Drop for GlobalPause<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.allocator.end_global_pause() {
                tracing::error!("{}: could not resume allocator: {e}", self.op);
            }
        }
    }
}

/// Runs `f` inside the allocator's global pause.
///
/// The pause is released on every path. If both `f` and the release fail, the
/// error from `f` wins and the release failure is only logged.
pub(crate) fn paused<T>(
    allocator: &dyn ExternalAllocator,
    op: &'static str,
    f: impl FnOnce() -> Result<T, PermError>,
) -> Result<T, PermError> {
    let pause = GlobalPause::begin(allocator, op)?;
    let result = f();
    match (result, pause.end()) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), _) => Err(e),
    }
}
