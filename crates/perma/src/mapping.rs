use crate::allocator::ChunkSource;
use crate::errors::PermError;
use crate::header::{ArenaCursor, HeaderRecord, SessionHeader};
use crate::scatter::Region;
use nix::errno::Errno;
use nix::sys::mman::{self, MapFlags, MsFlags, ProtFlags};
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

/// How many fresh windows to try when the kernel hands a reserved range to
/// someone else between reservation and mapping.
const RESERVE_ATTEMPTS: u32 = 3;

/// System page size. Fixed mappings need page-aligned addresses and lengths.
pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

/// A heap window mapped at a fixed virtual address.
///
/// The mapping is never unmapped: objects in the heap hold absolute pointers,
/// and code running during process shutdown may still follow them. Dropping a
/// `HeapMapping` leaves the pages in place until the process exits.
pub(crate) struct HeapMapping {
    base: NonNull<u8>,
    len: usize,
    header: &'static SessionHeader,
}

// SAFETY: the mapping is process-global memory that is never unmapped, and all
// mutable header state is atomic.
unsafe impl Send for HeapMapping {}
unsafe impl Sync for HeapMapping {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sharing {
    /// Writes reach the file.
    Shared,
    /// Copy-on-write; the file is never modified.
    Private,
}

impl HeapMapping {
    /// Maps `len` bytes of `file` at exactly `base`.
    ///
    /// Refuses to replace anything already mapped there.
    pub(crate) fn map_at(
        file: &File,
        base: usize,
        len: usize,
        sharing: Sharing,
    ) -> Result<NonNull<u8>, PermError> {
        let conflict = |source: io::Error| PermError::AddressConflict {
            op: "mopen",
            address: base,
            source,
        };
        let addr = NonZeroUsize::new(base)
            .ok_or_else(|| conflict(io::Error::from(io::ErrorKind::InvalidInput)))?;
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| conflict(io::Error::from(io::ErrorKind::InvalidInput)))?;

        let visibility = match sharing {
            Sharing::Shared => MapFlags::MAP_SHARED,
            Sharing::Private => MapFlags::MAP_PRIVATE,
        };

        // SAFETY: MAP_FIXED_NOREPLACE never clobbers an existing mapping.
        let ptr = unsafe {
            mman::mmap(
                Some(addr),
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                visibility | MapFlags::MAP_FIXED_NOREPLACE,
                file,
                0,
            )
        }
        .map_err(|errno| conflict(errno.into()))?;

        // Kernels before 4.17 treat the flag as a hint and may place the
        // mapping elsewhere.
        if ptr.as_ptr() as usize != base {
            unsafe {
                let _ = mman::munmap(ptr, len);
            }
            return Err(conflict(Errno::EEXIST.into()));
        }

        Ok(ptr.cast())
    }

    /// Finds a free, `align`-aligned window of `len` bytes.
    ///
    /// Reserves `len + align` bytes, picks the aligned start inside, and gives
    /// the reservation back. The caller maps there right after.
    pub(crate) fn reserve_aligned(len: usize, align: usize) -> Result<usize, PermError> {
        let total = len
            .checked_add(align)
            .and_then(NonZeroUsize::new)
            .ok_or(PermError::OutOfMemory {
                op: "mopen",
                requested: len,
            })?;

        let ptr = unsafe {
            mman::mmap_anonymous(
                None,
                total,
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE,
            )
        }
        .map_err(|errno| PermError::io("mopen", "error reserving heap window", errno.into()))?;

        let start = ptr.as_ptr() as usize;
        let aligned = start.next_multiple_of(align);

        unsafe { mman::munmap(ptr, total.get()) }
            .map_err(|errno| PermError::io("mopen", "error releasing reservation", errno.into()))?;

        Ok(aligned)
    }

    /// Maps a fresh heap somewhere free, retrying if another mapping wins the
    /// race for the reserved window.
    pub(crate) fn map_anywhere(
        file: &File,
        len: usize,
        align: usize,
        sharing: Sharing,
    ) -> Result<NonNull<u8>, PermError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let base = Self::reserve_aligned(len, align)?;
            match Self::map_at(file, base, len, sharing) {
                Err(PermError::AddressConflict { .. }) if attempt < RESERVE_ATTEMPTS => {
                    tracing::warn!(
                        "mopen: reserved window {base:#x} taken, retrying ({attempt}/{RESERVE_ATTEMPTS})"
                    );
                }
                other => return other,
            }
        }
    }

    /// Writes a fresh header into a new mapping.
    pub(crate) fn format(base: NonNull<u8>, len: usize, first_chunk: usize) -> Self {
        let record = HeaderRecord::fresh(base.as_ptr() as usize, len, first_chunk);
        // SAFETY: base is the start of a new, 64-aligned, writable mapping.
        let header = unsafe { SessionHeader::format(base.as_ptr(), &record) };
        Self { base, len, header }
    }

    /// Adopts a mapping whose header was written by an earlier session.
    pub(crate) fn adopt(base: NonNull<u8>, len: usize) -> Self {
        // SAFETY: base is the start of a heap mapping that is never unmapped.
        let header = unsafe { SessionHeader::at(base.as_ptr()) };
        Self { base, len, header }
    }

    pub(crate) fn header(&self) -> &'static SessionHeader {
        self.header
    }

    pub(crate) fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Raw access to `[base, base + len)` of the heap.
    ///
    /// # Safety
    /// The caller must hold the allocator's global pause, and `len` must not
    /// exceed the mapped length.
    pub(crate) unsafe fn bytes_mut(&self, len: usize) -> &mut [u8] {
        debug_assert!(len <= self.len);
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), len) }
    }

    /// Blocks until `[heap_base, heap_end)` is on disk.
    pub(crate) fn sync(&self, op: &'static str) -> Result<(), PermError> {
        let committed = self.header.end() - self.base();
        unsafe { mman::msync(self.base.cast(), committed, MsFlags::MS_SYNC) }.map_err(|errno| {
            PermError::Sync {
                op,
                target: "map file",
                source: errno.into(),
            }
        })
    }
}

impl ChunkSource for HeapMapping {
    fn grow(&self, size: usize) -> Result<Region, PermError> {
        let max = self.base() + self.len;
        let heap_end = &self.header.heap_end;
        let mut end = heap_end.load(Ordering::Acquire) as usize;
        loop {
            let new_end = match end.checked_add(size) {
                Some(new_end) if new_end <= max => new_end,
                _ => {
                    return Err(PermError::OutOfMemory {
                        op: "chunk_alloc",
                        requested: size,
                    });
                }
            };
            match heap_end.compare_exchange(
                end as u64,
                new_end as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                // SAFETY: [end, new_end) lies inside the permanent mapping.
                Ok(_) => return Ok(unsafe { Region::new(end as *mut u8, size) }),
                Err(current) => end = current as usize,
            }
        }
    }

    fn arena_cursor(&self) -> &ArenaCursor {
        &self.header.arena
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    const CHUNK: usize = 64 * 1024;
    const LEN: usize = 16 * CHUNK;

    fn heap_file(len: usize) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.seek(SeekFrom::Start(len as u64 - 1)).unwrap();
        file.write_all(&[0]).unwrap();
        file
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert_eq!(CHUNK % page_size(), 0);
    }

    #[test]
    fn test_map_anywhere_is_chunk_aligned() {
        let file = heap_file(LEN);
        let base = HeapMapping::map_anywhere(&file, LEN, CHUNK, Sharing::Shared).unwrap();
        assert_eq!(base.as_ptr() as usize % CHUNK, 0);

        let mapping = HeapMapping::format(base, LEN, CHUNK);
        let header = mapping.header().snapshot();
        assert_eq!(header.heap_base as usize, mapping.base());
        assert_eq!(header.committed_len(), CHUNK);
        assert_eq!(header.capacity(), LEN);
    }

    #[test]
    fn test_map_at_refuses_occupied_range() {
        let file = heap_file(LEN);
        let base = HeapMapping::map_anywhere(&file, LEN, CHUNK, Sharing::Shared).unwrap();

        let other = heap_file(LEN);
        let err =
            HeapMapping::map_at(&other, base.as_ptr() as usize, LEN, Sharing::Shared).unwrap_err();
        assert!(
            matches!(err, PermError::AddressConflict { address, .. } if address == base.as_ptr() as usize),
            "existing mapping must not be replaced, got {err:?}"
        );
    }

    #[test]
    fn test_grow_commits_until_capacity() {
        let file = heap_file(LEN);
        let base = HeapMapping::map_anywhere(&file, LEN, CHUNK, Sharing::Shared).unwrap();
        let mapping = HeapMapping::format(base, LEN, CHUNK);

        let chunk = mapping.grow(CHUNK * 2).unwrap();
        assert_eq!(chunk.address(), mapping.base() + CHUNK);
        assert_eq!(chunk.len(), CHUNK * 2);
        assert_eq!(mapping.header().end(), mapping.base() + 3 * CHUNK);

        let err = mapping.grow(LEN).unwrap_err();
        assert!(matches!(err, PermError::OutOfMemory { .. }));
        assert_eq!(
            mapping.header().end(),
            mapping.base() + 3 * CHUNK,
            "failed growth leaves heap_end alone"
        );

        mapping.grow(LEN - 3 * CHUNK).unwrap();
        assert_eq!(mapping.header().end(), mapping.base() + LEN);
    }

    #[test]
    fn test_sync_writes_header_to_file() {
        use std::io::Read;

        let mut file = heap_file(LEN);
        let base = HeapMapping::map_anywhere(&file, LEN, CHUNK, Sharing::Shared).unwrap();
        let mapping = HeapMapping::format(base, LEN, CHUNK);
        mapping.sync("mflush").unwrap();

        let mut bytes = vec![0u8; HeaderRecord::SIZE];
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_exact(&mut bytes).unwrap();
        assert_eq!(
            HeaderRecord::decode(&bytes).unwrap(),
            mapping.header().snapshot()
        );
    }

    #[test]
    fn test_private_mapping_leaves_file_untouched() {
        use std::io::Read;

        let mut file = heap_file(LEN);
        let base = HeapMapping::map_anywhere(&file, LEN, CHUNK, Sharing::Private).unwrap();
        let mapping = HeapMapping::format(base, LEN, CHUNK);
        mapping.sync("mflush").unwrap();

        let mut bytes = vec![0xFFu8; HeaderRecord::SIZE];
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_exact(&mut bytes).unwrap();
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
