use crate::allocator::paused;
use crate::errors::PermError;
use crate::header::HeaderRecord;
use crate::mapping::HeapMapping;
use crate::reliable_io::read_fully;
use crate::roots::RootRegistry;
use crate::scatter::scatter;
use crate::session::PersistentHeap;
use std::fs::File;
use std::io::{self, Seek, SeekFrom};

impl PersistentHeap {
    /// Replaces the heap and the roots with the contents of the backup file.
    ///
    /// The backup header is checked against the live one first; on any
    /// mismatch, or if the backup is shorter than its header claims, nothing
    /// is modified.
    pub fn restore(&self) -> Result<(), PermError> {
        let state = self.lock();
        let session = state.open_session("restore")?;
        let Some(file) = session.backup.as_ref() else {
            tracing::error!("restore: no backup file open");
            return Err(PermError::BackupFileNotOpen { op: "restore" });
        };

        let _frozen = session.metadata.freeze();
        paused(self.allocator.as_ref(), "restore", || {
            restore_from(file, &session.mapping, &state.roots)
        })
    }
}

fn restore_from(
    mut file: &File,
    mapping: &HeapMapping,
    roots: &RootRegistry,
) -> Result<(), PermError> {
    let live = mapping.header().snapshot();

    let mut bytes = [0u8; HeaderRecord::SIZE];
    file.seek(SeekFrom::Start(0))
        .and_then(|_| read_fully(&mut file, &mut bytes))
        .map_err(|e| {
            tracing::error!("restore: error reading backup header: {e}");
            PermError::io("restore", "error reading backup header", e)
        })?;
    let saved = HeaderRecord::decode(&bytes).ok_or_else(|| {
        PermError::io(
            "restore",
            "error reading backup header",
            io::ErrorKind::UnexpectedEof.into(),
        )
    })?;

    check_backup("restore", &saved, &live)?;

    let len = saved.committed_len();
    let file_len = file
        .metadata()
        .map_err(|e| PermError::io("restore", "error reading backup size", e))?
        .len();
    if file_len < len as u64 {
        tracing::error!(
            file_len,
            expected = len,
            "restore: backup file shorter than its heap"
        );
        return Err(PermError::io(
            "restore",
            "backup file shorter than its heap",
            io::ErrorKind::UnexpectedEof.into(),
        ));
    }

    // Stage everything first so a failed read leaves the heap untouched.
    let mut staged = vec![0u8; len];
    file.seek(SeekFrom::Start(0))
        .and_then(|_| read_fully(&mut file, &mut staged))
        .map_err(|e| {
            tracing::error!("restore: error reading heap data: {e}");
            PermError::io("restore", "error reading heap data", e)
        })?;

    let live_len = live.committed_len();
    // SAFETY: the caller holds the pause; both lengths lie inside the mapping
    // since heap_max is identical for backup and live heap.
    let heap = unsafe { mapping.bytes_mut(len.max(live_len)) };
    heap[..len].copy_from_slice(&staged);
    if live_len > len {
        heap[len..live_len].fill(0);
    }

    let blob_start = (saved.roots_blob_ptr - saved.heap_base) as usize;
    let blob = &heap[blob_start..blob_start + saved.roots_blob_len as usize];
    let copied = scatter(blob, roots.regions());

    tracing::debug!(
        bytes = len,
        zeroed = live_len.saturating_sub(len),
        roots = copied,
        "restore: heap restored"
    );
    Ok(())
}

fn invalid(op: &'static str, field: &'static str, found: u64, expected: String) -> PermError {
    tracing::error!("{op}: {field} incorrect, found:{found:#x} expect:{expected}");
    PermError::HeaderValidation {
        op,
        field,
        found,
        expected,
    }
}

fn expect_eq(op: &'static str, field: &'static str, found: u64, expected: u64) -> Result<(), PermError> {
    if found != expected {
        return Err(invalid(op, field, found, format!("{expected:#x}")));
    }
    Ok(())
}

fn expect_within(
    op: &'static str,
    field: &'static str,
    found: u64,
    low: u64,
    high: u64,
) -> Result<(), PermError> {
    if found < low || found > high {
        return Err(invalid(op, field, found, format!("[{low:#x}, {high:#x}]")));
    }
    Ok(())
}

/// Checks that every address in `record` lies inside the heap it describes.
pub(crate) fn check_bounds(op: &'static str, record: &HeaderRecord) -> Result<(), PermError> {
    let base = record.heap_base;
    let max = record.heap_max;
    if base == 0 || max <= base {
        return Err(invalid(op, "heap_max", max, format!("> {base:#x}")));
    }
    // Nothing may be handed out from under the header.
    let first_free = base.saturating_add(HeaderRecord::SIZE as u64);
    expect_within(op, "heap_end", record.heap_end, first_free, max)?;
    let end = record.heap_end;

    expect_within(op, "metadata_base", record.metadata_base, base, end)?;
    expect_within(op, "metadata_limit", record.metadata_limit, base, end)?;
    expect_within(
        op,
        "metadata_next",
        record.metadata_next,
        record.metadata_base.max(first_free),
        record.metadata_limit,
    )?;

    expect_within(op, "roots_blob_ptr", record.roots_blob_ptr, first_free, end)?;
    let blob_end = record
        .roots_blob_ptr
        .checked_add(record.roots_blob_len)
        .unwrap_or(u64::MAX);
    expect_within(op, "roots_blob_len", blob_end, base, end)?;

    if record.arena_limit != 0 {
        expect_within(op, "arena_limit", record.arena_limit, first_free, end)?;
        expect_within(op, "arena_next", record.arena_next, first_free, record.arena_limit)?;
    } else {
        expect_eq(op, "arena_next", record.arena_next, 0)?;
    }
    Ok(())
}

/// Checks a backup header against the header of the live heap it would
/// replace.
pub(crate) fn check_backup(
    op: &'static str,
    saved: &HeaderRecord,
    live: &HeaderRecord,
) -> Result<(), PermError> {
    expect_eq(op, "magic", saved.magic, live.magic)?;
    expect_eq(op, "heap_base", saved.heap_base, live.heap_base)?;
    expect_eq(op, "heap_max", saved.heap_max, live.heap_max)?;
    check_bounds(op, saved)?;
    expect_eq(op, "roots_blob_len", saved.roots_blob_len, live.roots_blob_len)
}
