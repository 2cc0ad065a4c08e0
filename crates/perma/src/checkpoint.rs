use crate::allocator::{ExternalAllocator, paused};
use crate::errors::PermError;
use crate::header::SessionHeader;
use crate::reliable_io::write_fully;
use crate::roots::RootRegistry;
use crate::scatter::gather;
use crate::session::{OpenSession, PersistentHeap};
use std::io::{Seek, SeekFrom};

impl PersistentHeap {
    /// Saves the roots into the heap and syncs the heap to its backing file.
    pub fn flush(&self) -> Result<(), PermError> {
        let state = self.lock();
        let session = state.open_session("mflush")?;
        flush_session(self.allocator.as_ref(), &state.roots, session, "mflush")
    }

    /// Copies the committed heap, roots included, into the backup file.
    ///
    /// The backup is truncated to exactly the committed length, so it can be
    /// smaller than the heap file.
    pub fn backup(&self) -> Result<(), PermError> {
        let state = self.lock();
        let session = state.open_session("backup")?;
        let Some(mut file) = session.backup.as_ref() else {
            tracing::error!("backup: no backup file open");
            return Err(PermError::BackupFileNotOpen { op: "backup" });
        };

        let mapping = &session.mapping;
        let _frozen = session.metadata.freeze();
        paused(self.allocator.as_ref(), "backup", || {
            let header = mapping.header();
            gather_roots(&state.roots, header);

            let len = header.end() - header.base();
            // SAFETY: the pause is held and the committed range is mapped.
            let bytes: &[u8] = unsafe { mapping.bytes_mut(len) };

            file.seek(SeekFrom::Start(0))
                .and_then(|_| write_fully(&mut file, bytes))
                .map_err(|e| {
                    tracing::error!("backup: error writing heap data: {e}");
                    PermError::io("backup", "error writing heap data", e)
                })?;
            file.sync_all().map_err(|source| {
                tracing::error!("backup: error syncing backup file: {source}");
                PermError::Sync {
                    op: "backup",
                    target: "backup file",
                    source,
                }
            })?;
            file.set_len(len as u64)
                .map_err(|e| PermError::io("backup", "error truncating backup file", e))?;

            tracing::debug!(bytes = len, "backup: heap written");
            Ok(())
        })
    }
}

/// Copies every registered root into the roots blob.
pub(crate) fn gather_roots(roots: &RootRegistry, header: &SessionHeader) -> usize {
    let snapshot = header.snapshot();
    let len = (snapshot.roots_blob_len as usize).min(roots.total());
    if len == 0 {
        return 0;
    }
    // SAFETY: the blob was allocated inside the heap at open and holds
    // roots_blob_len bytes.
    let blob = unsafe {
        std::slice::from_raw_parts_mut(snapshot.roots_blob_ptr as *mut u8, len)
    };
    gather(blob, roots.regions())
}

/// Flush body shared by `flush`, the initial checkpoint at creation, and
/// `close`.
pub(crate) fn flush_session(
    allocator: &dyn ExternalAllocator,
    roots: &RootRegistry,
    session: &OpenSession,
    op: &'static str,
) -> Result<(), PermError> {
    let _frozen = session.metadata.freeze();
    paused(allocator, op, || {
        let copied = gather_roots(roots, session.mapping.header());
        session.mapping.sync(op).inspect_err(|e| {
            tracing::error!("{op}: {e}");
        })?;
        tracing::debug!(roots = copied, "{op}: heap synced");
        Ok(())
    })
}
