use crate::allocator::ExternalAllocator;
use crate::config::HeapConfig;
use crate::errors::PermError;
use crate::header::{HeaderRecord, MAGIC};
use crate::mapping::{HeapMapping, Sharing};
use crate::metadata::MetadataAllocator;
use crate::mode::OpenMode;
use crate::reliable_io::{read_fully, write_fully};
use crate::restore::check_bounds;
use crate::roots::{RootCell, RootRegistry};
use crate::scatter::{Region, scatter};
use bytemuck::Pod;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lifecycle of a [`PersistentHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Closed,
    Opening,
    /// Open on a heap file created by this session.
    Created,
    /// Open on a heap file written by an earlier session.
    Restored,
}

impl Phase {
    pub fn is_open(&self) -> bool {
        matches!(self, Phase::Created | Phase::Restored)
    }
}

/// A heap mapped onto a file at a fixed address, plus the root regions saved
/// with it.
///
/// Register roots first, then open. A handle opens at most once: the mapping
/// outlives the session, and the allocator stays bound to it.
///
/// ```ignore
/// let arena = Arc::new(BumpArena::default());
/// let heap = PersistentHeap::new(arena.clone());
/// heap.register_cell(&COUNTER)?;
/// heap.open("/tmp/app.heap", OpenMode::CREATE, 64 << 20)?;
/// // allocate from `arena`, update roots...
/// heap.flush()?;
/// ```
pub struct PersistentHeap {
    pub(crate) allocator: Arc<dyn ExternalAllocator>,
    state: Mutex<SessionState>,
}

pub(crate) struct SessionState {
    pub(crate) phase: Phase,
    opened_once: bool,
    pub(crate) roots: RootRegistry,
    pub(crate) session: Option<OpenSession>,
}

/// Resources held while a session is open.
pub(crate) struct OpenSession {
    _file: File,
    pub(crate) mode: OpenMode,
    pub(crate) mapping: Arc<HeapMapping>,
    pub(crate) metadata: Arc<MetadataAllocator>,
    pub(crate) backup: Option<File>,
}

impl SessionState {
    pub(crate) fn open_session(&self, op: &'static str) -> Result<&OpenSession, PermError> {
        self.session.as_ref().ok_or_else(|| {
            tracing::error!("{op}: no open session");
            PermError::SessionNotOpen { op }
        })
    }
}

impl PersistentHeap {
    pub fn new(allocator: Arc<dyn ExternalAllocator>) -> Self {
        Self::with_root_capacity(allocator, crate::roots::DEFAULT_ROOT_CAPACITY)
    }

    pub fn with_root_capacity(allocator: Arc<dyn ExternalAllocator>, capacity: usize) -> Self {
        Self {
            allocator,
            state: Mutex::new(SessionState {
                phase: Phase::Closed,
                opened_once: false,
                roots: RootRegistry::new(capacity),
                session: None,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a region to be saved with the heap. Only allowed before opening.
    pub fn register(&self, region: Region) -> Result<(), PermError> {
        self.lock().roots.register(region)
    }

    pub fn register_cell<T: Pod>(&self, cell: &'static RootCell<T>) -> Result<(), PermError> {
        self.register(cell.region())
    }

    /// Opens `path`, creating a fresh heap of `size` bytes when `mode` creates.
    /// Existing heaps are mapped at the address they were created at and
    /// `size` is ignored.
    pub fn open(&self, path: impl AsRef<Path>, mode: OpenMode, size: usize) -> Result<Phase, PermError> {
        self.open_inner(path.as_ref(), mode, size, None)
    }

    /// Like [`open`](Self::open), placing a new heap at `address`.
    pub fn open_at(
        &self,
        path: impl AsRef<Path>,
        mode: OpenMode,
        size: usize,
        address: usize,
    ) -> Result<Phase, PermError> {
        self.open_inner(path.as_ref(), mode, size, Some(address))
    }

    /// Opens the heap described by `config`, and its backup file if one is
    /// configured.
    pub fn open_with_config(&self, config: &HeapConfig) -> Result<Phase, PermError> {
        let phase = self.open_inner(&config.path, config.mode, config.size, config.address)?;
        if let Some(backup) = &config.backup {
            self.open_backup(&backup.path, backup.mode)?;
        }
        Ok(phase)
    }

    fn open_inner(
        &self,
        path: &Path,
        mode: OpenMode,
        size: usize,
        address: Option<usize>,
    ) -> Result<Phase, PermError> {
        let mut state = self.lock();

        if state.phase != Phase::Closed {
            tracing::error!("mopen: session already open");
            return Err(PermError::AlreadyOpen { op: "mopen" });
        }
        if state.opened_once {
            tracing::error!("mopen: handle already opened once");
            return Err(PermError::OneTimeConstraint {
                op: "mopen",
                reason: "a heap handle can only be opened once",
            });
        }
        if self.allocator.has_allocation_occurred() {
            tracing::error!("mopen: allocator used before the heap was opened");
            return Err(PermError::OneTimeConstraint {
                op: "mopen",
                reason: "must be called before malloc",
            });
        }

        state.phase = Phase::Opening;
        let result = if mode.creates() {
            self.create(&mut state, path, mode, size, address)
        } else {
            self.reopen(&mut state, path, mode)
        };

        match result {
            Ok(session) => {
                let phase = if mode.creates() {
                    Phase::Created
                } else {
                    Phase::Restored
                };
                let header = session.mapping.header().snapshot();
                tracing::info!(
                    path = %path.display(),
                    base = %format!("{:#x}", header.heap_base),
                    committed = header.committed_len(),
                    capacity = header.capacity(),
                    roots = state.roots.len(),
                    "mopen: {phase:?} heap"
                );
                state.session = Some(session);
                state.phase = phase;
                Ok(phase)
            }
            Err(e) => {
                tracing::error!(path = %path.display(), "mopen: {e}");
                state.phase = Phase::Closed;
                Err(e)
            }
        }
    }

    fn create(
        &self,
        state: &mut SessionState,
        path: &Path,
        mode: OpenMode,
        size: usize,
        address: Option<usize>,
    ) -> Result<OpenSession, PermError> {
        let chunk_size = self.allocator.chunk_size();
        if chunk_size == 0 || chunk_size % crate::mapping::page_size() != 0 {
            return Err(PermError::InvalidConfig(format!(
                "chunk size {chunk_size:#x} is not a multiple of the page size"
            )));
        }
        if size == 0 {
            return Err(PermError::InvalidConfig("heap size must be non-zero".into()));
        }
        let size = size
            .checked_next_multiple_of(chunk_size)
            .ok_or(PermError::OutOfMemory { op: "mopen", requested: size })?;

        let mut file = mode
            .options()
            .open(path)
            .map_err(|e| PermError::io("mopen", "error opening map file", e))?;

        // Sparse extension: only the last byte is written.
        file.seek(SeekFrom::Start(size as u64 - 1))
            .and_then(|_| write_fully(&mut file, &[0]))
            .map_err(|e| PermError::io("mopen", "error extending map file", e))?;

        let base = match address.or_else(|| self.allocator.default_base()) {
            Some(base) if base % chunk_size != 0 => {
                return Err(PermError::Alignment {
                    op: "mopen",
                    address: base,
                    chunk_size,
                });
            }
            Some(base) => HeapMapping::map_at(&file, base, size, Sharing::Shared)?,
            None => HeapMapping::map_anywhere(&file, size, chunk_size, Sharing::Shared)?,
        };

        let mapping = Arc::new(HeapMapping::format(base, size, chunk_size));
        self.allocator.rebind_chunk_source(mapping.clone())?;
        state.opened_once = true;

        let header = mapping.header();
        let metadata = Arc::new(MetadataAllocator::boot(
            header,
            Arc::clone(&self.allocator),
            true,
        ));

        let total = state.roots.total();
        let blob = metadata.allocate(total).map_err(|_| PermError::OutOfMemory {
            op: "mopen",
            requested: total,
        })?;
        header
            .roots_blob_ptr
            .store(blob.as_ptr() as u64, Ordering::Release);
        header
            .roots_blob_len
            .store(total as u64, Ordering::Release);

        state.roots.seal();

        let session = OpenSession {
            _file: file,
            mode,
            mapping,
            metadata,
            backup: None,
        };
        crate::checkpoint::flush_session(self.allocator.as_ref(), &state.roots, &session, "mopen")?;
        Ok(session)
    }

    fn reopen(
        &self,
        state: &mut SessionState,
        path: &Path,
        mode: OpenMode,
    ) -> Result<OpenSession, PermError> {
        let mut file = mode
            .options()
            .open(path)
            .map_err(|e| PermError::io("mopen", "error opening map file", e))?;

        let mut bytes = [0u8; HeaderRecord::SIZE];
        read_fully(&mut file, &mut bytes)
            .map_err(|e| PermError::io("mopen", "error reading header", e))?;
        let record = HeaderRecord::decode(&bytes).ok_or(PermError::IncompatibleVersion {
            op: "mopen",
            found: 0,
            expected: MAGIC,
        })?;

        if record.magic != MAGIC {
            return Err(PermError::IncompatibleVersion {
                op: "mopen",
                found: record.magic,
                expected: MAGIC,
            });
        }
        check_bounds("mopen", &record)?;

        let capacity = record.capacity();
        let file_len = file
            .metadata()
            .map_err(|e| PermError::io("mopen", "error reading map file size", e))?
            .len();
        if file_len < capacity as u64 {
            return Err(PermError::HeaderValidation {
                op: "mopen",
                field: "file length",
                found: file_len,
                expected: format!("{capacity:#x}"),
            });
        }

        let sharing = if mode.is_writable() {
            Sharing::Shared
        } else {
            Sharing::Private
        };
        let base = HeapMapping::map_at(&file, record.heap_base as usize, capacity, sharing)?;
        let mapping = Arc::new(HeapMapping::adopt(base, capacity));
        self.allocator.rebind_chunk_source(mapping.clone())?;
        state.opened_once = true;

        let metadata = Arc::new(MetadataAllocator::boot(
            mapping.header(),
            Arc::clone(&self.allocator),
            false,
        ));

        let blob_len = record.roots_blob_len as usize;
        if blob_len != state.roots.total() {
            tracing::warn!(
                saved = blob_len,
                registered = state.roots.total(),
                "mopen: roots blob size differs from registered roots"
            );
        }
        // SAFETY: check_bounds placed the blob inside the committed heap.
        let blob = unsafe {
            std::slice::from_raw_parts(record.roots_blob_ptr as *const u8, blob_len)
        };
        scatter(blob, state.roots.regions());
        state.roots.seal();

        Ok(OpenSession {
            _file: file,
            mode,
            mapping,
            metadata,
            backup: None,
        })
    }

    /// Flushes a writable heap and closes its file. The heap stays mapped.
    pub fn close(&self) -> Result<(), PermError> {
        let mut state = self.lock();
        let session = state.open_session("mclose")?;

        let flushed = if session.mode.is_writable() {
            crate::checkpoint::flush_session(self.allocator.as_ref(), &state.roots, session, "mclose")
        } else {
            Ok(())
        };

        state.session = None;
        state.phase = Phase::Closed;
        tracing::info!("mclose: session closed");
        flushed
    }

    /// Opens the file used by [`backup`](Self::backup) and
    /// [`restore`](Self::restore).
    pub fn open_backup(&self, path: impl AsRef<Path>, mode: OpenMode) -> Result<(), PermError> {
        let path = path.as_ref();
        let mut state = self.lock();
        let session = state.session.as_mut().ok_or_else(|| {
            tracing::error!("bopen: no open session");
            PermError::SessionNotOpen { op: "bopen" }
        })?;
        if session.backup.is_some() {
            tracing::error!("bopen: backup file already open");
            return Err(PermError::AlreadyOpen { op: "bopen" });
        }

        let file = mode.options().open(path).map_err(|e| {
            tracing::error!(path = %path.display(), "bopen: {e}");
            PermError::io("bopen", "error opening backup file", e)
        })?;
        session.backup = Some(file);
        tracing::info!(path = %path.display(), "bopen: backup file open");
        Ok(())
    }

    pub fn close_backup(&self) -> Result<(), PermError> {
        let mut state = self.lock();
        let session = state.session.as_mut().ok_or(PermError::SessionNotOpen { op: "bclose" })?;
        match session.backup.take() {
            Some(_) => Ok(()),
            None => Err(PermError::BackupFileNotOpen { op: "bclose" }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    /// Snapshot of the live session header.
    pub fn header(&self) -> Result<HeaderRecord, PermError> {
        let state = self.lock();
        Ok(state.open_session("header")?.mapping.header().snapshot())
    }

    pub fn metadata(&self) -> Result<Arc<MetadataAllocator>, PermError> {
        let state = self.lock();
        Ok(Arc::clone(&state.open_session("metadata")?.metadata))
    }

    pub fn allocator(&self) -> &Arc<dyn ExternalAllocator> {
        &self.allocator
    }

    pub fn root_count(&self) -> usize {
        self.lock().roots.len()
    }

    pub fn roots_total(&self) -> usize {
        self.lock().roots.total()
    }

    pub fn has_backup(&self) -> bool {
        self.lock()
            .session
            .as_ref()
            .is_some_and(|s| s.backup.is_some())
    }
}

impl Drop for PersistentHeap {
    fn drop(&mut self) {
        if self.lock().phase.is_open() {
            if let Err(e) = self.close() {
                tracing::warn!("mclose: closing dropped heap failed: {e}");
            }
        }
    }
}
