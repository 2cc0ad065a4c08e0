use crate::errors::PermError;
use crate::header::{HeaderRecord, MAGIC};
use crate::restore::check_bounds;
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::path::Path;

/// Read-only view of a heap or backup file, for tooling.
///
/// Maps the file wherever the kernel likes, so absolute addresses in the
/// header are only used as offsets from `heap_base`. Opening an inspector does
/// not count as a session and may be done at any time.
pub struct HeapInspector {
    _file: File,
    mmap: Mmap,
}

impl HeapInspector {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, PermError> {
        let file = File::open(path)?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        Ok(Self { _file: file, mmap })
    }

    pub fn file_len(&self) -> usize {
        self.mmap.len()
    }

    /// Decodes and checks the header at offset 0.
    pub fn header(&self) -> Result<HeaderRecord, PermError> {
        let record = HeaderRecord::decode(&self.mmap).ok_or(PermError::HeaderValidation {
            op: "inspect",
            field: "file length",
            found: self.mmap.len() as u64,
            expected: format!(">= {:#x}", HeaderRecord::SIZE),
        })?;
        if record.magic != MAGIC {
            return Err(PermError::IncompatibleVersion {
                op: "inspect",
                found: record.magic,
                expected: MAGIC,
            });
        }
        check_bounds("inspect", &record)?;
        Ok(record)
    }

    /// The committed part of the heap, header first.
    pub fn committed(&self) -> Result<&[u8], PermError> {
        let header = self.header()?;
        let len = header.committed_len();
        self.mmap.get(..len).ok_or(PermError::HeaderValidation {
            op: "inspect",
            field: "file length",
            found: self.mmap.len() as u64,
            expected: format!(">= {len:#x}"),
        })
    }

    /// The serialized roots as of the last checkpoint.
    pub fn roots_blob(&self) -> Result<&[u8], PermError> {
        let header = self.header()?;
        let start = (header.roots_blob_ptr - header.heap_base) as usize;
        let end = start + header.roots_blob_len as usize;
        Ok(&self.committed()?[start..end])
    }
}
