use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PermError {
    #[error("{op}: persistent heap session already open")]
    AlreadyOpen { op: &'static str },

    #[error("{op}: {reason}")]
    OneTimeConstraint {
        op: &'static str,
        reason: &'static str,
    },

    #[error("register: root registry full ({capacity} entries)")]
    CapacityExceeded { capacity: usize },

    #[error("{op}: heap address {address:#x} must be aligned to chunk size {chunk_size:#x}")]
    Alignment {
        op: &'static str,
        address: usize,
        chunk_size: usize,
    },

    #[error("{op}: cannot map heap at {address:#x}: {source}")]
    AddressConflict {
        op: &'static str,
        address: usize,
        #[source]
        source: io::Error,
    },

    #[error("{op}: version key incorrect, found:{found:#x} expect:{expected:#x}")]
    IncompatibleVersion {
        op: &'static str,
        found: u64,
        expected: u64,
    },

    #[error("{op}: {field} incorrect, found:{found:#x} expect:{expected}")]
    HeaderValidation {
        op: &'static str,
        field: &'static str,
        found: u64,
        expected: String,
    },

    #[error("{op}: error syncing {target}: {source}")]
    Sync {
        op: &'static str,
        target: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("{op}: persistent heap session not open")]
    SessionNotOpen { op: &'static str },

    #[error("{op}: backup file not open")]
    BackupFileNotOpen { op: &'static str },

    #[error("{op}: out of memory requesting {requested} bytes")]
    OutOfMemory { op: &'static str, requested: usize },

    #[error("{op}: allocator pause failed: {reason}")]
    Pause {
        op: &'static str,
        reason: &'static str,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PermError {
    /// Wraps an `io::Error` with the operation that hit it, keeping the kind.
    pub(crate) fn io(op: &'static str, what: &str, err: io::Error) -> Self {
        PermError::IoError(io::Error::new(err.kind(), format!("{op}: {what}: {err}")))
    }
}
