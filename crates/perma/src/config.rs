use crate::errors::PermError;
use crate::mode::OpenMode;
use crate::paths::{
    DEFAULT_HEAP_MODE, DEFAULT_HEAP_SIZE, ENV_BACKUP_FILE, ENV_BACKUP_MODE, ENV_HEAP_ADDRESS,
    ENV_HEAP_FILE, ENV_HEAP_MODE, ENV_HEAP_SIZE,
};
use std::env;
use std::path::PathBuf;

/// Everything needed to open a heap session, usually read from `PERM_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    pub path: PathBuf,
    pub mode: OpenMode,
    pub size: usize,
    /// Fixed base address; `None` lets the allocator or the kernel choose.
    pub address: Option<usize>,
    pub backup: Option<BackupConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub path: PathBuf,
    pub mode: OpenMode,
}

impl HeapConfig {
    pub fn new(path: impl Into<PathBuf>, mode: OpenMode, size: usize) -> Self {
        Self {
            path: path.into(),
            mode,
            size,
            address: None,
            backup: None,
        }
    }

    pub fn with_address(mut self, address: usize) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_backup(mut self, path: impl Into<PathBuf>, mode: OpenMode) -> Self {
        self.backup = Some(BackupConfig {
            path: path.into(),
            mode,
        });
        self
    }

    /// Reads the configuration from the process environment.
    ///
    /// Returns `Ok(None)` when `PERM_FNAME` is not set.
    pub fn from_env() -> Result<Option<Self>, PermError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>, PermError> {
        let Some(path) = lookup(ENV_HEAP_FILE).filter(|p| !p.is_empty()) else {
            return Ok(None);
        };

        let mode_str = lookup(ENV_HEAP_MODE).unwrap_or_else(|| DEFAULT_HEAP_MODE.to_string());
        let mode: OpenMode = mode_str.parse()?;

        let size = match lookup(ENV_HEAP_SIZE) {
            Some(s) => parse_size(&s)?,
            None => DEFAULT_HEAP_SIZE,
        };

        let address = match lookup(ENV_HEAP_ADDRESS) {
            Some(s) => parse_address(&s)?,
            None => None,
        };

        let backup = match lookup(ENV_BACKUP_FILE).filter(|p| !p.is_empty()) {
            Some(path) => {
                let mode = match lookup(ENV_BACKUP_MODE) {
                    Some(m) => m.parse()?,
                    None => mode,
                };
                Some(BackupConfig {
                    path: path.into(),
                    mode,
                })
            }
            None => None,
        };

        Ok(Some(Self {
            path: path.into(),
            mode,
            size,
            address,
            backup,
        }))
    }
}

/// Parses a byte count with an optional `K`, `M`, `G` or `T` suffix
/// (binary multiples, case-insensitive).
pub fn parse_size(s: &str) -> Result<usize, PermError> {
    let invalid = || PermError::InvalidConfig(format!("invalid heap size {s:?}"));
    let s = s.trim();
    let (digits, shift) = match s.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_uppercase() {
                'K' => 10,
                'M' => 20,
                'G' => 30,
                'T' => 40,
                _ => return Err(invalid()),
            };
            (&s[..i], shift)
        }
        _ => (s, 0),
    };
    let value: usize = digits.parse().map_err(|_| invalid())?;
    value.checked_mul(1usize << shift).ok_or_else(invalid)
}

/// Parses a heap address in C notation: `0x` hex, leading-zero octal or
/// decimal. Zero means "no fixed address".
pub fn parse_address(s: &str) -> Result<Option<usize>, PermError> {
    let invalid = |_| PermError::InvalidConfig(format!("invalid heap address {s:?}"));
    let s = s.trim();
    let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).map_err(invalid)?
    } else if s.len() > 1 && s.starts_with('0') {
        usize::from_str_radix(&s[1..], 8).map_err(invalid)?
    } else {
        s.parse::<usize>().map_err(invalid)?
    };
    Ok((value != 0).then_some(value))
}
