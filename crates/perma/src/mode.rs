use crate::errors::PermError;
use std::fs::OpenOptions;
use std::str::FromStr;

/// How a heap or backup file is opened, written the way `fopen` modes are.
///
/// - `r`: existing file, read only
/// - `r+`: existing file, read and write
/// - `w`, `w+`: create or truncate, read and write
///
/// `b` is accepted and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    read: bool,
    write: bool,
    create: bool,
}

impl OpenMode {
    pub const READ: OpenMode = OpenMode {
        read: true,
        write: false,
        create: false,
    };
    pub const READ_WRITE: OpenMode = OpenMode {
        read: true,
        write: true,
        create: false,
    };
    pub const CREATE: OpenMode = OpenMode {
        read: true,
        write: true,
        create: true,
    };

    pub fn is_writable(&self) -> bool {
        self.write
    }

    /// Whether opening starts a fresh file instead of reading an existing one.
    pub fn creates(&self) -> bool {
        self.create
    }

    /// Options for the file behind this mode. Heap files are always opened
    /// readable, since mapping needs read access even for writers.
    pub(crate) fn options(&self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options
            .read(self.read || self.write)
            .write(self.write)
            .create(self.create)
            .truncate(self.create);
        options
    }
}

impl FromStr for OpenMode {
    type Err = PermError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars().filter(|&c| c != 'b');
        let mode = match chars.next() {
            Some('r') => OpenMode::READ,
            Some('w') => OpenMode::CREATE,
            _ => return Err(PermError::InvalidConfig(format!("invalid open mode {s:?}"))),
        };
        match (chars.next(), chars.next()) {
            (None, _) => Ok(mode),
            (Some('+'), None) => Ok(OpenMode {
                read: true,
                write: true,
                ..mode
            }),
            _ => Err(PermError::InvalidConfig(format!("invalid open mode {s:?}"))),
        }
    }
}

impl Default for OpenMode {
    fn default() -> Self {
        OpenMode::CREATE
    }
}
