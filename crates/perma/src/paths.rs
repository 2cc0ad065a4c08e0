//! Defaults shared by the library, the demo binary and the tests.
//!
//! Environment variable names live here too, so the configuration loader and
//! anything that sets them for a child process agree on spelling.

/// Heap file, `PERM_FNAME`
pub const ENV_HEAP_FILE: &str = "PERM_FNAME";

/// Heap file mode, `PERM_MODE`
pub const ENV_HEAP_MODE: &str = "PERM_MODE";

/// Heap size, `PERM_SIZE`
pub const ENV_HEAP_SIZE: &str = "PERM_SIZE";

/// Fixed heap base address, `PERM_ADDRESS`
pub const ENV_HEAP_ADDRESS: &str = "PERM_ADDRESS";

/// Backup file, `PERM_BACKUP`
pub const ENV_BACKUP_FILE: &str = "PERM_BACKUP";

/// Backup file mode, `PERM_BACKUP_MODE`
pub const ENV_BACKUP_MODE: &str = "PERM_BACKUP_MODE";

/// Default heap file mode: create or truncate, read and write
pub const DEFAULT_HEAP_MODE: &str = "w+";

/// Default heap size (1GB of address space, sparse on disk)
pub const DEFAULT_HEAP_SIZE: usize = 1024 * 1024 * 1024;

/// Heap base used by the demo binary, so separate runs map at the same address
pub const DEFAULT_HEAP_ADDRESS: usize = 0x2000_0000_0000;

/// Default heap file used by the demo binary
pub const DEFAULT_HEAP_PATH: &str = "/tmp/perma_demo.heap";

/// Default backup file used by the demo binary
pub const DEFAULT_BACKUP_PATH: &str = "/tmp/perma_demo.backup";
