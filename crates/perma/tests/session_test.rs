use allocator_api2::vec::Vec as ArenaVec;
use perma::{BumpArena, OpenMode, PermError, PersistentHeap, Phase, Region, RootCell};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

const CHUNK: usize = 64 * 1024;
const HEAP_SIZE: usize = 1024 * 1024;

struct Fixture {
    dir: TempDir,
    arena: Arc<BumpArena>,
    heap: PersistentHeap,
}

impl Fixture {
    fn new() -> Self {
        let arena = Arc::new(BumpArena::new(CHUNK));
        let heap = PersistentHeap::new(arena.clone());
        Self {
            dir: tempdir().unwrap(),
            arena,
            heap,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn create(&self) {
        let phase = self
            .heap
            .open(self.path("test.heap"), OpenMode::CREATE, HEAP_SIZE)
            .unwrap();
        assert_eq!(phase, Phase::Created);
    }

    fn with_backup(&self) {
        self.heap
            .open_backup(self.path("test.backup"), OpenMode::CREATE)
            .unwrap();
    }

    fn block(&self, len: usize, fill: u8) -> NonNull<u8> {
        let block = self.arena.alloc_bytes(len).unwrap();
        unsafe { block.as_ptr().write_bytes(fill, len) };
        block
    }
}

fn cell<T: bytemuck::Pod>(value: T) -> &'static RootCell<T> {
    Box::leak(Box::new(RootCell::new(value)))
}

fn bytes_at(block: NonNull<u8>, len: usize) -> &'static [u8] {
    unsafe { std::slice::from_raw_parts(block.as_ptr(), len) }
}

fn tamper(path: &PathBuf, offset: u64, value: u64) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&value.to_ne_bytes()).unwrap();
    file.sync_all().unwrap();
}

/// Small scenario: one 4-byte root, a 1MB heap, one backup.
///
/// Tests:
/// - Root value is brought back by restore
/// - Heap block contents are brought back by restore
#[test]
fn test_restore_scenario() {
    let fx = Fixture::new();
    let root = cell(5u32);
    fx.heap.register_cell(root).unwrap();
    fx.create();
    fx.with_backup();

    let block = fx.block(100, 0xAA);
    fx.heap.backup().unwrap();

    root.set(99);
    unsafe { block.as_ptr().write_bytes(0x55, 100) };

    fx.heap.restore().unwrap();

    assert_eq!(root.get(), 5, "Root should be back at its backup value");
    assert!(
        bytes_at(block, 100).iter().all(|&b| b == 0xAA),
        "Heap block should hold its backup contents"
    );
}

/// Round trip: backup, mutate roots and allocator state, restore.
///
/// Allocations made after the backup are forgotten, so the next allocation
/// reuses their address.
#[test]
fn test_round_trip_rolls_back_allocations() {
    let fx = Fixture::new();
    let counter = cell(1u64);
    let pair = cell([7u16; 2]);
    fx.heap.register_cell(counter).unwrap();
    fx.heap.register_cell(pair).unwrap();
    fx.create();
    fx.with_backup();

    fx.block(32, 1);
    fx.heap.backup().unwrap();
    let header_at_backup = fx.heap.header().unwrap();

    let later = fx.block(32, 2);
    counter.set(2);
    pair.set([8, 9]);

    fx.heap.restore().unwrap();

    assert_eq!(counter.get(), 1);
    assert_eq!(pair.get(), [7, 7]);
    assert_eq!(fx.heap.header().unwrap(), header_at_backup);
    assert_eq!(
        fx.block(32, 3),
        later,
        "Allocation cursor should be rolled back with the heap"
    );
}

/// Container buffers allocated through the arena are part of the heap.
///
/// Tests:
/// - The buffer of a `Vec` lands inside the committed heap
/// - In-place edits made after the backup are undone by restore
#[test]
fn test_vec_contents_follow_restore() {
    let fx = Fixture::new();
    fx.create();
    fx.with_backup();

    let mut values: ArenaVec<u64, &BumpArena> = ArenaVec::with_capacity_in(16, fx.arena.as_ref());
    values.extend(1..=8);

    let header = fx.heap.header().unwrap();
    let at = values.as_ptr() as u64;
    assert!(
        at >= header.heap_base && at + 16 * 8 <= header.heap_end,
        "Vec buffer should live in the heap"
    );

    fx.heap.backup().unwrap();
    values.iter_mut().for_each(|v| *v *= 100);
    assert_eq!(values[7], 800);

    fx.heap.restore().unwrap();

    assert_eq!(&values[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
}

/// Two flushes without mutation leave the backing file byte-identical.
#[test]
fn test_repeated_flush_is_stable() {
    let fx = Fixture::new();
    let root = cell(0x1234_5678u32);
    fx.heap.register_cell(root).unwrap();
    fx.create();
    fx.block(500, 0x42);

    fx.heap.flush().unwrap();
    let first = std::fs::read(fx.path("test.heap")).unwrap();
    fx.heap.flush().unwrap();
    let second = std::fs::read(fx.path("test.heap")).unwrap();
    assert_eq!(first.len(), HEAP_SIZE);
    assert!(first == second, "Flushing twice should not change the file");

    root.set(1);
    fx.heap.flush().unwrap();
    let third = std::fs::read(fx.path("test.heap")).unwrap();
    assert!(first != third, "A changed root should reach the file");
}

#[test]
fn test_registration_after_open_is_rejected() {
    let fx = Fixture::new();
    fx.heap.register_cell(cell(1u8)).unwrap();
    fx.create();

    let err = fx.heap.register_cell(cell(2u8)).unwrap_err();
    assert!(matches!(err, PermError::AlreadyOpen { .. }));
    assert_eq!(fx.heap.root_count(), 1);
    assert_eq!(fx.heap.roots_total(), 1);

    fx.heap.close().unwrap();
    let err = fx.heap.register_cell(cell(3u8)).unwrap_err();
    assert!(
        matches!(err, PermError::AlreadyOpen { .. }),
        "Registration stays closed after the session ends"
    );
}

#[test]
fn test_registration_past_capacity() {
    let arena = Arc::new(BumpArena::new(CHUNK));
    let heap = PersistentHeap::with_root_capacity(arena, 2);
    heap.register_cell(cell(1u32)).unwrap();
    heap.register_cell(cell(2u32)).unwrap();

    let err = heap.register_cell(cell(3u64)).unwrap_err();
    assert!(matches!(err, PermError::CapacityExceeded { capacity: 2 }));
    assert_eq!(heap.root_count(), 2);
    assert_eq!(heap.roots_total(), 8);
}

/// A backup whose identity fields were altered is refused and the live heap
/// is left exactly as it was.
#[test]
fn test_tampered_backup_is_refused() {
    let fx = Fixture::new();
    let root = cell(5u32);
    fx.heap.register_cell(root).unwrap();
    fx.create();
    fx.with_backup();

    let block = fx.block(64, 0xAA);
    let base = fx.heap.header().unwrap().heap_base;

    for (offset, value, field) in [
        (0, 0xBAD, "magic"),
        (8, base + CHUNK as u64, "heap_base"),
        (24, base + 2 * HEAP_SIZE as u64, "heap_max"),
    ] {
        fx.heap.backup().unwrap();
        root.set(99);
        unsafe { block.as_ptr().write_bytes(0x55, 64) };
        let header_before = fx.heap.header().unwrap();

        tamper(&fx.path("test.backup"), offset, value);
        match fx.heap.restore().unwrap_err() {
            PermError::HeaderValidation { field: f, .. } => assert_eq!(f, field),
            other => panic!("Expected HeaderValidation for {field}, got {other:?}"),
        }

        assert_eq!(root.get(), 99, "Root untouched after refused {field}");
        assert!(bytes_at(block, 64).iter().all(|&b| b == 0x55));
        assert_eq!(fx.heap.header().unwrap(), header_before);

        root.set(5);
        unsafe { block.as_ptr().write_bytes(0xAA, 64) };
    }
}

/// Growth after the backup is zeroed on restore.
#[test]
fn test_restore_zeroes_growth_since_backup() {
    let fx = Fixture::new();
    fx.create();
    fx.with_backup();

    fx.block(100, 1);
    fx.heap.backup().unwrap();
    let backup_end = fx.heap.header().unwrap().heap_end;

    let grown = fx.block(2 * CHUNK, 0xFF);
    assert!(grown.as_ptr() as u64 >= backup_end, "Block should need new chunks");
    assert!(fx.heap.header().unwrap().heap_end > backup_end);

    fx.heap.restore().unwrap();

    assert_eq!(fx.heap.header().unwrap().heap_end, backup_end);
    assert!(
        bytes_at(grown, 2 * CHUNK).iter().all(|&b| b == 0),
        "Memory committed after the backup should read as zero"
    );
}

#[test]
fn test_short_backup_leaves_heap_untouched() {
    let fx = Fixture::new();
    let root = cell(5u32);
    fx.heap.register_cell(root).unwrap();
    fx.create();
    fx.with_backup();
    fx.heap.backup().unwrap();

    root.set(99);
    let file = OpenOptions::new()
        .write(true)
        .open(fx.path("test.backup"))
        .unwrap();
    file.set_len(CHUNK as u64 / 2).unwrap();

    let err = fx.heap.restore().unwrap_err();
    match err {
        PermError::IoError(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
        other => panic!("Expected IoError, got {other:?}"),
    }
    assert_eq!(root.get(), 99);
}

#[test]
fn test_restore_requires_backup_file() {
    let fx = Fixture::new();
    fx.create();
    assert!(matches!(
        fx.heap.restore(),
        Err(PermError::BackupFileNotOpen { .. })
    ));
}

#[test]
fn test_allocation_before_open_is_one_time_constraint() {
    let fx = Fixture::new();
    fx.arena.alloc_bytes(16).unwrap();

    let err = fx
        .heap
        .open(fx.path("test.heap"), OpenMode::CREATE, HEAP_SIZE)
        .unwrap_err();
    assert!(matches!(err, PermError::OneTimeConstraint { .. }));
    assert_eq!(fx.heap.phase(), Phase::Closed);
}

#[test]
fn test_allocator_serves_one_heap_only() {
    let fx = Fixture::new();
    fx.create();

    let other = PersistentHeap::new(fx.arena.clone());
    let err = other
        .open(fx.path("other.heap"), OpenMode::CREATE, HEAP_SIZE)
        .unwrap_err();
    assert!(matches!(err, PermError::OneTimeConstraint { .. }));
}

#[test]
fn test_misaligned_address_is_rejected() {
    let fx = Fixture::new();
    let err = fx
        .heap
        .open_at(
            fx.path("test.heap"),
            OpenMode::CREATE,
            HEAP_SIZE,
            0x3000_0000_0000 + 4096,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        PermError::Alignment {
            chunk_size: CHUNK,
            ..
        }
    ));
}

#[test]
fn test_occupied_address_is_conflict() {
    let fx = Fixture::new();
    fx.create();
    let base = fx.heap.header().unwrap().heap_base as usize;

    let other = Fixture::new();
    let err = other
        .heap
        .open_at(other.path("test.heap"), OpenMode::CREATE, HEAP_SIZE, base)
        .unwrap_err();
    assert!(
        matches!(err, PermError::AddressConflict { address, .. } if address == base),
        "Second heap must not be placed over the first, got {err:?}"
    );
}

/// The mapping outlives the session, so the same file cannot be mapped again
/// in this process; reopening is for the next process.
#[test]
fn test_reopen_in_same_process_conflicts() {
    let fx = Fixture::new();
    fx.create();
    fx.heap.close().unwrap();

    let again = Fixture::new();
    let err = again
        .heap
        .open(fx.path("test.heap"), OpenMode::READ_WRITE, 0)
        .unwrap_err();
    assert!(matches!(err, PermError::AddressConflict { .. }));
}

#[test]
fn test_foreign_file_is_incompatible() {
    let fx = Fixture::new();
    std::fs::write(fx.path("zeros.heap"), vec![0u8; HEAP_SIZE]).unwrap();

    let err = fx
        .heap
        .open(fx.path("zeros.heap"), OpenMode::READ, 0)
        .unwrap_err();
    assert!(matches!(
        err,
        PermError::IncompatibleVersion { found: 0, .. }
    ));
}

#[test]
fn test_raw_region_roots() {
    let fx = Fixture::new();
    let bytes: &'static mut [u8; 24] = Box::leak(Box::new([3u8; 24]));
    let region = unsafe { Region::new(bytes.as_mut_ptr(), 24) };
    fx.heap.register(region).unwrap();
    fx.create();
    fx.with_backup();
    fx.heap.backup().unwrap();

    unsafe { std::ptr::write_bytes(region.address() as *mut u8, 0, 24) };
    fx.heap.restore().unwrap();

    let restored = unsafe { std::slice::from_raw_parts(region.address() as *const u8, 24) };
    assert!(restored.iter().all(|&b| b == 3));
}
