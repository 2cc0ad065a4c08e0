use crate::errors::PermError;
use crate::scatter::Region;
use bytemuck::Pod;
use std::cell::UnsafeCell;

/// Default number of root regions a registry accepts.
pub const DEFAULT_ROOT_CAPACITY: usize = 49;

/// Ordered list of memory regions preserved alongside the heap.
///
/// Regions are copied into the roots blob on every checkpoint and copied back
/// on restore, in registration order. The list is sealed when the session
/// opens and never changes afterwards.
#[derive(Debug)]
pub struct RootRegistry {
    roots: Vec<Region>,
    capacity: usize,
    total: usize,
    sealed: bool,
}

impl RootRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            roots: Vec::with_capacity(capacity),
            capacity,
            total: 0,
            sealed: false,
        }
    }

    /// Appends `region`. Overlaps and duplicates are not checked.
    pub fn register(&mut self, region: Region) -> Result<(), PermError> {
        if self.sealed {
            tracing::error!("perm: must be called before opening a file");
            return Err(PermError::AlreadyOpen { op: "perm" });
        }
        if self.roots.len() == self.capacity {
            tracing::error!(capacity = self.capacity, "perm: root registry full");
            return Err(PermError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        self.total += region.len();
        self.roots.push(region);
        Ok(())
    }

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn regions(&self) -> &[Region] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sum of all registered lengths, the size of the roots blob.
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Default for RootRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT_CAPACITY)
    }
}

/// A value that lives outside the heap and is saved with it.
///
/// Declare as a `static` and register it once before the session opens:
///
/// ```ignore
/// static STEP: RootCell<u64> = RootCell::new(0);
/// heap.register_cell(&STEP)?;
/// ```
///
/// `T: Pod` because restore overwrites the bytes wholesale. Reads and writes
/// must not race with flush, backup or restore on another thread.
#[repr(transparent)]
pub struct RootCell<T>(UnsafeCell<T>);

// SAFETY: access is by copy; concurrent use with checkpoints is excluded by
// the contract above.
unsafe impl<T: Pod + Send> Sync for RootCell<T> {}

impl<T: Pod> RootCell<T> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    pub fn get(&self) -> T {
        unsafe { self.0.get().read_volatile() }
    }

    pub fn set(&self, value: T) {
        unsafe { self.0.get().write_volatile(value) }
    }

    pub fn region(&'static self) -> Region {
        // SAFETY: a 'static cell outlives every session.
        unsafe { Region::new(self.0.get().cast::<u8>(), std::mem::size_of::<T>()) }
    }
}
