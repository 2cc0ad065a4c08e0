use std::ptr;

/// A contiguous range of memory outside the heap, identified by address and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    address: usize,
    len: usize,
}

impl Region {
    /// # Safety
    /// `address..address + len` must stay valid for reads and writes for as
    /// long as the region is used with [`gather`] or [`scatter`], and must not
    /// be accessed through other references while a copy is running.
    pub unsafe fn new(address: *mut u8, len: usize) -> Self {
        Self {
            address: address as usize,
            len,
        }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> usize {
        self.address + self.len
    }

    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.address as *mut u8
    }
}

/// Copies from `regions`, in order, into `buffer`.
///
/// Stops when the buffer is full or the regions run out and returns the number
/// of bytes copied. A short count is not an error here; callers size the
/// buffer.
pub fn gather(buffer: &mut [u8], regions: &[Region]) -> usize {
    let mut offset = 0;
    for region in regions {
        let remaining = buffer.len() - offset;
        if remaining == 0 {
            break;
        }
        let n = remaining.min(region.len);
        // SAFETY: Region::new guarantees the source range is readable.
        unsafe {
            ptr::copy_nonoverlapping(region.as_mut_ptr(), buffer[offset..].as_mut_ptr(), n);
        }
        offset += n;
    }
    offset
}

/// Copies `buffer` out across `regions`, in order.
///
/// Mirror of [`gather`]; returns the number of bytes copied.
pub fn scatter(buffer: &[u8], regions: &[Region]) -> usize {
    let mut offset = 0;
    for region in regions {
        let remaining = buffer.len() - offset;
        if remaining == 0 {
            break;
        }
        let n = remaining.min(region.len);
        // SAFETY: Region::new guarantees the destination range is writable.
        unsafe {
            ptr::copy_nonoverlapping(buffer[offset..].as_ptr(), region.as_mut_ptr(), n);
        }
        offset += n;
    }
    offset
}
