//! Activity buffers and the pool that hands them to the device client.
use std::{
    alloc::{Layout, alloc_zeroed, dealloc},
    fmt,
    ptr::NonNull,
};

use tracing::trace;

use super::cursor::Records;
use crate::error::{ErrorChannel, TraceError};

/// Default activity buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
/// Default activity buffer alignment.
pub const DEFAULT_BUFFER_ALIGN: usize = 8;

/// An owned, zero-initialized buffer of activity records.
///
/// The device client fills the buffer and reports how many of its bytes are valid.
/// The memory is released when the buffer is dropped, whichever path it takes back.
pub struct RecordBuffer {
    /// Pointer to the raw bytes.
    ptr: NonNull<u8>,
    layout: Layout,
    /// The number of valid bytes within the buffer.
    valid_size: usize,
}

// Safety: the buffer exclusively owns its allocation.
unsafe impl Send for RecordBuffer {}
unsafe impl Sync for RecordBuffer {}

impl RecordBuffer {
    /// Attempt to allocate a zeroed buffer with the given layout.
    pub fn try_new(size: usize, align: usize) -> Result<Self, TraceError> {
        let layout = Layout::from_size_align(size, align)
            .map_err(|_| TraceError::InvalidLayout { size, align })?;
        if layout.size() == 0 {
            return Err(TraceError::InvalidLayout { size, align });
        }
        // Safety: the layout has a non-zero size. Ownership of the allocation moves into
        // the returned buffer, which frees it with the same layout on drop.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(TraceError::Allocation { size })?;
        Ok(Self {
            ptr,
            layout,
            valid_size: 0,
        })
    }

    /// The size of the allocation.
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    pub fn valid_size(&self) -> usize {
        self.valid_size
    }

    /// Set the number of valid bytes, as reported by the producer. Clamped to the
    /// capacity.
    pub fn set_valid_size(&mut self, valid_size: usize) {
        self.valid_size = valid_size.min(self.capacity());
    }

    /// The whole allocation, valid or not.
    pub fn as_slice(&self) -> &[u8] {
        // Safety: the pointer is valid for `capacity` initialized bytes for as long as
        // self lives.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.capacity()) }
    }

    /// Mutable access to the whole allocation, for producers filling the buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: as for `as_slice`, and the exclusive borrow of self prevents aliasing.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity()) }
    }

    /// The bytes reported valid by the producer.
    pub fn valid_bytes(&self) -> &[u8] {
        &self.as_slice()[..self.valid_size]
    }

    /// Append an encoded record after the valid bytes. Returns false, leaving the
    /// buffer untouched, if it does not fit.
    pub fn push_record(&mut self, record: &[u8]) -> bool {
        let start = self.valid_size;
        let Some(end) = start.checked_add(record.len()) else {
            return false;
        };
        match self.as_mut_slice().get_mut(start..end) {
            Some(dst) => {
                dst.copy_from_slice(record);
                self.valid_size = end;
                true
            }
            None => false,
        }
    }

    pub fn records(&self) -> Records<'_> {
        Records::new(self.valid_bytes())
    }
}

impl Drop for RecordBuffer {
    fn drop(&mut self) {
        // Safety: allocated in `try_new` with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for RecordBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordBuffer")
            .field("capacity", &self.capacity())
            .field("valid_size", &self.valid_size)
            .finish()
    }
}

/// Hands out activity buffers of one configured layout.
#[derive(Debug)]
pub struct BufferPool {
    size: usize,
    align: usize,
    errors: ErrorChannel,
}

impl BufferPool {
    /// Create a pool, validating that `size` and `align` form a usable layout.
    pub fn new(size: usize, align: usize, errors: ErrorChannel) -> Result<Self, TraceError> {
        if size == 0 {
            return Err(TraceError::InvalidLayout { size, align });
        }
        Layout::from_size_align(size, align)
            .map_err(|_| TraceError::InvalidLayout { size, align })?;
        Ok(Self {
            size,
            align,
            errors,
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }

    pub fn buffer_align(&self) -> usize {
        self.align
    }

    /// Allocate a zeroed buffer for the producer.
    ///
    /// On allocation failure the error is reported and `None` is returned; the producer
    /// then drops records and reports them through its dropped-record counter.
    pub fn request(&self) -> Option<RecordBuffer> {
        trace!("buffer requested: {} bytes", self.size);
        self.errors
            .check("buffer_request", RecordBuffer::try_new(self.size, self.align))
    }
}
