use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::Error;

/// Fixed pool of block-aligned read buffers, one per request slot.
///
/// Buffers are carved out of a single allocation aligned to the block size,
/// which satisfies `O_DIRECT` alignment for any power-of-two block size.
pub struct BufferPool {
    base: NonNull<u8>,
    layout: Layout,
    block_size: u32,
    count: u32,
    iovecs: Vec<libc::iovec>,
}

// Safety: the pool owns its allocation. Each buffer is handed to at most one
// in-flight request at a time by the slot pool.
unsafe impl Send for BufferPool {}

impl BufferPool {
    pub fn new(count: u32, block_size: u32) -> Result<Self, Error> {
        if count == 0 || !block_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "buffer pool needs count > 0 and power-of-two block size (got {count} x {block_size})"
            )));
        }
        let size = (count as usize)
            .checked_mul(block_size as usize)
            .ok_or_else(|| Error::Config("buffer pool size overflows".into()))?;
        let layout = Layout::from_size_align(size, block_size as usize)
            .map_err(|e| Error::Config(format!("buffer pool layout: {e}")))?;
        let base = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or_else(|| Error::ResourceLimit(format!("failed to allocate {size} buffer bytes")))?;

        let iovecs = (0..count as usize)
            .map(|i| libc::iovec {
                iov_base: unsafe { base.as_ptr().add(i * block_size as usize) }.cast(),
                iov_len: block_size as usize,
            })
            .collect();

        Ok(BufferPool {
            base,
            layout,
            block_size,
            count,
            iovecs,
        })
    }

    /// Pointer to the buffer for `slot`.
    pub fn buffer(&self, slot: u32) -> *mut u8 {
        assert!(slot < self.count, "buffer slot {slot} out of {}", self.count);
        unsafe {
            self.base
                .as_ptr()
                .add(slot as usize * self.block_size as usize)
        }
    }

    /// The iovecs for `IORING_REGISTER_BUFFERS`, in slot order.
    pub fn iovecs(&self) -> &[libc::iovec] {
        &self.iovecs
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}
