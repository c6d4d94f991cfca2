//! Shared memory regions and validated accessors into them.
//!
//! A [`Region`] is a mapping shared with the kernel (or, in tests, with the
//! simulated kernel). Ring code never does pointer arithmetic itself: it asks
//! the region for a [`Word`] or a [`Table`] at a kernel-reported offset, and
//! the region checks bounds and alignment once, at setup.

use std::io;
use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::Error;

enum Backing {
    Mapped {
        ptr: NonNull<u8>,
        len: usize,
    },
    #[cfg(test)]
    Heap {
        ptr: NonNull<u64>,
        words: usize,
    },
}

impl Drop for Backing {
    fn drop(&mut self) {
        match *self {
            Backing::Mapped { ptr, len } => unsafe {
                libc::munmap(ptr.as_ptr().cast(), len);
            },
            #[cfg(test)]
            Backing::Heap { ptr, words } => unsafe {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                    ptr.as_ptr(),
                    words,
                )));
            },
        }
    }
}

// Safety: the backing is plain memory; all access goes through atomics or
// through tables whose single-writer discipline is enforced by the rings.
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

/// A shared memory region. Clones share the same mapping; the mapping is
/// released when the last clone is dropped.
#[derive(Clone)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
    _backing: Arc<Backing>,
}

// Safety: see `Backing`.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map `len` bytes of `fd` at the kernel-defined `offset`.
    pub(crate) fn map(fd: RawFd, offset: u64, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-length ring mapping",
            ));
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))?;
        Ok(Region {
            base,
            len,
            _backing: Arc::new(Backing::Mapped { ptr: base, len }),
        })
    }

    /// Zeroed, 8-byte aligned heap memory standing in for a kernel mapping.
    #[cfg(test)]
    pub(crate) fn zeroed(len: usize) -> Self {
        let words = len.div_ceil(8).max(1);
        let boxed: Box<[u64]> = vec![0u64; words].into_boxed_slice();
        let raw = Box::into_raw(boxed) as *mut u64;
        let ptr = NonNull::new(raw).expect("box pointer is non-null");
        Region {
            base: ptr.cast(),
            len,
            _backing: Arc::new(Backing::Heap { ptr, words }),
        }
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    fn checked<T>(&self, offset: u32, count: u32, what: &str) -> Result<NonNull<T>, Error> {
        let start = offset as usize;
        let end = size_of::<T>()
            .checked_mul(count as usize)
            .and_then(|bytes| bytes.checked_add(start));
        match end {
            Some(end) if end <= self.len => {}
            _ => {
                return Err(Error::Mapping(format!(
                    "{what} at offset {offset} (x{count}) exceeds region of {} bytes",
                    self.len
                )));
            }
        }
        let ptr = unsafe { self.base.add(start) };
        if ptr.as_ptr() as usize % align_of::<T>() != 0 {
            return Err(Error::Mapping(format!("{what} at offset {offset} is misaligned")));
        }
        Ok(ptr.cast())
    }

    /// A 32-bit shared word (ring head, tail, mask, ...).
    pub(crate) fn word(&self, offset: u32, what: &str) -> Result<Word, Error> {
        Ok(Word {
            ptr: self.checked::<AtomicU32>(offset, 1, what)?,
        })
    }

    /// An array of `count` records of type `T` starting at `offset`.
    pub(crate) fn table<T>(&self, offset: u32, count: u32, what: &str) -> Result<Table<T>, Error> {
        Ok(Table {
            ptr: self.checked::<T>(offset, count, what)?,
            len: count,
            _marker: PhantomData,
        })
    }
}

/// A validated 32-bit word inside a [`Region`].
///
/// Only valid while the owning region is alive; every holder keeps a clone
/// of the region next to its words.
#[derive(Clone, Copy)]
pub(crate) struct Word {
    ptr: NonNull<AtomicU32>,
}

unsafe impl Send for Word {}
unsafe impl Sync for Word {}

impl Word {
    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> u32 {
        unsafe { self.ptr.as_ref() }.load(order)
    }

    #[inline]
    pub(crate) fn store(&self, value: u32, order: Ordering) {
        unsafe { self.ptr.as_ref() }.store(value, order)
    }
}

/// A validated array of records inside a [`Region`]. Same lifetime rule as
/// [`Word`].
pub(crate) struct Table<T> {
    ptr: NonNull<T>,
    len: u32,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T> Send for Table<T> {}
unsafe impl<T> Sync for Table<T> {}

impl<T> Table<T> {
    #[inline]
    pub(crate) fn write(&self, index: u32, value: T) {
        assert!(index < self.len, "table index {index} out of {}", self.len);
        unsafe { ptr::write_volatile(self.ptr.as_ptr().add(index as usize), value) }
    }
}

impl<T: Copy> Table<T> {
    #[inline]
    pub(crate) fn read(&self, index: u32) -> T {
        assert!(index < self.len, "table index {index} out of {}", self.len);
        unsafe { ptr::read_volatile(self.ptr.as_ptr().add(index as usize)) }
    }
}
