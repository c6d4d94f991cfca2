//! The kernel side of the ring channel.
//!
//! [`RingKernel`] creates channels; a [`RingChannel`] maps the shared
//! regions and performs the entry call. The production implementation talks
//! to io_uring through raw system calls. Tests substitute a simulated kernel
//! that shares the same memory layout.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::abi::{
    IORING_OFF_CQ_RING, IORING_OFF_SQ_RING, IORING_OFF_SQES, IORING_REGISTER_BUFFERS,
    UringParams,
};
use crate::region::Region;

/// The three mappable regions of a channel. Each has a fixed mmap offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    SubmissionRing,
    CompletionRing,
    Descriptors,
}

impl RegionKind {
    pub fn mmap_offset(self) -> u64 {
        match self {
            RegionKind::SubmissionRing => IORING_OFF_SQ_RING,
            RegionKind::CompletionRing => IORING_OFF_CQ_RING,
            RegionKind::Descriptors => IORING_OFF_SQES,
        }
    }
}

/// Creates ring channels.
pub trait RingKernel {
    type Channel: RingChannel;

    /// Create a channel with room for `entries` submissions. The kernel
    /// completes `params` with ring sizes and region offsets.
    fn setup(&self, entries: u32, params: &mut UringParams) -> io::Result<Self::Channel>;
}

/// An open ring channel.
pub trait RingChannel {
    /// Pre-register buffers for fixed-buffer reads.
    fn register_buffers(&self, iovecs: &[libc::iovec]) -> io::Result<()>;

    /// Map `len` bytes of one of the channel's regions.
    fn map(&self, region: RegionKind, len: usize) -> io::Result<Region>;

    /// Submit `to_submit` published descriptors and, with
    /// `IORING_ENTER_GETEVENTS`, wait for `min_complete` completions.
    /// Returns how many descriptors the kernel consumed.
    fn enter(&self, to_submit: u32, min_complete: u32, flags: u32) -> io::Result<u32>;
}

/// Linux io_uring, reached through `io_uring_setup(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UringKernel;

impl RingKernel for UringKernel {
    type Channel = UringChannel;

    fn setup(&self, entries: u32, params: &mut UringParams) -> io::Result<UringChannel> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_uring_setup,
                entries as libc::c_long,
                params as *mut UringParams,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: io_uring_setup returned a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(ret as i32) };
        Ok(UringChannel { fd })
    }
}

/// An io_uring instance. The descriptor is closed on drop, after every
/// mapping derived from it has been released by its owner.
#[derive(Debug)]
pub struct UringChannel {
    fd: OwnedFd,
}

impl RingChannel for UringChannel {
    fn register_buffers(&self, iovecs: &[libc::iovec]) -> io::Result<()> {
        if iovecs.is_empty() {
            return Ok(());
        }
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_uring_register,
                self.fd.as_raw_fd() as libc::c_long,
                IORING_REGISTER_BUFFERS as libc::c_long,
                iovecs.as_ptr(),
                iovecs.len() as libc::c_long,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn map(&self, region: RegionKind, len: usize) -> io::Result<Region> {
        Region::map(self.fd.as_raw_fd(), region.mmap_offset(), len)
    }

    fn enter(&self, to_submit: u32, min_complete: u32, flags: u32) -> io::Result<u32> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_uring_enter,
                self.fd.as_raw_fd() as libc::c_long,
                to_submit as libc::c_long,
                min_complete as libc::c_long,
                flags as libc::c_long,
                std::ptr::null::<libc::sigset_t>(),
                0 as libc::c_long,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as u32)
    }
}
