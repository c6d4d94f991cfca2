//! Kernel ABI for the io_uring channel: setup parameters, ring offsets,
//! descriptor and completion record layouts.
//!
//! These mirror `include/uapi/linux/io_uring.h`. Only the subset the
//! benchmark touches is declared.

/// mmap offset of the submission ring metadata + index array.
pub const IORING_OFF_SQ_RING: u64 = 0;
/// mmap offset of the completion ring metadata + events.
pub const IORING_OFF_CQ_RING: u64 = 0x800_0000;
/// mmap offset of the submission descriptor (SQE) table.
pub const IORING_OFF_SQES: u64 = 0x1000_0000;

pub const IORING_SETUP_IOPOLL: u32 = 1 << 0;
pub const IORING_SETUP_SQPOLL: u32 = 1 << 1;
pub const IORING_SETUP_SQ_AFF: u32 = 1 << 2;

pub const IORING_ENTER_GETEVENTS: u32 = 1 << 0;
pub const IORING_ENTER_SQ_WAKEUP: u32 = 1 << 1;

pub const IORING_REGISTER_BUFFERS: u32 = 0;

/// SQ ring flag: the kernel submission thread is idle and must be woken.
pub const IORING_SQ_NEED_WAKEUP: u32 = 1 << 0;

/// Completion flag bit marking a read served without device access.
pub const CQE_FLAG_CACHE_HIT: u32 = 1 << 0;

pub const IORING_OP_READ_FIXED: u8 = 4;
pub const IORING_OP_READ: u8 = 22;

/// Byte offsets of the submission ring fields inside its mapped region.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

/// Byte offsets of the completion ring fields inside its mapped region.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

/// `struct io_uring_params`: filled in by the caller, completed by the kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UringParams {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqRingOffsets,
    pub cq_off: CqRingOffsets,
}

impl UringParams {
    /// Bytes to map for the submission ring region.
    pub fn sq_ring_len(&self) -> usize {
        self.sq_off.array as usize + self.sq_entries as usize * size_of::<u32>()
    }

    /// Bytes to map for the completion ring region.
    pub fn cq_ring_len(&self) -> usize {
        self.cq_off.cqes as usize + self.cq_entries as usize * size_of::<Cqe>()
    }

    /// Bytes to map for the descriptor table.
    pub fn sqes_len(&self) -> usize {
        self.sq_entries as usize * size_of::<Sqe>()
    }
}

/// `struct io_uring_sqe` (64 bytes), as read back by a kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Sqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    pub op_flags: u32,
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub splice_fd_in: i32,
    pub pad: [u64; 2],
}

/// `struct io_uring_cqe` (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cqe {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

const _: () = assert!(size_of::<UringParams>() == 120);
const _: () = assert!(size_of::<Sqe>() == 64);
const _: () = assert!(size_of::<Cqe>() == 16);
