use std::os::fd::RawFd;

use io_uring::opcode;
use io_uring::squeue;
use io_uring::types::Fd;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::completion::UserData;

/// A prepared read: the descriptor to publish plus the offset it reads, kept
/// for error reporting when the completion comes back.
pub struct Request {
    pub offset: u64,
    pub entry: squeue::Entry,
}

/// Produces block-aligned random reads against one target.
pub struct RequestGenerator {
    rng: SmallRng,
    fd: RawFd,
    max_blocks: u64,
    block_size: u32,
    fixed_buffers: bool,
}

impl RequestGenerator {
    /// `max_blocks` is the usable block count of the target, already
    /// validated non-zero by the caller.
    pub fn new(fd: RawFd, max_blocks: u64, block_size: u32, fixed_buffers: bool, seed: u64) -> Self {
        RequestGenerator {
            rng: SmallRng::seed_from_u64(seed),
            fd,
            max_blocks,
            block_size,
            fixed_buffers,
        }
    }

    /// A uniformly drawn, block-aligned offset below
    /// `(max_blocks - 1) * block_size`. Targets too small for that range
    /// always read block 0.
    pub fn next_offset(&mut self) -> u64 {
        let span = self.max_blocks.saturating_sub(1).max(1);
        self.rng.random_range(0..span) * self.block_size as u64
    }

    /// Build the read for request slot `slot` into `buf`.
    pub fn prepare(&mut self, slot: u32, generation: u32, buf: *mut u8) -> Request {
        let offset = self.next_offset();
        let user_data = UserData::encode(slot, generation).raw();
        let entry = if self.fixed_buffers {
            opcode::ReadFixed::new(Fd(self.fd), buf, self.block_size, slot as u16)
                .offset(offset)
                .build()
        } else {
            opcode::Read::new(Fd(self.fd), buf, self.block_size)
                .offset(offset)
                .build()
        };
        Request {
            offset,
            entry: entry.user_data(user_data),
        }
    }
}
