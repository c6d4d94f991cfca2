use std::io;
use std::sync::atomic::Ordering;

use io_uring::squeue;
use tracing::debug;

use crate::abi::{
    CqRingOffsets, Cqe, IORING_ENTER_GETEVENTS, IORING_ENTER_SQ_WAKEUP, IORING_SETUP_IOPOLL,
    IORING_SETUP_SQ_AFF, IORING_SETUP_SQPOLL, IORING_SQ_NEED_WAKEUP, Sqe, SqRingOffsets,
    UringParams,
};
use crate::buffer::BufferPool;
use crate::completion::CompletionRecord;
use crate::error::Error;
use crate::kernel::{RegionKind, RingChannel, RingKernel};
use crate::region::{Region, Table, Word};

// Descriptors built by the io_uring crate are written straight into the
// mapped SQE table, so they must have the kernel's layout.
const _: () = assert!(size_of::<squeue::Entry>() == size_of::<Sqe>());

/// Channel creation options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RingOptions {
    /// Busy-poll for completions (`IORING_SETUP_IOPOLL`, needs `O_DIRECT`).
    pub iopoll: bool,
    /// Let a kernel thread consume the submission ring (`IORING_SETUP_SQPOLL`).
    pub sq_thread: bool,
    /// Pin the kernel submission thread to this CPU.
    pub sq_thread_cpu: Option<u32>,
    /// Register the buffer pool for fixed-buffer reads.
    pub fixed_buffers: bool,
}

impl RingOptions {
    fn setup_flags(&self) -> u32 {
        let mut flags = 0;
        if self.iopoll {
            flags |= IORING_SETUP_IOPOLL;
        }
        if self.sq_thread {
            flags |= IORING_SETUP_SQPOLL;
            if self.sq_thread_cpu.is_some() {
                flags |= IORING_SETUP_SQ_AFF;
            }
        }
        flags
    }
}

/// User side of the submission ring. The user owns `tail`; the kernel owns
/// `head`.
pub struct SubmissionRing {
    _region: Region,
    head: Word,
    tail: Word,
    flags: Word,
    array: Table<u32>,
    mask: u32,
    entries: u32,
    /// Tail including staged-but-unpublished entries.
    local_tail: u32,
}

impl SubmissionRing {
    fn new(region: Region, off: &SqRingOffsets, sq_entries: u32) -> Result<Self, Error> {
        let head = region.word(off.head, "sq head")?;
        let tail = region.word(off.tail, "sq tail")?;
        let mask = region.word(off.ring_mask, "sq ring_mask")?.load(Ordering::Relaxed);
        let entries = region
            .word(off.ring_entries, "sq ring_entries")?
            .load(Ordering::Relaxed);
        check_geometry("submission", entries, mask, sq_entries)?;
        let flags = region.word(off.flags, "sq flags")?;
        let array = region.table::<u32>(off.array, entries, "sq array")?;
        let local_tail = tail.load(Ordering::Relaxed);
        Ok(SubmissionRing {
            _region: region,
            head,
            tail,
            flags,
            array,
            mask,
            entries,
            local_tail,
        })
    }

    pub fn entries(&self) -> u32 {
        self.entries
    }

    /// Kernel consumer index.
    pub fn head(&self) -> u32 {
        self.head.load(Ordering::Acquire)
    }

    /// User producer index, including staged entries.
    pub fn tail(&self) -> u32 {
        self.local_tail
    }

    /// Entries published or staged but not yet consumed by the kernel.
    pub fn len(&self) -> u32 {
        self.local_tail.wrapping_sub(self.head())
    }

    pub fn free(&self) -> u32 {
        self.entries.saturating_sub(self.len())
    }

    /// Stage a descriptor index at the tail. Returns `false` if the ring is
    /// full. Not visible to the kernel until [`publish`](Self::publish).
    fn push(&mut self, index: u32) -> bool {
        if self.free() == 0 {
            return false;
        }
        self.array.write(self.local_tail & self.mask, index);
        self.local_tail = self.local_tail.wrapping_add(1);
        true
    }

    /// Make staged entries visible. Release ordering covers the descriptor
    /// and index-array writes made before it.
    pub fn publish(&self) {
        if self.tail.load(Ordering::Relaxed) != self.local_tail {
            self.tail.store(self.local_tail, Ordering::Release);
        }
    }

    /// The kernel submission thread went idle and needs a wakeup.
    pub fn needs_wakeup(&self) -> bool {
        self.flags.load(Ordering::Acquire) & IORING_SQ_NEED_WAKEUP != 0
    }
}

/// User side of the completion ring. The kernel owns `tail`; the user owns
/// `head`.
pub struct CompletionRing {
    region: Region,
    head: Word,
    tail: Word,
    overflow: Word,
    events: Table<Cqe>,
    mask: u32,
    entries: u32,
    local_head: u32,
}

impl CompletionRing {
    fn new(region: Region, off: &CqRingOffsets, cq_entries: u32) -> Result<Self, Error> {
        let head = region.word(off.head, "cq head")?;
        let tail = region.word(off.tail, "cq tail")?;
        let mask = region.word(off.ring_mask, "cq ring_mask")?.load(Ordering::Relaxed);
        let entries = region
            .word(off.ring_entries, "cq ring_entries")?
            .load(Ordering::Relaxed);
        check_geometry("completion", entries, mask, cq_entries)?;
        let overflow = region.word(off.overflow, "cq overflow")?;
        let events = region.table::<Cqe>(off.cqes, entries, "cq events")?;
        let local_head = head.load(Ordering::Relaxed);
        Ok(CompletionRing {
            region,
            head,
            tail,
            overflow,
            events,
            mask,
            entries,
            local_head,
        })
    }

    pub fn entries(&self) -> u32 {
        self.entries
    }

    pub fn head(&self) -> u32 {
        self.local_head
    }

    /// Kernel producer index. Acquire ordering makes the events up to it
    /// readable.
    pub fn tail(&self) -> u32 {
        self.tail.load(Ordering::Acquire)
    }

    /// Completions the kernel dropped because the ring was full.
    pub fn overflow(&self) -> u32 {
        self.overflow.load(Ordering::Acquire)
    }

    /// Walk the completions published so far. The tail is sampled once; the
    /// head only moves locally until [`release`](Self::release).
    pub fn drain(&mut self) -> Drain<'_> {
        let tail = self.tail();
        Drain { ring: self, tail }
    }

    /// Hand consumed entries back to the kernel.
    pub fn release(&self) {
        if self.head.load(Ordering::Relaxed) != self.local_head {
            self.head.store(self.local_head, Ordering::Release);
        }
    }
}

/// Iterator over the completions between the local head and a tail
/// snapshot.
pub struct Drain<'a> {
    ring: &'a mut CompletionRing,
    tail: u32,
}

impl Iterator for Drain<'_> {
    type Item = CompletionRecord;

    fn next(&mut self) -> Option<CompletionRecord> {
        let ring = &mut *self.ring;
        if ring.local_head == self.tail {
            return None;
        }
        let cqe = ring.events.read(ring.local_head & ring.mask);
        ring.local_head = ring.local_head.wrapping_add(1);
        Some(cqe.into())
    }
}

/// Read-only view of the completion ring indices, for the reporting thread.
#[derive(Clone)]
pub struct RingProbe {
    _region: Region,
    head: Word,
    tail: Word,
}

impl RingProbe {
    /// `(head, tail)` of the completion ring.
    pub fn snapshot(&self) -> (u32, u32) {
        (
            self.head.load(Ordering::Acquire),
            self.tail.load(Ordering::Acquire),
        )
    }
}

fn check_geometry(ring: &str, entries: u32, mask: u32, expected: u32) -> Result<(), Error> {
    if entries == 0 || !entries.is_power_of_two() || mask != entries - 1 || entries != expected {
        return Err(Error::Mapping(format!(
            "{ring} ring reports entries={entries} mask={mask:#x}, expected {expected} entries"
        )));
    }
    Ok(())
}

/// The shared-memory transport: the two rings, the descriptor table and the
/// kernel channel they were mapped from.
pub struct RingTransport<C: RingChannel> {
    sq: SubmissionRing,
    cq: CompletionRing,
    sqes: Table<squeue::Entry>,
    _sqes_region: Region,
    params: UringParams,
    sq_thread: bool,
    channel: C,
}

impl<C: RingChannel> RingTransport<C> {
    /// Create a channel for `depth` requests and map its regions.
    pub fn initialize<K>(
        kernel: &K,
        depth: u32,
        options: &RingOptions,
        buffers: Option<&BufferPool>,
    ) -> Result<Self, Error>
    where
        K: RingKernel<Channel = C>,
    {
        let mut params = UringParams {
            flags: options.setup_flags(),
            sq_thread_cpu: options.sq_thread_cpu.unwrap_or(0),
            ..UringParams::default()
        };
        let channel = kernel
            .setup(depth, &mut params)
            .map_err(|e| Error::RingSetup(format!("io_uring_setup({depth}): {e}")))?;

        if params.sq_entries < depth {
            return Err(Error::RingSetup(format!(
                "kernel granted {} submission entries, need {depth}",
                params.sq_entries
            )));
        }

        if options.fixed_buffers {
            let pool = buffers.ok_or_else(|| {
                Error::RingSetup("fixed buffers requested without a buffer pool".into())
            })?;
            channel
                .register_buffers(pool.iovecs())
                .map_err(|e| Error::RingSetup(format!("buffer registration: {e}")))?;
        }

        let sq_region = map(&channel, RegionKind::SubmissionRing, params.sq_ring_len())?;
        let sqes_region = map(&channel, RegionKind::Descriptors, params.sqes_len())?;
        let cq_region = map(&channel, RegionKind::CompletionRing, params.cq_ring_len())?;

        let sq = SubmissionRing::new(sq_region, &params.sq_off, params.sq_entries)?;
        let sqes = sqes_region.table::<squeue::Entry>(0, params.sq_entries, "sqes")?;
        let cq = CompletionRing::new(cq_region, &params.cq_off, params.cq_entries)?;

        debug!(
            sq_entries = sq.entries(),
            cq_entries = cq.entries(),
            features = params.features,
            "ring mapped"
        );

        Ok(RingTransport {
            sq,
            cq,
            sqes,
            _sqes_region: sqes_region,
            params,
            sq_thread: options.sq_thread,
            channel,
        })
    }

    pub fn params(&self) -> &UringParams {
        &self.params
    }

    pub fn submission(&self) -> &SubmissionRing {
        &self.sq
    }

    pub fn completion(&self) -> &CompletionRing {
        &self.cq
    }

    pub fn completion_mut(&mut self) -> &mut CompletionRing {
        &mut self.cq
    }

    /// A probe the control thread can sample without touching the worker.
    pub fn probe(&self) -> RingProbe {
        RingProbe {
            _region: self.cq.region.clone(),
            head: self.cq.head,
            tail: self.cq.tail,
        }
    }

    /// Write `entry` into descriptor slot `index` and stage `index` at the
    /// submission tail. Returns `false` if the submission ring is full.
    ///
    /// # Safety
    /// The buffer referenced by `entry` must stay valid and untouched until
    /// the matching completion is reaped.
    pub unsafe fn push(&mut self, index: u32, entry: squeue::Entry) -> bool {
        if self.sq.free() == 0 {
            return false;
        }
        self.sqes.write(index, entry);
        self.sq.push(index)
    }

    /// Publish staged descriptors to the kernel.
    pub fn publish(&self) {
        self.sq.publish();
    }

    /// The kernel entry call: submit `to_submit` descriptors and wait for
    /// `min_complete` completions.
    pub fn enter(&self, to_submit: u32, min_complete: u32) -> io::Result<u32> {
        let mut flags = IORING_ENTER_GETEVENTS;
        if self.sq_thread && self.sq.needs_wakeup() {
            flags |= IORING_ENTER_SQ_WAKEUP;
        }
        self.channel.enter(to_submit, min_complete, flags)
    }
}

fn map<C: RingChannel>(channel: &C, kind: RegionKind, len: usize) -> Result<Region, Error> {
    channel
        .map(kind, len)
        .map_err(|e| Error::Mapping(format!("mmap {kind:?} ({len} bytes): {e}")))
}
