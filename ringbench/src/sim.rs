//! A simulated kernel for driving the ring protocol in tests.
//!
//! The simulation plays the kernel's side of the shared-memory contract: it
//! lays out the regions the way io_uring does, consumes published
//! descriptors on `enter`, and posts completion records. Its behaviour per
//! call can be scripted ([`SimStep`]) to exercise partial submission,
//! "try again" and hard failures.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::abi::{CQE_FLAG_CACHE_HIT, Cqe, CqRingOffsets, Sqe, SqRingOffsets, UringParams};
use crate::kernel::{RegionKind, RingChannel, RingKernel};
use crate::region::Region;

const HEADER: u32 = 64;

/// What the simulated kernel does on the next `enter` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimStep {
    /// Consume up to this many descriptors (`None`: as many as requested).
    Accept(Option<u32>),
    /// Fail with `EAGAIN`.
    Again,
    /// Fail with the given errno.
    Fail(i32),
}

/// One recorded `enter` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnterCall {
    pub to_submit: u32,
    pub min_complete: u32,
    pub flags: u32,
}

struct Rings {
    sq: Region,
    cq: Region,
    sqes: Region,
    sq_entries: u32,
    cq_entries: u32,
}

#[derive(Default)]
struct SimState {
    rings: Option<Rings>,
    setup_errno: Option<i32>,
    fail_map: Option<RegionKind>,
    corrupt_sq_array: bool,
    mapped: Vec<RegionKind>,
    registered: usize,
    script: VecDeque<SimStep>,
    results: VecDeque<i32>,
    hit_when: Option<fn(&Sqe) -> bool>,
    deferred: bool,
    held: Vec<Sqe>,
    submitted: Vec<Sqe>,
    calls: Vec<EnterCall>,
    max_sq_occupancy: u32,
}

/// The simulated kernel. Clones share state, so a test can keep one handle
/// while the transport owns the channel.
#[derive(Clone, Default)]
pub struct SimKernel {
    state: Arc<Mutex<SimState>>,
}

impl SimKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn fail_setup(&self, errno: i32) {
        self.lock().setup_errno = Some(errno);
    }

    pub fn fail_map(&self, region: RegionKind) {
        self.lock().fail_map = Some(region);
    }

    /// Report an index-array offset past the end of the SQ region.
    pub fn corrupt_sq_array_offset(&self) {
        self.lock().corrupt_sq_array = true;
    }

    pub fn script(&self, steps: impl IntoIterator<Item = SimStep>) {
        self.lock().script.extend(steps);
    }

    /// Override the result code of the next completions, in order.
    pub fn results(&self, results: impl IntoIterator<Item = i32>) {
        self.lock().results.extend(results);
    }

    /// Flag completions whose descriptor matches `pred` as cache hits.
    pub fn hit_when(&self, pred: fn(&Sqe) -> bool) {
        self.lock().hit_when = Some(pred);
    }

    /// Post completions one `enter` call after the descriptors are consumed.
    pub fn set_deferred(&self, deferred: bool) {
        self.lock().deferred = deferred;
    }

    pub fn set_need_wakeup(&self, on: bool) {
        let state = self.lock();
        let rings = state.rings.as_ref().expect("setup first");
        let flags = rings.sq.word(16, "sq flags").unwrap();
        flags.store(u32::from(on), Ordering::Release);
    }

    pub fn mapped(&self) -> Vec<RegionKind> {
        self.lock().mapped.clone()
    }

    pub fn registered_buffers(&self) -> usize {
        self.lock().registered
    }

    pub fn submitted(&self) -> Vec<Sqe> {
        self.lock().submitted.clone()
    }

    pub fn calls(&self) -> Vec<EnterCall> {
        self.lock().calls.clone()
    }

    /// Largest `tail - head` the kernel ever observed on the SQ ring.
    pub fn max_sq_occupancy(&self) -> u32 {
        self.lock().max_sq_occupancy
    }

    pub fn published_sq_tail(&self) -> u32 {
        let state = self.lock();
        let rings = state.rings.as_ref().expect("setup first");
        rings.sq.word(4, "sq tail").unwrap().load(Ordering::Acquire)
    }

    pub fn published_cq_head(&self) -> u32 {
        let state = self.lock();
        let rings = state.rings.as_ref().expect("setup first");
        rings.cq.word(0, "cq head").unwrap().load(Ordering::Acquire)
    }
}

impl RingKernel for SimKernel {
    type Channel = SimChannel;

    fn setup(&self, entries: u32, params: &mut UringParams) -> io::Result<SimChannel> {
        let mut state = self.lock();
        if let Some(errno) = state.setup_errno {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if entries == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let sq_entries = entries.next_power_of_two();
        let cq_entries = sq_entries * 2;

        params.sq_entries = sq_entries;
        params.cq_entries = cq_entries;
        params.sq_off = SqRingOffsets {
            head: 0,
            tail: 4,
            ring_mask: 8,
            ring_entries: 12,
            flags: 16,
            dropped: 20,
            array: HEADER,
            ..SqRingOffsets::default()
        };
        params.cq_off = CqRingOffsets {
            head: 0,
            tail: 4,
            ring_mask: 8,
            ring_entries: 12,
            overflow: 16,
            flags: 20,
            cqes: HEADER,
            ..CqRingOffsets::default()
        };

        let sq = Region::zeroed(params.sq_ring_len());
        let cq = Region::zeroed(params.cq_ring_len());
        let sqes = Region::zeroed(params.sqes_len());
        for (region, n) in [(&sq, sq_entries), (&cq, cq_entries)] {
            region.word(8, "mask").unwrap().store(n - 1, Ordering::Relaxed);
            region.word(12, "entries").unwrap().store(n, Ordering::Relaxed);
        }
        if state.corrupt_sq_array {
            params.sq_off.array = u32::MAX - 8;
        }

        state.rings = Some(Rings {
            sq,
            cq,
            sqes,
            sq_entries,
            cq_entries,
        });
        Ok(SimChannel {
            state: Arc::clone(&self.state),
        })
    }
}

/// Channel half of the simulation.
pub struct SimChannel {
    state: Arc<Mutex<SimState>>,
}

impl RingChannel for SimChannel {
    fn register_buffers(&self, iovecs: &[libc::iovec]) -> io::Result<()> {
        self.state.lock().unwrap().registered = iovecs.len();
        Ok(())
    }

    fn map(&self, region: RegionKind, _len: usize) -> io::Result<Region> {
        let mut state = self.state.lock().unwrap();
        if state.fail_map == Some(region) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        state.mapped.push(region);
        let rings = state.rings.as_ref().expect("setup before map");
        let backing = match region {
            RegionKind::SubmissionRing => &rings.sq,
            RegionKind::CompletionRing => &rings.cq,
            RegionKind::Descriptors => &rings.sqes,
        };
        // A corrupted layout may ask for more than exists; hand back the real
        // region and let offset validation reject it.
        Ok(backing.clone())
    }

    fn enter(&self, to_submit: u32, min_complete: u32, flags: u32) -> io::Result<u32> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.calls.push(EnterCall {
            to_submit,
            min_complete,
            flags,
        });

        // Reads accepted earlier finish whatever this call returns.
        let rings = state.rings.as_ref().expect("setup before enter");
        if state.deferred {
            for sqe in std::mem::take(&mut state.held) {
                post(rings, &mut state.results, state.hit_when, &sqe);
            }
        }

        let limit = match state.script.pop_front().unwrap_or(SimStep::Accept(None)) {
            SimStep::Again => return Err(io::Error::from_raw_os_error(libc::EAGAIN)),
            SimStep::Fail(errno) => return Err(io::Error::from_raw_os_error(errno)),
            SimStep::Accept(limit) => limit.unwrap_or(u32::MAX),
        };

        let sq_head = rings.sq.word(0, "sq head").unwrap();
        let sq_tail = rings.sq.word(4, "sq tail").unwrap();
        let array = rings.sq.table::<u32>(HEADER, rings.sq_entries, "array").unwrap();
        let sqes = rings.sqes.table::<Sqe>(0, rings.sq_entries, "sqes").unwrap();

        let mut head = sq_head.load(Ordering::Relaxed);
        let tail = sq_tail.load(Ordering::Acquire);
        let available = tail.wrapping_sub(head);
        assert!(
            available <= rings.sq_entries,
            "submission ring overfilled: {available} > {}",
            rings.sq_entries
        );
        state.max_sq_occupancy = state.max_sq_occupancy.max(available);

        let accepted = to_submit.min(available).min(limit);
        for _ in 0..accepted {
            let index = array.read(head & (rings.sq_entries - 1));
            let sqe = sqes.read(index);
            state.submitted.push(sqe);
            if state.deferred {
                state.held.push(sqe);
            } else {
                post(rings, &mut state.results, state.hit_when, &sqe);
            }
            head = head.wrapping_add(1);
        }
        sq_head.store(head, Ordering::Release);
        Ok(accepted)
    }
}

fn post(rings: &Rings, results: &mut VecDeque<i32>, hit_when: Option<fn(&Sqe) -> bool>, sqe: &Sqe) {
    let cq_head = rings.cq.word(0, "cq head").unwrap();
    let cq_tail = rings.cq.word(4, "cq tail").unwrap();
    let events = rings.cq.table::<Cqe>(HEADER, rings.cq_entries, "cqes").unwrap();

    let tail = cq_tail.load(Ordering::Relaxed);
    if tail.wrapping_sub(cq_head.load(Ordering::Acquire)) >= rings.cq_entries {
        let overflow = rings.cq.word(16, "overflow").unwrap();
        overflow.store(overflow.load(Ordering::Relaxed) + 1, Ordering::Release);
        return;
    }
    let hit = hit_when.is_some_and(|pred| pred(sqe));
    events.write(
        tail & (rings.cq_entries - 1),
        Cqe {
            user_data: sqe.user_data,
            res: results.pop_front().unwrap_or(sqe.len as i32),
            flags: if hit { CQE_FLAG_CACHE_HIT } else { 0 },
        },
    );
    cq_tail.store(tail.wrapping_add(1), Ordering::Release);
}
