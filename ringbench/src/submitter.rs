//! The submit/wait/reap loop.
//!
//! The submitter prepares reads into free request slots, publishes them on
//! the submission ring, enters the kernel and reaps completions, adapting
//! how many completions it waits for to how full the queue is. Each round
//! moves through [`State`] explicitly; see [`Submitter::step`].

use std::io;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::buffer::BufferPool;
use crate::completion::UserData;
use crate::config::Config;
use crate::error::Error;
use crate::generator::RequestGenerator;
use crate::kernel::RingChannel;
use crate::metrics;
use crate::ring::RingTransport;
use crate::stats::BenchContext;

struct SlotEntry {
    generation: u32,
    offset: u64,
    in_use: bool,
}

/// Request slots `0..depth`. A slot is handed out only while free and stays
/// owned by its request until the matching completion is reaped; each reuse
/// bumps its generation so a stale completion cannot match.
pub(crate) struct SlotPool {
    entries: Vec<SlotEntry>,
    free_list: Vec<u32>,
}

impl SlotPool {
    pub fn new(capacity: u32) -> Self {
        let mut entries = Vec::with_capacity(capacity as usize);
        let mut free_list = Vec::with_capacity(capacity as usize);
        for i in (0..capacity).rev() {
            entries.push(SlotEntry {
                generation: 0,
                offset: 0,
                in_use: false,
            });
            free_list.push(i);
        }
        SlotPool { entries, free_list }
    }

    /// Take a free slot. Returns `(slot, generation)`.
    pub fn allocate(&mut self) -> Option<(u32, u32)> {
        let slot = self.free_list.pop()?;
        let entry = &mut self.entries[slot as usize];
        entry.in_use = true;
        Some((slot, entry.generation))
    }

    pub fn set_offset(&mut self, slot: u32, offset: u64) {
        self.entries[slot as usize].offset = offset;
    }

    /// Return a slot that was allocated but never submitted.
    pub fn cancel(&mut self, slot: u32) {
        self.entries[slot as usize].in_use = false;
        self.free_list.push(slot);
    }

    /// Retire the request named by `user_data`. Returns the offset it read.
    pub fn complete(&mut self, user_data: UserData) -> Result<u64, Error> {
        let entry = self
            .entries
            .get_mut(user_data.slot() as usize)
            .filter(|e| e.in_use && e.generation == user_data.generation())
            .ok_or(Error::UnknownCompletion(user_data.raw()))?;
        entry.in_use = false;
        entry.generation = entry.generation.wrapping_add(1);
        self.free_list.push(user_data.slot());
        Ok(entry.offset)
    }

    pub fn in_use(&self) -> u32 {
        (self.entries.len() - self.free_list.len()) as u32
    }
}

/// Result of one kernel entry call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The kernel consumed this many descriptors.
    Accepted(u32),
    /// The kernel asked to try again later.
    Again,
}

/// Submitter states. A round runs
/// `Idle → Prepping → Submitting → Waiting → Draining → Idle`; partial
/// submission and "try again" loop back to `Submitting` without preparing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Prepping,
    /// `retry` is set after "try again": the next call must not block.
    Submitting { retry: bool },
    Waiting { to_submit: u32, min_complete: u32 },
    Draining { to_submit: u32, outcome: Outcome },
    Finished,
}

/// Drives one ring for the lifetime of a run.
pub struct Submitter<C: RingChannel> {
    transport: RingTransport<C>,
    /// Released in `Drop` only once nothing is in flight.
    buffers: ManuallyDrop<BufferPool>,
    generator: RequestGenerator,
    slots: SlotPool,
    ctx: Arc<BenchContext>,
    depth: u32,
    batch_submit: u32,
    batch_complete: u32,
    block_size: u32,
    /// Published but not yet accepted by the kernel.
    pending: u32,
    /// Prepared and not yet reaped; includes `pending`.
    inflight: u32,
    overflow_seen: u32,
    state: State,
}

impl<C: RingChannel> Submitter<C> {
    pub fn new(
        transport: RingTransport<C>,
        buffers: BufferPool,
        generator: RequestGenerator,
        config: &Config,
        ctx: Arc<BenchContext>,
    ) -> Self {
        let overflow_seen = transport.completion().overflow();
        Submitter {
            transport,
            buffers: ManuallyDrop::new(buffers),
            generator,
            slots: SlotPool::new(config.depth),
            ctx,
            depth: config.depth,
            batch_submit: config.batch_submit,
            batch_complete: config.batch_complete,
            block_size: config.block_size,
            pending: 0,
            inflight: 0,
            overflow_seen,
            state: State::Idle,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn inflight(&self) -> u32 {
        self.inflight
    }

    pub fn pending(&self) -> u32 {
        self.pending
    }

    pub fn transport(&self) -> &RingTransport<C> {
        &self.transport
    }

    /// Run until shutdown has been requested and every request is reaped.
    ///
    /// On a fatal error the remaining in-flight reads are waited out before
    /// the error is returned.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            match self.step() {
                Ok(State::Finished) => break,
                Ok(_) => {}
                Err(e) => {
                    self.quiesce();
                    return Err(e);
                }
            }
        }
        debug!(
            done = self.ctx.stats().snapshot().done,
            "submitter finished"
        );
        Ok(())
    }

    /// Perform the work of the current state and move to the next one.
    pub fn step(&mut self) -> Result<State, Error> {
        let next = match self.state {
            State::Idle => self.idle(),
            State::Prepping => self.prepare(),
            State::Submitting { retry } => self.submitting(retry),
            State::Waiting {
                to_submit,
                min_complete,
            } => self.wait(to_submit, min_complete)?,
            State::Draining { to_submit, outcome } => self.drain(to_submit, outcome)?,
            State::Finished => State::Finished,
        };
        self.state = next;
        Ok(next)
    }

    fn idle(&self) -> State {
        let shutdown = self.ctx.is_shutdown();
        if shutdown && self.inflight == 0 {
            State::Finished
        } else if self.pending == 0 && !shutdown && self.inflight < self.depth {
            State::Prepping
        } else {
            State::Submitting { retry: false }
        }
    }

    fn prepare(&mut self) -> State {
        let want = (self.depth - self.inflight).min(self.batch_submit);
        let mut prepared = 0;
        while prepared < want {
            let Some((slot, generation)) = self.slots.allocate() else {
                break;
            };
            let request = self
                .generator
                .prepare(slot, generation, self.buffers.buffer(slot));
            self.slots.set_offset(slot, request.offset);
            // Safety: the slot's buffer belongs to this request until
            // `SlotPool::complete` retires it.
            if !unsafe { self.transport.push(slot, request.entry) } {
                self.slots.cancel(slot);
                break;
            }
            prepared += 1;
        }
        self.transport.publish();
        self.pending += prepared;
        self.inflight += prepared;
        self.publish_inflight();
        State::Submitting { retry: false }
    }

    fn submitting(&self, retry: bool) -> State {
        let to_submit = self.pending;
        let min_complete =
            if retry || (to_submit > 0 && self.inflight + self.batch_submit < self.depth) {
                0
            } else {
                self.inflight.min(self.batch_complete)
            };
        State::Waiting {
            to_submit,
            min_complete,
        }
    }

    fn wait(&mut self, to_submit: u32, min_complete: u32) -> Result<State, Error> {
        let result = self.transport.enter(to_submit, min_complete);
        self.ctx.stats().add_call();
        metrics::ENTER_CALLS.increment();

        let outcome = match result {
            Ok(accepted) => {
                debug_assert!(
                    accepted <= to_submit,
                    "kernel accepted {accepted} of {to_submit}"
                );
                let accepted = accepted.min(to_submit);
                self.pending -= accepted;
                self.ctx.stats().add_done(accepted as u64);
                metrics::SQE_SUBMITTED.add(accepted as u64);
                Outcome::Accepted(accepted)
            }
            Err(e) if is_transient(&e) => {
                metrics::ENTER_RETRIES.increment();
                Outcome::Again
            }
            Err(e) => {
                error!(to_submit, min_complete, "kernel entry failed: {e}");
                return Err(Error::Submit(e));
            }
        };
        Ok(State::Draining { to_submit, outcome })
    }

    fn drain(&mut self, to_submit: u32, outcome: Outcome) -> Result<State, Error> {
        self.reap()?;
        let next = match outcome {
            Outcome::Accepted(n) if n == to_submit || n == 0 => State::Idle,
            Outcome::Accepted(_) => State::Submitting { retry: false },
            Outcome::Again if self.ctx.is_shutdown() && self.inflight == 0 => State::Finished,
            Outcome::Again => State::Submitting { retry: true },
        };
        Ok(next)
    }

    /// Consume every published completion, then hand the ring space back.
    fn reap(&mut self) -> Result<(), Error> {
        let Self {
            transport,
            slots,
            block_size,
            ..
        } = self;
        let block_size = *block_size;
        let mut hits = 0u64;
        let mut misses = 0u64;
        let mut retired = 0u32;
        let mut failure = None;

        for record in transport.completion_mut().drain() {
            let offset = match slots.complete(record.user_data) {
                Ok(offset) => offset,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            retired += 1;
            if record.result != block_size as i32 {
                error!(
                    offset,
                    expected = block_size,
                    actual = record.result,
                    "read completed with unexpected size"
                );
                failure = Some(Error::ShortTransfer {
                    offset,
                    expected: block_size,
                    actual: record.result,
                });
                break;
            }
            if record.is_cache_hit() {
                hits += 1;
            } else {
                misses += 1;
            }
        }
        transport.completion().release();

        if retired > 0 {
            self.inflight -= retired;
            self.ctx.stats().add_reaped(hits, misses);
            metrics::CQE_REAPED.add(hits + misses);
            metrics::CACHE_HIT.add(hits);
            metrics::CACHE_MISS.add(misses);
            self.publish_inflight();
        }
        debug_assert_eq!(self.inflight, self.slots.in_use());
        if let Some(e) = failure {
            return Err(e);
        }

        let overflow = self.transport.completion().overflow();
        if overflow != self.overflow_seen {
            warn!(
                overflow,
                lost = overflow.wrapping_sub(self.overflow_seen),
                "completion ring overflowed"
            );
            self.overflow_seen = overflow;
        }
        Ok(())
    }

    /// After a fatal error: submit what is still pending and wait until the
    /// kernel has returned every outstanding read. Stops early if the ring
    /// fails or stalls, leaving the remaining requests in flight.
    fn quiesce(&mut self) {
        self.state = State::Finished;
        self.discard();
        while self.inflight > 0 {
            let before = (self.inflight, self.pending);
            let result = self.transport.enter(self.pending, self.inflight);
            if let Ok(accepted) = &result {
                self.pending -= (*accepted).min(self.pending);
            }
            self.discard();
            match &result {
                Err(e) if !is_transient(e) => {
                    warn!(inflight = self.inflight, "giving up on in-flight reads: {e}");
                    return;
                }
                Ok(_) if (self.inflight, self.pending) == before => {
                    warn!(inflight = self.inflight, "kernel returned no in-flight reads");
                    return;
                }
                _ => {}
            }
        }
    }

    /// Retire every published completion without checking its result.
    fn discard(&mut self) {
        let Self {
            transport, slots, ..
        } = self;
        let mut retired = 0;
        for record in transport.completion_mut().drain() {
            if slots.complete(record.user_data).is_ok() {
                retired += 1;
            }
        }
        transport.completion().release();
        self.inflight -= retired;
        self.publish_inflight();
    }

    fn publish_inflight(&self) {
        self.ctx.stats().set_inflight(self.inflight as u64);
        metrics::INFLIGHT.set(self.inflight as i64);
    }
}

impl<C: RingChannel> Drop for Submitter<C> {
    fn drop(&mut self) {
        if self.inflight > 0 {
            // The kernel may still write into these buffers.
            warn!(
                inflight = self.inflight,
                "leaking read buffers with requests in flight"
            );
            return;
        }
        // Safety: nothing in flight references the pool, and it is not used
        // again after this point.
        unsafe { ManuallyDrop::drop(&mut self.buffers) }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EBUSY) | Some(libc::EINTR)
    )
}
