//! ringbench process metrics.
//!
//! Cumulative counters for the submit and reap paths. These mirror the
//! per-run [`BenchStats`](crate::BenchStats) but are process-wide and
//! exposed through `metriken`'s registry for external exposition.

use metriken::{Counter, Gauge, metric};

// ── Submission ───────────────────────────────────────────────────

#[metric(
    name = "ringbench/sqe/submitted",
    description = "Descriptors accepted by the kernel"
)]
pub static SQE_SUBMITTED: Counter = Counter::new();

#[metric(
    name = "ringbench/enter/calls",
    description = "Kernel entry calls"
)]
pub static ENTER_CALLS: Counter = Counter::new();

#[metric(
    name = "ringbench/enter/retries",
    description = "Kernel entry calls that asked to try again"
)]
pub static ENTER_RETRIES: Counter = Counter::new();

// ── Completion ───────────────────────────────────────────────────

#[metric(name = "ringbench/cqe/reaped", description = "Completions reaped")]
pub static CQE_REAPED: Counter = Counter::new();

#[metric(
    name = "ringbench/cqe/cache_hit",
    description = "Reads served from the page cache"
)]
pub static CACHE_HIT: Counter = Counter::new();

#[metric(
    name = "ringbench/cqe/cache_miss",
    description = "Reads that went to the device"
)]
pub static CACHE_MISS: Counter = Counter::new();

#[metric(
    name = "ringbench/requests/inflight",
    description = "Requests prepared or submitted and not yet reaped"
)]
pub static INFLIGHT: Gauge = Gauge::new();
