use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cumulative counters for one run. Written by the submitter thread only;
/// the report thread reads them without synchronizing with the writer, so a
/// snapshot may be a few operations stale.
#[derive(Debug, Default)]
pub struct BenchStats {
    done: AtomicU64,
    calls: AtomicU64,
    reaped: AtomicU64,
    cache_hit: AtomicU64,
    cache_miss: AtomicU64,
    inflight: AtomicU64,
}

impl BenchStats {
    pub(crate) fn add_done(&self, n: u64) {
        self.done.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_reaped(&self, hits: u64, misses: u64) {
        self.cache_hit.fetch_add(hits, Ordering::Relaxed);
        self.cache_miss.fetch_add(misses, Ordering::Relaxed);
        self.reaped.fetch_add(hits + misses, Ordering::Relaxed);
    }

    pub(crate) fn set_inflight(&self, n: u64) {
        self.inflight.store(n, Ordering::Relaxed);
    }

    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            done: self.done.load(Ordering::Relaxed),
            calls: self.calls.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
            cache_hit: self.cache_hit.load(Ordering::Relaxed),
            cache_miss: self.cache_miss.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the control thread and the submitter.
#[derive(Debug, Default)]
pub struct BenchContext {
    stats: BenchStats,
    shutdown: AtomicBool,
}

impl BenchContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &BenchStats {
        &self.stats
    }

    /// Ask the submitter to stop preparing work and drain.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Counter values at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Requests accepted by the kernel.
    pub done: u64,
    /// Kernel entry calls.
    pub calls: u64,
    pub reaped: u64,
    pub cache_hit: u64,
    pub cache_miss: u64,
}

impl Snapshot {
    /// Counter growth from `earlier` to `self`.
    pub fn since(&self, earlier: &Snapshot) -> Snapshot {
        Snapshot {
            done: self.done.saturating_sub(earlier.done),
            calls: self.calls.saturating_sub(earlier.calls),
            reaped: self.reaped.saturating_sub(earlier.reaped),
            cache_hit: self.cache_hit.saturating_sub(earlier.cache_hit),
            cache_miss: self.cache_miss.saturating_sub(earlier.cache_miss),
        }
    }
}

/// One report line worth of derived figures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    pub iops: u64,
    pub ios_per_call: u64,
    pub reaps_per_call: u64,
    pub inflight: u64,
    pub cq_head: u32,
    pub cq_tail: u32,
    pub cache_hit_pct: f64,
}

impl Report {
    /// Derive the figures for an interval of length `elapsed` whose counter
    /// growth is `delta`.
    pub fn from_interval(delta: &Snapshot, elapsed: Duration, inflight: u64, cq: (u32, u32)) -> Self {
        let secs = elapsed.as_secs_f64();
        let iops = if secs > 0.0 {
            (delta.done as f64 / secs) as u64
        } else {
            delta.done
        };
        let (ios_per_call, reaps_per_call) = match delta.calls {
            0 => (0, 0),
            calls => (delta.done / calls, delta.reaped / calls),
        };
        let samples = delta.cache_hit + delta.cache_miss;
        let cache_hit_pct = if samples == 0 {
            0.0
        } else {
            delta.cache_hit as f64 * 100.0 / samples as f64
        };
        Report {
            iops,
            ios_per_call,
            reaps_per_call,
            inflight,
            cq_head: cq.0,
            cq_tail: cq.1,
            cache_hit_pct,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IOPS={}, IOS/call={}/{}, inflight={} (head={} tail={}), Cachehit={:.2}%",
            self.iops,
            self.ios_per_call,
            self.reaps_per_call,
            self.inflight,
            self.cq_head,
            self.cq_tail,
            self.cache_hit_pct
        )
    }
}

/// Diffs successive snapshots into per-interval reports.
pub struct StatsAggregator {
    previous: Snapshot,
    at: Instant,
}

impl StatsAggregator {
    pub fn new(stats: &BenchStats, now: Instant) -> Self {
        StatsAggregator {
            previous: stats.snapshot(),
            at: now,
        }
    }

    /// Close the current interval at `now` and start the next one.
    pub fn sample(&mut self, stats: &BenchStats, now: Instant, cq: (u32, u32)) -> Report {
        let current = stats.snapshot();
        let delta = current.since(&self.previous);
        let elapsed = now.saturating_duration_since(self.at);
        self.previous = current;
        self.at = now;
        Report::from_interval(&delta, elapsed, stats.inflight(), cq)
    }
}
