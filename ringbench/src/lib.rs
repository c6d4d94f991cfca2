//! ringbench: random-read throughput benchmark over io_uring.
//!
//! ringbench drives the io_uring submission and completion rings by hand:
//! it maps the shared regions itself, writes descriptors into the
//! submission queue, publishes the tail with release ordering and consumes
//! completions straight from the completion ring. One submitter thread
//! keeps up to `depth` fixed-size reads at random block-aligned offsets in
//! flight while the control thread prints a report line per interval.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ringbench::{Bench, BenchContext, ConfigBuilder, UringKernel};
//!
//! fn main() -> Result<(), ringbench::Error> {
//!     let config = ConfigBuilder::new().depth(64).direct(true).build()?;
//!     ringbench::ensure_memlock_limit()?;
//!     let ctx = Arc::new(BenchContext::new());
//!     let bench = Bench::launch(&UringKernel, &config, "/dev/nvme0n1".into(), ctx)?;
//!     bench.report_loop(config.report_interval);
//!     bench.join()
//! }
//! ```
//!
//! # Platform
//!
//! Linux only. Fixed-buffer reads need 5.1+, `IORING_OP_READ` needs 5.6+.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod generator;
pub(crate) mod metrics;
#[cfg(test)]
pub(crate) mod sim;
pub(crate) mod submitter;

// ── Public modules ──────────────────────────────────────────────────────
pub mod abi;
pub mod buffer;
pub mod completion;
pub mod config;
pub mod error;
pub mod kernel;
pub mod region;
pub mod ring;
pub mod stats;
pub mod worker;

// ── Re-exports ──────────────────────────────────────────────────────────

pub use config::{Config, ConfigBuilder};
pub use error::Error;
pub use kernel::{RingChannel, RingKernel, UringChannel, UringKernel};
pub use ring::{RingOptions, RingProbe};
pub use stats::{BenchContext, BenchStats, Report, Snapshot, StatsAggregator};
pub use worker::{Bench, Target, ensure_memlock_limit};
