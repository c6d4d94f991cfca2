use std::io;

use thiserror::Error;

/// Errors returned by the benchmark.
#[derive(Debug, Error)]
pub enum Error {
    /// A system call failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The kernel refused to create or configure the ring channel.
    #[error("ring setup: {0}")]
    RingSetup(String),
    /// A ring region could not be mapped, or a kernel-reported offset falls
    /// outside its region.
    #[error("ring mapping: {0}")]
    Mapping(String),
    /// A process resource limit could not be raised.
    #[error("{0}")]
    ResourceLimit(String),
    /// Invalid configuration value.
    #[error("config: {0}")]
    Config(String),
    /// The target file or device could not be opened or sized.
    #[error("target {path}: {source}")]
    Target {
        path: String,
        #[source]
        source: io::Error,
    },
    /// The target is smaller than one block.
    #[error("target {0} has zero size")]
    ZeroSizeTarget(String),
    /// A completion transferred a different number of bytes than requested.
    #[error("unexpected ret={actual} at offset={offset}, size={expected}")]
    ShortTransfer { offset: u64, expected: u32, actual: i32 },
    /// A completion names a slot that has no request in flight.
    #[error("completion for unknown request {0:#x}")]
    UnknownCompletion(u64),
    /// The kernel entry call failed with a non-transient error.
    #[error("io_uring_enter: {0}")]
    Submit(#[source] io::Error),
}
