use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::buffer::BufferPool;
use crate::config::Config;
use crate::error::Error;
use crate::generator::RequestGenerator;
use crate::kernel::RingKernel;
use crate::ring::{RingProbe, RingTransport};
use crate::stats::{BenchContext, StatsAggregator};
use crate::submitter::Submitter;

/// `_IOR(0x12, 114, size_t)`: size of a block device in bytes.
const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

/// How often the report loop looks at the shutdown flag while sleeping.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// An opened benchmark target.
pub struct Target {
    file: File,
    blocks: u64,
}

impl Target {
    /// Open `path` read-only, bypassing the page cache unless `buffered`, and
    /// size it in `block_size` units.
    pub fn open(path: &Path, buffered: bool, block_size: u32) -> Result<Self, Error> {
        let target_err = |source| Error::Target {
            path: path.display().to_string(),
            source,
        };
        let mut options = OpenOptions::new();
        options.read(true);
        if !buffered {
            options.custom_flags(libc::O_DIRECT);
        }
        let file = options.open(path).map_err(target_err)?;
        let bytes = target_size(&file).map_err(target_err)?;
        let blocks = bytes / block_size as u64;
        if blocks == 0 {
            return Err(Error::ZeroSizeTarget(path.display().to_string()));
        }
        Ok(Target { file, blocks })
    }

    /// Whole blocks in the target.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Block count the generator draws from. The last block is never read.
    pub fn max_blocks(&self) -> u64 {
        self.blocks - 1
    }
}

fn target_size(file: &File) -> io::Result<u64> {
    let meta = file.metadata()?;
    let file_type = meta.file_type();
    if file_type.is_block_device() {
        let mut bytes: u64 = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut bytes) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(bytes)
    } else if file_type.is_file() {
        Ok(meta.len())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file or block device",
        ))
    }
}

/// Raise `RLIMIT_MEMLOCK` so the rings and registered buffers can be pinned.
pub fn ensure_memlock_limit() -> Result<(), Error> {
    let mut rlim: libc::rlimit = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rlim) };
    if ret != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    if rlim.rlim_cur == libc::RLIM_INFINITY && rlim.rlim_max == libc::RLIM_INFINITY {
        return Ok(());
    }

    let wanted = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &wanted) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        return Err(Error::ResourceLimit(format!(
            "RLIMIT_MEMLOCK too low: soft {} hard {}, raising to unlimited failed: {err}. \
             Run with CAP_SYS_RESOURCE or raise the limit (ulimit -l unlimited).",
            rlim.rlim_cur, rlim.rlim_max
        )));
    }
    Ok(())
}

/// Sets the shutdown flag when the submitter thread exits, however it exits.
struct ShutdownOnExit(Arc<BenchContext>);

impl Drop for ShutdownOnExit {
    fn drop(&mut self) {
        self.0.request_shutdown();
    }
}

/// A running benchmark: the submitter thread plus what the control thread
/// needs to report on it.
pub struct Bench {
    ctx: Arc<BenchContext>,
    probe: RingProbe,
    handle: JoinHandle<Result<(), Error>>,
}

impl Bench {
    /// Set up the ring on the calling thread and start the submitter.
    ///
    /// Ring creation, mapping and buffer registration failures are returned
    /// here. Target failures end the submitter thread and surface from
    /// [`join`](Self::join).
    pub fn launch<K>(
        kernel: &K,
        config: &Config,
        target: PathBuf,
        ctx: Arc<BenchContext>,
    ) -> Result<Bench, Error>
    where
        K: RingKernel,
        K::Channel: Send + 'static,
    {
        config.validate()?;
        let buffers = BufferPool::new(config.depth, config.block_size)?;
        let transport =
            RingTransport::initialize(kernel, config.depth, &config.ring_options(), Some(&buffers))?;
        let probe = transport.probe();

        let config = config.clone();
        let worker_ctx = Arc::clone(&ctx);
        let handle = thread::Builder::new()
            .name("ringbench-submitter".to_string())
            .spawn(move || {
                let _guard = ShutdownOnExit(Arc::clone(&worker_ctx));
                let target = Target::open(&target, config.buffered, config.block_size)?;
                let seed = config.seed.unwrap_or_else(rand::random);
                debug!(
                    blocks = target.blocks(),
                    seed,
                    direct = !config.buffered,
                    "target opened"
                );
                let generator = RequestGenerator::new(
                    target.file.as_raw_fd(),
                    target.max_blocks(),
                    config.block_size,
                    config.fixed_buffers,
                    seed,
                );
                let mut submitter =
                    Submitter::new(transport, buffers, generator, &config, worker_ctx);
                submitter.run()
            })
            .map_err(Error::Io)?;

        Ok(Bench { ctx, probe, handle })
    }

    /// Log a report line every `interval` until shutdown is requested.
    pub fn report_loop(&self, interval: Duration) {
        let stats = self.ctx.stats();
        let mut aggregator = StatsAggregator::new(stats, Instant::now());
        let mut deadline = Instant::now() + interval;
        while !self.ctx.is_shutdown() {
            let now = Instant::now();
            if now < deadline {
                thread::sleep((deadline - now).min(SHUTDOWN_POLL));
                continue;
            }
            let report = aggregator.sample(stats, now, self.probe.snapshot());
            info!("{report}");
            deadline = next_deadline(deadline, now, interval);
        }
    }

    /// Wait for the submitter to drain and exit.
    pub fn join(self) -> Result<(), Error> {
        let result = match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(Error::Io(io::Error::other("submitter thread panicked"))),
        };
        if let Err(e) = &result {
            error!("submitter failed: {e}");
        }
        let totals = self.ctx.stats().snapshot();
        info!(
            done = totals.done,
            reaped = totals.reaped,
            calls = totals.calls,
            "benchmark finished"
        );
        result
    }
}

/// The report deadline after the one that fired at `now`. Intervals missed
/// while the reporter was stalled are skipped, not reported back to back.
fn next_deadline(deadline: Instant, now: Instant, interval: Duration) -> Instant {
    let next = deadline + interval;
    if next <= now { now + interval } else { next }
}
