use std::time::Duration;

use crate::error::Error;
use crate::ring::RingOptions;

/// Largest supported queue depth. Request slots are addressed by a `u16`
/// buffer index in fixed-buffer reads.
pub const MAX_DEPTH: u32 = 4096;

/// Configuration for one benchmark run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of requests in flight (ring size).
    pub depth: u32,
    /// Most requests prepared and submitted per round.
    pub batch_submit: u32,
    /// Most completions waited for per kernel entry call.
    pub batch_complete: u32,
    /// Size of every read, in bytes. Power of two, at least 512.
    pub block_size: u32,
    /// Read through the page cache. `false` opens the target with `O_DIRECT`.
    pub buffered: bool,
    /// Busy-poll for completions (`IORING_SETUP_IOPOLL`). Requires direct I/O.
    pub polled: bool,
    /// Register the buffer pool with the kernel and issue fixed-buffer reads.
    pub fixed_buffers: bool,
    /// Let a kernel thread consume the submission ring.
    pub sq_thread: bool,
    /// Pin the kernel submission thread to this CPU. Only meaningful with
    /// `sq_thread`.
    pub sq_thread_cpu: Option<u32>,
    /// Interval between report lines.
    pub report_interval: Duration,
    /// Seed for the offset generator. `None` draws one from the OS.
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            depth: 32,
            batch_submit: 8,
            batch_complete: 8,
            block_size: 4096,
            buffered: true,
            polled: false,
            fixed_buffers: false,
            sq_thread: false,
            sq_thread_cpu: None,
            report_interval: Duration::from_secs(1),
            seed: None,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.depth == 0 || self.depth > MAX_DEPTH {
            return Err(Error::Config(format!(
                "depth must be > 0 and <= {MAX_DEPTH}"
            )));
        }
        if self.batch_submit == 0 {
            return Err(Error::Config("batch_submit must be > 0".into()));
        }
        if self.batch_complete == 0 {
            return Err(Error::Config("batch_complete must be > 0".into()));
        }
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(Error::Config(
                "block_size must be a power of two >= 512".into(),
            ));
        }
        if self.polled && self.buffered {
            return Err(Error::Config(
                "polled completions require direct I/O".into(),
            ));
        }
        if self.sq_thread_cpu.is_some() && !self.sq_thread {
            return Err(Error::Config(
                "sq_thread_cpu requires sq_thread".into(),
            ));
        }
        if self.report_interval.is_zero() {
            return Err(Error::Config("report_interval must be > 0".into()));
        }
        Ok(())
    }

    /// Ring channel options derived from this configuration.
    pub fn ring_options(&self) -> RingOptions {
        RingOptions {
            iopoll: self.polled,
            sq_thread: self.sq_thread,
            sq_thread_cpu: self.sq_thread_cpu,
            fixed_buffers: self.fixed_buffers,
        }
    }
}

/// Builder for [`Config`] with `build()` validation.
///
/// # Example
///
/// ```rust
/// use ringbench::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .depth(64)
///     .batch(16, 16)
///     .direct(true)
///     .build()
///     .expect("invalid config");
/// assert!(!config.buffered);
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Queue shape ──────────────────────────────────────────────────

    pub fn depth(mut self, n: u32) -> Self {
        self.config.depth = n;
        self
    }

    /// Set the submit and complete batch sizes.
    pub fn batch(mut self, submit: u32, complete: u32) -> Self {
        self.config.batch_submit = submit;
        self.config.batch_complete = complete;
        self
    }

    pub fn block_size(mut self, bytes: u32) -> Self {
        self.config.block_size = bytes;
        self
    }

    // ── I/O mode ─────────────────────────────────────────────────────

    /// Open the target with `O_DIRECT`.
    pub fn direct(mut self, enable: bool) -> Self {
        self.config.buffered = !enable;
        self
    }

    pub fn polled(mut self, enable: bool) -> Self {
        self.config.polled = enable;
        self
    }

    pub fn fixed_buffers(mut self, enable: bool) -> Self {
        self.config.fixed_buffers = enable;
        self
    }

    // ── Kernel submission thread ─────────────────────────────────────

    pub fn sq_thread(mut self, enable: bool) -> Self {
        self.config.sq_thread = enable;
        self
    }

    /// Pin the kernel submission thread to `cpu`.
    pub fn sq_thread_cpu(mut self, cpu: u32) -> Self {
        self.config.sq_thread_cpu = Some(cpu);
        self
    }

    // ── Reporting ────────────────────────────────────────────────────

    pub fn report_interval(mut self, interval: Duration) -> Self {
        self.config.report_interval = interval;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.depth, 32);
        assert_eq!(config.batch_submit, 8);
        assert_eq!(config.batch_complete, 8);
        assert_eq!(config.block_size, 4096);
        assert!(config.buffered);
    }

    #[test]
    fn builder_sets_fields() {
        let config = ConfigBuilder::new()
            .depth(128)
            .batch(32, 16)
            .block_size(512)
            .direct(true)
            .polled(true)
            .fixed_buffers(true)
            .sq_thread(true)
            .sq_thread_cpu(3)
            .seed(9)
            .build()
            .unwrap();
        assert_eq!(config.depth, 128);
        assert_eq!(config.batch_submit, 32);
        assert_eq!(config.batch_complete, 16);
        assert_eq!(config.block_size, 512);
        assert!(!config.buffered);
        assert_eq!(config.seed, Some(9));

        let options = config.ring_options();
        assert!(options.iopoll);
        assert!(options.sq_thread);
        assert!(options.fixed_buffers);
        assert_eq!(options.sq_thread_cpu, Some(3));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let cases = [
            ConfigBuilder::new().depth(0),
            ConfigBuilder::new().depth(MAX_DEPTH + 1),
            ConfigBuilder::new().batch(0, 8),
            ConfigBuilder::new().batch(8, 0),
            ConfigBuilder::new().block_size(256),
            ConfigBuilder::new().block_size(3000),
            ConfigBuilder::new().polled(true),
            ConfigBuilder::new().sq_thread_cpu(1),
            ConfigBuilder::new().report_interval(Duration::ZERO),
        ];
        for builder in cases {
            assert!(matches!(builder.build(), Err(Error::Config(_))));
        }
    }

    #[test]
    fn polled_direct_is_accepted() {
        ConfigBuilder::new().direct(true).polled(true).build().unwrap();
    }
}
