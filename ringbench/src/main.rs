use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ringbench::{Bench, BenchContext, Config, ConfigBuilder, UringKernel};
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "ringbench")]
#[command(version, about = "Random-read throughput benchmark over io_uring")]
struct Cli {
    /// File or block device to read from
    target: PathBuf,

    /// Maximum requests in flight
    #[arg(long, default_value = "32")]
    depth: u32,

    /// Requests prepared and submitted per round
    #[arg(long, default_value = "8")]
    batch_submit: u32,

    /// Completions waited for per kernel entry
    #[arg(long, default_value = "8")]
    batch_complete: u32,

    /// Read size in bytes
    #[arg(long, default_value = "4096")]
    block_size: u32,

    /// Open the target with O_DIRECT instead of going through the page cache
    #[arg(long)]
    direct: bool,

    /// Busy-poll for completions (requires --direct)
    #[arg(long)]
    polled: bool,

    /// Register the read buffers with the kernel
    #[arg(long)]
    fixed_buffers: bool,

    /// Use a kernel thread to consume the submission ring
    #[arg(long)]
    sq_thread: bool,

    /// Pin the kernel submission thread to this CPU
    #[arg(long, requires = "sq_thread")]
    sq_thread_cpu: Option<u32>,

    /// Report interval in milliseconds
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// Seed for the offset generator
    #[arg(long)]
    seed: Option<u64>,
}

impl Cli {
    fn config(&self) -> Result<Config, ringbench::Error> {
        let mut builder = ConfigBuilder::new()
            .depth(self.depth)
            .batch(self.batch_submit, self.batch_complete)
            .block_size(self.block_size)
            .direct(self.direct)
            .polled(self.polled)
            .fixed_buffers(self.fixed_buffers)
            .sq_thread(self.sq_thread)
            .report_interval(Duration::from_millis(self.interval_ms));
        if let Some(cpu) = self.sq_thread_cpu {
            builder = builder.sq_thread_cpu(cpu);
        }
        if let Some(seed) = self.seed {
            builder = builder.seed(seed);
        }
        builder.build()
    }
}

fn run(cli: Cli) -> Result<(), ringbench::Error> {
    let config = cli.config()?;
    ringbench::ensure_memlock_limit()?;

    let ctx = Arc::new(BenchContext::new());
    let handler_ctx = Arc::clone(&ctx);
    ctrlc::set_handler(move || handler_ctx.request_shutdown())
        .map_err(|e| ringbench::Error::Io(std::io::Error::other(e.to_string())))?;

    let bench = Bench::launch(&UringKernel, &config, cli.target, ctx)?;
    bench.report_loop(config.report_interval);
    bench.join()
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
        Err(e) => e.exit(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
