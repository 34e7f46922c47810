mod harness;
mod loopback;
mod stats;
mod timebase;

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push copy elements through one or more contexts and verify them.
    Copy {
        #[arg(short, long, default_value_t = 1)]
        workers: usize,
        #[arg(short, long, default_value_t = 1)]
        loops: usize,
        #[arg(short, long, default_value_t = 1024)]
        size: usize,
        #[arg(short, long, default_value_t = 120)]
        timeout: u64,
        /// Signal completions with chained interrupt elements.
        #[arg(long)]
        irq: bool,
        /// Configure stop-on-invalid-command and restart after enqueues.
        #[arg(long)]
        stop: bool,
        /// Share one context between all workers behind a lock.
        #[arg(long)]
        shared: bool,
    },
    /// Run a verified chain of counter increments.
    Increment {
        #[arg(short, long, default_value_t = 100)]
        loops: usize,
        #[arg(short, long, default_value_t = 120)]
        timeout: u64,
    },
    /// Sample the accelerator timebase against host wall time.
    Timebase {
        #[arg(short, long, default_value_t = 5)]
        samples: usize,
        #[arg(short, long, default_value_t = 120)]
        timeout: u64,
    },
    /// Demonstrate the staged two-phase publish with a single copy.
    Loopback {
        #[arg(short, long, default_value_t = 1024)]
        size: usize,
        #[arg(short, long, default_value_t = 120)]
        timeout: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Copy {
            workers,
            loops,
            size,
            timeout,
            irq,
            stop,
            shared,
        } => {
            harness::run_copy(&harness::CopyOptions {
                workers,
                loops,
                size,
                timeout: Duration::from_secs(timeout),
                irq,
                stop,
                shared,
            })?;
        }
        Commands::Increment { loops, timeout } => {
            harness::run_increment(loops, Duration::from_secs(timeout))?;
        }
        Commands::Timebase { samples, timeout } => {
            timebase::run_timebase(samples, Duration::from_secs(timeout))?;
        }
        Commands::Loopback { size, timeout } => {
            loopback::run_loopback(size, Duration::from_secs(timeout))?;
        }
    }
    Ok(())
}
