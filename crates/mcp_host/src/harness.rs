//! Copy and increment exercises against the modelled accelerator.
//!
//! Each worker owns a source and destination buffer in device-shared
//! memory, pushes copy elements through a context, and verifies the
//! payload after every completion. Workers either own a context each or
//! share a single one behind a lock, with waits kept outside the lock
//! so submissions from other workers can proceed.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, ensure};
use mcp_common::wire::{CACHE_LINE_SIZE, CompletionEvent, WorkElement};
use mcp_core::context::{ContextHandle, MasterContext};
use mcp_core::flow::FlowController;
use mcp_core::queue::WorkQueue;
use mcp_core::region::DeviceRegion;
use mcp_core::waiter::{CompletionWaiter, DEFAULT_INTERRUPT_TIMEOUT};
use mcp_hw::{SimAfu, SimContext, StdTimebase};
use rand::RngCore;
use rayon::prelude::*;

use crate::stats::LatencyStats;

/// Interrupt source used for completion signalling.
const IRQ_SOURCE: u16 = 1;

pub struct CopyOptions {
    pub workers: usize,
    pub loops: usize,
    pub size: usize,
    pub timeout: Duration,
    pub irq: bool,
    pub stop: bool,
    pub shared: bool,
}

fn new_context(afu: &SimAfu, stop: bool) -> Result<ContextHandle<SimContext>> {
    // Maximum descriptor geometry; deep enough that no worker's awaited
    // slot is ever lapped by the ring.
    let queue = WorkQueue::new_max()?;
    let mut ctx = ContextHandle::new(afu.open_context(), queue, FlowController::new(stop));
    ctx.start()?;
    Ok(ctx)
}

fn verify_copy(dst: &DeviceRegion, payload: &[u8]) -> Result<()> {
    let mut copied = vec![0u8; payload.len()];
    dst.read_bytes(0, &mut copied);
    ensure!(copied == payload, "destination does not match the payload");
    Ok(())
}

struct CopyBuffers {
    src: DeviceRegion,
    dst: DeviceRegion,
    payload: Vec<u8>,
    zeros: Vec<u8>,
}

impl CopyBuffers {
    fn new(size: usize) -> Result<Self> {
        Ok(Self {
            src: DeviceRegion::new_zeroed(size, CACHE_LINE_SIZE)?,
            dst: DeviceRegion::new_zeroed(size, CACHE_LINE_SIZE)?,
            payload: vec![0u8; size],
            zeros: vec![0u8; size],
        })
    }

    /// Fresh random payload in the source, cleared destination.
    fn refill(&mut self) -> WorkElement {
        rand::thread_rng().fill_bytes(&mut self.payload);
        self.src.write_bytes(0, &self.payload);
        self.dst.write_bytes(0, &self.zeros);
        WorkElement::copy(
            self.src.base_addr(),
            self.dst.base_addr(),
            self.payload.len() as u16,
        )
    }
}

fn ensure_complete(completion: CompletionEvent) -> Result<()> {
    match completion {
        CompletionEvent::Complete => Ok(()),
        CompletionEvent::Fault(set) => Err(anyhow!("copy faulted: {set}")),
    }
}

fn copy_loop_owned(ctx: &mut ContextHandle<SimContext>, opts: &CopyOptions) -> Result<LatencyStats> {
    let clock = StdTimebase::new();
    let mut buffers = CopyBuffers::new(opts.size)?;
    let mut stats = LatencyStats::new();

    for _ in 0..opts.loops {
        let we = buffers.refill();
        let begin = Instant::now();
        let completion = if opts.irq {
            let slot = ctx.submit_with_interrupt(&we, IRQ_SOURCE)?;
            ctx.wait_interrupt(&slot, IRQ_SOURCE, &clock, DEFAULT_INTERRUPT_TIMEOUT, opts.timeout)?
                .completion
        } else {
            let slot = ctx.submit(&we)?;
            CompletionWaiter::new(&clock)
                .with_deadline(opts.timeout)
                .wait(&slot)?
        };
        ensure_complete(completion)?;
        stats.update(begin.elapsed().as_nanos() as u64);
        verify_copy(&buffers.dst, &buffers.payload)?;
    }
    Ok(stats)
}

fn copy_loop_shared(
    ctx: &Mutex<ContextHandle<SimContext>>,
    opts: &CopyOptions,
) -> Result<LatencyStats> {
    let clock = StdTimebase::new();
    let mut buffers = CopyBuffers::new(opts.size)?;
    let mut stats = LatencyStats::new();

    for _ in 0..opts.loops {
        let we = buffers.refill();
        let begin = Instant::now();
        if opts.irq {
            // The halt acknowledgement must serialize with other
            // producers' enqueues, so the interrupt wait stays inside
            // the lock.
            let mut guard = ctx.lock().unwrap_or_else(|e| e.into_inner());
            let slot = guard.submit_with_interrupt(&we, IRQ_SOURCE)?;
            let report = guard.wait_interrupt(
                &slot,
                IRQ_SOURCE,
                &clock,
                DEFAULT_INTERRUPT_TIMEOUT,
                opts.timeout,
            )?;
            ensure_complete(report.completion)?;
        } else {
            let slot = {
                let mut guard = ctx.lock().unwrap_or_else(|e| e.into_inner());
                guard.submit(&we)?
            };
            let completion = CompletionWaiter::new(&clock)
                .with_deadline(opts.timeout)
                .wait(&slot)?;
            ensure_complete(completion)?;
        }
        stats.update(begin.elapsed().as_nanos() as u64);
        verify_copy(&buffers.dst, &buffers.payload)?;
    }
    Ok(stats)
}

/// Runs the copy exercise and prints latency and throughput reports.
pub fn run_copy(opts: &CopyOptions) -> Result<()> {
    ensure!(opts.workers > 0, "need at least one worker");
    ensure!(
        opts.size > 0 && opts.size <= u16::MAX as usize,
        "copy size must be between 1 and {} bytes",
        u16::MAX
    );

    let afu = SimAfu::new();
    let mut master = MasterContext::new(afu.open_master());
    master.start()?;
    let cfg = master.set_stop_on_invalid(opts.stop)?;

    println!(
        "Copy exercise: {} worker(s) x {} loop(s), {} bytes, irq={}, shared={}",
        opts.workers, opts.loops, opts.size, opts.irq, opts.shared
    );
    println!("Accelerator config: {cfg:#018x}");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.workers)
        .build()?;

    let begin = Instant::now();
    let per_worker: Vec<LatencyStats> = if opts.shared {
        let ctx = Arc::new(Mutex::new(new_context(&afu, opts.stop)?));
        let results = pool.install(|| {
            (0..opts.workers)
                .into_par_iter()
                .map(|_| copy_loop_shared(&ctx, opts))
                .collect::<Result<Vec<_>>>()
        })?;
        let mutex = Arc::try_unwrap(ctx).map_err(|_| anyhow!("context handle still shared"))?;
        mutex
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .terminate()?;
        results
    } else {
        pool.install(|| {
            (0..opts.workers)
                .into_par_iter()
                .map(|_| {
                    let mut ctx = new_context(&afu, opts.stop)?;
                    let stats = copy_loop_owned(&mut ctx, opts);
                    ctx.terminate()?;
                    stats
                })
                .collect::<Result<Vec<_>>>()
        })?
    };
    let wall = begin.elapsed();

    let mut total = LatencyStats::new();
    for stats in &per_worker {
        total.merge(stats);
    }

    let seconds = wall.as_secs_f64();
    let copies = total.count;
    let bytes = copies as f64 * opts.size as f64;
    println!("\nResults");
    println!("Time: {:.4} s", seconds);
    println!("Copies: {copies}");
    println!("Throughput: {:.2} copies/s ({:.2} MiB/s)", copies as f64 / seconds, bytes / seconds / (1024.0 * 1024.0));
    total.print_report();

    master.terminate()?;
    Ok(())
}

/// Runs a chain of increments through one context, verifying the counter
/// after every completion.
pub fn run_increment(loops: usize, timeout: Duration) -> Result<()> {
    let afu = SimAfu::new();
    let mut ctx = new_context(&afu, false)?;
    let clock = StdTimebase::new();

    let counter = DeviceRegion::new_zeroed(CACHE_LINE_SIZE, CACHE_LINE_SIZE)?;
    let initial = rand::thread_rng().next_u32();
    counter.write_u32_be(0, initial);

    println!("Increment exercise: {loops} loop(s), starting at {initial:#010x}");

    let mut stats = LatencyStats::new();
    let mut expected = initial;
    for _ in 0..loops {
        let we = WorkElement::increment(counter.base_addr(), counter.base_addr());
        let begin = Instant::now();
        let slot = ctx.submit(&we)?;
        let completion = CompletionWaiter::new(&clock)
            .with_deadline(timeout)
            .wait(&slot)?;
        ensure_complete(completion)?;
        stats.update(begin.elapsed().as_nanos() as u64);

        expected = expected.wrapping_add(1);
        let value = counter.read_u32_be(0);
        ensure!(
            value == expected,
            "counter reads {value:#010x}, expected {expected:#010x}"
        );
    }

    println!("Final counter: {expected:#010x}");
    stats.print_report();
    ctx.terminate()?;
    Ok(())
}
