//! Two-phase publish demonstration.
//!
//! Shows the staged submission path end to end: the copy element is
//! queued before its payload exists, the interrupt element rides behind
//! it already valid, and activating the copy releases both. The payload
//! write between staging and activation is exactly the window the
//! activation fence covers.

use std::time::{Duration, Instant};

use anyhow::{Result, ensure};
use mcp_common::wire::{CACHE_LINE_SIZE, CompletionEvent, WorkElement};
use mcp_core::context::ContextHandle;
use mcp_core::flow::FlowController;
use mcp_core::queue::WorkQueue;
use mcp_core::region::DeviceRegion;
use mcp_core::waiter::DEFAULT_INTERRUPT_TIMEOUT;
use mcp_hw::{SimAfu, StdTimebase};
use rand::RngCore;

const IRQ_SOURCE: u16 = 1;

pub fn run_loopback(size: usize, timeout: Duration) -> Result<()> {
    ensure!(
        size > 0 && size <= u16::MAX as usize,
        "loopback size must be between 1 and {} bytes",
        u16::MAX
    );

    let afu = SimAfu::new();
    let queue = WorkQueue::new(2 * CACHE_LINE_SIZE)?;
    let mut ctx = ContextHandle::new(afu.open_context(), queue, FlowController::new(false));
    ctx.start()?;
    let clock = StdTimebase::new();

    let src = DeviceRegion::new_zeroed(size, CACHE_LINE_SIZE)?;
    let dst = DeviceRegion::new_zeroed(size, CACHE_LINE_SIZE)?;

    println!("Loopback: staging a {size}-byte copy with interrupt completion");

    // Stage the pair before the payload exists. Neither element is
    // consumable yet: the copy's valid bit is clear and gates both.
    let we = WorkElement::copy(src.base_addr(), dst.base_addr(), size as u16);
    let slot = ctx.stage(&we)?;
    ctx.stage(&WorkElement::raise_interrupt(IRQ_SOURCE))?;

    // Late payload write, then release.
    let mut payload = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut payload);
    src.write_bytes(0, &payload);

    let begin = Instant::now();
    slot.activate();
    ctx.kick()?;

    let report = ctx.wait_interrupt(&slot, IRQ_SOURCE, &clock, DEFAULT_INTERRUPT_TIMEOUT, timeout)?;
    let latency = begin.elapsed();
    ensure!(
        report.completion == CompletionEvent::Complete,
        "loopback copy faulted: {:?}",
        report.completion
    );

    let mut copied = vec![0u8; size];
    dst.read_bytes(0, &mut copied);
    ensure!(copied == payload, "destination does not match the payload");

    println!(
        "Completed in {latency:?} (interrupt {})",
        if report.interrupt_seen {
            "delivered"
        } else {
            "missed, recovered by polling"
        }
    );
    ctx.terminate()?;
    Ok(())
}
