//! Timebase synchronization exercise.
//!
//! Repeatedly requests a timebase update through the register window and
//! checks that the latched tick count advances with host wall time.

use std::time::Duration;

use anyhow::{Result, ensure};
use mcp_core::context::ContextHandle;
use mcp_core::flow::FlowController;
use mcp_core::queue::WorkQueue;
use mcp_core::waiter::Timebase as _;
use mcp_common::wire::CACHE_LINE_SIZE;
use mcp_hw::{SimAfu, StdTimebase};

const SAMPLE_GAP: Duration = Duration::from_millis(10);

pub fn run_timebase(samples: usize, timeout: Duration) -> Result<()> {
    ensure!(samples > 0, "need at least one sample");

    let afu = SimAfu::new();
    let queue = WorkQueue::new(CACHE_LINE_SIZE)?;
    let mut ctx = ContextHandle::new(afu.open_context(), queue, FlowController::new(false));
    ctx.start()?;

    let clock = StdTimebase::new();
    println!("Timebase exercise: {samples} sample(s), {SAMPLE_GAP:?} apart");

    let mut previous = ctx.sync_timebase(&clock, timeout)?;
    ensure!(previous > 0, "timebase never latched a tick count");

    for sample in 1..=samples {
        let wall_before = clock.now();
        clock.pause(SAMPLE_GAP);
        let ticks = ctx.sync_timebase(&clock, timeout)?;
        let wall = clock.now() - wall_before;

        ensure!(
            ticks > previous,
            "timebase went backwards: {ticks} after {previous}"
        );
        let delta = (ticks - previous) as f64;
        let expected = wall.as_nanos() as f64;
        println!(
            "sample {sample}: {delta:.0} ticks over {wall:?} ({:.3} MHz apparent)",
            delta / wall.as_secs_f64() / 1e6
        );
        // The tick counter runs at nanosecond granularity; flag gross
        // drift against the host clock.
        ensure!(
            delta > expected * 0.5 && delta < expected * 2.0,
            "timebase drifted: {delta:.0} ticks against {expected:.0} ns of wall time"
        );
        previous = ticks;
    }

    ctx.terminate()?;
    Ok(())
}
