//! End-to-end protocol tests against the modelled accelerator.
//!
//! Each test drives the real protocol stack (queue, context lifecycle,
//! flow control, completion waiting) with the software engine standing
//! in for the hardware.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use mcp_common::regs;
use mcp_core::waiter::Timebase;
use mcp_common::wire::{CACHE_LINE_SIZE, CompletionEvent, FaultKind, WorkElement};
use mcp_core::McpError;
use mcp_core::context::{ContextHandle, MasterContext};
use mcp_core::flow::FlowController;
use mcp_core::queue::{StagedElement, WorkQueue};
use mcp_core::region::DeviceRegion;
use mcp_core::waiter::{CompletionWaiter, DEFAULT_INTERRUPT_TIMEOUT, wait_for_condition};
use mcp_hw::{SimAfu, SimContext, StdTimebase};
use rand::RngCore;

const TEST_DEADLINE: Duration = Duration::from_secs(10);

fn running_context(
    afu: &SimAfu,
    queue_bytes: usize,
    stop_mode: bool,
) -> ContextHandle<SimContext> {
    let queue = WorkQueue::new(queue_bytes).unwrap();
    let mut handle = ContextHandle::new(
        afu.open_context(),
        queue,
        FlowController::new(stop_mode),
    );
    handle.start().unwrap();
    handle
}

fn random_region(len: usize) -> (DeviceRegion, Vec<u8>) {
    let region = DeviceRegion::new_zeroed(len, CACHE_LINE_SIZE).unwrap();
    let mut payload = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut payload);
    region.write_bytes(0, &payload);
    (region, payload)
}

fn wait_complete(slot: &StagedElement) -> Result<CompletionEvent, McpError> {
    let clock = StdTimebase::new();
    CompletionWaiter::new(&clock)
        .with_deadline(TEST_DEADLINE)
        .wait(slot)
}

#[test]
fn copy_moves_a_random_payload() {
    let afu = SimAfu::new();
    let mut ctx = running_context(&afu, 8 * CACHE_LINE_SIZE, false);

    let (src, payload) = random_region(1024);
    let dst = DeviceRegion::new_zeroed(1024, CACHE_LINE_SIZE).unwrap();

    let slot = ctx
        .submit(&WorkElement::copy(src.base_addr(), dst.base_addr(), 1024))
        .unwrap();
    assert_eq!(wait_complete(&slot).unwrap(), CompletionEvent::Complete);

    let mut copied = vec![0u8; 1024];
    dst.read_bytes(0, &mut copied);
    assert_eq!(copied, payload);
    ctx.terminate().unwrap();
}

#[test]
fn increment_bumps_a_shared_counter() {
    let afu = SimAfu::new();
    let mut ctx = running_context(&afu, CACHE_LINE_SIZE, false);

    let counters = DeviceRegion::new_zeroed(CACHE_LINE_SIZE, CACHE_LINE_SIZE).unwrap();
    counters.write_u32_be(0, 41);

    let slot = ctx
        .submit(&WorkElement::increment(
            counters.base_addr(),
            counters.base_addr() + 64,
        ))
        .unwrap();
    assert_eq!(wait_complete(&slot).unwrap(), CompletionEvent::Complete);
    assert_eq!(counters.read_u32_be(64), 42);
    ctx.terminate().unwrap();
}

#[test]
fn queue_survives_many_wrap_generations() {
    let afu = SimAfu::new();
    // Four slots per line, so sixteen submissions traverse the ring
    // four times.
    let mut ctx = running_context(&afu, CACHE_LINE_SIZE, false);

    let (src, payload) = random_region(256);
    let dst = DeviceRegion::new_zeroed(256, CACHE_LINE_SIZE).unwrap();

    for round in 0..16u64 {
        let offset = (round % 4) * 64;
        let slot = ctx
            .submit(&WorkElement::copy(
                src.base_addr() + offset,
                dst.base_addr() + offset,
                64,
            ))
            .unwrap();
        assert_eq!(wait_complete(&slot).unwrap(), CompletionEvent::Complete);
    }

    let mut copied = vec![0u8; 256];
    dst.read_bytes(0, &mut copied);
    assert_eq!(copied, payload);
}

#[test]
fn producers_share_one_context_under_a_lock() {
    let afu = SimAfu::new();
    let ctx = Arc::new(Mutex::new(running_context(&afu, 8 * CACHE_LINE_SIZE, false)));

    thread::scope(|scope| {
        for _ in 0..4 {
            let ctx = Arc::clone(&ctx);
            scope.spawn(move || {
                for _ in 0..8 {
                    let (src, payload) = random_region(512);
                    let dst = DeviceRegion::new_zeroed(512, CACHE_LINE_SIZE).unwrap();

                    // Enqueue under the lock, wait outside it.
                    let slot = ctx
                        .lock()
                        .unwrap()
                        .submit(&WorkElement::copy(src.base_addr(), dst.base_addr(), 512))
                        .unwrap();
                    assert_eq!(wait_complete(&slot).unwrap(), CompletionEvent::Complete);

                    let mut copied = vec![0u8; 512];
                    dst.read_bytes(0, &mut copied);
                    assert_eq!(copied, payload);
                }
            });
        }
    });
}

#[test]
fn unactivated_slot_times_out() {
    let afu = SimAfu::new();
    let mut ctx = running_context(&afu, CACHE_LINE_SIZE, false);

    let (src, _) = random_region(64);
    let dst = DeviceRegion::new_zeroed(64, CACHE_LINE_SIZE).unwrap();
    let slot = ctx
        .stage(&WorkElement::copy(src.base_addr(), dst.base_addr(), 64))
        .unwrap();

    let clock = StdTimebase::new();
    let result = CompletionWaiter::new(&clock)
        .with_deadline(Duration::from_millis(20))
        .wait(&slot);
    assert_eq!(result, Err(McpError::Timeout));

    // Activation after the abandoned wait still completes the element.
    slot.activate();
    ctx.kick().unwrap();
    assert_eq!(wait_complete(&slot).unwrap(), CompletionEvent::Complete);
}

#[test]
fn stop_mode_halts_when_idle_and_resumes_on_submit() {
    let afu = SimAfu::new();
    let mut master = MasterContext::new(afu.open_master());
    master.start().unwrap();
    master.set_stop_on_invalid(true).unwrap();

    let mut ctx = running_context(&afu, CACHE_LINE_SIZE, true);
    let clock = StdTimebase::new();

    // Idle queue: the engine must latch the stopped bit on its own.
    assert!(wait_for_condition(
        &clock,
        TEST_DEADLINE,
        Duration::from_micros(50),
        || ctx.stopped().unwrap(),
    ));

    // Each submission restarts the halted engine.
    let (src, payload) = random_region(128);
    let dst = DeviceRegion::new_zeroed(128, CACHE_LINE_SIZE).unwrap();
    for _ in 0..3 {
        let slot = ctx
            .submit(&WorkElement::copy(src.base_addr(), dst.base_addr(), 128))
            .unwrap();
        assert_eq!(wait_complete(&slot).unwrap(), CompletionEvent::Complete);
    }

    let mut copied = vec![0u8; 128];
    dst.read_bytes(0, &mut copied);
    assert_eq!(copied, payload);

    master.set_stop_on_invalid(false).unwrap();
    master.terminate().unwrap();
}

#[test]
fn undefined_opcode_faults_without_killing_the_queue() {
    let afu = SimAfu::new();
    let mut ctx = running_context(&afu, CACHE_LINE_SIZE, false);

    let (src, _) = random_region(64);
    let dst = DeviceRegion::new_zeroed(64, CACHE_LINE_SIZE).unwrap();

    let mut bogus = WorkElement::copy(src.base_addr(), dst.base_addr(), 64);
    bogus.cmd = 0x3f;
    let slot = ctx.submit(&bogus).unwrap();
    match wait_complete(&slot).unwrap() {
        CompletionEvent::Fault(set) => {
            assert!(set.contains(FaultKind::UndefinedCommand));
        }
        other => panic!("expected undefined-command fault, got {other:?}"),
    }

    // The next well-formed element still completes.
    let slot = ctx
        .submit(&WorkElement::copy(src.base_addr(), dst.base_addr(), 64))
        .unwrap();
    assert_eq!(wait_complete(&slot).unwrap(), CompletionEvent::Complete);
}

#[test]
fn stop_mode_recovers_from_an_undefined_opcode() {
    let afu = SimAfu::new();
    let mut master = MasterContext::new(afu.open_master());
    master.start().unwrap();
    master.set_stop_on_invalid(true).unwrap();

    let mut ctx = running_context(&afu, CACHE_LINE_SIZE, true);
    let clock = StdTimebase::new();

    let (src, payload) = random_region(64);
    let dst = DeviceRegion::new_zeroed(64, CACHE_LINE_SIZE).unwrap();

    // An element with an opcode the engine does not decode.
    let mut bogus = WorkElement::copy(src.base_addr(), dst.base_addr(), 64);
    bogus.cmd = 0x3f;
    let slot = ctx.submit(&bogus).unwrap();
    match wait_complete(&slot).unwrap() {
        CompletionEvent::Fault(set) => {
            assert!(set.contains(FaultKind::UndefinedCommand));
        }
        other => panic!("expected undefined-command fault, got {other:?}"),
    }

    // With no further work published, the stopped bit must latch.
    assert!(wait_for_condition(
        &clock,
        TEST_DEADLINE,
        Duration::from_micros(50),
        || ctx.stopped().unwrap(),
    ));

    // Restart returns the context to a submittable state.
    ctx.restart().unwrap();
    let slot = ctx
        .submit(&WorkElement::copy(src.base_addr(), dst.base_addr(), 64))
        .unwrap();
    assert_eq!(wait_complete(&slot).unwrap(), CompletionEvent::Complete);

    let mut copied = vec![0u8; 64];
    dst.read_bytes(0, &mut copied);
    assert_eq!(copied, payload[..64]);

    master.set_stop_on_invalid(false).unwrap();
    master.terminate().unwrap();
}

#[test]
fn chained_interrupt_signals_completion() {
    let afu = SimAfu::new();
    let mut ctx = running_context(&afu, 2 * CACHE_LINE_SIZE, false);
    let clock = StdTimebase::new();

    let (src, payload) = random_region(1024);
    let dst = DeviceRegion::new_zeroed(1024, CACHE_LINE_SIZE).unwrap();

    let slot = ctx
        .submit_with_interrupt(
            &WorkElement::copy(src.base_addr(), dst.base_addr(), 1024),
            1,
        )
        .unwrap();
    let report = ctx
        .wait_interrupt(&slot, 1, &clock, DEFAULT_INTERRUPT_TIMEOUT, TEST_DEADLINE)
        .unwrap();
    assert_eq!(report.completion, CompletionEvent::Complete);
    assert!(report.interrupt_seen);

    let mut copied = vec![0u8; 1024];
    dst.read_bytes(0, &mut copied);
    assert_eq!(copied, payload);

    // The restart in the interrupt acknowledgement left the engine
    // running for plain submissions.
    let slot = ctx
        .submit(&WorkElement::copy(src.base_addr(), dst.base_addr(), 64))
        .unwrap();
    assert_eq!(wait_complete(&slot).unwrap(), CompletionEvent::Complete);
}

#[test]
fn invalid_interrupt_source_is_reported() {
    let afu = SimAfu::new();
    let mut ctx = running_context(&afu, CACHE_LINE_SIZE, false);
    let clock = StdTimebase::new();

    let (src, _) = random_region(64);
    let dst = DeviceRegion::new_zeroed(64, CACHE_LINE_SIZE).unwrap();

    let bad_source = mcp_hw::IRQ_SOURCE_MAX + 1;
    let slot = ctx
        .submit_with_interrupt(
            &WorkElement::copy(src.base_addr(), dst.base_addr(), 64),
            bad_source,
        )
        .unwrap();

    // No event is delivered; the halt acknowledgement and the status
    // poll still recover the fault.
    let report = ctx
        .wait_interrupt(
            &slot,
            bad_source,
            &clock,
            Duration::from_millis(20),
            TEST_DEADLINE,
        )
        .unwrap();
    assert!(!report.interrupt_seen);
    // The copy itself completed; the fault sits on the interrupt
    // element behind it.
    assert_eq!(report.completion, CompletionEvent::Complete);
}

#[test]
fn mismatched_process_handle_aborts_setup() {
    let afu = SimAfu::new();
    let queue = WorkQueue::new(CACHE_LINE_SIZE).unwrap();
    let mut device = afu.open_context();
    device.inject_process_handle(regs::PROCESS_HANDLE_DEAD);

    let mut ctx = ContextHandle::new(device, queue, FlowController::new(false));
    match ctx.start().unwrap_err() {
        McpError::ProcessHandleMismatch { found, .. } => {
            assert_eq!(found, regs::PROCESS_HANDLE_DEAD);
        }
        other => panic!("expected process handle mismatch, got {other:?}"),
    }
    assert!(ctx.submit(&WorkElement::copy(1, 1, 8)).is_err());
}

#[test]
fn timebase_sync_reads_advancing_ticks() {
    let afu = SimAfu::new();
    let mut ctx = running_context(&afu, CACHE_LINE_SIZE, false);
    let clock = StdTimebase::new();

    let first = ctx.sync_timebase(&clock, TEST_DEADLINE).unwrap();
    assert!(first > 0);
    clock.pause(Duration::from_millis(1));
    let second = ctx.sync_timebase(&clock, TEST_DEADLINE).unwrap();
    assert!(second > first);
}

#[test]
fn compare_and_swap_guards_the_store() {
    let afu = SimAfu::new();
    let mut ctx = running_context(&afu, CACHE_LINE_SIZE, false);

    let word = DeviceRegion::new_zeroed(CACHE_LINE_SIZE, CACHE_LINE_SIZE).unwrap();
    word.write_bytes(0, &7u64.to_be_bytes());

    // Matching comparand: swapped.
    let slot = ctx
        .submit(&WorkElement::atomic_cas(word.base_addr(), 7, 11, true))
        .unwrap();
    assert_eq!(wait_complete(&slot).unwrap(), CompletionEvent::Complete);
    let mut raw = [0u8; 8];
    word.read_bytes(0, &mut raw);
    assert_eq!(u64::from_be_bytes(raw), 11);

    // Stale comparand: rejected with the CAS-invalid response.
    let slot = ctx
        .submit(&WorkElement::atomic_cas(word.base_addr(), 7, 99, true))
        .unwrap();
    match wait_complete(&slot).unwrap() {
        CompletionEvent::Fault(set) => assert!(set.contains(FaultKind::UndefinedCommand)),
        other => panic!("expected CAS-invalid fault, got {other:?}"),
    }
    word.read_bytes(0, &mut raw);
    assert_eq!(u64::from_be_bytes(raw), 11);
}
