//! Completion observation and deadline-bounded poll loops.
//!
//! Some operations on the accelerator are inherently slow, so the default
//! completion deadline is generous; the interrupt wait, by contrast, is
//! short because a missed event is recovered by re-reading the status
//! directly. Both the completion waiter and the wait-for-stopped step of
//! the flow controller share a single `wait_for_condition` loop rather
//! than growing their own ad hoc spin loops.

use core::time::Duration;

use mcp_common::wire::CompletionEvent;

use crate::McpError;
use crate::queue::StagedElement;

/// Interval between successive status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(1);

/// Default deadline for a work element to reach a terminal status.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(120);

/// Default deadline for one interrupt wait.
pub const DEFAULT_INTERRUPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Monotonic time source and pause primitive supplied by the platform.
///
/// Firmware backs this with a hardware tick counter and a spin hint; a
/// hosted harness backs it with the OS monotonic clock and a sleeping
/// pause. `now` is an offset from an arbitrary origin fixed per instance.
pub trait Timebase {
    /// Time elapsed since this timebase's origin.
    fn now(&self) -> Duration;

    /// Pauses the caller for roughly `interval`.
    fn pause(&self, interval: Duration);
}

/// Polls `condition` until it holds or `deadline` elapses.
///
/// The condition is re-checked one final time after the deadline passes,
/// so a condition that became true during the last pause is not
/// misreported as a timeout.
///
/// # Arguments
///
/// * `timebase` - Clock used for the deadline and pauses
/// * `deadline` - Maximum time to keep polling
/// * `poll_interval` - Pause between checks
/// * `condition` - Predicate to wait for
///
/// # Returns
///
/// True when the condition held within the deadline.
pub fn wait_for_condition<T: Timebase + ?Sized>(
    timebase: &T,
    deadline: Duration,
    poll_interval: Duration,
    mut condition: impl FnMut() -> bool,
) -> bool {
    let limit = timebase.now().saturating_add(deadline);
    loop {
        if condition() {
            return true;
        }
        if timebase.now() >= limit {
            return condition();
        }
        timebase.pause(poll_interval);
    }
}

/// Observes a queued element's status byte until it turns terminal.
///
/// One waiter can serve many slots; it carries only the deadline and the
/// poll interval. Waiting never touches the queue's cursor state, so
/// other producers are free to enqueue concurrently.
pub struct CompletionWaiter<'t, T: Timebase> {
    timebase: &'t T,
    deadline: Duration,
    poll_interval: Duration,
}

impl<'t, T: Timebase> CompletionWaiter<'t, T> {
    /// Creates a waiter with the default deadline and poll interval.
    pub fn new(timebase: &'t T) -> Self {
        Self {
            timebase,
            deadline: DEFAULT_COMPLETION_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Replaces the completion deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Replaces the poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Busy-polls the slot's status byte until it is nonzero.
    ///
    /// # Returns
    ///
    /// The decoded completion event, or `Timeout` if the status stayed
    /// zero past the deadline. A timeout is software-detected: the
    /// hardware reported nothing and may still complete the slot later.
    pub fn wait(&self, slot: &StagedElement) -> Result<CompletionEvent, McpError> {
        if wait_for_condition(self.timebase, self.deadline, self.poll_interval, || {
            slot.status() != 0
        }) {
            slot.completion().ok_or(McpError::Timeout)
        } else {
            Err(McpError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::WorkQueue;
    use core::cell::Cell;
    use mcp_common::wire::{CACHE_LINE_SIZE, FaultKind, WorkElement};

    /// Deterministic timebase: every pause advances the clock by the
    /// requested interval.
    struct StepClock {
        now: Cell<Duration>,
    }

    impl StepClock {
        fn new() -> Self {
            Self {
                now: Cell::new(Duration::ZERO),
            }
        }
    }

    impl Timebase for StepClock {
        fn now(&self) -> Duration {
            self.now.get()
        }

        fn pause(&self, interval: Duration) {
            self.now.set(self.now.get() + interval);
        }
    }

    #[test]
    fn condition_met_before_deadline() {
        let clock = StepClock::new();
        let mut polls = 0;
        let ok = wait_for_condition(
            &clock,
            Duration::from_millis(10),
            Duration::from_millis(1),
            || {
                polls += 1;
                polls == 4
            },
        );
        assert!(ok);
        assert_eq!(polls, 4);
    }

    #[test]
    fn deadline_expiry_reports_failure() {
        let clock = StepClock::new();
        let ok = wait_for_condition(
            &clock,
            Duration::from_millis(5),
            Duration::from_millis(1),
            || false,
        );
        assert!(!ok);
        assert!(clock.now() >= Duration::from_millis(5));
    }

    #[test]
    fn final_recheck_catches_late_condition() {
        let clock = StepClock::new();
        // Becomes true exactly when the deadline is reached.
        let ok = wait_for_condition(
            &clock,
            Duration::from_millis(3),
            Duration::from_millis(1),
            || clock.now() >= Duration::from_millis(3),
        );
        assert!(ok);
    }

    #[test]
    fn waiter_times_out_on_silent_slot() {
        let clock = StepClock::new();
        let mut q = WorkQueue::new(CACHE_LINE_SIZE).unwrap();
        let slot = q.enqueue(&WorkElement::copy(0, 0, 8));

        let waiter = CompletionWaiter::new(&clock)
            .with_deadline(Duration::from_millis(2))
            .with_poll_interval(Duration::from_millis(1));
        assert_eq!(waiter.wait(&slot), Err(McpError::Timeout));
    }

    #[test]
    fn waiter_decodes_terminal_status() {
        let clock = StepClock::new();
        let mut q = WorkQueue::new(CACHE_LINE_SIZE).unwrap();
        let slot = q.enqueue(&WorkElement::copy(0, 0, 8));
        q.memory()
            .write_u8(slot.slot_offset() + 1, 0x40 | 0x02);

        let waiter = CompletionWaiter::new(&clock).with_deadline(Duration::from_millis(2));
        match waiter.wait(&slot) {
            Ok(CompletionEvent::Fault(set)) => {
                assert!(set.contains(FaultKind::TranslationFault));
                assert!(set.contains(FaultKind::ProcessTerminated));
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }
}
