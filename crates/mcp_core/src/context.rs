//! Per-context lifecycle driver and the device-layer seam.
//!
//! Obtaining a context handle from the device layer, attaching the work
//! element descriptor, mapping the register window, and validating the
//! process handle must happen in a fixed order before the queue can be
//! used. The `ContextHandle` enforces that order; the `AfuContext` trait
//! is the narrow surface the platform's device layer (character devices
//! and ioctls on real hardware, a software model in tests) implements
//! underneath it.

use core::time::Duration;

use mcp_common::regs::{
    CFG_STOP_ON_INVALID_CMD, MASTER_REG_CFG, PROCESS_HANDLE_DEAD, PROCESS_HANDLE_INVALID,
    PS_PCTRL_RESTART, PS_REG_PCTRL, PS_REG_PH, PS_REG_STATUS, PS_REG_TB, PS_STATUS_STOPPED,
    process_handle_field,
};
use mcp_common::wire::{CompletionEvent, WorkElement};

use crate::McpError;
use crate::flow::FlowController;
use crate::queue::{StagedElement, WorkQueue};
use crate::waiter::{CompletionWaiter, DEFAULT_POLL_INTERVAL, Timebase, wait_for_condition};

/// Device-layer operations one attached accelerator context provides.
///
/// Implementations own the underlying handle (file descriptor, mapped
/// window, simulator state) and report failures through `McpError`.
/// Everything above this trait is platform-independent.
pub trait AfuContext {
    /// The process handle the attach call assigned to this context.
    fn process_element(&self) -> Result<u64, McpError>;

    /// Attaches a work element descriptor and starts the context.
    ///
    /// Master contexts attach without a queue and pass zero. Fails with
    /// `AttachmentRejected` if the hardware refuses the descriptor.
    fn attach(&mut self, wed: u64) -> Result<(), McpError>;

    /// Maps the context's problem-state register window.
    fn map_registers(&mut self) -> Result<(), McpError>;

    /// Reads a 64-bit register at a byte offset within the window.
    fn read_register(&self, offset: usize) -> Result<u64, McpError>;

    /// Writes a 64-bit register at a byte offset within the window.
    fn write_register(&mut self, offset: usize, value: u64) -> Result<(), McpError>;

    /// Waits for an interrupt from the given source number.
    ///
    /// # Returns
    ///
    /// `Ok(true)` when the event arrived, `Ok(false)` when the wait timed
    /// out. A timeout here is not fatal: event delivery can race with
    /// completion, so callers fall back to reading status directly.
    fn wait_for_interrupt(&mut self, source: u16, timeout: Duration) -> Result<bool, McpError>;

    /// Releases the context: unmap, detach, free.
    fn detach(&mut self) -> Result<(), McpError>;
}

/// Lifecycle position of an attached context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Handle obtained, queue not yet attached.
    Attached,

    /// Descriptor attached and register window mapped, process handle
    /// not yet validated.
    Mapped,

    /// Validated and consuming the queue.
    Running,

    /// Halted by the hardware; waiting for a restart write.
    Stopped,

    /// Torn down; no further operations are possible.
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Attached,
    Mapped,
    Running,
    Terminated,
}

/// Outcome of one interrupt-driven completion wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptReport {
    /// Terminal status decoded from the element.
    pub completion: CompletionEvent,

    /// Whether the interrupt event itself was delivered. False means the
    /// event wait timed out and completion was recovered from the status
    /// byte directly.
    pub interrupt_seen: bool,
}

/// One attached accelerator context and the queue it owns.
///
/// Drives the `Attached → Mapped → Running` setup sequence, submissions
/// with the flow-control handshake, interrupt-driven waits, and teardown.
/// The handle owns its queue exclusively; sharing a context between
/// producers means sharing the whole handle behind one lock, which is
/// also what serializes restart writes against concurrent enqueues.
pub struct ContextHandle<C: AfuContext> {
    ctx: C,
    queue: WorkQueue,
    flow: FlowController,
    phase: Phase,
    process_element: u64,
}

impl<C: AfuContext> ContextHandle<C> {
    /// Wraps an already-opened device context and the queue it will
    /// consume. The handle starts in the attached state; call `start`
    /// before submitting.
    pub fn new(ctx: C, queue: WorkQueue, flow: FlowController) -> Self {
        Self {
            ctx,
            queue,
            flow,
            phase: Phase::Attached,
            process_element: 0,
        }
    }

    /// Runs the setup sequence: attach the descriptor, map the register
    /// window, validate the process handle.
    ///
    /// A mismatched process handle, or the dead/all-ones sentinel, is
    /// fatal for this context: the error is returned once and the context
    /// stays unusable; setup is never silently retried.
    pub fn start(&mut self) -> Result<(), McpError> {
        if self.phase != Phase::Attached {
            return Err(McpError::InvalidLifecycle);
        }

        self.ctx.attach(self.queue.wed())?;
        self.ctx.map_registers()?;
        self.phase = Phase::Mapped;

        let expected = self.ctx.process_element()?;
        let found = process_handle_field(self.ctx.read_register(PS_REG_PH)?);
        if found == PROCESS_HANDLE_DEAD || found == PROCESS_HANDLE_INVALID || found != expected {
            return Err(McpError::ProcessHandleMismatch { expected, found });
        }

        self.process_element = expected;
        self.phase = Phase::Running;
        Ok(())
    }

    /// The validated process handle. Zero before `start` succeeds.
    pub fn process_element(&self) -> u64 {
        self.process_element
    }

    /// The flow controller configured for this context.
    pub fn flow(&self) -> &FlowController {
        &self.flow
    }

    /// Queue capacity in elements.
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// The underlying device context.
    pub fn device(&self) -> &C {
        &self.ctx
    }

    /// The current lifecycle state, folding in the hardware's stopped
    /// bit when the context is otherwise running.
    pub fn state(&self) -> Result<ContextState, McpError> {
        Ok(match self.phase {
            Phase::Attached => ContextState::Attached,
            Phase::Mapped => ContextState::Mapped,
            Phase::Terminated => ContextState::Terminated,
            Phase::Running => {
                if self.stopped()? {
                    ContextState::Stopped
                } else {
                    ContextState::Running
                }
            }
        })
    }

    fn require_running(&self) -> Result<(), McpError> {
        if self.phase == Phase::Running {
            Ok(())
        } else {
            Err(McpError::InvalidLifecycle)
        }
    }

    /// Queues an element without activating it.
    ///
    /// Used for staged submissions where the caller inserts further
    /// elements before releasing the first; plain submissions should use
    /// `submit`. The caller must eventually activate the returned slot
    /// and call `kick`, or the hardware will never consume it.
    pub fn stage(&mut self, we: &WorkElement) -> Result<StagedElement, McpError> {
        self.require_running()?;
        Ok(self.queue.enqueue(we))
    }

    /// Performs the post-enqueue flow-control handshake (a restart write
    /// when stop mode is active).
    pub fn kick(&mut self) -> Result<(), McpError> {
        self.require_running()?;
        self.flow.resume_after_enqueue(&mut self.ctx)
    }

    /// Queues an element, activates it, and kicks the engine.
    ///
    /// # Returns
    ///
    /// The slot handle to wait on.
    pub fn submit(&mut self, we: &WorkElement) -> Result<StagedElement, McpError> {
        self.require_running()?;
        let slot = self.queue.enqueue(we);
        slot.activate();
        self.flow.resume_after_enqueue(&mut self.ctx)?;
        Ok(slot)
    }

    /// Queues an element chained with an interrupt-raise element, then
    /// activates the pair and kicks the engine.
    ///
    /// The interrupt element is queued behind the payload element already
    /// valid; activating the payload releases both, so the hardware
    /// raises the interrupt only after it has consumed the payload slot.
    ///
    /// # Arguments
    ///
    /// * `we` - The payload element, built unvalidated
    /// * `irq_source` - Interrupt source number to raise afterwards
    pub fn submit_with_interrupt(
        &mut self,
        we: &WorkElement,
        irq_source: u16,
    ) -> Result<StagedElement, McpError> {
        self.require_running()?;
        let slot = self.queue.enqueue(we);
        self.queue.enqueue(&WorkElement::raise_interrupt(irq_source));
        slot.activate();
        self.flow.resume_after_enqueue(&mut self.ctx)?;
        Ok(slot)
    }

    /// Waits for an interrupt-signalled completion.
    ///
    /// Waits on the event channel for `irq_timeout`; on timeout the wait
    /// still proceeds, since the hardware may have completed while event
    /// delivery raced. The engine halts after raising an interrupt, so
    /// the stopped bit is acknowledged and the engine restarted before
    /// the status byte is polled to its terminal value.
    ///
    /// # Arguments
    ///
    /// * `slot` - Slot handle returned by the submission
    /// * `irq_source` - Source number the chained interrupt element used
    /// * `timebase` - Clock for the waits
    /// * `irq_timeout` - Deadline for the event wait (short)
    /// * `completion_deadline` - Deadline for the status byte
    pub fn wait_interrupt<T: Timebase>(
        &mut self,
        slot: &StagedElement,
        irq_source: u16,
        timebase: &T,
        irq_timeout: Duration,
        completion_deadline: Duration,
    ) -> Result<InterruptReport, McpError> {
        self.require_running()?;

        let interrupt_seen = self.ctx.wait_for_interrupt(irq_source, irq_timeout)?;
        self.flow
            .acknowledge_halt(&mut self.ctx, timebase, completion_deadline)?;

        let completion = CompletionWaiter::new(timebase)
            .with_deadline(completion_deadline)
            .wait(slot)?;
        Ok(InterruptReport {
            completion,
            interrupt_seen,
        })
    }

    /// True when the status register reports the engine halted.
    pub fn stopped(&self) -> Result<bool, McpError> {
        Ok(self.ctx.read_register(PS_REG_STATUS)? & PS_STATUS_STOPPED != 0)
    }

    /// Writes the restart bit. Only meaningful once the stopped bit has
    /// been observed; a restart of a running engine is ignored by the
    /// hardware.
    pub fn restart(&mut self) -> Result<(), McpError> {
        self.require_running()?;
        self.ctx.write_register(PS_REG_PCTRL, PS_PCTRL_RESTART)
    }

    /// Requests a timebase update and reads the latched tick count.
    ///
    /// Writes zero to the timebase register, then polls it until the
    /// hardware publishes a nonzero value.
    ///
    /// # Returns
    ///
    /// The accelerator's tick count, or `Timeout` if it never appeared.
    pub fn sync_timebase<T: Timebase>(
        &mut self,
        timebase: &T,
        deadline: Duration,
    ) -> Result<u64, McpError> {
        self.require_running()?;
        self.ctx.write_register(PS_REG_TB, 0)?;

        let mut latched = 0u64;
        let mut read_err = None;
        let ctx = &self.ctx;
        let ok = wait_for_condition(timebase, deadline, DEFAULT_POLL_INTERVAL, || {
            match ctx.read_register(PS_REG_TB) {
                Ok(0) => false,
                Ok(ticks) => {
                    latched = ticks;
                    true
                }
                Err(e) => {
                    read_err = Some(e);
                    true
                }
            }
        });
        if let Some(e) = read_err {
            return Err(e);
        }
        if !ok {
            return Err(McpError::Timeout);
        }
        Ok(latched)
    }

    /// Tears the context down from any state: the device layer unmaps
    /// and detaches, and the handle becomes terminated. Idempotent.
    pub fn terminate(&mut self) -> Result<(), McpError> {
        if self.phase != Phase::Terminated {
            self.ctx.detach()?;
            self.phase = Phase::Terminated;
        }
        Ok(())
    }
}

/// The master context's configuration surface.
///
/// The master attaches without a work queue and exposes the
/// accelerator-wide configuration registers. Stop-on-invalid-command is
/// configured here once at setup, independent of any individual queue.
pub struct MasterContext<C: AfuContext> {
    ctx: C,
    mapped: bool,
}

impl<C: AfuContext> MasterContext<C> {
    /// Wraps an opened master device context.
    pub fn new(ctx: C) -> Self {
        Self { ctx, mapped: false }
    }

    /// Attaches (with no descriptor) and maps the master register
    /// window.
    pub fn start(&mut self) -> Result<(), McpError> {
        if self.mapped {
            return Err(McpError::InvalidLifecycle);
        }
        self.ctx.attach(0)?;
        self.ctx.map_registers()?;
        self.mapped = true;
        Ok(())
    }

    /// Sets or clears stop-on-invalid-command in the configuration
    /// register with a read-modify-write.
    ///
    /// # Returns
    ///
    /// The configuration value written back, for diagnostic reporting.
    pub fn set_stop_on_invalid(&mut self, enable: bool) -> Result<u64, McpError> {
        if !self.mapped {
            return Err(McpError::InvalidLifecycle);
        }
        let mut cfg = self.ctx.read_register(MASTER_REG_CFG)?;
        if enable {
            cfg |= CFG_STOP_ON_INVALID_CMD;
        } else {
            cfg &= !CFG_STOP_ON_INVALID_CMD;
        }
        self.ctx.write_register(MASTER_REG_CFG, cfg)?;
        Ok(cfg)
    }

    /// Releases the master context.
    pub fn terminate(&mut self) -> Result<(), McpError> {
        if self.mapped {
            self.ctx.detach()?;
            self.mapped = false;
        }
        Ok(())
    }
}
