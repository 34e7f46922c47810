//! Stop-on-invalid-command flow control.
//!
//! Some configurations run the accelerator with stop-on-invalid-command
//! enabled: instead of polling the ring for the next valid slot, the
//! engine halts when it finds none and must be told about new work
//! through a restart write. The controller owns the two sequences this
//! requires: a restart immediately after every enqueue, and the
//! acknowledge-then-restart handshake after the engine has latched a
//! halt. Restart writes race with other producers' enqueues, so callers
//! serialize both behind the queue lock.

use core::time::Duration;

use mcp_common::regs::{PS_PCTRL_RESTART, PS_REG_PCTRL, PS_REG_STATUS, PS_STATUS_STOPPED};

use crate::McpError;
use crate::context::AfuContext;
use crate::waiter::{DEFAULT_POLL_INTERVAL, Timebase, wait_for_condition};

/// Implements the restart handshake for stop-on-invalid-command mode.
///
/// Constructed per context with the mode the master configuration
/// selected. When the mode is off, the post-enqueue resume is a no-op;
/// the halt acknowledgement is always available because the engine also
/// halts after raising an interrupt, independent of the mode.
#[derive(Debug, Clone, Copy)]
pub struct FlowController {
    stop_mode: bool,
}

impl FlowController {
    /// Creates a controller; `stop_mode` mirrors the master
    /// configuration register's stop-on-invalid-command bit.
    pub fn new(stop_mode: bool) -> Self {
        Self { stop_mode }
    }

    /// True when stop-on-invalid-command handling is active.
    pub fn stop_mode(&self) -> bool {
        self.stop_mode
    }

    /// Restarts the engine after an enqueue so it resumes consuming the
    /// queue. No-op unless stop mode is active.
    ///
    /// Must run before the caller starts waiting for completion: a
    /// halted engine will never reach the new element otherwise.
    pub fn resume_after_enqueue<C: AfuContext>(&self, ctx: &mut C) -> Result<(), McpError> {
        if self.stop_mode {
            ctx.write_register(PS_REG_PCTRL, PS_PCTRL_RESTART)?;
        }
        Ok(())
    }

    /// Waits for the status register's stopped bit, then issues a
    /// restart.
    ///
    /// The hardware only accepts a restart once it has latched the halt,
    /// so the busy-read must precede the control write; restarting a
    /// running engine is ignored and would leave it halted later. Used
    /// after every interrupt-driven wait regardless of stop mode.
    ///
    /// # Returns
    ///
    /// `Timeout` if the stopped bit never appeared within `deadline`;
    /// otherwise the result of the restart write.
    pub fn acknowledge_halt<C: AfuContext, T: Timebase>(
        &self,
        ctx: &mut C,
        timebase: &T,
        deadline: Duration,
    ) -> Result<(), McpError> {
        let mut read_err = None;
        let stopped = wait_for_condition(timebase, deadline, DEFAULT_POLL_INTERVAL, || {
            match ctx.read_register(PS_REG_STATUS) {
                Ok(status) => status & PS_STATUS_STOPPED != 0,
                Err(e) => {
                    read_err = Some(e);
                    // Abort the poll loop; the error is surfaced below.
                    true
                }
            }
        });
        if let Some(e) = read_err {
            return Err(e);
        }
        if !stopped {
            return Err(McpError::Timeout);
        }
        ctx.write_register(PS_REG_PCTRL, PS_PCTRL_RESTART)
    }
}
