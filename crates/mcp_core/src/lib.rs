//! Core work-queue protocol for the memcpy accelerator.
//!
//! This crate implements the software half of the accelerator protocol: a
//! fixed-capacity command ring in hardware-shared memory, the per-context
//! attach/map/validate lifecycle, completion waiting by status polling or
//! interrupt, and the stop/restart flow-control handshake. All modules are
//! usable without the standard library; platform concerns (clocks, the
//! device layer, threads) enter through the `Timebase` and `AfuContext`
//! traits.

#![no_std]

extern crate alloc;

/// Per-context lifecycle driver and the device-layer seam.
///
/// Defines the `AfuContext` trait the platform implements (attach, register
/// window access, interrupt waits) and the `ContextHandle` state machine
/// that takes an attached context through mapping, process-handle
/// validation, submission, and teardown. Also hosts the master-context
/// configuration surface.
pub mod context;

/// Stop-on-invalid-command flow control.
///
/// Implements the restart-after-enqueue and acknowledge-halt-then-restart
/// sequences required when the accelerator is configured to halt rather
/// than poll for new work.
pub mod flow;

/// Work-element ring buffer in hardware-shared memory.
///
/// Owns the enqueue cursor and wrap-generation state and performs the
/// ordered two-phase publish: data fields, store fence, command byte,
/// with activation of the valid bit as a separate caller-driven step.
pub mod queue;

/// Hardware-shared device memory regions.
///
/// Page-aligned allocations that expose only bounds-checked volatile
/// access and explicit publish/complete fences, so hardware-visible
/// buffers are never handled as plain slices by application code.
pub mod region;

/// Completion observation and poll-loop plumbing.
///
/// Provides the `Timebase` abstraction over platform clocks, the shared
/// `wait_for_condition` poll loop, and the `CompletionWaiter` that watches
/// a queued element's status byte against a deadline.
pub mod waiter;

use core::fmt;

use mcp_common::wire::FaultSet;

/// Error types returned by work-queue and context operations.
///
/// Hardware-reported faults are carried as a decoded fault set so that
/// every signalled fault bit reaches the caller; the remaining variants
/// are software-detected conditions. None of these are retried
/// internally; retry policy belongs to the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpError {
    /// A hardware-shared memory allocation could not be satisfied.
    AllocationFailure,

    /// The hardware rejected the work element descriptor or the queue
    /// geometry behind it (misaligned base, zero or oversized depth).
    AttachmentRejected,

    /// The process handle read back from the register window does not
    /// match the handle obtained at attach time, or is a dead/all-ones
    /// sentinel. Fatal for the context; setup must not be retried.
    ProcessHandleMismatch {
        /// Handle reported by the attach call.
        expected: u64,
        /// Handle field read from the register window.
        found: u64,
    },

    /// A deadline elapsed with no status or register change observed.
    /// Software-detected; the hardware reported no fault and may still
    /// complete the operation later.
    Timeout,

    /// The hardware reported one or more fault bits in a status byte or
    /// the interrupt path.
    Fault(FaultSet),

    /// An operation was issued in a lifecycle state that does not permit
    /// it, such as submitting before the context is running.
    InvalidLifecycle,
}

impl fmt::Display for McpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpError::AllocationFailure => f.write_str("device memory allocation failed"),
            McpError::AttachmentRejected => {
                f.write_str("work element descriptor rejected by the hardware")
            }
            McpError::ProcessHandleMismatch { expected, found } => write!(
                f,
                "process handle mismatch: attach reported {expected:#x}, register window reports {found:#x}"
            ),
            McpError::Timeout => f.write_str("timed out waiting for the accelerator"),
            McpError::Fault(set) => write!(f, "hardware fault: {set}"),
            McpError::InvalidLifecycle => {
                f.write_str("operation not permitted in the current context state")
            }
        }
    }
}

impl core::error::Error for McpError {}
