//! The modelled device layer: contexts, register windows, interrupts.
//!
//! `SimAfu` stands in for one accelerator card. Opening a context hands
//! out a `SimContext` implementing the device-layer trait; attaching a
//! work element descriptor spawns that context's engine thread. The
//! master context attaches without a descriptor and exposes the
//! accelerator-wide configuration register, which the engines consult
//! when deciding whether an empty slot means halt or keep polling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mcp_common::regs::{
    CFG_STOP_ON_INVALID_CMD, MASTER_REG_CFG, PS_PCTRL_RESTART, PS_REG_PCTRL, PS_REG_PH,
    PS_REG_STATUS, PS_REG_TB, PS_REG_WED, wed_base, wed_depth_lines,
};
use mcp_core::McpError;
use mcp_core::context::AfuContext;

use crate::engine::{self, EngineRegs};

/// Highest interrupt source number a context may raise. Source zero is
/// reserved; elements naming zero or anything above this fault with the
/// invalid-source status bit.
pub const IRQ_SOURCE_MAX: u16 = 4;

/// Pending interrupt counts keyed by context handle and source number.
struct IrqHub {
    pending: Mutex<HashMap<(u64, u16), u32>>,
    delivered: Condvar,
}

impl IrqHub {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            delivered: Condvar::new(),
        }
    }

    fn raise(&self, handle: u64, source: u16) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending.entry((handle, source)).or_insert(0) += 1;
        self.delivered.notify_all();
    }

    /// Blocks until an interrupt for the key is pending or the timeout
    /// elapses, consuming one event on success.
    fn wait(&self, handle: u64, source: u16, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(count) = pending.get_mut(&(handle, source)) {
                if *count > 0 {
                    *count -= 1;
                    return true;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .delivered
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            pending = guard;
        }
    }
}

/// State shared by every context of one modelled card.
pub(crate) struct SimShared {
    config: AtomicU64,
    next_handle: AtomicU64,
    irq: IrqHub,
    start: Instant,
}

impl SimShared {
    /// True when the configuration register says to halt on an empty
    /// slot instead of polling.
    pub(crate) fn stop_on_invalid(&self) -> bool {
        self.config.load(Ordering::SeqCst) & CFG_STOP_ON_INVALID_CMD != 0
    }

    pub(crate) fn raise_irq(&self, handle: u64, source: u16) {
        self.irq.raise(handle, source);
    }

    /// Current timebase tick count, never zero.
    fn ticks(&self) -> u64 {
        (self.start.elapsed().as_nanos() as u64).max(1)
    }
}

/// One modelled accelerator card.
///
/// Cheap to clone via the handles it gives out; dropping the `SimAfu`
/// itself does not tear down open contexts.
pub struct SimAfu {
    shared: Arc<SimShared>,
}

impl SimAfu {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SimShared {
                config: AtomicU64::new(0),
                // Handle zero is never assigned; it reads as absent.
                next_handle: AtomicU64::new(1),
                irq: IrqHub::new(),
                start: Instant::now(),
            }),
        }
    }

    fn open(&self, is_master: bool) -> SimContext {
        SimContext {
            shared: Arc::clone(&self.shared),
            regs: Arc::new(EngineRegs::new()),
            handle: self.shared.next_handle.fetch_add(1, Ordering::SeqCst),
            is_master,
            mapped: false,
            attached: false,
            wed: 0,
            ph_field: None,
            tb: 0,
            engine: None,
        }
    }

    /// Opens a per-process context ready to attach a work queue.
    pub fn open_context(&self) -> SimContext {
        self.open(false)
    }

    /// Opens the master context exposing the configuration registers.
    pub fn open_master(&self) -> SimContext {
        self.open(true)
    }
}

impl Default for SimAfu {
    fn default() -> Self {
        Self::new()
    }
}

/// One opened context of a modelled card.
///
/// Implements the device-layer trait the protocol core drives. The
/// engine thread is spawned on attach and joined on detach or drop.
pub struct SimContext {
    shared: Arc<SimShared>,
    regs: Arc<EngineRegs>,
    handle: u64,
    is_master: bool,
    mapped: bool,
    attached: bool,
    wed: u64,
    ph_field: Option<u64>,
    tb: u64,
    engine: Option<JoinHandle<()>>,
}

impl SimContext {
    /// Overrides the process-handle field the register window reports.
    ///
    /// Test hook for exercising the setup validation paths with the
    /// dead/invalid sentinels or a mismatched handle.
    pub fn inject_process_handle(&mut self, field: u64) {
        self.ph_field = Some(field);
    }

    fn reported_handle(&self) -> u64 {
        self.ph_field.unwrap_or(self.handle)
    }

    fn require_mapped(&self) -> Result<(), McpError> {
        if self.mapped {
            Ok(())
        } else {
            Err(McpError::InvalidLifecycle)
        }
    }

    fn shut_down_engine(&mut self) {
        if let Some(engine) = self.engine.take() {
            self.regs.request_shutdown();
            let _ = engine.join();
        }
    }
}

impl AfuContext for SimContext {
    fn process_element(&self) -> Result<u64, McpError> {
        Ok(self.handle)
    }

    fn attach(&mut self, wed: u64) -> Result<(), McpError> {
        if self.attached {
            return Err(McpError::InvalidLifecycle);
        }

        if !self.is_master {
            // The card refuses descriptors it cannot walk: a missing
            // base or a zero depth. The descriptor encoding already
            // forces page alignment and caps the depth.
            if wed_base(wed) == 0 || wed_depth_lines(wed) == 0 {
                return Err(McpError::AttachmentRejected);
            }

            let regs = Arc::clone(&self.regs);
            let shared = Arc::clone(&self.shared);
            let handle = self.handle;
            self.engine = Some(thread::spawn(move || {
                engine::run(wed, handle, &regs, &shared);
            }));
        }

        self.wed = wed;
        self.attached = true;
        Ok(())
    }

    fn map_registers(&mut self) -> Result<(), McpError> {
        if !self.attached {
            return Err(McpError::InvalidLifecycle);
        }
        self.mapped = true;
        Ok(())
    }

    fn read_register(&self, offset: usize) -> Result<u64, McpError> {
        self.require_mapped()?;
        if self.is_master {
            return Ok(match offset {
                MASTER_REG_CFG => self.shared.config.load(Ordering::SeqCst),
                _ => 0,
            });
        }
        Ok(match offset {
            PS_REG_WED => self.wed,
            PS_REG_PH => self.reported_handle() << 48,
            PS_REG_STATUS => self.regs.status(),
            PS_REG_TB => self.tb,
            _ => 0,
        })
    }

    fn write_register(&mut self, offset: usize, value: u64) -> Result<(), McpError> {
        self.require_mapped()?;
        if self.is_master {
            if offset == MASTER_REG_CFG {
                self.shared.config.store(value, Ordering::SeqCst);
            }
            return Ok(());
        }
        match offset {
            PS_REG_PCTRL => {
                if value & PS_PCTRL_RESTART != 0 {
                    self.regs.request_restart();
                }
            }
            // A zero write requests a timebase update; the card latches
            // its tick count for the next read.
            PS_REG_TB if value == 0 => self.tb = self.shared.ticks(),
            _ => {}
        }
        Ok(())
    }

    fn wait_for_interrupt(&mut self, source: u16, timeout: Duration) -> Result<bool, McpError> {
        if !self.attached {
            return Err(McpError::InvalidLifecycle);
        }
        Ok(self.shared.irq.wait(self.handle, source, timeout))
    }

    fn detach(&mut self) -> Result<(), McpError> {
        self.shut_down_engine();
        self.mapped = false;
        self.attached = false;
        Ok(())
    }
}

impl Drop for SimContext {
    fn drop(&mut self) {
        // The engine thread reads queue memory the context does not own;
        // it must be gone before the owner can free that memory.
        self.shut_down_engine();
    }
}
