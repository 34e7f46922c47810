//! The modelled command engine: one consumer walking one queue.
//!
//! The engine mirrors the hardware's visible ordering exactly. It reads
//! only the command byte until it sees the valid bit with the current
//! wrap generation, takes a load fence before trusting the data fields,
//! executes the opcode against host memory, and takes a store fence
//! before writing the status byte that publishes the result. Stale
//! elements from the previous wrap generation are skipped the same way
//! unpublished slots are.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use mcp_common::regs::{PS_STATUS_STOPPED, wed_base, wed_depth_lines};
use mcp_common::wire::{
    CMD_EXTRA_CAS_EQUAL_8, CMD_EXTRA_CAS_NOT_EQUAL_8, CMD_VALID, CMD_WRAP,
    ELEMENTS_PER_CACHE_LINE, Opcode, STAT_ADDRESS_ERROR, STAT_COMPLETE, STAT_INVALID_IRQ_SOURCE,
    STAT_UNDEFINED_COMMAND, WORK_ELEMENT_SIZE, WorkElement,
};

use crate::afu::{IRQ_SOURCE_MAX, SimShared};

/// Interval between command-byte polls when the engine is not halting
/// on empty slots.
const ENGINE_POLL: Duration = Duration::from_micros(1);

#[derive(Default)]
struct HaltState {
    stopped: bool,
    restart: bool,
}

/// Register state shared between one engine thread and its context's
/// register window.
///
/// The stopped bit of the status register and the restart handshake live
/// here; the context's `write_register` feeds restarts in, the engine
/// consumes them. Restart writes while the engine is running are
/// discarded, matching the control register's behavior.
pub(crate) struct EngineRegs {
    status: AtomicU64,
    halt: Mutex<HaltState>,
    resume: Condvar,
    shutdown: AtomicBool,
}

impl EngineRegs {
    pub(crate) fn new() -> Self {
        Self {
            status: AtomicU64::new(0),
            halt: Mutex::new(HaltState::default()),
            resume: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn lock_halt(&self) -> MutexGuard<'_, HaltState> {
        self.halt.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current status register value.
    pub(crate) fn status(&self) -> u64 {
        self.status.load(Ordering::SeqCst)
    }

    /// Control-register restart write. Honored only while the engine is
    /// halted; otherwise silently dropped.
    pub(crate) fn request_restart(&self) {
        let mut halt = self.lock_halt();
        if halt.stopped {
            halt.restart = true;
            self.resume.notify_all();
        }
    }

    /// Tells the engine thread to exit at its next poll or halt wakeup.
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _halt = self.lock_halt();
        self.resume.notify_all();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Latches the stopped bit. Restart writes are accepted from this
    /// point on.
    fn begin_halt(&self) {
        let mut halt = self.lock_halt();
        halt.stopped = true;
        self.status.fetch_or(PS_STATUS_STOPPED, Ordering::SeqCst);
    }

    /// Abandons a halt before waiting: the slot re-check found published
    /// work, so the engine resumes immediately. A restart that raced in
    /// is discarded along with it.
    fn cancel_halt(&self) {
        let mut halt = self.lock_halt();
        halt.stopped = false;
        halt.restart = false;
        self.status.fetch_and(!PS_STATUS_STOPPED, Ordering::SeqCst);
    }

    /// Blocks a latched halt until a restart or shutdown.
    fn wait_restart(&self) {
        let mut halt = self.lock_halt();
        while !halt.restart && !self.is_shutdown() {
            halt = self
                .resume
                .wait(halt)
                .unwrap_or_else(|e| e.into_inner());
        }
        halt.restart = false;
        halt.stopped = false;
        self.status.fetch_and(!PS_STATUS_STOPPED, Ordering::SeqCst);
    }

    /// Latches the stopped bit and blocks until a restart or shutdown.
    fn enter_halt(&self) {
        self.begin_halt();
        self.wait_restart();
    }
}

/// Result of executing one work element.
pub(crate) struct Outcome {
    /// Status byte to publish into the slot.
    pub(crate) status: u8,

    /// Whether the engine halts after publishing, as it does for every
    /// interrupt element.
    pub(crate) halt: bool,
}

unsafe fn copy_bytes(src: u64, dst: u64, len: usize) {
    let s = src as *const u8;
    let d = dst as *mut u8;
    for i in 0..len {
        unsafe { d.add(i).write_volatile(s.add(i).read_volatile()) };
    }
}

unsafe fn read_u32_be(addr: u64) -> u32 {
    let p = addr as *const u8;
    let mut raw = [0u8; 4];
    for (i, b) in raw.iter_mut().enumerate() {
        *b = unsafe { p.add(i).read_volatile() };
    }
    u32::from_be_bytes(raw)
}

unsafe fn write_u32_be(addr: u64, value: u32) {
    let p = addr as *mut u8;
    for (i, b) in value.to_be_bytes().iter().enumerate() {
        unsafe { p.add(i).write_volatile(*b) };
    }
}

unsafe fn read_u64_be(addr: u64) -> u64 {
    let p = addr as *const u8;
    let mut raw = [0u8; 8];
    for (i, b) in raw.iter_mut().enumerate() {
        *b = unsafe { p.add(i).read_volatile() };
    }
    u64::from_be_bytes(raw)
}

unsafe fn write_u64_be(addr: u64, value: u64) {
    let p = addr as *mut u8;
    for (i, b) in value.to_be_bytes().iter().enumerate() {
        unsafe { p.add(i).write_volatile(*b) };
    }
}

/// Executes one published work element against host memory.
///
/// `raise_irq` delivers a validated interrupt source to the interrupt
/// hub. The caller is responsible for the fences on either side of this
/// call and for the status write itself.
///
/// # Safety contract
///
/// Addresses in the element are dereferenced directly; submitters keep
/// the referenced buffers alive until the status byte turns terminal,
/// which the queue's slot handles guarantee for well-formed clients.
pub(crate) fn execute(we: &WorkElement, raise_irq: impl FnOnce(u16)) -> Outcome {
    match we.opcode() {
        Some(Opcode::Copy) => {
            if we.src() == 0 || we.dst() == 0 {
                return Outcome {
                    status: STAT_ADDRESS_ERROR,
                    halt: false,
                };
            }
            unsafe { copy_bytes(we.src(), we.dst(), we.length() as usize) };
            Outcome {
                status: STAT_COMPLETE,
                halt: false,
            }
        }

        Some(Opcode::RaiseInterrupt) => {
            let source = we.length();
            if source == 0 || source > IRQ_SOURCE_MAX {
                // Invalid source: fault reported, engine still halts.
                return Outcome {
                    status: STAT_COMPLETE | STAT_INVALID_IRQ_SOURCE,
                    halt: true,
                };
            }
            raise_irq(source);
            Outcome {
                status: STAT_COMPLETE,
                halt: true,
            }
        }

        Some(Opcode::Increment) => {
            if we.src() == 0 || we.dst() == 0 {
                return Outcome {
                    status: STAT_ADDRESS_ERROR,
                    halt: false,
                };
            }
            let value = unsafe { read_u32_be(we.src()) };
            unsafe { write_u32_be(we.dst(), value.wrapping_add(1)) };
            Outcome {
                status: STAT_COMPLETE,
                halt: false,
            }
        }

        Some(Opcode::AtomicCas) => {
            if we.dst() == 0 {
                return Outcome {
                    status: STAT_ADDRESS_ERROR,
                    halt: false,
                };
            }
            let current = unsafe { read_u64_be(we.dst()) };
            let store = match we.cmd_extra {
                CMD_EXTRA_CAS_EQUAL_8 => current == we.atomic_op1(),
                CMD_EXTRA_CAS_NOT_EQUAL_8 => current != we.atomic_op1(),
                _ => {
                    return Outcome {
                        status: STAT_UNDEFINED_COMMAND,
                        halt: false,
                    };
                }
            };
            if store {
                // The swap value rides in the source field.
                unsafe { write_u64_be(we.dst(), we.src()) };
                Outcome {
                    status: STAT_COMPLETE,
                    halt: false,
                }
            } else {
                Outcome {
                    status: STAT_UNDEFINED_COMMAND,
                    halt: false,
                }
            }
        }

        None => Outcome {
            status: STAT_UNDEFINED_COMMAND,
            halt: false,
        },
    }
}

/// Consumer loop for one attached context's queue.
///
/// Runs on the engine thread until shutdown. `wed` is the descriptor the
/// context attached: queue base address plus depth in cache lines.
pub(crate) fn run(wed: u64, handle: u64, regs: &EngineRegs, shared: &SimShared) {
    let base = wed_base(wed) as *mut u8;
    let depth = wed_depth_lines(wed) as usize * ELEMENTS_PER_CACHE_LINE;
    let mut cursor = 0usize;
    let mut wrap = 0u8;

    while !regs.is_shutdown() {
        let slot = unsafe { base.add(cursor * WORK_ELEMENT_SIZE) };
        let cmd = unsafe { slot.read_volatile() };

        if cmd & CMD_VALID == 0 || cmd & CMD_WRAP != wrap {
            // No published work at the cursor: halt or keep polling,
            // depending on the configuration register.
            if shared.stop_on_invalid() {
                // A producer may publish and write its restart in the
                // window before the stopped bit latches; that restart is
                // dropped. Re-checking the slot after latching closes
                // the window: any later restart write is accepted.
                regs.begin_halt();
                let cmd = unsafe { slot.read_volatile() };
                if cmd & CMD_VALID != 0 && cmd & CMD_WRAP == wrap {
                    regs.cancel_halt();
                } else {
                    regs.wait_restart();
                }
            } else {
                thread::sleep(ENGINE_POLL);
            }
            continue;
        }

        // The valid bit is the acquire point for the data fields.
        fence(Ordering::Acquire);
        let we = unsafe { (slot as *const WorkElement).read_volatile() };

        let outcome = execute(&we, |source| shared.raise_irq(handle, source));

        // Results must be visible before the status byte is.
        fence(Ordering::Release);
        unsafe { slot.add(1).write_volatile(outcome.status) };

        cursor += 1;
        if cursor == depth {
            cursor = 0;
            wrap ^= CMD_WRAP;
        }

        if outcome.halt {
            regs.enter_halt();
        }
    }
}
