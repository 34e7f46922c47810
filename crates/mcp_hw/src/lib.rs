//! Software model of the memcpy accelerator.
//!
//! Plays the hardware's role against the protocol core: each attached
//! context gets a consumer thread that walks the work-element queue the
//! way the engine does: honoring the valid and wrap-generation bits,
//! fencing between the command byte and the data fields, executing the
//! opcode, and fencing again before the status write. The model also
//! implements the register window (process handle, status, control,
//! timebase), the stop-on-invalid-command halt, the halt after every
//! raised interrupt, and per-source interrupt delivery, so the full
//! protocol can be exercised without hardware attached.

mod afu;
mod engine;
mod timebase;

pub use afu::{IRQ_SOURCE_MAX, SimAfu, SimContext};
pub use timebase::StdTimebase;
