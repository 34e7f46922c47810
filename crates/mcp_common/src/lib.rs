//! Common definitions and constants shared across the memcpy accelerator system.
//!
//! This crate provides the hardware wire format for work elements, the
//! command/status bit assignments, and the memory-mapped register layout of
//! the accelerator's problem state area. These definitions are used by the
//! protocol core, the hardware model, and the host-side test harness, and
//! must match the accelerator's documented register semantics exactly.

#![no_std]

// Work-element wire format definitions.
//
// The accelerator consumes fixed-layout 32-byte command records from a
// shared-memory ring. All multi-byte fields are big-endian on the wire.
// The command byte is the publication point: the hardware must never
// observe it with the valid bit set before the remaining fields are
// visible in memory.
pub mod wire {
    /// Hardware cache-line size in bytes.
    ///
    /// The work-element queue must be sized and the copy buffers aligned in
    /// units of this value. The queue depth carried in the work-element
    /// descriptor is expressed in cache lines, not elements.
    pub const CACHE_LINE_SIZE: usize = 128;

    /// Size of one work element in bytes.
    pub const WORK_ELEMENT_SIZE: usize = 32;

    /// Number of work elements per cache line.
    pub const ELEMENTS_PER_CACHE_LINE: usize = CACHE_LINE_SIZE / WORK_ELEMENT_SIZE;

    /// Valid bit of the command byte.
    ///
    /// Setting this bit publishes the slot to the hardware. It must be the
    /// last store of an enqueue, after a store fence covering every other
    /// field of the element.
    pub const CMD_VALID: u8 = 1 << 7;

    /// Wrap-generation bit of the command byte.
    ///
    /// Toggled by the producer each time the enqueue cursor wraps from the
    /// last slot back to the base. The consumer tracks its own copy and
    /// ignores slots whose wrap bit belongs to a previous pass, so stale
    /// entries left over from the prior generation are never re-executed.
    pub const CMD_WRAP: u8 = 1 << 6;

    /// Mask selecting the 6-bit opcode field of the command byte.
    pub const CMD_OPCODE_MASK: u8 = 0x3f;

    /// Operation codes understood by the accelerator.
    ///
    /// The numeric values are fixed by the hardware command decoder. Any
    /// other value in the opcode field is reported through the
    /// undefined-command status bit.
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Opcode {
        /// Copy `length` bytes from the source address to the destination.
        Copy = 0,

        /// Raise a hardware interrupt.
        ///
        /// The `length` field is reused as the interrupt source number;
        /// the address fields are ignored. After raising the interrupt the
        /// engine halts and waits for a restart write.
        RaiseInterrupt = 1,

        /// Read a 4-byte big-endian counter at the source address and write
        /// the incremented value to the destination address.
        Increment = 4,

        /// Guarded 8-byte compare-and-swap selected by the extra command
        /// byte, with the comparand in the atomic operand field and the
        /// swap value in the source field.
        AtomicCas = 5,
    }

    impl Opcode {
        /// Decodes the opcode field of a raw command byte.
        ///
        /// Returns `None` for encodings the hardware treats as undefined
        /// commands.
        pub fn from_cmd(cmd: u8) -> Option<Self> {
            match cmd & CMD_OPCODE_MASK {
                0 => Some(Opcode::Copy),
                1 => Some(Opcode::RaiseInterrupt),
                4 => Some(Opcode::Increment),
                5 => Some(Opcode::AtomicCas),
                _ => None,
            }
        }
    }

    /// Extra-command encoding: store the swap value only when the
    /// destination word differs from the comparand.
    pub const CMD_EXTRA_CAS_NOT_EQUAL_8: u8 = 0x10;

    /// Extra-command encoding: store the swap value only when the
    /// destination word equals the comparand.
    pub const CMD_EXTRA_CAS_EQUAL_8: u8 = 0x11;

    /// Packs a command byte from a valid flag and an opcode.
    ///
    /// The wrap bit is deliberately not part of this encoding: it belongs
    /// to the queue's current generation and is merged in by the enqueue
    /// path, never by element constructors.
    pub fn pack_cmd(valid: bool, opcode: Opcode) -> u8 {
        (if valid { CMD_VALID } else { 0 }) | (opcode as u8 & CMD_OPCODE_MASK)
    }

    /// Status bit reporting successful completion.
    pub const STAT_COMPLETE: u8 = 0x80;

    /// Status bit reporting a translation fault.
    pub const STAT_TRANSLATION_FAULT: u8 = 0x40;

    /// Status bit reporting an address error.
    pub const STAT_ADDRESS_ERROR: u8 = 0x20;

    /// Status bit reporting a data error.
    pub const STAT_DATA_ERROR: u8 = 0x10;

    /// Status bit reporting a fault response from the link layer.
    pub const STAT_LINK_FAULT: u8 = 0x08;

    /// Status bit reporting an invalid interrupt source number.
    pub const STAT_INVALID_IRQ_SOURCE: u8 = 0x04;

    /// Status bit reporting that the owning process was terminated.
    pub const STAT_PROCESS_TERMINATED: u8 = 0x02;

    /// Status bit reporting an undefined command or a failed CAS guard.
    pub const STAT_UNDEFINED_COMMAND: u8 = 0x01;

    /// Mask selecting the fault bits of the status byte (everything but
    /// the completion bit).
    pub const STAT_FAULT_MASK: u8 = 0x7f;

    /// One fixed-layout command record exchanged with the hardware.
    ///
    /// The in-memory representation is exactly the 32-byte wire layout:
    /// multi-byte fields hold big-endian values regardless of host
    /// endianness, so the record can be copied verbatim into the
    /// hardware-visible queue. Use the constructors and accessors rather
    /// than touching the raw fields; they perform the byte-order
    /// conversions.
    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WorkElement {
        /// Command byte: valid bit, wrap bit, 6-bit opcode.
        pub cmd: u8,

        /// Status byte, written by the hardware. Zero while the element is
        /// in flight; terminal once any bit is set.
        pub status: u8,

        /// Transfer length in bytes (big-endian), reused as the interrupt
        /// source number for interrupt elements.
        pub length: u16,

        /// Extra command qualifier for atomic opcodes.
        pub cmd_extra: u8,

        /// Reserved, must be zero.
        pub reserved1: u8,

        /// Reserved, must be zero.
        pub reserved2: u16,

        /// First atomic operand (big-endian), the comparand for CAS.
        pub atomic_op1: u64,

        /// Source address (big-endian), reused as the second atomic
        /// operand for CAS.
        pub src: u64,

        /// Destination address (big-endian).
        pub dst: u64,
    }

    impl WorkElement {
        /// Builds an unpublished copy element.
        ///
        /// The valid bit is left clear: copy elements use the two-step
        /// publish, so the caller activates the queued slot once any
        /// dependent elements have been inserted behind it.
        pub fn copy(src: u64, dst: u64, length: u16) -> Self {
            Self {
                cmd: pack_cmd(false, Opcode::Copy),
                length: length.to_be(),
                src: src.to_be(),
                dst: dst.to_be(),
                ..Self::zeroed()
            }
        }

        /// Builds an interrupt-raise element for the given source number.
        ///
        /// The valid bit is set immediately: interrupt elements are always
        /// queued behind the element whose completion they signal, and
        /// become visible together with it when that element is activated.
        pub fn raise_interrupt(source: u16) -> Self {
            Self {
                cmd: pack_cmd(true, Opcode::RaiseInterrupt),
                length: source.to_be(),
                ..Self::zeroed()
            }
        }

        /// Builds an unpublished increment element.
        ///
        /// The counter is a 4-byte big-endian word; the length field is
        /// fixed to its size.
        pub fn increment(src: u64, dst: u64) -> Self {
            Self {
                cmd: pack_cmd(false, Opcode::Increment),
                length: 4u16.to_be(),
                src: src.to_be(),
                dst: dst.to_be(),
                ..Self::zeroed()
            }
        }

        /// Builds an unpublished 8-byte compare-and-swap element.
        ///
        /// When `when_equal` is set the swap value is stored only if the
        /// destination word equals `compare`; otherwise only if it
        /// differs. A failed guard completes with the undefined-command
        /// (CAS-invalid) status bit.
        pub fn atomic_cas(dst: u64, compare: u64, swap: u64, when_equal: bool) -> Self {
            Self {
                cmd: pack_cmd(false, Opcode::AtomicCas),
                length: 8u16.to_be(),
                cmd_extra: if when_equal {
                    CMD_EXTRA_CAS_EQUAL_8
                } else {
                    CMD_EXTRA_CAS_NOT_EQUAL_8
                },
                atomic_op1: compare.to_be(),
                src: swap.to_be(),
                dst: dst.to_be(),
                ..Self::zeroed()
            }
        }

        /// An all-zero element. A zero command byte has the valid bit
        /// clear, so zeroed queue memory is never consumed.
        pub fn zeroed() -> Self {
            Self {
                cmd: 0,
                status: 0,
                length: 0,
                cmd_extra: 0,
                reserved1: 0,
                reserved2: 0,
                atomic_op1: 0,
                src: 0,
                dst: 0,
            }
        }

        /// Transfer length (or interrupt source) in host byte order.
        pub fn length(&self) -> u16 {
            u16::from_be(self.length)
        }

        /// Source address in host byte order.
        pub fn src(&self) -> u64 {
            u64::from_be(self.src)
        }

        /// Destination address in host byte order.
        pub fn dst(&self) -> u64 {
            u64::from_be(self.dst)
        }

        /// First atomic operand in host byte order.
        pub fn atomic_op1(&self) -> u64 {
            u64::from_be(self.atomic_op1)
        }

        /// Decodes the opcode field of the command byte.
        pub fn opcode(&self) -> Option<Opcode> {
            Opcode::from_cmd(self.cmd)
        }
    }

    /// One hardware fault kind decoded from the status byte.
    ///
    /// Fault bits are not mutually exclusive; a single completion can
    /// report several of them at once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FaultKind {
        /// The hardware could not translate a source or destination
        /// address.
        TranslationFault,

        /// Address error response on the fabric.
        AddressError,

        /// Data error response on the fabric.
        DataError,

        /// Fault response from the coherence/link layer.
        LinkFault,

        /// The interrupt source number was outside the range configured
        /// for the context.
        InvalidInterruptSource,

        /// The owning process was terminated while the element was in
        /// flight.
        ProcessTerminated,

        /// The opcode was not recognized, or an atomic guard failed.
        UndefinedCommand,
    }

    impl FaultKind {
        /// The status bit signalling this fault.
        pub fn bit(self) -> u8 {
            match self {
                FaultKind::TranslationFault => STAT_TRANSLATION_FAULT,
                FaultKind::AddressError => STAT_ADDRESS_ERROR,
                FaultKind::DataError => STAT_DATA_ERROR,
                FaultKind::LinkFault => STAT_LINK_FAULT,
                FaultKind::InvalidInterruptSource => STAT_INVALID_IRQ_SOURCE,
                FaultKind::ProcessTerminated => STAT_PROCESS_TERMINATED,
                FaultKind::UndefinedCommand => STAT_UNDEFINED_COMMAND,
            }
        }

        /// All fault kinds, highest status bit first.
        pub const ALL: [FaultKind; 7] = [
            FaultKind::TranslationFault,
            FaultKind::AddressError,
            FaultKind::DataError,
            FaultKind::LinkFault,
            FaultKind::InvalidInterruptSource,
            FaultKind::ProcessTerminated,
            FaultKind::UndefinedCommand,
        ];
    }

    impl core::fmt::Display for FaultKind {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            let msg = match self {
                FaultKind::TranslationFault => "translation fault",
                FaultKind::AddressError => "address error",
                FaultKind::DataError => "data error",
                FaultKind::LinkFault => "link-layer fault response",
                FaultKind::InvalidInterruptSource => "invalid interrupt source number",
                FaultKind::ProcessTerminated => "process terminated",
                FaultKind::UndefinedCommand => "undefined command or CAS-invalid response",
            };
            f.write_str(msg)
        }
    }

    /// The set of fault bits carried by one status byte.
    ///
    /// Every set bit is reported, not just the highest-priority one, so a
    /// caller can see compound failures such as a translation fault that
    /// also produced a data error.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultSet(u8);

    impl FaultSet {
        /// Extracts the fault bits from a raw status byte.
        pub fn from_status(status: u8) -> Self {
            Self(status & STAT_FAULT_MASK)
        }

        /// True when no fault bit is set.
        pub fn is_empty(self) -> bool {
            self.0 == 0
        }

        /// True when this set carries the given fault.
        pub fn contains(self, kind: FaultKind) -> bool {
            self.0 & kind.bit() != 0
        }

        /// The raw fault bits.
        pub fn bits(self) -> u8 {
            self.0
        }

        /// Iterates over every signalled fault, highest bit first.
        pub fn iter(self) -> impl Iterator<Item = FaultKind> {
            FaultKind::ALL.into_iter().filter(move |k| self.contains(*k))
        }
    }

    impl core::fmt::Display for FaultSet {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            let mut first = true;
            for kind in self.iter() {
                if !first {
                    f.write_str(", ")?;
                }
                write!(f, "{kind}")?;
                first = false;
            }
            if first {
                f.write_str("none")?;
            }
            Ok(())
        }
    }

    /// Terminal interpretation of a work element's status byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum CompletionEvent {
        /// The element completed successfully.
        Complete,

        /// The hardware reported one or more faults.
        Fault(FaultSet),
    }

    impl CompletionEvent {
        /// Decodes a raw status byte.
        ///
        /// Returns `None` while the byte is still zero (element in
        /// flight). Any set fault bit yields `Fault` even if the
        /// completion bit is also set.
        pub fn decode(status: u8) -> Option<Self> {
            if status == 0 {
                return None;
            }
            let faults = FaultSet::from_status(status);
            if faults.is_empty() {
                Some(CompletionEvent::Complete)
            } else {
                Some(CompletionEvent::Fault(faults))
            }
        }
    }
}

// Memory-mapped register layout of the accelerator problem state areas.
//
// Offsets are in bytes within the mapped register window; the hardware
// uses an 8-byte register stride. Per-process registers live in each
// attached context's window, the configuration registers in the master
// context's window.
pub mod regs {
    /// Host page size; the work-element queue allocation must be aligned
    /// to this boundary because the descriptor only carries the upper
    /// address bits.
    pub const PAGE_SIZE: usize = 4096;

    /// Size of one mapped problem-state register window in bytes.
    pub const PSA_REGS_SIZE: usize = 16 * 1024;

    /// Per-process register: work element descriptor.
    pub const PS_REG_WED: usize = 0 << 3;

    /// Per-process register: hardware-assigned process handle.
    ///
    /// The handle occupies the upper 16 bits of the register value and is
    /// cross-checked against the handle obtained from the attach call.
    pub const PS_REG_PH: usize = 1 << 3;

    /// Per-process register: context status.
    pub const PS_REG_STATUS: usize = 2 << 3;

    /// Per-process register: context control.
    pub const PS_REG_PCTRL: usize = 3 << 3;

    /// Per-process register: accelerator timebase.
    ///
    /// Writing zero requests a timebase update; the register then reads
    /// back nonzero once the hardware has latched its current tick count.
    pub const PS_REG_TB: usize = 8 << 3;

    /// Status register bit: the engine has halted and is waiting for a
    /// restart write.
    pub const PS_STATUS_STOPPED: u64 = 0x0800_0000_0000_0000;

    /// Control register bit: restart a stopped engine.
    ///
    /// Only honored once the stopped bit has been observed; writing it to
    /// a running context is ignored.
    pub const PS_PCTRL_RESTART: u64 = 0x8000_0000_0000_0000;

    /// Master register: accelerator configuration.
    pub const MASTER_REG_CFG: usize = 0 << 3;

    /// Master register: error status.
    pub const MASTER_REG_ERR: usize = 2 << 3;

    /// Master register: error information.
    pub const MASTER_REG_ERR_INFO: usize = 3 << 3;

    /// Master register: trace control.
    pub const MASTER_REG_TRACE_CTL: usize = 4 << 3;

    /// Configuration register bit: halt the engine on an invalid command
    /// instead of polling for the next valid slot.
    pub const CFG_STOP_ON_INVALID_CMD: u64 = 0x2000_0000_0000_0000;

    /// Process-handle sentinel reported by a dead context.
    pub const PROCESS_HANDLE_DEAD: u64 = 0xdead;

    /// Process-handle sentinel reported by an unmapped or failed context.
    pub const PROCESS_HANDLE_INVALID: u64 = 0xffff;

    /// Maximum queue depth expressible in the work element descriptor.
    pub const WED_DEPTH_MAX: u64 = 0xfff;

    /// Mask selecting the queue base address bits of the descriptor.
    pub const WED_ADDR_MASK: u64 = 0xffff_ffff_ffff_f000;

    /// Packs a work element descriptor from the queue base address and
    /// its depth in cache lines.
    ///
    /// The base must be page-aligned; only its upper bits are carried.
    /// The depth occupies the low 12 bits.
    pub fn pack_wed(queue_base: u64, depth_lines: u64) -> u64 {
        (queue_base & WED_ADDR_MASK) | (depth_lines & WED_DEPTH_MAX)
    }

    /// Extracts the queue base address from a work element descriptor.
    pub fn wed_base(wed: u64) -> u64 {
        wed & WED_ADDR_MASK
    }

    /// Extracts the queue depth in cache lines from a descriptor.
    pub fn wed_depth_lines(wed: u64) -> u64 {
        wed & WED_DEPTH_MAX
    }

    /// Extracts the process handle field from the raw register value.
    pub fn process_handle_field(reg: u64) -> u64 {
        reg >> 48
    }
}
