//! Fixed-capacity work-element ring shared with the accelerator.
//!
//! The queue is the only component that writes into hardware-visible
//! memory. Enqueue copies an element's data fields into the slot at the
//! cursor, issues a store fence, and only then writes the command byte
//! carrying the queue's current wrap-generation bit: the hardware must
//! never observe a command byte with the valid bit set before the data
//! fields are visible. Publication itself is two-phase: the enqueue leaves
//! the caller's valid bit as built, and the returned slot handle exposes a
//! separate activation step so a producer can insert a dependent
//! interrupt element behind a copy and release both together.

use alloc::sync::Arc;
use core::mem::size_of;

use mcp_common::regs::{PAGE_SIZE, WED_DEPTH_MAX, pack_wed};
use mcp_common::wire::{
    CACHE_LINE_SIZE, CMD_VALID, CMD_WRAP, CompletionEvent, WORK_ELEMENT_SIZE, WorkElement,
};

use crate::McpError;
use crate::region::DeviceRegion;

const CMD_BYTE: usize = 0;
const STATUS_BYTE: usize = 1;

/// Fixed-capacity circular buffer of work elements.
///
/// Owns the enqueue cursor and the wrap-generation bit. Capacity is fixed
/// at construction; the backing memory is page-aligned, zeroed, and kept
/// alive by every outstanding slot handle, so a slot abandoned after a
/// timeout cannot dangle while the hardware may still write its status.
///
/// Enqueue mutates cursor and wrap state and is therefore not reentrant:
/// producers sharing one queue must serialize calls behind a single lock.
/// Waiting on a slot's completion needs no lock and is done through the
/// returned `StagedElement`.
pub struct WorkQueue {
    mem: Arc<DeviceRegion>,
    depth: usize,
    cursor: usize,
    wrap: u8,
}

impl WorkQueue {
    /// Allocates a queue of `capacity_bytes` of hardware-shared memory.
    ///
    /// The capacity must be a nonzero multiple of the cache-line size and
    /// small enough for its line count to fit the descriptor's 12-bit
    /// depth field; other geometries are rejected before any allocation
    /// happens, since the hardware would refuse the descriptor anyway.
    ///
    /// # Arguments
    ///
    /// * `capacity_bytes` - Queue size in bytes, a multiple of 128
    ///
    /// # Returns
    ///
    /// The queue with its cursor at the base and wrap generation zero, or
    /// `AttachmentRejected`/`AllocationFailure` on bad geometry or
    /// allocation failure.
    pub fn new(capacity_bytes: usize) -> Result<Self, McpError> {
        const _: () = assert!(size_of::<WorkElement>() == WORK_ELEMENT_SIZE);

        if capacity_bytes == 0 || !capacity_bytes.is_multiple_of(CACHE_LINE_SIZE) {
            return Err(McpError::AttachmentRejected);
        }
        let lines = capacity_bytes / CACHE_LINE_SIZE;
        if lines as u64 > WED_DEPTH_MAX {
            return Err(McpError::AttachmentRejected);
        }
        let mem = Arc::new(DeviceRegion::new_zeroed(capacity_bytes, PAGE_SIZE)?);
        Ok(Self {
            mem,
            depth: capacity_bytes / WORK_ELEMENT_SIZE,
            cursor: 0,
            wrap: 0,
        })
    }

    /// Allocates the largest queue the work element descriptor can
    /// express: 4095 cache lines.
    pub fn new_max() -> Result<Self, McpError> {
        Self::new(WED_DEPTH_MAX as usize * CACHE_LINE_SIZE)
    }

    /// Queue capacity in elements.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Queue capacity in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.mem.len()
    }

    /// Index of the slot the next enqueue will use.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Wrap bit carried by elements of the current generation; either 0
    /// or the raw wrap-bit value.
    pub fn wrap_generation(&self) -> u8 {
        self.wrap
    }

    /// The work element descriptor pointing the hardware at this queue,
    /// packing the page-aligned base with the depth in cache lines.
    pub fn wed(&self) -> u64 {
        pack_wed(
            self.mem.base_addr(),
            (self.capacity_bytes() / CACHE_LINE_SIZE) as u64,
        )
    }

    /// Copies a work element into the slot at the cursor and publishes its
    /// command byte, returning a handle to the queued slot.
    ///
    /// The element's data fields are written first, then a store fence,
    /// then the command byte with the caller's wrap bit replaced by the
    /// queue's current generation. The caller's valid bit is preserved:
    /// elements built unvalidated stay invisible to the hardware until
    /// `StagedElement::activate` flips the bit.
    ///
    /// Advances the cursor; passing the last slot flips the wrap
    /// generation and returns the cursor to the base.
    pub fn enqueue(&mut self, we: &WorkElement) -> StagedElement {
        let offset = self.cursor * WORK_ELEMENT_SIZE;

        // Everything except the command byte, in wire form.
        let raw = unsafe {
            core::slice::from_raw_parts(we as *const WorkElement as *const u8, WORK_ELEMENT_SIZE)
        };
        self.mem.write_bytes(offset + 1, &raw[1..]);

        DeviceRegion::publish_fence();
        self.mem
            .write_u8(offset + CMD_BYTE, (we.cmd & !CMD_WRAP) | self.wrap);

        self.cursor += 1;
        if self.cursor == self.depth {
            self.cursor = 0;
            self.wrap ^= CMD_WRAP;
        }

        StagedElement {
            mem: Arc::clone(&self.mem),
            offset,
        }
    }

    #[cfg(test)]
    pub(crate) fn memory(&self) -> &Arc<DeviceRegion> {
        &self.mem
    }
}

impl core::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("base", &self.mem.base_addr())
            .field("depth", &self.depth)
            .field("cursor", &self.cursor)
            .field("wrap", &(self.wrap != 0))
            .finish()
    }
}

/// Handle to one queued work element.
///
/// Created by `WorkQueue::enqueue`. Holds the queue memory alive, so the
/// handle stays valid even if the submitter abandons the wait; the slot
/// itself is recycled by the queue on its next wrap regardless. Cloneable
/// so a submitter can hand the wait to another party.
#[derive(Clone)]
pub struct StagedElement {
    mem: Arc<DeviceRegion>,
    offset: usize,
}

impl StagedElement {
    /// Sets the valid bit on the queued slot, releasing it (and any
    /// pre-validated elements queued behind it) to the hardware.
    ///
    /// Issues a store fence first so anything the caller wrote after
    /// enqueue, source buffers included, is visible before the bit.
    pub fn activate(&self) {
        DeviceRegion::publish_fence();
        let cmd = self.mem.read_u8(self.offset + CMD_BYTE);
        self.mem.write_u8(self.offset + CMD_BYTE, cmd | CMD_VALID);
    }

    /// The slot's current command byte.
    pub fn command(&self) -> u8 {
        self.mem.read_u8(self.offset + CMD_BYTE)
    }

    /// The slot's status byte.
    ///
    /// Zero while the element is in flight. A nonzero read is followed by
    /// a load fence: the status byte is the only field that synchronizes
    /// the hardware's writes, so nothing else may be trusted before it.
    pub fn status(&self) -> u8 {
        let status = self.mem.read_u8(self.offset + STATUS_BYTE);
        if status != 0 {
            DeviceRegion::complete_fence();
        }
        status
    }

    /// Decoded completion state, `None` while in flight.
    pub fn completion(&self) -> Option<CompletionEvent> {
        CompletionEvent::decode(self.status())
    }

    /// Byte offset of the slot within the queue memory.
    pub fn slot_offset(&self) -> usize {
        self.offset
    }
}

impl core::fmt::Debug for StagedElement {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StagedElement")
            .field("offset", &self.offset)
            .field("command", &self.command())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_common::regs;
    use mcp_common::wire::{ELEMENTS_PER_CACHE_LINE, Opcode};

    #[test]
    fn rejects_bad_geometry() {
        assert_eq!(WorkQueue::new(0).err(), Some(McpError::AttachmentRejected));
        assert_eq!(WorkQueue::new(100).err(), Some(McpError::AttachmentRejected));
        // One line past the 12-bit depth field.
        assert_eq!(
            WorkQueue::new(4096 * CACHE_LINE_SIZE).err(),
            Some(McpError::AttachmentRejected)
        );
    }

    #[test]
    fn wed_carries_base_and_depth() {
        let q = WorkQueue::new(64 * CACHE_LINE_SIZE).unwrap();
        let wed = q.wed();
        assert_eq!(regs::wed_base(wed), q.memory().base_addr());
        assert_eq!(regs::wed_depth_lines(wed), 64);

        let q = WorkQueue::new_max().unwrap();
        assert_eq!(regs::wed_depth_lines(q.wed()), regs::WED_DEPTH_MAX);
        assert_eq!(q.depth(), 4095 * ELEMENTS_PER_CACHE_LINE);
    }

    #[test]
    fn enqueue_preserves_fields_and_defers_valid() {
        let mut q = WorkQueue::new(CACHE_LINE_SIZE).unwrap();
        let slot = q.enqueue(&WorkElement::copy(0x1000, 0x2000, 512));

        assert_eq!(slot.command() & CMD_VALID, 0);
        assert_eq!(Opcode::from_cmd(slot.command()), Some(Opcode::Copy));
        assert_eq!(slot.status(), 0);

        slot.activate();
        assert_eq!(slot.command() & CMD_VALID, CMD_VALID);

        // Activation must not disturb the opcode or wrap bit.
        assert_eq!(Opcode::from_cmd(slot.command()), Some(Opcode::Copy));
        assert_eq!(slot.command() & CMD_WRAP, 0);
    }

    #[test]
    fn wrap_generation_flips_once_per_traversal() {
        let mut q = WorkQueue::new(2 * CACHE_LINE_SIZE).unwrap();
        let depth = q.depth();
        assert_eq!(depth, 8);

        let mut offsets = alloc::vec::Vec::new();
        for _ in 0..depth {
            assert_eq!(q.wrap_generation(), 0);
            offsets.push(q.enqueue(&WorkElement::copy(0, 0, 1)).slot_offset());
        }
        // Cursor back at base, generation flipped exactly once.
        assert_eq!(q.cursor(), 0);
        assert_eq!(q.wrap_generation(), CMD_WRAP);

        // Every slot was distinct.
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), depth);

        // Second pass tags elements with the new generation.
        let slot = q.enqueue(&WorkElement::copy(0, 0, 1));
        assert_eq!(slot.command() & CMD_WRAP, CMD_WRAP);

        for _ in 1..depth {
            q.enqueue(&WorkElement::copy(0, 0, 1));
        }
        assert_eq!(q.wrap_generation(), 0);
        assert_eq!(q.cursor(), 0);
    }

    #[test]
    fn interrupt_elements_publish_valid_immediately() {
        let mut q = WorkQueue::new(CACHE_LINE_SIZE).unwrap();
        let copy = q.enqueue(&WorkElement::copy(0x10, 0x20, 64));
        let irq = q.enqueue(&WorkElement::raise_interrupt(1));

        // The chained pair: interrupt already valid, copy gating both.
        assert_eq!(irq.command() & CMD_VALID, CMD_VALID);
        assert_eq!(copy.command() & CMD_VALID, 0);
        copy.activate();
        assert_eq!(copy.command() & CMD_VALID, CMD_VALID);
    }

    #[test]
    fn completion_decodes_status_writes() {
        let mut q = WorkQueue::new(CACHE_LINE_SIZE).unwrap();
        let slot = q.enqueue(&WorkElement::copy(0, 0, 1));
        assert_eq!(slot.completion(), None);

        // Hardware-side status write.
        q.memory().write_u8(slot.slot_offset() + 1, 0x80);
        assert_eq!(slot.completion(), Some(CompletionEvent::Complete));
    }
}
