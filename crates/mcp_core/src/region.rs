//! Page-aligned device memory regions shared with the hardware.
//!
//! The queue buffer is read by the accelerator asynchronously, so it must
//! never be handled as a plain Rust buffer: every access goes through
//! volatile reads and writes, and ordering against the hardware is
//! established with explicit fences. This module provides the single owner
//! type for such memory.

use alloc::alloc::{alloc_zeroed, dealloc};
use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{Ordering, fence};

use crate::McpError;

/// An owned, page-aligned region of hardware-shared memory.
///
/// The region is zero-initialized at allocation and freed on drop. All
/// access is volatile and bounds-checked; the base address is stable for
/// the lifetime of the region, which is what allows it to be handed to the
/// hardware through the work element descriptor.
pub struct DeviceRegion {
    base: NonNull<u8>,
    layout: Layout,
}

// The region is raw memory with volatile access only; cross-thread use is
// coordinated by the queue lock and the status-byte protocol.
unsafe impl Send for DeviceRegion {}
unsafe impl Sync for DeviceRegion {}

impl DeviceRegion {
    /// Allocates a zeroed region of `len` bytes aligned to `align`.
    ///
    /// # Arguments
    ///
    /// * `len` - Region size in bytes; must be nonzero
    /// * `align` - Required alignment; must be a power of two
    ///
    /// # Returns
    ///
    /// The owned region, or `AllocationFailure` if the layout is invalid
    /// or the allocator cannot satisfy it.
    pub fn new_zeroed(len: usize, align: usize) -> Result<Self, McpError> {
        if len == 0 {
            return Err(McpError::AllocationFailure);
        }
        let layout =
            Layout::from_size_align(len, align).map_err(|_| McpError::AllocationFailure)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(McpError::AllocationFailure)?;
        Ok(Self { base, layout })
    }

    /// Region size in bytes.
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// True when the region has no capacity. Construction rejects empty
    /// regions, so this is always false for a live region.
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// The region's base address, as handed to the hardware.
    pub fn base_addr(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    fn slot_ptr(&self, offset: usize, len: usize) -> *mut u8 {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len()),
            "device region access out of bounds"
        );
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Volatile single-byte read.
    pub fn read_u8(&self, offset: usize) -> u8 {
        unsafe { self.slot_ptr(offset, 1).read_volatile() }
    }

    /// Volatile single-byte write.
    pub fn write_u8(&self, offset: usize, value: u8) {
        unsafe { self.slot_ptr(offset, 1).write_volatile(value) }
    }

    /// Volatile big-endian u32 read, for counter words shared with the
    /// increment opcode.
    pub fn read_u32_be(&self, offset: usize) -> u32 {
        let p = self.slot_ptr(offset, 4);
        let mut raw = [0u8; 4];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = unsafe { p.add(i).read_volatile() };
        }
        u32::from_be_bytes(raw)
    }

    /// Volatile big-endian u32 write.
    pub fn write_u32_be(&self, offset: usize, value: u32) {
        let p = self.slot_ptr(offset, 4);
        for (i, b) in value.to_be_bytes().iter().enumerate() {
            unsafe { p.add(i).write_volatile(*b) };
        }
    }

    /// Volatile copy of `src` into the region at `offset`.
    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        let p = self.slot_ptr(offset, src.len());
        for (i, b) in src.iter().enumerate() {
            unsafe { p.add(i).write_volatile(*b) };
        }
    }

    /// Volatile copy out of the region at `offset` into `dst`.
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        let p = self.slot_ptr(offset, dst.len());
        for (i, b) in dst.iter_mut().enumerate() {
            *b = unsafe { p.add(i).read_volatile() };
        }
    }

    /// Store fence issued between an element's data fields and the command
    /// byte that makes the slot visible to the hardware.
    pub fn publish_fence() {
        fence(Ordering::Release);
    }

    /// Load fence issued after observing a nonzero status byte, before any
    /// other hardware-written field or buffer is read.
    pub fn complete_fence() {
        fence(Ordering::Acquire);
    }
}

impl Drop for DeviceRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_length() {
        assert_eq!(
            DeviceRegion::new_zeroed(0, 4096).err(),
            Some(McpError::AllocationFailure)
        );
    }

    #[test]
    fn allocation_is_aligned_and_zeroed() {
        let region = DeviceRegion::new_zeroed(8192, 4096).unwrap();
        assert_eq!(region.base_addr() % 4096, 0);
        assert_eq!(region.len(), 8192);
        let mut buf = [0xffu8; 64];
        region.read_bytes(8192 - 64, &mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn byte_and_word_access_round_trip() {
        let region = DeviceRegion::new_zeroed(4096, 4096).unwrap();
        region.write_u8(17, 0xa5);
        assert_eq!(region.read_u8(17), 0xa5);
        region.write_u32_be(128, 0x0102_0304);
        assert_eq!(region.read_u32_be(128), 0x0102_0304);
        // Big-endian byte order in memory.
        assert_eq!(region.read_u8(128), 0x01);
        assert_eq!(region.read_u8(131), 0x04);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn out_of_bounds_access_panics() {
        let region = DeviceRegion::new_zeroed(4096, 4096).unwrap();
        region.read_u8(4096);
    }
}
