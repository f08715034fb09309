//! Heap region contract and fixed-capacity arena backing.
//!
//! The allocator never talks to the operating system directly. It extends
//! its managed region through a [`HeapSource`], an sbrk-style primitive that
//! hands out contiguous chunks from a single monotonically-growing break
//! pointer.

use crate::mem::{Alignment, HeapAddr, MemoryError};

/// Extension primitive backing a managed heap region.
///
/// # Safety
///
/// Implementors must guarantee that:
/// - every address returned by [`HeapSource::extend`] begins a readable and
///   writable run of exactly the requested length, contiguous with all
///   previously returned runs;
/// - the region base is 16-byte aligned and never moves;
/// - `heap_lo()` and `heap_hi()` bound every byte handed out so far, with
///   `heap_hi` exclusive;
/// - a failed extension leaves the region untouched.
pub unsafe trait HeapSource {
    /// Grows the region by exactly `size` bytes and returns the base address
    /// of the new run.
    fn extend(&mut self, size: usize) -> Result<HeapAddr, MemoryError>;

    /// First byte of the managed region.
    fn heap_lo(&self) -> HeapAddr;

    /// One past the last byte handed out so far.
    fn heap_hi(&self) -> HeapAddr;
}

/// Fixed-capacity arena exposing the sbrk contract over a caller-provided
/// byte buffer.
///
/// The arena never releases memory: the break pointer only moves forward,
/// and an extension past the buffer capacity fails without moving it.
pub struct ArenaSource {
    base: HeapAddr,
    capacity: usize,
    brk: usize,
}

impl ArenaSource {
    /// Wraps a raw buffer of `capacity` bytes.
    ///
    /// # Safety
    ///
    /// `base` must point to a readable and writable buffer of at least
    /// `capacity` bytes that outlives the arena and is not accessed through
    /// any other path while the arena exists.
    pub unsafe fn new(base: *mut u8, capacity: usize) -> Result<Self, MemoryError> {
        let base = HeapAddr::from(base);

        if base.is_null() {
            return Err(MemoryError::NullPointer);
        }

        if !base.is_aligned_with(Alignment::ALIGN_16B) {
            return Err(MemoryError::InvalidAlignment);
        }

        Ok(Self {
            base,
            capacity,
            brk: 0,
        })
    }
}

unsafe impl HeapSource for ArenaSource {
    fn extend(&mut self, size: usize) -> Result<HeapAddr, MemoryError> {
        let new_brk = self
            .brk
            .checked_add(size)
            .ok_or(MemoryError::RegionExhausted)?;

        if new_brk > self.capacity {
            return Err(MemoryError::RegionExhausted);
        }

        let run_base = self.base + self.brk;
        self.brk = new_brk;

        Ok(run_base)
    }

    fn heap_lo(&self) -> HeapAddr {
        self.base
    }

    fn heap_hi(&self) -> HeapAddr {
        self.base + self.brk
    }
}

// The arena owns its region exclusively for its whole lifetime.
unsafe impl Send for ArenaSource {}
