//! Boundary-tag codec.
//!
//! Every block in the heap begins with an 8-byte divider word; free blocks
//! end with a copy of it. The word packs the block size together with four
//! status bits, so that both neighbors of a block can be reached (and their
//! state read) from the block itself.

use bytemuck::{Pod, Zeroable};
use core::ptr::{self, null_mut};

use crate::mem::utils::BitIndex;
use crate::mem::HeapAddr;

use super::DIVIDER_SIZE;

const EPILOGUE_BIT: u64 = 0;
const NEXT_ALLOCATED_BIT: u64 = 1;
const PREV_ALLOCATED_BIT: u64 = 2;
const ALLOCATED_BIT: u64 = 3;
const SIZE_SHIFT: u64 = 4;

/// 8-byte boundary tag, used both as block header and as free-block footer.
///
/// Layout, MSB to LSB: block size (60 bits), allocated bit, predecessor
/// allocated bit, successor allocated bit, epilogue bit. Two dividers are
/// equal iff every field matches, which makes the header/footer consistency
/// check a single word comparison.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub(crate) struct Divider {
    inner: u64,
}

impl Divider {
    /// Allocated sentinel guarding the low end of the heap. Gives the first
    /// real block a valid predecessor.
    pub(crate) const PROLOGUE: Self = Self::new(DIVIDER_SIZE, true, true, true, false);

    pub(crate) const fn new(
        size: u64,
        allocated: bool,
        prev_allocated: bool,
        next_allocated: bool,
        epilogue: bool,
    ) -> Self {
        Self {
            inner: (size << SIZE_SHIFT)
                | ((allocated as u64) << ALLOCATED_BIT)
                | ((prev_allocated as u64) << PREV_ALLOCATED_BIT)
                | ((next_allocated as u64) << NEXT_ALLOCATED_BIT)
                | ((epilogue as u64) << EPILOGUE_BIT),
        }
    }

    /// Allocated zero-size sentinel at the high end of the heap. Every
    /// forward traversal terminates on it.
    pub(crate) const fn epilogue(prev_allocated: bool) -> Self {
        Self::new(0, true, prev_allocated, true, true)
    }

    /// Total block length in bytes, header included (and footer, when the
    /// block is free).
    pub(crate) fn size(&self) -> u64 {
        self.inner.get_bit_slice(SIZE_SHIFT, 63)
    }

    pub(crate) fn is_allocated(&self) -> bool {
        self.inner.get_bit(ALLOCATED_BIT) != 0
    }

    pub(crate) fn prev_allocated(&self) -> bool {
        self.inner.get_bit(PREV_ALLOCATED_BIT) != 0
    }

    pub(crate) fn set_prev_allocated(&mut self, allocated: bool) {
        if allocated {
            self.inner |= 1 << PREV_ALLOCATED_BIT;
        } else {
            self.inner &= !(1 << PREV_ALLOCATED_BIT);
        }
    }

    pub(crate) fn next_allocated(&self) -> bool {
        self.inner.get_bit(NEXT_ALLOCATED_BIT) != 0
    }

    pub(crate) fn set_next_allocated(&mut self, allocated: bool) {
        if allocated {
            self.inner |= 1 << NEXT_ALLOCATED_BIT;
        } else {
            self.inner &= !(1 << NEXT_ALLOCATED_BIT);
        }
    }

    pub(crate) fn is_epilogue(&self) -> bool {
        self.inner.get_bit(EPILOGUE_BIT) != 0
    }
}

/// Wrapper around a raw pointer to a block's header divider.
///
/// All neighbor derivations live here: the successor is reached through the
/// size field, the predecessor through the footer the prologue guarantees
/// to exist below every real block.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockLink {
    divider: *mut Divider,
}

impl BlockLink {
    pub(crate) const NULL_LINK: Self = Self {
        divider: null_mut(),
    };

    pub(crate) fn from_addr(addr: HeapAddr) -> Self {
        Self {
            divider: addr.as_mut_ptr(),
        }
    }

    /// Derives the block link from a payload address handed out by the
    /// allocator.
    pub(crate) fn from_payload(payload: HeapAddr) -> Self {
        Self::from_addr(payload - DIVIDER_SIZE)
    }

    pub(crate) fn addr(&self) -> HeapAddr {
        HeapAddr::from(self.divider)
    }

    pub(crate) fn is_null(&self) -> bool {
        self.divider.is_null()
    }

    /// First payload byte of this block.
    pub(crate) fn payload_addr(&self) -> HeapAddr {
        self.addr() + DIVIDER_SIZE
    }

    /// Returns a reference to the header divider of this block.
    ///
    /// # Safety
    ///
    /// The link must point inside a live heap region, and the usual borrow
    /// checking rules must be respected even though they can be avoided
    /// here.
    pub(crate) unsafe fn header(&self) -> &Divider {
        &*self.divider
    }

    /// Returns a mutable reference to the header divider of this block.
    ///
    /// # Safety
    ///
    /// Same contract as [`BlockLink::header`].
    pub(crate) unsafe fn header_mut(&self) -> &mut Divider {
        &mut *self.divider
    }

    /// Link to the block immediately after this one.
    ///
    /// # Safety
    ///
    /// The header must carry a valid size and the block must not be the
    /// epilogue.
    pub(crate) unsafe fn next_block(&self) -> Self {
        Self::from_addr(self.addr() + self.header().size())
    }

    /// Footer of the block immediately before this one. Only meaningful
    /// when that block is free.
    ///
    /// # Safety
    ///
    /// There must be a block (or the prologue) directly below this one.
    pub(crate) unsafe fn prev_footer(&self) -> Divider {
        ptr::read((self.addr() - DIVIDER_SIZE).as_ptr())
    }

    /// Link to the block immediately before this one, located through its
    /// footer.
    ///
    /// # Safety
    ///
    /// The predecessor must be free; an allocated predecessor carries no
    /// footer and cannot be traversed upward.
    pub(crate) unsafe fn prev_block(&self) -> Self {
        Self::from_addr(self.addr() - self.prev_footer().size())
    }

    /// Reads the footer divider of this block. Only meaningful when the
    /// block is free.
    ///
    /// # Safety
    ///
    /// The header size must be valid and span in-heap memory.
    pub(crate) unsafe fn footer(&self) -> Divider {
        ptr::read((self.addr() + self.header().size() - DIVIDER_SIZE).as_ptr())
    }

    /// Mirrors the header divider into the footer slot at the end of the
    /// block.
    ///
    /// # Safety
    ///
    /// The header size must be valid and span in-heap memory. Must not be
    /// called on the epilogue, whose footer slot would alias the word below
    /// its header.
    pub(crate) unsafe fn write_footer(&self) {
        ptr::write(
            (self.addr() + self.header().size() - DIVIDER_SIZE).as_mut_ptr(),
            *self.header(),
        );
    }
}
