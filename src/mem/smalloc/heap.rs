//! Main heap allocator engine.
//!
//! The heap is a single contiguous region obtained from a [`HeapSource`]:
//! a prologue divider, a run of blocks, and an epilogue divider. Placement
//! searches the segregated index with a best-fit-within-margin policy,
//! releases coalesce with both neighbors, and a failed search grows the
//! region by exactly the aligned request.

use core::ptr;

use log::{debug, error, info};

use crate::mem::region::HeapSource;
use crate::mem::{Alignment, HeapAddr, MemoryError};

use super::divider::{BlockLink, Divider};
use super::freelist::{free_links, SegregatedIndex, SIZE_CLASS_COUNT};
use super::{ALIGNMENT, DIVIDER_SIZE, FREE_LINKS_SIZE, MIN_BLOCK_SIZE};

/// Best-fit search margin: a candidate within 22.5% of the request is taken
/// immediately instead of scanning the rest of its class.
const FIT_MARGIN_NUM: u64 = 9;
const FIT_MARGIN_DEN: u64 = 40;

/// Segregated-list heap allocator over an sbrk-style region source.
///
/// Owns every byte the source has handed out. Block metadata lives in the
/// region itself as boundary tags; the only out-of-band state is the six
/// free-list heads.
pub struct SegHeapAllocator<S: HeapSource> {
    source: S,
    index: SegregatedIndex,
}

impl<S: HeapSource> SegHeapAllocator<S> {
    /// Initializes a heap over the given region source.
    ///
    /// Reserves 16 bytes for the prologue and epilogue sentinels. Fails
    /// only if the source cannot provide them.
    pub fn init(source: S) -> Result<Self, MemoryError> {
        let mut heap = Self {
            source,
            index: SegregatedIndex::new(),
        };

        let base = heap.source.extend(2 * DIVIDER_SIZE as usize)?;
        assert!(
            base.is_aligned_with(Alignment::ALIGN_16B),
            "invalid alignment for the heap region"
        );

        unsafe {
            *BlockLink::from_addr(base).header_mut() = Divider::PROLOGUE;
            *BlockLink::from_addr(base + DIVIDER_SIZE).header_mut() = Divider::epilogue(true);
        }

        info!("heap initialized at {}", base);

        Ok(heap)
    }

    /// Allocates `size` bytes and returns the payload address, or the null
    /// address if the region source cannot back the request.
    ///
    /// Payloads are 16-byte aligned. A zero `size` yields the null address.
    ///
    /// # Safety
    ///
    /// The heap invariants must hold, i.e. every block previously handed
    /// out was either left untouched outside its payload or released
    /// through [`SegHeapAllocator::free`].
    pub unsafe fn allocate(&mut self, size: usize) -> HeapAddr {
        if size == 0 {
            return HeapAddr::NULL_PTR;
        }

        let size_req = match aligned_request(size) {
            Some(size_req) => size_req,
            None => return HeapAddr::NULL_PTR,
        };

        let block = match self.find_free_space(size_req) {
            Some(block) => {
                self.index.unlink(block);
                self.place(block, size_req);
                block
            }
            None => match self.increase_heap(size_req) {
                Some(block) => block,
                None => return HeapAddr::NULL_PTR,
            },
        };

        block.payload_addr()
    }

    /// Releases a payload previously returned by this allocator, merging
    /// the freed block with any free neighbor.
    ///
    /// The null address is a no-op.
    ///
    /// # Safety
    ///
    /// `payload` must be null or a live payload address obtained from this
    /// allocator; releasing it twice or releasing a derived pointer is
    /// undefined behavior.
    pub unsafe fn free(&mut self, payload: HeapAddr) {
        if payload.is_null() {
            return;
        }

        self.release(BlockLink::from_payload(payload));
    }

    /// Resizes an allocation, moving it only when the current block cannot
    /// hold `size` bytes.
    ///
    /// A null `payload` degrades to [`SegHeapAllocator::allocate`]; a zero
    /// `size` degrades to [`SegHeapAllocator::free`] and returns the null
    /// address. On failure the original allocation is left untouched.
    ///
    /// # Safety
    ///
    /// Same contract as [`SegHeapAllocator::free`].
    pub unsafe fn reallocate(&mut self, payload: HeapAddr, size: usize) -> HeapAddr {
        if payload.is_null() {
            return self.allocate(size);
        }

        if size == 0 {
            self.free(payload);
            return HeapAddr::NULL_PTR;
        }

        let block = BlockLink::from_payload(payload);
        let old_payload_size = block.header().size() - DIVIDER_SIZE;

        // The block is never shrunk in place.
        if old_payload_size >= u64::try_from(size).expect("infallible conversion") {
            return payload;
        }

        let new_payload = self.allocate(size);
        if new_payload.is_null() {
            return HeapAddr::NULL_PTR;
        }

        let copied = old_payload_size.min(u64::try_from(size).expect("infallible conversion"));
        ptr::copy_nonoverlapping(
            payload.as_ptr::<u8>(),
            new_payload.as_mut_ptr::<u8>(),
            usize::try_from(copied).expect("infallible conversion"),
        );

        self.free(payload);

        new_payload
    }

    /// Allocates `count * size` bytes and zero-fills the payload.
    ///
    /// Returns the null address when the product overflows or cannot be
    /// backed by the region source.
    ///
    /// # Safety
    ///
    /// Same contract as [`SegHeapAllocator::allocate`].
    pub unsafe fn zero_allocate(&mut self, count: usize, size: usize) -> HeapAddr {
        let total = match count.checked_mul(size) {
            Some(total) => total,
            None => return HeapAddr::NULL_PTR,
        };

        let payload = self.allocate(total);
        if !payload.is_null() {
            ptr::write_bytes(payload.as_mut_ptr::<u8>(), 0, total);
        }

        payload
    }

    /// Bytes currently managed, sentinels included.
    pub fn heap_size(&self) -> usize {
        usize::try_from(self.source.heap_hi() - self.source.heap_lo())
            .expect("infallible conversion")
    }

    pub fn heap_lo(&self) -> HeapAddr {
        self.source.heap_lo()
    }

    pub fn heap_hi(&self) -> HeapAddr {
        self.source.heap_hi()
    }

    /// Scans the index for a free block of at least `size_req` bytes.
    ///
    /// Starts at the class matching the request and falls through the
    /// higher classes up to the catch-all. Within a class the smallest
    /// fitting block wins, except that a candidate within the fit margin
    /// of the request is taken without scanning further.
    unsafe fn find_free_space(&self, size_req: u64) -> Option<BlockLink> {
        let first_class = SegregatedIndex::class_for(size_req);

        for class in first_class..SIZE_CLASS_COUNT {
            let mut best: Option<BlockLink> = None;
            let mut node = self.index.head(class);

            while !node.is_null() {
                let node_size = node.header().size();

                if node_size >= size_req {
                    if node_size <= size_req + (size_req * FIT_MARGIN_NUM) / FIT_MARGIN_DEN {
                        return Some(node);
                    }

                    let improves = match best {
                        Some(best_block) => node_size < best_block.header().size(),
                        None => true,
                    };
                    if improves {
                        best = Some(node);
                    }
                }

                node = free_links(node).next_free;
            }

            if best.is_some() {
                return best;
            }
        }

        None
    }

    /// Marks an unlinked free block as allocated, splitting off the tail
    /// when the remainder can host a minimum free block.
    unsafe fn place(&mut self, block: BlockLink, size_req: u64) {
        let header = *block.header();

        if header.size() > size_req + DIVIDER_SIZE + FREE_LINKS_SIZE {
            self.split(block, size_req);
        } else {
            self.set_divider(
                block,
                Divider::new(
                    header.size(),
                    true,
                    header.prev_allocated(),
                    header.next_allocated(),
                    false,
                ),
            );
        }
    }

    /// Splits a free block into an allocated prefix of `size_req` bytes and
    /// a free suffix inserted back into the index.
    unsafe fn split(&mut self, block: BlockLink, size_req: u64) {
        let old = *block.header();
        let prefix = Divider::new(size_req, true, old.prev_allocated(), false, false);

        let suffix_block = BlockLink::from_addr(block.addr() + size_req);
        let suffix = Divider::new(old.size() - size_req, false, true, old.next_allocated(), false);

        *block.header_mut() = prefix;
        *suffix_block.header_mut() = suffix;
        suffix_block.write_footer();

        // Re-applying the mutator to both halves settles the neighbor bits
        // on both sides of the cut.
        self.set_divider(block, prefix);
        self.set_divider(suffix_block, suffix);

        self.index.insert(suffix_block);
    }

    /// Central divider mutator.
    ///
    /// Writes `divider` into the block header, mirrors it into the footer
    /// when the block is free, and refreshes the neighbor-allocation bits
    /// of both adjacent blocks. The predecessor is reachable only through
    /// its footer, so it is touched only while it is free.
    unsafe fn set_divider(&mut self, block: BlockLink, divider: Divider) {
        *block.header_mut() = divider;
        if !divider.is_allocated() {
            block.write_footer();
        }

        let next = block.next_block();
        next.header_mut().set_prev_allocated(divider.is_allocated());

        let next_header = *next.header();
        if !next_header.is_allocated() && !next_header.is_epilogue() {
            next.write_footer();
        }

        if !divider.prev_allocated() {
            let prev = block.prev_block();
            prev.header_mut().set_next_allocated(divider.is_allocated());
            prev.write_footer();
        }
    }

    /// Marks a block free and merges it with whichever neighbors are free,
    /// then files the resulting block in its size class.
    unsafe fn release(&mut self, block: BlockLink) {
        let header = *block.header();
        let next = block.next_block();
        let next_header = *next.header();
        let next_free = !next_header.is_allocated() && !next_header.is_epilogue();

        self.set_divider(
            block,
            Divider::new(
                header.size(),
                false,
                header.prev_allocated(),
                next_header.is_allocated(),
                false,
            ),
        );

        let merged = match (header.prev_allocated(), next_free) {
            (false, true) => {
                let prev = block.prev_block();
                self.index.unlink(prev);
                self.index.unlink(next);
                self.coalesce(prev, next.addr() + next_header.size())
            }
            (false, false) => {
                let prev = block.prev_block();
                self.index.unlink(prev);
                self.coalesce(prev, block.addr() + header.size())
            }
            (true, true) => {
                self.index.unlink(next);
                self.coalesce(block, next.addr() + next_header.size())
            }
            (true, false) => block,
        };

        self.index.insert(merged);
    }

    /// Rewrites `left` to span every byte up to `right_end`, absorbing the
    /// blocks in between.
    unsafe fn coalesce(&mut self, left: BlockLink, right_end: HeapAddr) -> BlockLink {
        let spanned = right_end - left.addr();
        let successor = *BlockLink::from_addr(right_end).header();
        let prev_allocated = left.header().prev_allocated();

        self.set_divider(
            left,
            Divider::new(spanned, false, prev_allocated, successor.is_allocated(), false),
        );

        left
    }

    /// Grows the region by exactly `size_req` bytes and shapes the new run
    /// into an allocated block, re-anchoring the epilogue behind it.
    ///
    /// The new block's header lands on the displaced epilogue and inherits
    /// its predecessor bit, so a free trailing block keeps coalescing.
    unsafe fn increase_heap(&mut self, size_req: u64) -> Option<BlockLink> {
        let run = self
            .source
            .extend(usize::try_from(size_req).expect("infallible conversion"))
            .ok()?;

        let block = BlockLink::from_addr(run - DIVIDER_SIZE);
        let displaced = *block.header();
        let header = Divider::new(size_req, true, displaced.prev_allocated(), true, false);

        *block.header_mut() = header;
        *block.next_block().header_mut() = Divider::epilogue(true);

        self.set_divider(block, header);

        debug!(
            "heap extended by {} bytes ({} bytes managed)",
            size_req,
            self.heap_size()
        );

        Some(block)
    }

    /// Walks the heap and every free list, reporting each structural
    /// violation found. Returns whether the heap is consistent.
    ///
    /// Debug-build tool: it repairs nothing.
    pub fn check(&self) -> bool {
        let lo = self.source.heap_lo();
        let hi = self.source.heap_hi();
        let mut consistent = true;

        let mut walked_free = 0usize;
        let mut prev_allocated = true;
        let mut prev_was_free = false;

        unsafe {
            let mut block = BlockLink::from_addr(lo + DIVIDER_SIZE);

            loop {
                if !block.addr().is_within(lo, hi) {
                    error!("block {} escapes the heap", block.addr());
                    return false;
                }

                let header = *block.header();

                if header.is_epilogue() {
                    if header.size() != 0 || block.addr() != hi - DIVIDER_SIZE {
                        error!("misplaced epilogue at {}", block.addr());
                        consistent = false;
                    }
                    if header.prev_allocated() != prev_allocated {
                        error!("stale predecessor bit on the epilogue");
                        consistent = false;
                    }
                    break;
                }

                let size = header.size();

                if size == 0 || size % ALIGNMENT != 0 {
                    error!("invalid block size {} at {}", size, block.addr());
                    return false;
                }

                if u64::from(block.addr()) + size > u64::from(hi) {
                    error!("block {} overruns the heap", block.addr());
                    return false;
                }

                if header.prev_allocated() != prev_allocated {
                    error!("stale predecessor bit at {}", block.addr());
                    consistent = false;
                }

                if !header.is_allocated() {
                    walked_free += 1;

                    if prev_was_free {
                        error!("adjacent free blocks at {}", block.addr());
                        consistent = false;
                    }

                    if block.footer() != header {
                        error!("header/footer mismatch at {}", block.addr());
                        consistent = false;
                    }

                    // The successor bit of a free block is always kept
                    // fresh; allocated blocks cannot be reached by their
                    // successor and may go stale.
                    if header.next_allocated() != block.next_block().header().is_allocated() {
                        error!("stale successor bit at {}", block.addr());
                        consistent = false;
                    }

                    let class = SegregatedIndex::class_for(size);
                    if !self.index.contains(class, block) {
                        error!("free block {} missing from class {}", block.addr(), class);
                        consistent = false;
                    }
                }

                prev_was_free = !header.is_allocated();
                prev_allocated = header.is_allocated();
                block = block.next_block();
            }

            let mut listed = 0usize;

            for class in 0..SIZE_CLASS_COUNT {
                let mut node = self.index.head(class);

                while !node.is_null() {
                    listed += 1;

                    if !node.addr().is_within(lo, hi) {
                        error!("listed block {} escapes the heap", node.addr());
                        return false;
                    }

                    let header = *node.header();

                    if header.is_allocated() {
                        error!("allocated block {} in free list {}", node.addr(), class);
                        consistent = false;
                    }

                    if SegregatedIndex::class_for(header.size()) != class {
                        error!(
                            "block {} of size {} filed in class {}",
                            node.addr(),
                            header.size(),
                            class
                        );
                        consistent = false;
                    }

                    node = free_links(node).next_free;
                }
            }

            if listed != walked_free {
                error!(
                    "free-list population {} does not match heap walk {}",
                    listed, walked_free
                );
                consistent = false;
            }
        }

        consistent
    }
}

/// Rounds a payload request up to a whole block size: header added, aligned
/// to 16, never below the minimum block.
fn aligned_request(size: usize) -> Option<u64> {
    let size = u64::try_from(size).expect("infallible conversion");
    let padded = size.checked_add(DIVIDER_SIZE + ALIGNMENT - 1)?;

    Some((padded & !(ALIGNMENT - 1)).max(MIN_BLOCK_SIZE))
}
