//! Integration tests driving the full allocator over a fixed arena.

use std::alloc::{GlobalAlloc, Layout};

use segalloc::{
    init_global_heap, ArenaSource, HeapAddr, LockedSegAllocator, SegHeapAllocator,
    SyncSegAllocator,
};

const ARENA_CAPACITY: usize = 1 << 16;

#[repr(align(16))]
struct ArenaBacking([u8; ARENA_CAPACITY]);

/// Fresh allocator over its own arena. The backing buffer must stay alive
/// for as long as the allocator, so both are handed back.
fn fresh_heap() -> (SegHeapAllocator<ArenaSource>, Box<ArenaBacking>) {
    let mut backing = Box::new(ArenaBacking([0; ARENA_CAPACITY]));
    let arena = unsafe { ArenaSource::new(backing.0.as_mut_ptr(), ARENA_CAPACITY) }.unwrap();

    (SegHeapAllocator::init(arena).unwrap(), backing)
}

#[test]
fn small_allocation_rounds_to_minimum_block() {
    let (mut heap, _backing) = fresh_heap();
    assert_eq!(heap.heap_size(), 16);

    let payload = unsafe { heap.allocate(1) };
    assert!(!payload.is_null());
    assert_eq!(u64::from(payload) % 16, 0);
    assert_eq!(heap.heap_size(), 48);

    unsafe { payload.as_mut_ptr::<u8>().write(0xAB) };
    assert!(heap.check());

    unsafe { heap.free(payload) };
    assert!(heap.check());

    // The freed minimum block is recycled for the next small request.
    let recycled = unsafe { heap.allocate(24) };
    assert_eq!(recycled, payload);
    assert_eq!(heap.heap_size(), 48);
}

#[test]
fn zero_size_requests_yield_null() {
    let (mut heap, _backing) = fresh_heap();

    unsafe {
        assert!(heap.allocate(0).is_null());
        assert!(heap.zero_allocate(0, 128).is_null());
        assert!(heap.zero_allocate(128, 0).is_null());

        heap.free(HeapAddr::NULL_PTR);
    }

    assert_eq!(heap.heap_size(), 16);
    assert!(heap.check());
}

#[test]
fn placement_splits_a_recycled_block() {
    let (mut heap, _backing) = fresh_heap();

    let big = unsafe { heap.allocate(2000) };
    assert_eq!(heap.heap_size(), 16 + 2016);

    unsafe { heap.free(big) };

    // The 2016-byte block comes back split: a 32-byte prefix for this
    // request, a 1984-byte free suffix behind it.
    let small = unsafe { heap.allocate(16) };
    assert_eq!(small, big);
    assert_eq!(heap.heap_size(), 16 + 2016);
    assert!(heap.check());

    // The suffix serves the next large request without growing the heap.
    let tail = unsafe { heap.allocate(1900) };
    assert!(!tail.is_null());
    assert_eq!(heap.heap_size(), 16 + 2016);
    assert!(heap.check());
}

#[test]
fn release_coalesces_both_neighbors() {
    let (mut heap, _backing) = fresh_heap();

    let first = unsafe { heap.allocate(64) };
    let second = unsafe { heap.allocate(64) };
    let third = unsafe { heap.allocate(64) };
    assert_eq!(heap.heap_size(), 16 + 240);

    unsafe {
        heap.free(first);
        heap.free(third);
        heap.free(second);
    }
    assert!(heap.check());

    // One 240-byte block now spans all three; an exact-fit request lands
    // on it without growing the heap.
    let spanning = unsafe { heap.allocate(232) };
    assert_eq!(spanning, first);
    assert_eq!(heap.heap_size(), 16 + 240);
    assert!(heap.check());
}

#[test]
fn reallocate_grows_in_place_while_the_block_holds() {
    let (mut heap, _backing) = fresh_heap();

    let payload = unsafe { heap.allocate(100) };
    assert_eq!(heap.heap_size(), 16 + 112);

    // 112-byte block: 104 payload bytes, so 100 and 104 both fit in place.
    assert_eq!(unsafe { heap.reallocate(payload, 100) }, payload);
    assert_eq!(unsafe { heap.reallocate(payload, 104) }, payload);
    assert_eq!(heap.heap_size(), 16 + 112);
    assert!(heap.check());
}

#[test]
fn reallocate_moves_and_preserves_the_payload() {
    let (mut heap, _backing) = fresh_heap();

    let payload = unsafe { heap.allocate(16) };
    for offset in 0..16u8 {
        unsafe { payload.as_mut_ptr::<u8>().add(offset as usize).write(offset) };
    }

    let moved = unsafe { heap.reallocate(payload, 1000) };
    assert!(!moved.is_null());
    assert_ne!(moved, payload);

    for offset in 0..16u8 {
        assert_eq!(
            unsafe { moved.as_ptr::<u8>().add(offset as usize).read() },
            offset
        );
    }
    assert!(heap.check());

    // The original minimum block was released and is recycled first.
    let recycled = unsafe { heap.allocate(8) };
    assert_eq!(recycled, payload);
}

#[test]
fn reallocate_degrades_on_null_and_zero() {
    let (mut heap, _backing) = fresh_heap();

    let payload = unsafe { heap.reallocate(HeapAddr::NULL_PTR, 40) };
    assert!(!payload.is_null());

    assert!(unsafe { heap.reallocate(payload, 0) }.is_null());
    assert!(heap.check());

    // The freed block is available again.
    assert_eq!(unsafe { heap.allocate(40) }, payload);
}

#[test]
fn zero_allocate_clears_the_payload() {
    let (mut heap, _backing) = fresh_heap();

    let payload = unsafe { heap.zero_allocate(4, 8) };
    assert!(!payload.is_null());
    assert_eq!(heap.heap_size(), 16 + 48);

    for offset in 0..32 {
        assert_eq!(unsafe { payload.as_ptr::<u8>().add(offset).read() }, 0);
    }
    assert!(heap.check());
}

#[test]
fn zero_allocate_rejects_overflowing_products() {
    let (mut heap, _backing) = fresh_heap();

    assert!(unsafe { heap.zero_allocate(usize::MAX, 2) }.is_null());
    assert_eq!(heap.heap_size(), 16);
    assert!(heap.check());
}

#[test]
fn payloads_are_aligned_and_in_bounds() {
    let (mut heap, _backing) = fresh_heap();
    let sizes = [
        1usize, 2, 3, 8, 15, 16, 17, 31, 32, 33, 63, 64, 100, 128, 500, 1000, 2916, 4000,
    ];

    let mut payloads = Vec::new();
    for size in sizes {
        let payload = unsafe { heap.allocate(size) };
        assert!(!payload.is_null());
        assert_eq!(u64::from(payload) % 16, 0);
        assert!(payload > heap.heap_lo());
        assert!(payload + size <= heap.heap_hi());

        unsafe {
            payload.as_mut_ptr::<u8>().write(0x5A);
            payload.as_mut_ptr::<u8>().add(size - 1).write(0xA5);
        }
        assert!(heap.check());

        payloads.push(payload);
    }

    let managed = heap.heap_size();
    for payload in payloads {
        unsafe { heap.free(payload) };
        assert!(heap.check());
    }

    // Releases never shrink the heap, they only merge blocks.
    assert_eq!(heap.heap_size(), managed);
}

#[test]
fn exhaustion_leaves_the_heap_unchanged() {
    #[repr(align(16))]
    struct SmallBacking([u8; 128]);

    let mut backing = Box::new(SmallBacking([0; 128]));
    let arena = unsafe { ArenaSource::new(backing.0.as_mut_ptr(), 128) }.unwrap();
    let mut heap = SegHeapAllocator::init(arena).unwrap();

    let payload = unsafe { heap.allocate(50) };
    assert!(!payload.is_null());
    assert_eq!(heap.heap_size(), 80);

    // 112 bytes cannot be backed by the 48 remaining ones.
    assert!(unsafe { heap.allocate(100) }.is_null());
    assert_eq!(heap.heap_size(), 80);
    assert!(heap.check());

    unsafe { payload.as_mut_ptr::<u8>().write(0x11) };

    // What is left still serves a fitting request.
    assert!(!unsafe { heap.allocate(30) }.is_null());
    assert_eq!(heap.heap_size(), 128);
    assert!(heap.check());
}

#[test]
fn checker_flags_a_clobbered_footer() {
    let (mut heap, _backing) = fresh_heap();

    let first = unsafe { heap.allocate(40) };
    let _second = unsafe { heap.allocate(40) };
    unsafe { heap.free(first) };
    assert!(heap.check());

    // Clobber the free block's footer: 48-byte block, footer 32 bytes into
    // the payload.
    unsafe { (first + 32u64).as_mut_ptr::<u64>().write(0) };
    assert!(!heap.check());
}

#[test]
fn locked_allocator_serves_global_alloc() {
    let (heap, _backing) = fresh_heap();
    let locked = LockedSegAllocator::new(heap);

    unsafe {
        let layout = Layout::from_size_align(64, 8).unwrap();
        let ptr = locked.alloc(layout);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 16, 0);

        let zeroed = locked.alloc_zeroed(Layout::from_size_align(32, 16).unwrap());
        assert!(!zeroed.is_null());
        for offset in 0..32 {
            assert_eq!(zeroed.add(offset).read(), 0);
        }

        // Alignment above 16 bytes is out of contract.
        assert!(locked
            .alloc(Layout::from_size_align(64, 32).unwrap())
            .is_null());

        ptr.write(0x42);
        let grown = locked.realloc(ptr, layout, 256);
        assert!(!grown.is_null());
        assert_eq!(grown.read(), 0x42);

        locked.dealloc(grown, Layout::from_size_align(256, 8).unwrap());
        locked.dealloc(zeroed, Layout::from_size_align(32, 16).unwrap());
    }

    assert!(locked.alloc.lock().check());
}

#[test]
fn global_slot_serves_allocations_once_installed() {
    let backing: &'static mut ArenaBacking = Box::leak(Box::new(ArenaBacking([0; ARENA_CAPACITY])));
    let arena = unsafe { ArenaSource::new(backing.0.as_mut_ptr(), ARENA_CAPACITY) }.unwrap();

    init_global_heap(arena).unwrap();

    let front = SyncSegAllocator::new();
    unsafe {
        let layout = Layout::from_size_align(48, 8).unwrap();
        let ptr = front.alloc(layout);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 16, 0);

        ptr.write(0x77);
        assert_eq!(ptr.read(), 0x77);

        front.dealloc(ptr, layout);
    }
}
