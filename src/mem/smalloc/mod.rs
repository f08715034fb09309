//! Segregated-list heap allocator and its public allocation surface.
//!
//! `smalloc` manages a single sbrk-backed heap region. The engine lives in
//! [`heap`]; this module adds the locked wrapper and the process-wide
//! allocator slot so the heap can serve as a `#[global_allocator]`.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::null_mut;

use conquer_once::spin::OnceCell;
use spin::Mutex;

use crate::mem::region::{ArenaSource, HeapSource};
use crate::mem::{HeapAddr, MemoryError};

pub(crate) mod divider;
pub(crate) mod freelist;
mod heap;

pub use heap::SegHeapAllocator;

pub(crate) const ALIGNMENT: u64 = 16;
pub(crate) const DIVIDER_SIZE: u64 = 8;
pub(crate) const MIN_BLOCK_SIZE: u64 = 32;
pub(crate) const FREE_LINKS_SIZE: u64 = 16;

/// Largest payload alignment the allocator honors.
const MAX_SUPPORTED_ALIGN: usize = 16;

static SEG_HEAP_ALLOCATOR: OnceCell<Mutex<SegHeapAllocator<ArenaSource>>> = OnceCell::uninit();

/// Locked version of the [`SegHeapAllocator`].
///
/// It uses a spinlock-based Mutex to ensure interior mutability, which is
/// what [`GlobalAlloc`] requires. Requests aligned above 16 bytes are
/// refused with a null pointer.
pub struct LockedSegAllocator<S: HeapSource> {
    pub alloc: Mutex<SegHeapAllocator<S>>,
}

impl<S: HeapSource> LockedSegAllocator<S> {
    pub const fn new(alloc: SegHeapAllocator<S>) -> Self {
        Self {
            alloc: Mutex::new(alloc),
        }
    }
}

unsafe impl<S: HeapSource + Send> GlobalAlloc for LockedSegAllocator<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_SUPPORTED_ALIGN {
            return null_mut();
        }

        self.alloc.lock().allocate(layout.size()).as_mut_ptr()
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.alloc.lock().free(HeapAddr::from(ptr));
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_SUPPORTED_ALIGN {
            return null_mut();
        }

        self.alloc
            .lock()
            .zero_allocate(1, layout.size())
            .as_mut_ptr()
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        self.alloc
            .lock()
            .reallocate(HeapAddr::from(ptr), new_size)
            .as_mut_ptr()
    }
}

/// Initializes the process-wide heap over the given arena.
///
/// Should only run once; installs the allocator behind
/// [`SyncSegAllocator`].
pub fn init_global_heap(arena: ArenaSource) -> Result<(), MemoryError> {
    let heap = SegHeapAllocator::init(arena)?;
    SEG_HEAP_ALLOCATOR.init_once(|| Mutex::new(heap));

    Ok(())
}

/// Zero-sized front-end delegating to the process-wide heap, suitable for
/// the `#[global_allocator]` attribute once [`init_global_heap`] has run.
pub struct SyncSegAllocator {}

impl SyncSegAllocator {
    pub const fn new() -> Self {
        Self {}
    }
}

unsafe impl GlobalAlloc for SyncSegAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_SUPPORTED_ALIGN {
            return null_mut();
        }

        SEG_HEAP_ALLOCATOR
            .get_unchecked()
            .lock()
            .allocate(layout.size())
            .as_mut_ptr()
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        SEG_HEAP_ALLOCATOR
            .get_unchecked()
            .lock()
            .free(HeapAddr::from(ptr));
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_SUPPORTED_ALIGN {
            return null_mut();
        }

        SEG_HEAP_ALLOCATOR
            .get_unchecked()
            .lock()
            .zero_allocate(1, layout.size())
            .as_mut_ptr()
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        SEG_HEAP_ALLOCATOR
            .get_unchecked()
            .lock()
            .reallocate(HeapAddr::from(ptr), new_size)
            .as_mut_ptr()
    }
}
