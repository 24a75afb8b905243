//! Kernel heap front-end.
//!
//! Routes small requests to the slab allocator and everything else to the
//! buddy; frees are routed by the page's block type tag so callers never
//! need to remember which layer served them. The whole heap sits under one
//! spin lock.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use sett_core::sync::SpinLock;
use sett_core::{Cause, Error, Location, Result};

use crate::buddy::{AllocFlags, BlockType, BuddyAllocator, PoolStats};
use crate::page_align_down;
use crate::slab::{MAX_SLAB_SIZE, SlabAllocator};

/// Largest alignment the slab layer can guarantee (cells start at a 64-byte
/// offset into the page).
const MAX_SLAB_ALIGN: usize = 64;

/// The combined buddy + slab heap. One instance serves the whole kernel.
pub struct Heap {
    buddy: BuddyAllocator,
    slab: SlabAllocator,
}

impl Heap {
    /// Creates an empty heap; unusable until a pool is registered.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buddy: BuddyAllocator::new(),
            slab: SlabAllocator::new(),
        }
    }

    /// Registers `[start, end)` as backing memory.
    ///
    /// # Safety
    ///
    /// The range must be unused RAM owned by this heap from now on.
    pub unsafe fn init_pool(&mut self, start: usize, end: usize) -> Result<()> {
        // SAFETY: forwarded contract.
        unsafe { self.buddy.init_pool(start, end) }
    }

    /// Allocates `size` bytes with at least `align` alignment.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let size = size.max(1);
        if size <= MAX_SLAB_SIZE && align <= MAX_SLAB_ALIGN {
            // The cell class must also cover the alignment: class-N cells
            // are only N-aligned (capped at 64 by the data offset).
            self.slab.allocate(&mut self.buddy, size.max(align))
        } else {
            self.buddy
                .allocate(size, BlockType::Page, AllocFlags::empty())
        }
    }

    /// Allocates whole pages with an explicit type tag. Used by the process
    /// manager for user memory.
    pub fn allocate_pages(&mut self, size: usize, ty: BlockType) -> Result<NonNull<u8>> {
        if ty == BlockType::Slab {
            return Err(Error::new(Location::Unknown, Cause::Param));
        }
        self.buddy.allocate(size, ty, AllocFlags::empty())
    }

    /// Frees any pointer previously returned by this heap, routing by tag.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let page = page_align_down(ptr.as_ptr() as usize);
        // SAFETY: pages in a registered pool are never at address 0.
        let page_ptr = unsafe { NonNull::new_unchecked(page as *mut u8) };
        match self.buddy.type_of(page_ptr)? {
            BlockType::Slab => self.slab.deallocate(&mut self.buddy, ptr),
            BlockType::Page | BlockType::User => self.buddy.deallocate(ptr),
        }
    }

    /// Usable size of an allocation.
    pub fn size_of(&self, ptr: NonNull<u8>) -> Result<usize> {
        let page = page_align_down(ptr.as_ptr() as usize);
        // SAFETY: as in `free`.
        let page_ptr = unsafe { NonNull::new_unchecked(page as *mut u8) };
        match self.buddy.type_of(page_ptr)? {
            BlockType::Slab => Ok(self.slab.size_of(ptr)),
            BlockType::Page | BlockType::User => self.buddy.size_of(ptr),
        }
    }

    /// Type tag of the page backing `ptr`.
    pub fn type_of(&self, ptr: NonNull<u8>) -> Result<BlockType> {
        let page = page_align_down(ptr.as_ptr() as usize);
        // SAFETY: as in `free`.
        let page_ptr = unsafe { NonNull::new_unchecked(page as *mut u8) };
        self.buddy.type_of(page_ptr)
    }

    /// Byte size of a buddy block; used by the process mapper which needs
    /// the rounded size actually reserved.
    pub fn block_size_of(&self, ptr: NonNull<u8>) -> Result<usize> {
        self.buddy.size_of(ptr)
    }

    /// Resizes an allocation, moving it if necessary.
    pub fn reallocate(&mut self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>> {
        let old_size = self.size_of(ptr)?;
        let ty = self.type_of(ptr)?;

        // Page-to-page growth can stay in the buddy.
        if ty != BlockType::Slab && new_size > MAX_SLAB_SIZE {
            return self.buddy.reallocate(ptr, new_size);
        }
        if new_size <= old_size && ty == BlockType::Slab {
            return Ok(ptr);
        }

        let new = self.allocate(new_size, 1)?;
        // SAFETY: both allocations are live and at least `min(old, new)`
        // bytes long; distinct allocations never overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), old_size.min(new_size));
        }
        self.free(ptr)?;
        Ok(new)
    }

    /// Buddy pool statistics passthrough.
    #[must_use]
    pub fn pool_stats(&self, index: usize) -> Option<PoolStats> {
        self.buddy.pool_stats(index)
    }

    /// Whether `addr` lies in heap-managed memory.
    #[must_use]
    pub fn owns(&self, addr: usize) -> bool {
        self.buddy.owns(addr)
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// The global kernel heap.
pub static HEAP: SpinLock<Heap> = SpinLock::new(Heap::new());

/// Registers backing memory with the global heap.
///
/// # Safety
///
/// See [`Heap::init_pool`].
pub unsafe fn init_pool(start: usize, end: usize) -> Result<()> {
    // SAFETY: forwarded contract.
    unsafe { HEAP.lock().init_pool(start, end) }
}

/// Runs a closure against the global heap.
pub fn with_heap<R>(f: impl FnOnce(&mut Heap) -> R) -> R {
    f(&mut HEAP.lock())
}

/// `GlobalAlloc` adapter over the global heap, registered as the kernel's
/// `#[global_allocator]` by the kernel crate.
pub struct KernelHeap;

// SAFETY: allocation and deallocation are serialized by the heap lock;
// alignment is honored by the slab/buddy routing in `Heap::allocate`.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        with_heap(|heap| {
            heap.allocate(layout.size(), layout.align())
                .map_or(core::ptr::null_mut(), NonNull::as_ptr)
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            let _ = with_heap(|heap| heap.free(ptr));
        }
    }
}
