//! Page allocations that are released on drop unless explicitly handed over.

use core::ptr::NonNull;
use core::slice;

use crate::config::PAGE_SIZE;
use crate::error::AllocationError;

/// Source of page-aligned, physically addressable memory.
///
/// On UEFI this is `AllocatePages(EfiLoaderData)`; host tests use
/// [`crate::sim::SimPages`].
pub trait PageAllocator {
    fn allocate_pages(&self, count: usize) -> Result<NonNull<u8>, AllocationError>;

    /// # Safety
    ///
    /// `base` and `count` must come from a matching `allocate_pages` call on
    /// this allocator and must not be used afterwards.
    unsafe fn free_pages(&self, base: NonNull<u8>, count: usize);
}

impl<A: PageAllocator + ?Sized> PageAllocator for &A {
    fn allocate_pages(&self, count: usize) -> Result<NonNull<u8>, AllocationError> {
        (**self).allocate_pages(count)
    }

    unsafe fn free_pages(&self, base: NonNull<u8>, count: usize) {
        (**self).free_pages(base, count)
    }
}

/// Base and size of a region that no longer has an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    pub base: u64,
    pub count: usize,
}

impl PageSpan {
    pub fn len(&self) -> usize {
        self.count * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.len() as u64
    }
}

/// An owned run of pages.
#[derive(Debug)]
pub struct Pages<'a, A: PageAllocator + ?Sized> {
    allocator: &'a A,
    base: NonNull<u8>,
    count: usize,
}

impl<'a, A: PageAllocator + ?Sized> Pages<'a, A> {
    /// Allocate `count` pages filled with `fill`.
    pub fn allocate(allocator: &'a A, count: usize, fill: u8) -> Result<Self, AllocationError> {
        let base = allocator.allocate_pages(count)?;
        let mut pages = Self {
            allocator,
            base,
            count,
        };
        pages.as_mut_slice().fill(fill);
        Ok(pages)
    }

    pub fn zeroed(allocator: &'a A, count: usize) -> Result<Self, AllocationError> {
        Self::allocate(allocator, count, 0)
    }

    pub fn addr(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn len(&self) -> usize {
        self.count * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn span(&self) -> PageSpan {
        PageSpan {
            base: self.addr(),
            count: self.count,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocator handed out `count` pages at `base`, owned by us.
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.len()) }
    }

    /// Give up ownership; the pages stay allocated forever.
    pub fn leak(self) -> PageSpan {
        let span = self.span();
        core::mem::forget(self);
        span
    }
}

impl<A: PageAllocator + ?Sized> Drop for Pages<'_, A> {
    fn drop(&mut self) {
        // SAFETY: `base`/`count` came from `allocate_pages` and are dropped once.
        unsafe { self.allocator.free_pages(self.base, self.count) }
    }
}
