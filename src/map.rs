//! Page-aligned RAM buffers for chunk data.
//!
//! Nothing here needs a raw address-space reservation separate from
//! the bytes it backs, so this is a `std::alloc`-based implementation
//! with a small surface: `page_size()`, and allocate/release of a
//! page-aligned region.
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Returns the platform's page size.  Used to align DMA-bound chunk
/// buffers and swap-file placements.
#[inline]
pub fn page_size() -> usize {
    // `std` has no portable page-size query; 4 KiB covers every
    // platform this crate targets.  Kept as a single choke point so a
    // future `libc::sysconf(_SC_PAGESIZE)` call only needs to change
    // this function.
    4096
}

/// Allocates `size` bytes aligned to `align` (a power of two).  When
/// `align` is the page size, the result is safe to pass to
/// positioned, DMA-flagged file I/O.
pub fn alloc_aligned(size: usize, align: usize) -> Result<(NonNull<u8>, Layout), i32> {
    assert!(size > 0, "zero-size chunks never call into the allocator");
    let layout = Layout::from_size_align(size, align).map_err(|_| libc_like_einval())?;

    // SAFETY: `layout` has non-zero size, checked above.
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    match NonNull::new(ptr) {
        Some(ptr) => Ok((ptr, layout)),
        None => Err(libc_like_enomem()),
    }
}

/// Releases a region obtained from [`alloc_aligned`].
///
/// # Safety
///
/// `ptr` and `layout` must be exactly the pair returned by a single
/// prior call to `alloc_aligned`.
pub unsafe fn dealloc_aligned(ptr: NonNull<u8>, layout: Layout) {
    alloc::dealloc(ptr.as_ptr(), layout);
}

fn libc_like_enomem() -> i32 {
    12 // ENOMEM
}

fn libc_like_einval() -> i32 {
    22 // EINVAL
}

#[test]
fn test_page_size() {
    assert_eq!(page_size(), 4096);
}

#[test]
fn smoke_test() {
    let (ptr, layout) = alloc_aligned(4096, page_size()).expect("should allocate");
    assert_eq!(ptr.as_ptr() as usize % page_size(), 0);
    unsafe {
        std::ptr::write_bytes(ptr.as_ptr(), 0xAB, layout.size());
        dealloc_aligned(ptr, layout);
    }
}
