//! Aligned host allocation
//!
//! Host buffers are page-aligned and padded to a whole number of cache
//! lines so they can be handed to DMA engines directly. A zero-byte request
//! still yields one cache line: the returned pointer is never null. Memory is
//! zero-filled, so host views of a fresh buffer are always initialized.

use std::alloc::{self, Layout};

use crate::backend::{BackendError, BackendResult, HostPtr};

/// Alignment of host buffers
pub const HOST_PAGE_ALIGN: usize = 4096;

/// Host buffer lengths are rounded up to a multiple of this
pub const HOST_CACHE_ALIGN: usize = 64;

/// Bytes actually reserved for a request of `size` bytes
pub fn padded_size(size: usize) -> Option<usize> {
    let size = size.max(1);
    size.checked_add(HOST_CACHE_ALIGN - 1)
        .map(|s| s / HOST_CACHE_ALIGN * HOST_CACHE_ALIGN)
}

fn layout_for(size: usize) -> BackendResult<Layout> {
    let padded = padded_size(size).ok_or_else(|| {
        BackendError::AllocationFailed(format!("host allocation of {} bytes overflows", size))
    })?;
    Layout::from_size_align(padded, HOST_PAGE_ALIGN)
        .map_err(|e| BackendError::AllocationFailed(format!("invalid host layout: {}", e)))
}

/// Allocate `size` bytes of zeroed, page-aligned host memory
pub fn allocate(size: usize) -> BackendResult<HostPtr> {
    let layout = layout_for(size)?;
    // SAFETY: layout has a non-zero size
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    tracing::trace!("host::allocate: {} bytes ({} reserved) at {:?}", size, layout.size(), ptr);
    HostPtr::new(ptr).ok_or_else(|| {
        BackendError::AllocationFailed(format!("host allocator returned null for {} bytes", size))
    })
}

/// Free memory obtained from [`allocate`]
///
/// # Safety
/// `ptr` must come from [`allocate`] called with the same `size`, and must
/// not be used afterwards.
pub unsafe fn free(ptr: HostPtr, size: usize) {
    match layout_for(size) {
        Ok(layout) => alloc::dealloc(ptr.as_ptr(), layout),
        Err(e) => tracing::error!("host::free: cannot rebuild layout for {:?}: {}", ptr, e),
    }
}
