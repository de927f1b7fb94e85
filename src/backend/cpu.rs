//! Host-only backend
//!
//! The "device" address space is host memory: device allocations come from
//! the same aligned allocator as host buffers and copies are plain memcpy.

use std::ptr;

use super::{
    Backend, BackendError, BackendResult, DeviceBackend, DeviceInfo, DevicePtr, HostPtr,
    ProgramHandle,
};
use crate::memory::host;

/// Backend for the CPU device
#[derive(Debug, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }
}

impl DeviceBackend for CpuBackend {
    fn kind(&self) -> Backend {
        Backend::Cpu
    }

    fn name(&self) -> &str {
        "cpu"
    }

    fn allocate_device(&self, size: usize) -> BackendResult<DevicePtr> {
        let host_ptr = host::allocate(size)?;
        DevicePtr::new(host_ptr.as_ptr().cast()).ok_or_else(|| {
            BackendError::AllocationFailed(format!("null device pointer for {} bytes", size))
        })
    }

    unsafe fn free_device(&self, ptr: DevicePtr, size: usize) -> BackendResult<()> {
        let host_ptr = HostPtr::new(ptr.as_ptr().cast()).ok_or(BackendError::InvalidPointer(0))?;
        host::free(host_ptr, size);
        Ok(())
    }

    unsafe fn copy_to_device(
        &self,
        dst: DevicePtr,
        src: *const u8,
        size: usize,
    ) -> BackendResult<()> {
        ptr::copy_nonoverlapping(src, dst.as_ptr().cast::<u8>(), size);
        Ok(())
    }

    unsafe fn copy_to_host(&self, dst: *mut u8, src: DevicePtr, size: usize) -> BackendResult<()> {
        ptr::copy_nonoverlapping(src.as_ptr().cast::<u8>(), dst, size);
        Ok(())
    }

    unsafe fn enqueue_copy_to_device(
        &self,
        _queue: usize,
        dst: DevicePtr,
        src: *const u8,
        size: usize,
    ) -> BackendResult<()> {
        // No queues on the host: the copy completes immediately
        self.copy_to_device(dst, src, size)
    }

    fn query_device(&self) -> BackendResult<DeviceInfo> {
        let compute_units = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Ok(DeviceInfo {
            name: "cpu".to_string(),
            max_work_item_sizes: [0, 0, 0],
            compute_units,
            total_memory: 0,
        })
    }

    fn register_programs(&self) -> BackendResult<ProgramHandle> {
        Err(BackendError::Unsupported(
            "the CPU backend has no device programs".to_string(),
        ))
    }

    fn create_queue(&self) -> BackendResult<usize> {
        Err(BackendError::Unsupported(
            "the CPU backend has no command queues".to_string(),
        ))
    }

    fn queue_count(&self) -> usize {
        1
    }

    fn set_active_queue(&self, queue: usize) -> BackendResult<()> {
        if queue == 0 {
            Ok(())
        } else {
            Err(BackendError::QueueError(format!(
                "queue {} does not exist on the CPU backend",
                queue
            )))
        }
    }

    fn finish_queue(&self, _queue: usize) -> BackendResult<()> {
        Ok(())
    }

    fn extensions_len(&self) -> BackendResult<usize> {
        Ok(0)
    }

    fn read_extensions(&self, _max_len: usize) -> BackendResult<String> {
        Ok(String::new())
    }
}
