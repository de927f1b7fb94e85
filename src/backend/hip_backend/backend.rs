//! Native single-queue accelerator over the HIP runtime

use std::ffi::c_void;
use std::path::PathBuf;
use std::ptr;
use std::sync::Mutex;

use super::device::{self, check};
use super::ffi;
use super::module::HipModule;
use super::stream::HipStream;
use crate::backend::{
    Backend, BackendError, BackendResult, DeviceBackend, DeviceInfo, DevicePtr, HostPtr,
    ProgramHandle,
};
use crate::memory::host::padded_size;

/// Kernel code object to load at program registration
#[derive(Debug, Clone)]
pub struct HipProgram {
    pub path: PathBuf,
    pub kernels: Vec<String>,
}

/// One HIP device driven through a single private stream.
///
/// Host buffers are pinned (`hipHostMalloc`). Blocking copies are issued on
/// the stream and waited for, so they are ordered after earlier
/// asynchronous pushes.
#[derive(Debug)]
pub struct HipBackend {
    device_id: i32,
    name: String,
    stream: HipStream,
    program: Option<HipProgram>,
    modules: Mutex<Vec<HipModule>>,
}

impl HipBackend {
    /// Whether at least one HIP device is visible
    pub fn gpu_available() -> bool {
        device::device_count() > 0
    }

    pub fn new(device_id: usize) -> BackendResult<Self> {
        let count = device::device_count();
        if device_id >= count {
            tracing::error!("HipBackend: device {} requested, {} visible", device_id, count);
            return Err(BackendError::DeviceNotFound);
        }
        let device_id = device_id as i32;
        activate(device_id)?;
        let info = device::query(device_id)?;
        let stream = HipStream::new()?;
        tracing::info!("HipBackend: using device {} '{}'", device_id, info.name);

        Ok(HipBackend {
            device_id,
            name: format!("hip:{}:{}", device_id, info.name),
            stream,
            program: None,
            modules: Mutex::new(Vec::new()),
        })
    }

    /// Load `program` when programs are registered
    pub fn with_program(mut self, program: HipProgram) -> Self {
        self.program = Some(program);
        self
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    unsafe fn memcpy_async(
        &self,
        dst: *mut c_void,
        src: *const c_void,
        size: usize,
        kind: i32,
    ) -> BackendResult<()> {
        let code = ffi::hipMemcpyAsync(dst, src, size, kind, self.stream.as_ptr());
        check(code, |msg| {
            BackendError::CopyFailed(format!("hipMemcpyAsync of {} bytes: {}", size, msg))
        })
    }
}

fn activate(device_id: i32) -> BackendResult<()> {
    // SAFETY: plain runtime call
    let code = unsafe { ffi::hipSetDevice(device_id) };
    check(code, |msg| {
        BackendError::InitializationFailed(format!("hipSetDevice({}): {}", device_id, msg))
    })
}

impl DeviceBackend for HipBackend {
    fn kind(&self) -> Backend {
        Backend::SingleQueue
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn allocate_host(&self, size: usize) -> BackendResult<HostPtr> {
        let padded = padded_size(size).ok_or_else(|| {
            BackendError::AllocationFailed(format!("host size {} overflows", size))
        })?;
        let mut raw: *mut c_void = ptr::null_mut();
        // SAFETY: valid out-pointer
        let code = unsafe { ffi::hipHostMalloc(&mut raw, padded, ffi::HIP_HOST_MALLOC_DEFAULT) };
        check(code, |msg| {
            BackendError::AllocationFailed(format!("hipHostMalloc({}): {}", padded, msg))
        })?;
        let ptr = HostPtr::new(raw.cast()).ok_or_else(|| {
            BackendError::AllocationFailed(format!("hipHostMalloc({}) returned null", padded))
        })?;
        // SAFETY: freshly allocated, `padded` bytes long
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, padded) };
        tracing::trace!("HipBackend: pinned {} host bytes at {:?}", padded, ptr);
        Ok(ptr)
    }

    unsafe fn free_host(&self, ptr: HostPtr, _size: usize) -> BackendResult<()> {
        let code = ffi::hipHostFree(ptr.as_ptr().cast());
        check(code, |_| BackendError::InvalidPointer(ptr.addr()))
    }

    fn allocate_device(&self, size: usize) -> BackendResult<DevicePtr> {
        activate(self.device_id)?;
        let mut raw: *mut c_void = ptr::null_mut();
        // hipMalloc(0) succeeds with a null pointer
        let bytes = size.max(1);
        // SAFETY: valid out-pointer
        let code = unsafe { ffi::hipMalloc(&mut raw, bytes) };
        check(code, |msg| {
            BackendError::AllocationFailed(format!("hipMalloc({}): {}", bytes, msg))
        })?;
        DevicePtr::new(raw).ok_or_else(|| {
            BackendError::AllocationFailed(format!("hipMalloc({}) returned null", bytes))
        })
    }

    unsafe fn free_device(&self, ptr: DevicePtr, _size: usize) -> BackendResult<()> {
        activate(self.device_id)?;
        let code = ffi::hipFree(ptr.as_ptr());
        check(code, |_| BackendError::InvalidPointer(ptr.addr()))
    }

    unsafe fn copy_to_device(
        &self,
        dst: DevicePtr,
        src: *const u8,
        size: usize,
    ) -> BackendResult<()> {
        self.memcpy_async(dst.as_ptr(), src.cast(), size, ffi::HIP_MEMCPY_HOST_TO_DEVICE)?;
        self.stream.synchronize()
    }

    unsafe fn copy_to_host(&self, dst: *mut u8, src: DevicePtr, size: usize) -> BackendResult<()> {
        self.memcpy_async(dst.cast(), src.as_ptr(), size, ffi::HIP_MEMCPY_DEVICE_TO_HOST)?;
        self.stream.synchronize()
    }

    unsafe fn enqueue_copy_to_device(
        &self,
        queue: usize,
        dst: DevicePtr,
        src: *const u8,
        size: usize,
    ) -> BackendResult<()> {
        self.set_active_queue(queue)?;
        self.memcpy_async(dst.as_ptr(), src.cast(), size, ffi::HIP_MEMCPY_HOST_TO_DEVICE)
    }

    fn query_device(&self) -> BackendResult<DeviceInfo> {
        device::query(self.device_id)
    }

    fn register_programs(&self) -> BackendResult<ProgramHandle> {
        let program = match &self.program {
            Some(program) => program,
            None => {
                tracing::debug!("HipBackend: no code object configured");
                return Ok(ProgramHandle::new(0, Vec::new()));
            }
        };

        activate(self.device_id)?;
        let module = HipModule::load(&program.path)?;
        for kernel in &program.kernels {
            module.resolve(kernel)?;
        }

        let mut modules = self.modules.lock()?;
        modules.push(module);
        Ok(ProgramHandle::new(modules.len() as u64, program.kernels.clone()))
    }

    fn create_queue(&self) -> BackendResult<usize> {
        Err(BackendError::Unsupported(
            "the HIP backend drives a single stream".to_string(),
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
                "queue {} does not exist on a single-stream device",
                queue
            )))
        }
    }

    fn finish_queue(&self, queue: usize) -> BackendResult<()> {
        self.set_active_queue(queue)?;
        self.stream.synchronize()
    }

    fn extensions_len(&self) -> BackendResult<usize> {
        Ok(0)
    }

    fn read_extensions(&self, _max_len: usize) -> BackendResult<String> {
        Ok(String::new())
    }
}
