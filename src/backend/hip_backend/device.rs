//! Device discovery and properties

use std::ffi::CStr;

use super::ffi;
use crate::backend::{BackendError, BackendResult, DeviceInfo};

/// `hipDeviceProp_t` as an opaque, correctly sized buffer.
///
/// The runtime writes the full C struct, so the buffer must match
/// `sizeof(hipDeviceProp_t)` (1472 bytes on ROCm 6/7). Fields are read at
/// fixed offsets instead of mirroring the whole layout.
#[repr(C)]
#[derive(Clone)]
pub struct HipDeviceProp {
    buffer: [u8; 1472],
}

impl HipDeviceProp {
    const NAME_OFFSET: usize = 0;
    const NAME_LEN: usize = 256;
    const TOTAL_GLOBAL_MEM_OFFSET: usize = 288;
    const MAX_THREADS_DIM_OFFSET: usize = 324;
    const MULTI_PROCESSOR_COUNT_OFFSET: usize = 388;

    pub fn name(&self) -> String {
        let bytes = &self.buffer[Self::NAME_OFFSET..Self::NAME_OFFSET + Self::NAME_LEN];
        let len = bytes.iter().position(|&c| c == 0).unwrap_or(Self::NAME_LEN);
        String::from_utf8_lossy(&bytes[..len]).into_owned()
    }

    pub fn total_global_mem(&self) -> usize {
        self.read_u64(Self::TOTAL_GLOBAL_MEM_OFFSET) as usize
    }

    /// Maximum threads per block along x, y and z
    pub fn max_threads_dim(&self) -> [usize; 3] {
        let mut dims = [0usize; 3];
        for (i, dim) in dims.iter_mut().enumerate() {
            *dim = self.read_i32(Self::MAX_THREADS_DIM_OFFSET + i * 4).max(0) as usize;
        }
        dims
    }

    pub fn multi_processor_count(&self) -> usize {
        self.read_i32(Self::MULTI_PROCESSOR_COUNT_OFFSET).max(0) as usize
    }

    fn read_i32(&self, offset: usize) -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buffer[offset..offset + 4]);
        i32::from_ne_bytes(bytes)
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buffer[offset..offset + 8]);
        u64::from_ne_bytes(bytes)
    }
}

impl Default for HipDeviceProp {
    fn default() -> Self {
        HipDeviceProp { buffer: [0u8; 1472] }
    }
}

impl std::fmt::Debug for HipDeviceProp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HipDeviceProp")
            .field("name", &self.name())
            .field("total_global_mem", &self.total_global_mem())
            .field("max_threads_dim", &self.max_threads_dim())
            .finish()
    }
}

/// Runtime description of a HIP error code
pub fn error_string(code: i32) -> String {
    // SAFETY: the runtime returns a static, NUL-terminated string or null
    unsafe {
        let ptr = ffi::hipGetErrorString(code);
        if ptr.is_null() {
            format!("HIP error {}", code)
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

/// Turn a HIP status code into a backend error built by `make`
pub(super) fn check(code: i32, make: impl FnOnce(String) -> BackendError) -> BackendResult<()> {
    if code == ffi::HIP_SUCCESS {
        Ok(())
    } else {
        Err(make(format!("{} ({})", error_string(code), code)))
    }
}

/// Number of visible HIP devices; 0 if the runtime cannot be initialized
pub fn device_count() -> usize {
    let mut count: i32 = 0;
    // SAFETY: plain runtime calls with a valid out-pointer
    let ok = unsafe {
        ffi::hipInit(0) == ffi::HIP_SUCCESS
            && ffi::hipGetDeviceCount(&mut count) == ffi::HIP_SUCCESS
    };
    if ok {
        count.max(0) as usize
    } else {
        0
    }
}

/// Properties of `device_id`, converted to the backend-neutral description
pub fn query(device_id: i32) -> BackendResult<DeviceInfo> {
    let mut props = HipDeviceProp::default();
    // SAFETY: `props` is exactly sizeof(hipDeviceProp_t)
    let code = unsafe { ffi::hipGetDeviceProperties(&mut props, device_id) };
    check(code, |msg| {
        BackendError::QueryFailed(format!("hipGetDeviceProperties({}): {}", device_id, msg))
    })?;
    tracing::debug!("HIP device {}: {:?}", device_id, props);
    Ok(DeviceInfo {
        name: props.name(),
        max_work_item_sizes: props.max_threads_dim(),
        compute_units: props.multi_processor_count(),
        total_memory: props.total_global_mem(),
    })
}
