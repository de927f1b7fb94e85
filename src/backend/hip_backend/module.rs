//! Loaded HIP code objects

use std::ffi::{c_void, CString};
use std::path::Path;
use std::ptr;

use super::device::check;
use super::ffi;
use crate::backend::{BackendError, BackendResult};

/// Owned `hipModule_t`; unloaded on drop
#[derive(Debug)]
pub struct HipModule {
    module: *mut c_void,
}

// SAFETY: module handles are process-wide and immutable once loaded
unsafe impl Send for HipModule {}
unsafe impl Sync for HipModule {}

impl HipModule {
    /// Load a code object (`.hsaco`) from disk
    pub fn load(path: &Path) -> BackendResult<Self> {
        let display = path.display().to_string();
        let c_path = CString::new(display.as_str()).map_err(|e| {
            BackendError::ProgramRegistrationFailed(format!("invalid module path '{}': {}", display, e))
        })?;

        let mut module: *mut c_void = ptr::null_mut();
        // SAFETY: valid out-pointer and NUL-terminated path
        let code = unsafe { ffi::hipModuleLoad(&mut module, c_path.as_ptr()) };
        check(code, |msg| {
            BackendError::ProgramRegistrationFailed(format!("hipModuleLoad('{}'): {}", display, msg))
        })?;
        tracing::debug!("HipModule: loaded '{}'", display);
        Ok(HipModule { module })
    }

    /// Whether the module exports a kernel called `name`
    pub fn resolve(&self, name: &str) -> BackendResult<()> {
        let c_name = CString::new(name).map_err(|e| {
            BackendError::ProgramRegistrationFailed(format!("invalid kernel name '{}': {}", name, e))
        })?;
        let mut func: *mut c_void = ptr::null_mut();
        // SAFETY: live module, valid out-pointer and NUL-terminated name
        let code = unsafe { ffi::hipModuleGetFunction(&mut func, self.module, c_name.as_ptr()) };
        check(code, |msg| {
            BackendError::ProgramRegistrationFailed(format!("kernel '{}': {}", name, msg))
        })
    }
}

impl Drop for HipModule {
    fn drop(&mut self) {
        // SAFETY: loaded by hipModuleLoad and unloaded once
        let code = unsafe { ffi::hipModuleUnload(self.module) };
        if code != ffi::HIP_SUCCESS {
            tracing::warn!("HipModule: hipModuleUnload failed with code {}", code);
        }
    }
}
