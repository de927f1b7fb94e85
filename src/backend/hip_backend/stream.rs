//! HIP stream wrapper

use std::ffi::c_void;
use std::ptr;

use super::device::check;
use super::ffi;
use crate::backend::{BackendError, BackendResult};

/// Owned `hipStream_t`; destroyed on drop
#[derive(Debug)]
pub struct HipStream {
    stream: *mut c_void,
}

// SAFETY: a HIP stream handle may be used from any host thread; the runtime
// serializes work submitted to it
unsafe impl Send for HipStream {}
unsafe impl Sync for HipStream {}

impl HipStream {
    pub fn new() -> BackendResult<Self> {
        let mut stream: *mut c_void = ptr::null_mut();
        // SAFETY: valid out-pointer
        let code = unsafe { ffi::hipStreamCreate(&mut stream) };
        check(code, |msg| BackendError::QueueError(format!("hipStreamCreate: {}", msg)))?;
        if stream.is_null() {
            return Err(BackendError::QueueError(
                "hipStreamCreate returned a null stream".to_string(),
            ));
        }
        tracing::debug!("HipStream::new: created stream {:?}", stream);
        Ok(HipStream { stream })
    }

    /// Block until all work queued on the stream has completed
    pub fn synchronize(&self) -> BackendResult<()> {
        // SAFETY: `stream` is a live stream owned by self
        let code = unsafe { ffi::hipStreamSynchronize(self.stream) };
        check(code, |msg| {
            BackendError::QueueError(format!("hipStreamSynchronize: {}", msg))
        })
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.stream
    }
}

impl Drop for HipStream {
    fn drop(&mut self) {
        // SAFETY: `stream` was created by hipStreamCreate and is destroyed once
        let code = unsafe { ffi::hipStreamDestroy(self.stream) };
        if code != ffi::HIP_SUCCESS {
            tracing::warn!("HipStream: hipStreamDestroy failed with code {}", code);
        }
    }
}
