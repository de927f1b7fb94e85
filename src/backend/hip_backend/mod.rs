//! ROCm/HIP backend for AMD GPUs
//!
//! Built only with the `rocm` feature; links against `amdhip64`.

mod backend;
mod device;
mod ffi;
mod module;
mod stream;

pub use backend::{HipBackend, HipProgram};
pub use device::{device_count, error_string, HipDeviceProp};
pub use module::HipModule;
pub use stream::HipStream;
