//! forgemem - host/accelerator memory synchronization
//!
//! [`SyncedMemory`] keeps one host and one device copy of a buffer and moves
//! bytes between them only when the stale side is read. Each buffer is bound
//! to a [`DeviceContext`], which selects a [`DeviceBackend`] (CPU, a
//! single-queue accelerator or a multi-queue accelerator), tracks queue state
//! and memory usage, and hands out pooled scratch buffers.
//!
//! ```
//! use forgemem::{DeviceContext, SyncedHead, SyncedMemory};
//!
//! let context = DeviceContext::cpu();
//! let mut data = SyncedMemory::new(16, &context);
//! data.mutable_cpu_data().fill(1);
//! assert_eq!(data.head(), SyncedHead::HeadAtHost);
//! ```

pub mod backend;
pub mod device;
pub mod error;
pub mod logging;
pub mod memory;

pub use backend::{
    Backend, BackendError, CpuBackend, DeviceBackend, DeviceInfo, DevicePtr, EmulatedAccelerator,
    EmulatedConfig, HostPtr, ProgramHandle, MULTI_QUEUE_COUNT, SINGLE_QUEUE_COUNT,
};
#[cfg(feature = "rocm")]
pub use backend::HipBackend;
pub use device::{
    DeviceConfig, DeviceContext, DeviceHandle, Element, ScratchBuffer, SharedBuffer,
    MAX_EXTENSIONS_QUERY,
};
pub use error::{fatal, ErrorCategory, MemError, MemResult};
pub use logging::{init_logging_default, init_logging_from_env, init_with_config, LoggingConfig};
pub use memory::{MemoryUsage, SyncedHead, SyncedMemory, TransferStats};
