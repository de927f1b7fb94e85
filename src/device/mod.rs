//! Per-device execution contexts
//!
//! A [`DeviceContext`] identifies one physical device and its backend, tracks
//! queue state and memory accounting, and owns the typed scratch-buffer pool.
//! Buffers bound to a context keep only its [`DeviceHandle`], so they may
//! outlive the context without keeping the pool alive.

pub mod config;
pub mod context;
pub mod handle;
pub mod pool;

pub use config::DeviceConfig;
pub use context::{DeviceContext, MAX_EXTENSIONS_QUERY};
pub use handle::DeviceHandle;
pub use pool::{BufferPool, Element, ScratchBuffer, SharedBuffer};
