//! Host memory, accounting, and host/device synchronized buffers

pub mod host;
pub mod synced;
pub mod usage;

pub use host::{HOST_CACHE_ALIGN, HOST_PAGE_ALIGN};
pub use synced::{SyncedHead, SyncedMemory};
pub use usage::{MemoryUsage, TransferStats};
