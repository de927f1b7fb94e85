//! Device backends
//!
//! A [`DeviceBackend`] owns everything that differs between device families:
//! how host and device memory are allocated and freed, how bytes move
//! between the two address spaces, how command queues are created and
//! drained, and how the device describes itself. Backend selection happens
//! once, when a [`DeviceContext`](crate::device::DeviceContext) is built.

pub mod cpu;
pub mod emulated;
pub mod error;
#[cfg(feature = "rocm")]
pub mod hip_backend;

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use cpu::CpuBackend;
pub use emulated::{AllocationStats, EmulatedAccelerator, EmulatedConfig};
pub use error::{BackendError, BackendResult};
#[cfg(feature = "rocm")]
pub use hip_backend::HipBackend;

use crate::memory::host;

/// Number of command queues of a single-queue accelerator
pub const SINGLE_QUEUE_COUNT: usize = 1;

/// Number of command queues a multi-queue accelerator creates at init
pub const MULTI_QUEUE_COUNT: usize = 8;

/// Device family, determining queue and capability behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Host only; device allocations live in host memory
    #[default]
    Cpu,
    /// Accelerator driven through exactly one in-order queue
    SingleQueue,
    /// Accelerator with several independent in-order queues
    MultiQueue,
}

impl Backend {
    /// Whether this backend has a separate device address space
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Backend::Cpu)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cpu => write!(f, "cpu"),
            Backend::SingleQueue => write!(f, "single_queue"),
            Backend::MultiQueue => write!(f, "multi_queue"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" | "host" => Ok(Backend::Cpu),
            "single" | "single_queue" | "cuda" | "hip" => Ok(Backend::SingleQueue),
            "multi" | "multi_queue" | "opencl" => Ok(Backend::MultiQueue),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Host memory address handed out by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostPtr(NonNull<u8>);

/// Device memory address handed out by a backend
///
/// Opaque on the host: it may only be passed back to the backend that
/// produced it (or to kernels running on that device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(NonNull<c_void>);

// SAFETY: both are plain addresses. Dereferencing requires unsafe code that
// upholds the aliasing rules, so moving the address between threads is sound.
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}
unsafe impl Send for DevicePtr {}
unsafe impl Sync for DevicePtr {}

impl HostPtr {
    /// Wrap a raw host pointer, `None` if null
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(HostPtr)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl DevicePtr {
    /// Wrap a raw device pointer, `None` if null
    pub fn new(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(DevicePtr)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }

    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }
}

/// Result of a device query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    /// Maximum work-item extent per dimension
    pub max_work_item_sizes: [usize; 3],
    pub compute_units: usize,
    pub total_memory: usize,
}

/// Opaque handle for the device programs registered at init
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramHandle {
    id: u64,
    kernels: Vec<String>,
}

impl ProgramHandle {
    pub fn new(id: u64, kernels: Vec<String>) -> Self {
        ProgramHandle { id, kernels }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Names of the kernels the program exposes
    pub fn kernels(&self) -> &[String] {
        &self.kernels
    }

    pub fn has_kernel(&self, name: &str) -> bool {
        self.kernels.iter().any(|k| k == name)
    }
}

/// Allocation, copy, queue and query primitives of one device family.
///
/// Copies take raw host pointers because the host side may be memory the
/// backend did not allocate (installed by a caller). All pointer-taking
/// methods are `unsafe`: the caller guarantees the pointers are live and
/// cover `size` bytes.
pub trait DeviceBackend: fmt::Debug + Send + Sync {
    /// Device family of this backend
    fn kind(&self) -> Backend;

    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Allocate `size` bytes of host memory suitable for transfers.
    ///
    /// Defaults to page-aligned pageable memory; native accelerators override
    /// this with pinned memory.
    fn allocate_host(&self, size: usize) -> BackendResult<HostPtr> {
        host::allocate(size)
    }

    /// Free host memory obtained from [`allocate_host`](Self::allocate_host)
    ///
    /// # Safety
    /// `ptr` must come from `allocate_host` on this backend with the same `size`.
    unsafe fn free_host(&self, ptr: HostPtr, size: usize) -> BackendResult<()> {
        host::free(ptr, size);
        Ok(())
    }

    /// Allocate `size` bytes of device memory
    fn allocate_device(&self, size: usize) -> BackendResult<DevicePtr>;

    /// Free device memory
    ///
    /// # Safety
    /// `ptr` must come from `allocate_device` on this backend with the same `size`.
    unsafe fn free_device(&self, ptr: DevicePtr, size: usize) -> BackendResult<()>;

    /// Blocking host→device copy on the active queue
    ///
    /// # Safety
    /// `src` must be readable for `size` bytes and `dst` must cover `size` bytes.
    unsafe fn copy_to_device(&self, dst: DevicePtr, src: *const u8, size: usize)
        -> BackendResult<()>;

    /// Blocking device→host copy on the active queue
    ///
    /// # Safety
    /// `dst` must be writable for `size` bytes and `src` must cover `size` bytes.
    unsafe fn copy_to_host(&self, dst: *mut u8, src: DevicePtr, size: usize)
        -> BackendResult<()>;

    /// Enqueue a host→device copy on `queue` and return without waiting
    ///
    /// # Safety
    /// Same as [`copy_to_device`](Self::copy_to_device).
    unsafe fn enqueue_copy_to_device(
        &self,
        queue: usize,
        dst: DevicePtr,
        src: *const u8,
        size: usize,
    ) -> BackendResult<()>;

    /// Query work-item limits and identity of the device
    fn query_device(&self) -> BackendResult<DeviceInfo>;

    /// Compile/load the device programs; the backend retains them
    fn register_programs(&self) -> BackendResult<ProgramHandle>;

    /// Create one more command queue, returning the new queue count
    fn create_queue(&self) -> BackendResult<usize>;

    /// Number of queues currently created
    fn queue_count(&self) -> usize;

    /// Make `queue` the target of subsequent blocking copies
    fn set_active_queue(&self, queue: usize) -> BackendResult<()>;

    /// Block until `queue` has no pending work
    fn finish_queue(&self, queue: usize) -> BackendResult<()>;

    /// Length of the extension string as reported by the driver
    fn extensions_len(&self) -> BackendResult<usize>;

    /// Read at most `max_len` bytes of the extension string
    fn read_extensions(&self, max_len: usize) -> BackendResult<String>;
}
