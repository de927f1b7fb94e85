//! Lazily synchronized host/device buffer
//!
//! A [`SyncedMemory`] holds at most one host and one device buffer of a fixed
//! byte size and remembers which side holds the authoritative bytes. Nothing
//! is allocated until a side is first requested, and bytes only cross
//! between address spaces when the stale side is read.
//!
//! | head          | read host             | read device           | write X          |
//! |---------------|-----------------------|-----------------------|------------------|
//! | Uninitialized | alloc host → AtHost   | alloc device → AtDevice | alloc X → AtX  |
//! | HeadAtHost    | no-op                 | copy h→d → Synced     | sync X, → AtX    |
//! | HeadAtDevice  | copy d→h → Synced     | no-op                 | sync X, → AtX    |
//! | Synced        | no-op                 | no-op                 | → AtX            |
//!
//! Writes invalidate the other side eagerly; it is re-synced lazily on its
//! next read.

use std::fmt;

use crate::backend::{DevicePtr, HostPtr};
use crate::device::{DeviceContext, DeviceHandle};
use crate::error::{fatal, MemError, MemResult};

/// Which side(s) hold valid, up-to-date data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncedHead {
    /// Nothing allocated or written yet
    Uninitialized,
    /// Host copy is authoritative
    HeadAtHost,
    /// Device copy is authoritative
    HeadAtDevice,
    /// Both copies allocated and identical
    Synced,
}

impl fmt::Display for SyncedHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncedHead::Uninitialized => write!(f, "uninitialized"),
            SyncedHead::HeadAtHost => write!(f, "head_at_host"),
            SyncedHead::HeadAtDevice => write!(f, "head_at_device"),
            SyncedHead::Synced => write!(f, "synced"),
        }
    }
}

/// Host/device buffer pair with lazy, copy-minimizing synchronization.
///
/// Ownership is tracked per side: a buffer installed with
/// [`set_cpu_data`](Self::set_cpu_data) or [`set_gpu_data`](Self::set_gpu_data)
/// is never freed by this instance, while buffers it allocated itself are
/// freed on drop through the same backend that allocated them.
pub struct SyncedMemory {
    cpu_ptr: Option<HostPtr>,
    gpu_ptr: Option<DevicePtr>,
    size: usize,
    head: SyncedHead,
    own_cpu_data: bool,
    own_gpu_data: bool,
    device: DeviceHandle,
}

impl SyncedMemory {
    /// Buffer of `size` bytes bound to `context`; nothing is allocated yet
    pub fn new(size: usize, context: &DeviceContext) -> Self {
        Self::with_handle(size, context.handle())
    }

    /// Zero-sized buffer bound to `context`
    pub fn empty(context: &DeviceContext) -> Self {
        Self::new(0, context)
    }

    pub(crate) fn with_handle(size: usize, device: DeviceHandle) -> Self {
        SyncedMemory {
            cpu_ptr: None,
            gpu_ptr: None,
            size,
            head: SyncedHead::Uninitialized,
            own_cpu_data: false,
            own_gpu_data: false,
            device,
        }
    }

    pub fn head(&self) -> SyncedHead {
        self.head
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Current host pointer, without triggering synchronization
    pub fn host_ptr(&self) -> Option<HostPtr> {
        self.cpu_ptr
    }

    /// Current device pointer, without triggering synchronization
    pub fn device_ptr(&self) -> Option<DevicePtr> {
        self.gpu_ptr
    }

    pub fn owns_cpu_data(&self) -> bool {
        self.own_cpu_data
    }

    pub fn owns_gpu_data(&self) -> bool {
        self.own_gpu_data
    }

    /// Handle of the device this buffer allocates and copies through
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    // ---- host side -------------------------------------------------------

    /// Read-only host view; copies from the device if it holds the only valid data
    pub fn cpu_data(&mut self) -> &[u8] {
        if let Err(e) = self.to_cpu() {
            fatal(e);
        }
        self.host_slice()
    }

    pub fn try_cpu_data(&mut self) -> MemResult<&[u8]> {
        self.to_cpu()?;
        Ok(self.host_slice())
    }

    /// Writable host view; the host becomes the sole authoritative copy
    pub fn mutable_cpu_data(&mut self) -> &mut [u8] {
        if let Err(e) = self.to_cpu() {
            fatal(e);
        }
        self.head = SyncedHead::HeadAtHost;
        self.host_slice_mut()
    }

    pub fn try_mutable_cpu_data(&mut self) -> MemResult<&mut [u8]> {
        self.to_cpu()?;
        self.head = SyncedHead::HeadAtHost;
        Ok(self.host_slice_mut())
    }

    /// Install an externally owned host buffer.
    ///
    /// Any host buffer this instance owns is freed first. The head moves to
    /// the host: whatever was on the device is considered stale.
    ///
    /// # Safety
    /// `data` must be valid for reads and writes of [`size`](Self::size) bytes
    /// for as long as it stays installed, and must not be accessed through
    /// other references while this instance hands out views of it.
    pub unsafe fn set_cpu_data(&mut self, data: HostPtr) {
        self.release_host();
        self.cpu_ptr = Some(data);
        self.own_cpu_data = false;
        self.head = SyncedHead::HeadAtHost;
    }

    // ---- device side -----------------------------------------------------

    /// Device pointer to current data; copies from the host if it holds the only valid data
    pub fn gpu_data(&mut self) -> DevicePtr {
        match self.try_gpu_data() {
            Ok(ptr) => ptr,
            Err(e) => fatal(e),
        }
    }

    pub fn try_gpu_data(&mut self) -> MemResult<DevicePtr> {
        self.to_gpu()?;
        self.device_ptr_checked()
    }

    /// Device pointer for writing; the device becomes the sole authoritative copy
    pub fn mutable_gpu_data(&mut self) -> DevicePtr {
        match self.try_mutable_gpu_data() {
            Ok(ptr) => ptr,
            Err(e) => fatal(e),
        }
    }

    pub fn try_mutable_gpu_data(&mut self) -> MemResult<DevicePtr> {
        self.to_gpu()?;
        self.head = SyncedHead::HeadAtDevice;
        self.device_ptr_checked()
    }

    /// Install an externally owned device buffer.
    ///
    /// Any device buffer this instance owns is freed first. The head moves
    /// to the device: whatever was on the host is considered stale.
    ///
    /// # Safety
    /// `data` must be a device allocation of the bound backend covering
    /// [`size`](Self::size) bytes for as long as it stays installed.
    pub unsafe fn set_gpu_data(&mut self, data: DevicePtr) {
        self.release_device();
        self.gpu_ptr = Some(data);
        self.own_gpu_data = false;
        self.head = SyncedHead::HeadAtDevice;
    }

    /// Start a host→device copy on `queue` without waiting for it.
    ///
    /// Only valid while the host holds the authoritative data. The head is
    /// marked synced immediately; the device bytes are only guaranteed to be
    /// in place once the queue has drained (`finish_queues`, or a blocking
    /// copy on the same queue).
    pub fn async_gpu_push(&mut self, queue: usize) {
        if let Err(e) = self.try_async_gpu_push(queue) {
            fatal(e);
        }
    }

    pub fn try_async_gpu_push(&mut self, queue: usize) -> MemResult<()> {
        if self.head != SyncedHead::HeadAtHost {
            return Err(MemError::InvalidState(format!(
                "async push requires head_at_host, buffer is {}",
                self.head
            )));
        }
        let src = self.host_ptr_checked()?;
        let dst = match self.gpu_ptr {
            Some(ptr) => ptr,
            None => self.allocate_device()?,
        };

        // SAFETY: both buffers cover `size` bytes; the backend stages or
        // enqueues the copy and does not retain `src`'s borrow
        unsafe {
            self.device
                .backend()
                .enqueue_copy_to_device(queue, dst, src.as_ptr(), self.size)?;
        }
        self.device.usage().record_async_push(self.size);
        tracing::trace!("SyncedMemory: async push of {} bytes on queue {}", self.size, queue);
        self.head = SyncedHead::Synced;
        Ok(())
    }

    // ---- transitions -----------------------------------------------------

    fn to_cpu(&mut self) -> MemResult<()> {
        match self.head {
            SyncedHead::Uninitialized => {
                self.allocate_host()?;
                self.head = SyncedHead::HeadAtHost;
            }
            SyncedHead::HeadAtDevice => {
                let dst = match self.cpu_ptr {
                    Some(ptr) => ptr,
                    None => self.allocate_host()?,
                };
                let src = self.device_ptr_checked()?;
                // SAFETY: both buffers cover `size` bytes
                unsafe {
                    self.device
                        .backend()
                        .copy_to_host(dst.as_ptr(), src, self.size)?;
                }
                self.device.usage().record_to_host(self.size);
                tracing::trace!("SyncedMemory: copied {} bytes device→host", self.size);
                self.head = SyncedHead::Synced;
            }
            SyncedHead::HeadAtHost | SyncedHead::Synced => {}
        }
        Ok(())
    }

    fn to_gpu(&mut self) -> MemResult<()> {
        match self.head {
            SyncedHead::Uninitialized => {
                self.allocate_device()?;
                self.head = SyncedHead::HeadAtDevice;
            }
            SyncedHead::HeadAtHost => {
                let dst = match self.gpu_ptr {
                    Some(ptr) => ptr,
                    None => self.allocate_device()?,
                };
                let src = self.host_ptr_checked()?;
                // SAFETY: both buffers cover `size` bytes
                unsafe {
                    self.device
                        .backend()
                        .copy_to_device(dst, src.as_ptr(), self.size)?;
                }
                self.device.usage().record_to_device(self.size);
                tracing::trace!("SyncedMemory: copied {} bytes host→device", self.size);
                self.head = SyncedHead::Synced;
            }
            SyncedHead::HeadAtDevice | SyncedHead::Synced => {}
        }
        Ok(())
    }

    // ---- allocation ------------------------------------------------------

    fn allocate_host(&mut self) -> MemResult<HostPtr> {
        let ptr = self.device.backend().allocate_host(self.size)?;
        self.cpu_ptr = Some(ptr);
        self.own_cpu_data = true;
        Ok(ptr)
    }

    fn allocate_device(&mut self) -> MemResult<DevicePtr> {
        let ptr = self.device.backend().allocate_device(self.size)?;
        self.device.usage().increase(self.size);
        self.gpu_ptr = Some(ptr);
        self.own_gpu_data = true;
        Ok(ptr)
    }

    fn release_host(&mut self) {
        if let Some(ptr) = self.cpu_ptr.take() {
            if self.own_cpu_data {
                // SAFETY: we allocated `ptr` with this backend and this size
                if let Err(e) = unsafe { self.device.backend().free_host(ptr, self.size) } {
                    tracing::error!("SyncedMemory: failed to free host buffer {:?}: {}", ptr, e);
                }
            }
        }
        self.own_cpu_data = false;
    }

    fn release_device(&mut self) {
        if let Some(ptr) = self.gpu_ptr.take() {
            if self.own_gpu_data {
                // SAFETY: we allocated `ptr` with this backend and this size
                match unsafe { self.device.backend().free_device(ptr, self.size) } {
                    Ok(()) => self.device.usage().decrease(self.size),
                    Err(e) => {
                        tracing::error!("SyncedMemory: failed to free device buffer {:?}: {}", ptr, e)
                    }
                }
            }
        }
        self.own_gpu_data = false;
    }

    // ---- views -----------------------------------------------------------

    fn host_ptr_checked(&self) -> MemResult<HostPtr> {
        self.cpu_ptr.ok_or_else(|| {
            MemError::Internal(format!("head is {} but no host buffer is present", self.head))
        })
    }

    fn device_ptr_checked(&self) -> MemResult<DevicePtr> {
        self.gpu_ptr.ok_or_else(|| {
            MemError::Internal(format!("head is {} but no device buffer is present", self.head))
        })
    }

    fn host_slice(&self) -> &[u8] {
        match self.cpu_ptr {
            // SAFETY: the host buffer covers `size` initialized bytes
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.size) },
            None => &[],
        }
    }

    fn host_slice_mut(&mut self) -> &mut [u8] {
        match self.cpu_ptr {
            // SAFETY: the host buffer covers `size` bytes and `&mut self`
            // guarantees no other view is alive
            Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size) },
            None => &mut [],
        }
    }
}

impl fmt::Debug for SyncedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncedMemory")
            .field("size", &self.size)
            .field("head", &self.head)
            .field("cpu_ptr", &self.cpu_ptr)
            .field("gpu_ptr", &self.gpu_ptr)
            .field("own_cpu_data", &self.own_cpu_data)
            .field("own_gpu_data", &self.own_gpu_data)
            .field("device", &self.device.id())
            .finish()
    }
}

impl Drop for SyncedMemory {
    fn drop(&mut self) {
        self.release_host();
        self.release_device();
    }
}
