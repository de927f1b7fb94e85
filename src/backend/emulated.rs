//! In-process accelerator
//!
//! Emulates a device with its own allocation table and in-order command
//! queues, without touching a GPU. Device memory is host memory owned by the
//! emulator; every allocation and free is checked against the table, so the
//! emulator doubles as an allocation tracker (leaks, double frees, frees of
//! foreign pointers).
//!
//! Asynchronous writes are staged: the source bytes are captured when the
//! write is enqueued and land in device memory when the queue drains, either
//! through [`finish_queue`](DeviceBackend::finish_queue) or because a
//! blocking copy is issued on the same queue.

use std::alloc::{self, Layout};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ptr;
use std::sync::Mutex;

use super::{
    Backend, BackendError, BackendResult, DeviceBackend, DeviceInfo, DevicePtr, HostPtr,
    ProgramHandle, MULTI_QUEUE_COUNT,
};
use crate::memory::host;

/// Alignment of emulated device allocations
pub const EMULATED_DEVICE_ALIGN: usize = 256;

/// Device description and behavior knobs of an [`EmulatedAccelerator`]
#[derive(Debug, Clone)]
pub struct EmulatedConfig {
    pub name: String,
    pub kind: Backend,
    /// Reported maximum work-item extent per dimension
    pub max_work_item_sizes: [usize; 3],
    pub compute_units: usize,
    /// Device memory capacity; allocations beyond it fail
    pub total_memory: usize,
    /// Space-separated extension names
    pub extensions: String,
    /// Length the "driver" claims for the extension string, if it lies
    pub reported_extensions_len: Option<usize>,
    /// Kernels exposed by the registered program
    pub kernels: Vec<String>,
    /// Make `query_device` fail, as a broken driver would
    pub fail_query: bool,
    /// Make the extension-string queries fail
    pub fail_extensions: bool,
    /// Upper bound on queues a multi-queue device accepts
    pub max_queues: usize,
}

impl Default for EmulatedConfig {
    fn default() -> Self {
        EmulatedConfig {
            name: "emulated-accelerator".to_string(),
            kind: Backend::SingleQueue,
            max_work_item_sizes: [1024, 1024, 64],
            compute_units: 32,
            total_memory: 256 * 1024 * 1024,
            extensions: "cl_khr_fp64 cl_khr_int64_base_atomics cl_khr_global_int32_base_atomics"
                .to_string(),
            reported_extensions_len: None,
            kernels: vec!["fill".to_string(), "axpy".to_string(), "im2col".to_string()],
            fail_query: false,
            fail_extensions: false,
            max_queues: MULTI_QUEUE_COUNT,
        }
    }
}

impl EmulatedConfig {
    /// Accelerator with a single in-order queue
    pub fn single_queue() -> Self {
        Self::default()
    }

    /// Accelerator accepting up to [`MULTI_QUEUE_COUNT`] queues
    pub fn multi_queue() -> Self {
        EmulatedConfig {
            kind: Backend::MultiQueue,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_work_item_sizes(mut self, sizes: [usize; 3]) -> Self {
        self.max_work_item_sizes = sizes;
        self
    }

    pub fn with_total_memory(mut self, bytes: usize) -> Self {
        self.total_memory = bytes;
        self
    }

    pub fn with_extensions(mut self, extensions: &str) -> Self {
        self.extensions = extensions.to_string();
        self
    }

    pub fn with_reported_extensions_len(mut self, len: usize) -> Self {
        self.reported_extensions_len = Some(len);
        self
    }

    pub fn with_kernels(mut self, kernels: &[&str]) -> Self {
        self.kernels = kernels.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_failing_query(mut self) -> Self {
        self.fail_query = true;
        self
    }

    pub fn with_failing_extensions(mut self) -> Self {
        self.fail_extensions = true;
        self
    }

    pub fn with_max_queues(mut self, max_queues: usize) -> Self {
        self.max_queues = max_queues;
        self
    }
}

/// Allocation bookkeeping of an [`EmulatedAccelerator`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AllocationStats {
    pub host_allocations: usize,
    pub host_frees: usize,
    pub device_allocations: usize,
    pub device_frees: usize,
    /// Frees of pointers that were not live (double or foreign frees)
    pub invalid_frees: usize,
    pub live_device_bytes: usize,
    pub live_host_bytes: usize,
}

impl AllocationStats {
    pub fn live_device_allocations(&self) -> usize {
        self.device_allocations - self.device_frees
    }

    pub fn live_host_allocations(&self) -> usize {
        self.host_allocations - self.host_frees
    }
}

#[derive(Debug)]
struct StagedWrite {
    dst: usize,
    /// Generation of the allocation the write was staged against
    generation: u64,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct DeviceAllocation {
    layout: Layout,
    generation: u64,
}

#[derive(Debug, Default)]
struct CommandQueue {
    pending: VecDeque<StagedWrite>,
    completed: u64,
}

#[derive(Debug)]
struct EmulatedState {
    /// base address -> live allocation
    device_allocations: BTreeMap<usize, DeviceAllocation>,
    next_generation: u64,
    /// base address -> requested size
    host_allocations: HashMap<usize, usize>,
    queues: Vec<CommandQueue>,
    active_queue: usize,
    programs_registered: u64,
    stats: AllocationStats,
}

impl EmulatedState {
    /// Check that `[addr, addr + size)` lies inside one live device allocation,
    /// returning that allocation's generation
    fn check_device_range(&self, addr: usize, size: usize) -> BackendResult<u64> {
        let (&base, allocation) = self
            .device_allocations
            .range(..=addr)
            .next_back()
            .ok_or(BackendError::InvalidPointer(addr))?;
        let end = addr.checked_add(size).ok_or(BackendError::InvalidPointer(addr))?;
        if end > base + allocation.layout.size() {
            return Err(BackendError::CopyFailed(format!(
                "copy of {} bytes at 0x{:x} overruns allocation 0x{:x} of {} bytes",
                size,
                addr,
                base,
                allocation.layout.size()
            )));
        }
        Ok(allocation.generation)
    }

    fn drain_queue(&mut self, queue: usize) -> BackendResult<usize> {
        let pending: Vec<StagedWrite> = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BackendError::QueueError(format!("queue {} does not exist", queue)))?
            .pending
            .drain(..)
            .collect();

        let mut applied = 0;
        for write in pending {
            match self.check_device_range(write.dst, write.data.len()) {
                Ok(generation) if generation == write.generation => {}
                Ok(_) => {
                    tracing::warn!(
                        "dropping staged write to 0x{:x}: target was freed and the address reused",
                        write.dst
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!("dropping staged write to freed memory: {}", e);
                    continue;
                }
            }
            // SAFETY: destination range checked against the live allocation table
            unsafe {
                ptr::copy_nonoverlapping(write.data.as_ptr(), write.dst as *mut u8, write.data.len());
            }
            applied += 1;
        }
        self.queues[queue].completed += applied as u64;
        Ok(applied)
    }
}

/// Accelerator emulated in host memory
#[derive(Debug)]
pub struct EmulatedAccelerator {
    config: EmulatedConfig,
    state: Mutex<EmulatedState>,
}

impl EmulatedAccelerator {
    pub fn new(config: EmulatedConfig) -> Self {
        tracing::debug!(
            "EmulatedAccelerator::new: '{}' ({}), work items {:?}",
            config.name,
            config.kind,
            config.max_work_item_sizes
        );
        EmulatedAccelerator {
            config,
            state: Mutex::new(EmulatedState {
                device_allocations: BTreeMap::new(),
                next_generation: 0,
                host_allocations: HashMap::new(),
                queues: vec![CommandQueue::default()],
                active_queue: 0,
                programs_registered: 0,
                stats: AllocationStats::default(),
            }),
        }
    }

    pub fn single_queue() -> Self {
        Self::new(EmulatedConfig::single_queue())
    }

    pub fn multi_queue() -> Self {
        Self::new(EmulatedConfig::multi_queue())
    }

    pub fn config(&self) -> &EmulatedConfig {
        &self.config
    }

    /// Allocation bookkeeping snapshot
    pub fn stats(&self) -> AllocationStats {
        self.state
            .lock()
            .map(|s| s.stats.clone())
            .unwrap_or_default()
    }

    /// Staged writes not yet applied on `queue`
    pub fn pending_writes(&self, queue: usize) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.queues.get(queue).map(|q| q.pending.len()))
            .unwrap_or(0)
    }

    /// Staged writes applied on `queue` so far
    pub fn completed_writes(&self, queue: usize) -> u64 {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.queues.get(queue).map(|q| q.completed))
            .unwrap_or(0)
    }

    pub fn active_queue(&self) -> usize {
        self.state.lock().map(|s| s.active_queue).unwrap_or(0)
    }

    pub fn programs_registered(&self) -> u64 {
        self.state.lock().map(|s| s.programs_registered).unwrap_or(0)
    }

    fn check_extensions_query(&self) -> BackendResult<()> {
        if self.config.fail_extensions {
            return Err(BackendError::QueryFailed(format!(
                "{}: extension query rejected",
                self.config.name
            )));
        }
        Ok(())
    }
}

impl DeviceBackend for EmulatedAccelerator {
    fn kind(&self) -> Backend {
        self.config.kind
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn allocate_host(&self, size: usize) -> BackendResult<HostPtr> {
        let ptr = host::allocate(size)?;
        let mut state = self.state.lock()?;
        state.host_allocations.insert(ptr.addr(), size);
        state.stats.host_allocations += 1;
        state.stats.live_host_bytes += size;
        Ok(ptr)
    }

    unsafe fn free_host(&self, ptr: HostPtr, size: usize) -> BackendResult<()> {
        let mut state = self.state.lock()?;
        match state.host_allocations.remove(&ptr.addr()) {
            Some(recorded) => {
                host::free(ptr, recorded);
                state.stats.host_frees += 1;
                state.stats.live_host_bytes -= recorded;
                if recorded != size {
                    tracing::warn!(
                        "free_host: size mismatch for {:?} (allocated {}, freed {})",
                        ptr,
                        recorded,
                        size
                    );
                }
                Ok(())
            }
            None => {
                state.stats.invalid_frees += 1;
                Err(BackendError::InvalidPointer(ptr.addr()))
            }
        }
    }

    fn allocate_device(&self, size: usize) -> BackendResult<DevicePtr> {
        let mut state = self.state.lock()?;
        if state.stats.live_device_bytes.saturating_add(size) > self.config.total_memory {
            return Err(BackendError::AllocationFailed(format!(
                "{} bytes requested, {} of {} bytes in use",
                size, state.stats.live_device_bytes, self.config.total_memory
            )));
        }

        let layout = Layout::from_size_align(size.max(1), EMULATED_DEVICE_ALIGN)
            .map_err(|e| BackendError::AllocationFailed(e.to_string()))?;
        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = DevicePtr::new(raw.cast()).ok_or_else(|| {
            BackendError::AllocationFailed(format!("out of host memory backing {} bytes", size))
        })?;

        state.next_generation += 1;
        let generation = state.next_generation;
        state
            .device_allocations
            .insert(ptr.addr(), DeviceAllocation { layout, generation });
        state.stats.device_allocations += 1;
        state.stats.live_device_bytes += size;
        tracing::trace!("{}: allocated {} device bytes at {:?}", self.config.name, size, ptr);
        Ok(ptr)
    }

    unsafe fn free_device(&self, ptr: DevicePtr, size: usize) -> BackendResult<()> {
        let mut state = self.state.lock()?;
        match state.device_allocations.remove(&ptr.addr()) {
            Some(allocation) => {
                alloc::dealloc(ptr.as_ptr().cast(), allocation.layout);
                state.stats.device_frees += 1;
                state.stats.live_device_bytes =
                    state.stats.live_device_bytes.saturating_sub(size);
                Ok(())
            }
            None => {
                state.stats.invalid_frees += 1;
                Err(BackendError::InvalidPointer(ptr.addr()))
            }
        }
    }

    unsafe fn copy_to_device(
        &self,
        dst: DevicePtr,
        src: *const u8,
        size: usize,
    ) -> BackendResult<()> {
        let mut state = self.state.lock()?;
        let queue = state.active_queue;
        state.drain_queue(queue)?;
        state.check_device_range(dst.addr(), size)?;
        ptr::copy_nonoverlapping(src, dst.as_ptr().cast::<u8>(), size);
        Ok(())
    }

    unsafe fn copy_to_host(&self, dst: *mut u8, src: DevicePtr, size: usize) -> BackendResult<()> {
        let mut state = self.state.lock()?;
        let queue = state.active_queue;
        state.drain_queue(queue)?;
        state.check_device_range(src.addr(), size)?;
        ptr::copy_nonoverlapping(src.as_ptr().cast::<u8>(), dst, size);
        Ok(())
    }

    unsafe fn enqueue_copy_to_device(
        &self,
        queue: usize,
        dst: DevicePtr,
        src: *const u8,
        size: usize,
    ) -> BackendResult<()> {
        let mut state = self.state.lock()?;
        let generation = state.check_device_range(dst.addr(), size)?;
        let data = std::slice::from_raw_parts(src, size).to_vec();
        state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BackendError::QueueError(format!("queue {} does not exist", queue)))?
            .pending
            .push_back(StagedWrite {
                dst: dst.addr(),
                generation,
                data,
            });
        Ok(())
    }

    fn query_device(&self) -> BackendResult<DeviceInfo> {
        if self.config.fail_query {
            return Err(BackendError::QueryFailed(format!(
                "{}: device info query rejected",
                self.config.name
            )));
        }
        Ok(DeviceInfo {
            name: self.config.name.clone(),
            max_work_item_sizes: self.config.max_work_item_sizes,
            compute_units: self.config.compute_units,
            total_memory: self.config.total_memory,
        })
    }

    fn register_programs(&self) -> BackendResult<ProgramHandle> {
        let mut state = self.state.lock()?;
        state.programs_registered += 1;
        Ok(ProgramHandle::new(
            state.programs_registered,
            self.config.kernels.clone(),
        ))
    }

    fn create_queue(&self) -> BackendResult<usize> {
        if self.config.kind != Backend::MultiQueue {
            return Err(BackendError::Unsupported(format!(
                "{} has a single command queue",
                self.config.name
            )));
        }
        let mut state = self.state.lock()?;
        if state.queues.len() >= self.config.max_queues {
            return Err(BackendError::QueueError(format!(
                "queue limit of {} reached",
                self.config.max_queues
            )));
        }
        state.queues.push(CommandQueue::default());
        Ok(state.queues.len())
    }

    fn queue_count(&self) -> usize {
        self.state.lock().map(|s| s.queues.len()).unwrap_or(1)
    }

    fn set_active_queue(&self, queue: usize) -> BackendResult<()> {
        let mut state = self.state.lock()?;
        if queue >= state.queues.len() {
            return Err(BackendError::QueueError(format!(
                "queue {} does not exist ({} created)",
                queue,
                state.queues.len()
            )));
        }
        state.active_queue = queue;
        Ok(())
    }

    fn finish_queue(&self, queue: usize) -> BackendResult<()> {
        let mut state = self.state.lock()?;
        let applied = state.drain_queue(queue)?;
        tracing::trace!("{}: queue {} drained {} writes", self.config.name, queue, applied);
        Ok(())
    }

    fn extensions_len(&self) -> BackendResult<usize> {
        self.check_extensions_query()?;
        Ok(self
            .config
            .reported_extensions_len
            .unwrap_or(self.config.extensions.len()))
    }

    fn read_extensions(&self, max_len: usize) -> BackendResult<String> {
        self.check_extensions_query()?;
        let bytes = self.config.extensions.as_bytes();
        let len = bytes.len().min(max_len);
        Ok(String::from_utf8_lossy(&bytes[..len]).into_owned())
    }
}

impl Drop for EmulatedAccelerator {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !state.device_allocations.is_empty() || !state.host_allocations.is_empty() {
            tracing::warn!(
                "{}: dropped with {} device and {} host allocations still live",
                self.config.name,
                state.device_allocations.len(),
                state.host_allocations.len()
            );
        }
        for (addr, allocation) in std::mem::take(&mut state.device_allocations) {
            // SAFETY: every table entry was produced by alloc_zeroed with this layout
            unsafe { alloc::dealloc(addr as *mut u8, allocation.layout) };
        }
        for (addr, size) in std::mem::take(&mut state.host_allocations) {
            if let Some(ptr) = HostPtr::new(addr as *mut u8) {
                // SAFETY: every table entry was produced by host::allocate with this size
                unsafe { host::free(ptr, size) };
            }
        }
    }
}
