//! Per-device execution context

use std::sync::Arc;

use crate::backend::{
    Backend, CpuBackend, DeviceBackend, DeviceInfo, EmulatedAccelerator, ProgramHandle,
    MULTI_QUEUE_COUNT, SINGLE_QUEUE_COUNT,
};
use crate::device::{BufferPool, DeviceConfig, DeviceHandle, Element, SharedBuffer};
use crate::error::{fatal, MemError, MemResult};
use crate::memory::TransferStats;

/// Upper bound on the bytes read from a device extension string
pub const MAX_EXTENSIONS_QUERY: usize = 1 << 20;

/// One physical device: backend, queue state, memory counters and scratch pool.
///
/// A context is driven from one thread at a time; distinct contexts are
/// independent. Buffers created against it keep a [`DeviceHandle`] and stay
/// valid after the context is dropped.
pub struct DeviceContext {
    list_id: usize,
    queue_count: usize,
    current_queue_id: usize,
    workgroup_sizes: [usize; 3],
    initialized: bool,
    program: Option<ProgramHandle>,
    device_info: Option<DeviceInfo>,
    handle: DeviceHandle,
    pool: BufferPool,
}

impl DeviceContext {
    /// Context over an already constructed backend
    pub fn new(id: usize, list_id: usize, backend: Arc<dyn DeviceBackend>) -> Self {
        let queue_count = match backend.kind() {
            Backend::MultiQueue => MULTI_QUEUE_COUNT,
            Backend::Cpu | Backend::SingleQueue => SINGLE_QUEUE_COUNT,
        };
        tracing::debug!(
            "DeviceContext::new: device {} (list {}) on {} backend '{}'",
            id,
            list_id,
            backend.kind(),
            backend.name()
        );
        DeviceContext {
            list_id,
            queue_count,
            current_queue_id: 0,
            workgroup_sizes: [0; 3],
            initialized: false,
            program: None,
            device_info: None,
            handle: DeviceHandle::new(id, backend),
            pool: BufferPool::new(),
        }
    }

    /// CPU context for device 0
    pub fn cpu() -> Self {
        Self::new(0, 0, Arc::new(CpuBackend::new()))
    }

    /// Build a context, choosing the backend implementation from `config`
    pub fn from_config(config: &DeviceConfig) -> MemResult<Self> {
        config.validate()?;
        let backend: Arc<dyn DeviceBackend> = match config.backend {
            Backend::Cpu => Arc::new(CpuBackend::new()),
            Backend::SingleQueue => single_queue_backend(config)?,
            Backend::MultiQueue => Arc::new(EmulatedAccelerator::new(config.emulated_config())),
        };
        Ok(Self::new(config.device_id, config.list_id, backend).with_queue_count(config.queue_count))
    }

    /// Queues a multi-queue device creates at init; ignored by the other kinds.
    ///
    /// A multi-queue device always gets at least two queues.
    pub fn with_queue_count(mut self, queue_count: usize) -> Self {
        if self.backend() == Backend::MultiQueue {
            if queue_count < 2 {
                tracing::warn!(
                    "DeviceContext: multi-queue device {} needs at least 2 queues, got {}",
                    self.id(),
                    queue_count
                );
            }
            self.queue_count = queue_count.max(2);
        }
        self
    }

    /// One-time device setup; fatal on failure
    pub fn init(&mut self) {
        if let Err(e) = self.try_init() {
            fatal(e);
        }
    }

    /// Query work-item limits, register programs and create the extra queues.
    ///
    /// A second call is a no-op.
    pub fn try_init(&mut self) -> MemResult<()> {
        if self.initialized {
            tracing::debug!("DeviceContext: device {} already initialized", self.id());
            return Ok(());
        }

        let backend = Arc::clone(self.handle.backend_arc());
        match backend.kind() {
            Backend::Cpu => {
                tracing::debug!("DeviceContext: CPU device {} needs no setup", self.id());
            }
            kind => {
                let info = backend.query_device().map_err(|e| {
                    MemError::InitializationFailed(format!("device {} query: {}", self.id(), e))
                })?;
                self.workgroup_sizes = info.max_work_item_sizes;

                let program = backend.register_programs().map_err(|e| {
                    MemError::InitializationFailed(format!(
                        "device {} program registration: {}",
                        self.id(),
                        e
                    ))
                })?;

                if kind == Backend::MultiQueue {
                    while backend.queue_count() < self.queue_count {
                        backend.create_queue().map_err(|e| {
                            MemError::InitializationFailed(format!(
                                "device {} queue {}: {}",
                                self.id(),
                                backend.queue_count(),
                                e
                            ))
                        })?;
                    }
                    backend.set_active_queue(self.current_queue_id).map_err(|e| {
                        MemError::InitializationFailed(format!(
                            "device {} activating queue {}: {}",
                            self.id(),
                            self.current_queue_id,
                            e
                        ))
                    })?;
                }

                tracing::info!(
                    "DeviceContext: initialized '{}' (device {}), work items {:?}, {} queue(s), {} kernel(s)",
                    info.name,
                    self.id(),
                    self.workgroup_sizes,
                    backend.queue_count(),
                    program.kernels().len()
                );
                self.program = Some(program);
                self.device_info = Some(info);
            }
        }
        self.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn backend(&self) -> Backend {
        self.handle.kind()
    }

    /// Physical device id
    pub fn id(&self) -> usize {
        self.handle.id()
    }

    /// Position in the ordered device list
    pub fn list_id(&self) -> usize {
        self.list_id
    }

    /// Maximum work items along `dim`; 0 for `dim >= 3` and before init
    pub fn workgroup_size(&self, dim: usize) -> usize {
        self.workgroup_sizes.get(dim).copied().unwrap_or(0)
    }

    pub fn current_queue_id(&self) -> usize {
        self.current_queue_id
    }

    pub fn num_queues(&self) -> usize {
        self.queue_count
    }

    /// Result of the init-time device query
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    /// Programs registered at init
    pub fn program(&self) -> Option<&ProgramHandle> {
        self.program.as_ref()
    }

    /// Handle shared with buffers bound to this context
    pub fn handle(&self) -> DeviceHandle {
        self.handle.clone()
    }

    // ---- queues ----------------------------------------------------------

    /// Make queue `queue % num_queues()` active (multi-queue only).
    ///
    /// Before init the choice is recorded and applied once the queues exist.
    pub fn switch_queue(&mut self, queue: usize) {
        if let Err(e) = self.try_switch_queue(queue) {
            fatal(e);
        }
    }

    pub fn try_switch_queue(&mut self, queue: usize) -> MemResult<()> {
        if self.backend() != Backend::MultiQueue {
            return Ok(());
        }
        let target = queue % self.queue_count;
        if self.initialized {
            self.handle.backend().set_active_queue(target)?;
        }
        self.current_queue_id = target;
        Ok(())
    }

    /// Block until every queue has drained, then make queue 0 active
    pub fn finish_queues(&mut self) {
        if let Err(e) = self.try_finish_queues() {
            fatal(e);
        }
    }

    pub fn try_finish_queues(&mut self) -> MemResult<()> {
        let backend = self.handle.backend();
        match backend.kind() {
            Backend::Cpu => {}
            Backend::SingleQueue => backend.finish_queue(0)?,
            Backend::MultiQueue => {
                for queue in 0..backend.queue_count() {
                    backend.finish_queue(queue)?;
                }
                backend.set_active_queue(0)?;
            }
        }
        self.current_queue_id = 0;
        Ok(())
    }

    // ---- capabilities ----------------------------------------------------

    /// Whether the device advertises `name` in its extension string.
    ///
    /// Only multi-queue devices are asked; the others report every
    /// capability as present.
    pub fn check_capability(&self, name: &str) -> bool {
        if self.backend() != Backend::MultiQueue {
            return true;
        }
        let backend = self.handle.backend();
        let extensions = backend
            .extensions_len()
            .map(|len| {
                if len > MAX_EXTENSIONS_QUERY {
                    tracing::debug!(
                        "DeviceContext: extension length {} clamped to {}",
                        len,
                        MAX_EXTENSIONS_QUERY
                    );
                }
                len.min(MAX_EXTENSIONS_QUERY)
            })
            .and_then(|len| backend.read_extensions(len));

        match extensions {
            Ok(extensions) => extensions.contains(name),
            Err(e) => {
                tracing::warn!(
                    "DeviceContext: extension query on device {} failed: {}",
                    self.id(),
                    e
                );
                false
            }
        }
    }

    // ---- memory accounting -----------------------------------------------

    pub fn memory_usage(&self) -> usize {
        self.handle.usage().usage()
    }

    pub fn peak_memory_usage(&self) -> usize {
        self.handle.usage().peak()
    }

    pub fn increase_memory_usage(&self, bytes: usize) {
        self.handle.usage().increase(bytes);
    }

    pub fn decrease_memory_usage(&self, bytes: usize) {
        self.handle.usage().decrease(bytes);
    }

    /// Start a new peak-measurement phase at the current usage
    pub fn reset_peak_memory_usage(&self) {
        self.handle.usage().reset_peak();
    }

    pub fn transfer_stats(&self) -> TransferStats {
        self.handle.usage().transfer_stats()
    }

    // ---- scratch pool ----------------------------------------------------

    /// Shared scratch buffer `index` of element type `T`
    pub fn buffer<T: Element>(&mut self, index: usize) -> SharedBuffer<T> {
        self.pool.get::<T>(index, &self.handle)
    }

    /// Number of scratch buffers created for element type `T`
    pub fn pool_len<T: Element>(&self) -> usize {
        self.pool.len::<T>()
    }
}

impl Default for DeviceContext {
    fn default() -> Self {
        Self::cpu()
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("id", &self.id())
            .field("list_id", &self.list_id)
            .field("backend", &self.backend())
            .field("queue_count", &self.queue_count)
            .field("current_queue_id", &self.current_queue_id)
            .field("workgroup_sizes", &self.workgroup_sizes)
            .field("initialized", &self.initialized)
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(feature = "rocm")]
fn single_queue_backend(config: &DeviceConfig) -> MemResult<Arc<dyn DeviceBackend>> {
    use crate::backend::HipBackend;

    if !config.emulate && HipBackend::gpu_available() {
        return Ok(Arc::new(HipBackend::new(config.device_id)?));
    }
    tracing::warn!("DeviceContext: no HIP device available, using the emulated accelerator");
    Ok(Arc::new(EmulatedAccelerator::new(config.emulated_config())))
}

#[cfg(not(feature = "rocm"))]
fn single_queue_backend(config: &DeviceConfig) -> MemResult<Arc<dyn DeviceBackend>> {
    Ok(Arc::new(EmulatedAccelerator::new(config.emulated_config())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EmulatedConfig, HostPtr};
    use crate::memory::SyncedMemory;

    fn multi_queue_context() -> (DeviceContext, Arc<EmulatedAccelerator>) {
        let backend = Arc::new(EmulatedAccelerator::multi_queue());
        let mut context = DeviceContext::new(1, 0, backend.clone());
        context.init();
        (context, backend)
    }

    #[test]
    fn test_cpu_context() {
        let mut context = DeviceContext::cpu();
        context.init();
        assert_eq!(context.backend(), Backend::Cpu);
        assert_eq!(context.num_queues(), 1);
        assert_eq!(context.workgroup_size(0), 0);
        assert!(context.program().is_none());

        context.switch_queue(7);
        assert_eq!(context.current_queue_id(), 0);
        assert!(context.check_capability("anything"));
        context.finish_queues();
    }

    #[test]
    fn test_multi_queue_init_and_switch() {
        let (mut context, backend) = multi_queue_context();
        assert_eq!(context.num_queues(), MULTI_QUEUE_COUNT);
        assert_eq!(backend.queue_count(), MULTI_QUEUE_COUNT);
        assert_eq!(context.workgroup_size(0), 1024);
        assert_eq!(context.workgroup_size(2), 64);
        assert_eq!(context.workgroup_size(3), 0);
        assert!(context.program().unwrap().has_kernel("axpy"));

        context.switch_queue(10);
        assert_eq!(context.current_queue_id(), 2);
        assert_eq!(backend.active_queue(), 2);
    }

    #[test]
    fn test_switch_queue_before_init_applies_at_init() {
        let backend = Arc::new(EmulatedAccelerator::multi_queue());
        let mut context = DeviceContext::new(0, 0, backend.clone());
        assert_eq!(backend.queue_count(), 1);

        context.switch_queue(10);
        assert_eq!(context.current_queue_id(), 2);
        assert_eq!(backend.active_queue(), 0);

        context.init();
        assert_eq!(context.current_queue_id(), 2);
        assert_eq!(backend.active_queue(), 2);
    }

    #[test]
    fn test_multi_queue_count_has_floor_of_two() {
        let backend = Arc::new(EmulatedAccelerator::multi_queue());
        let mut context = DeviceContext::new(0, 0, backend.clone()).with_queue_count(1);
        context.init();
        assert_eq!(context.num_queues(), 2);
        assert_eq!(backend.queue_count(), 2);

        context.switch_queue(3);
        assert_eq!(context.current_queue_id(), 1);

        let cpu = DeviceContext::cpu().with_queue_count(4);
        assert_eq!(cpu.num_queues(), 1);
    }

    #[test]
    fn test_init_is_idempotent() {
        let (mut context, backend) = multi_queue_context();
        context.init();
        assert!(context.is_initialized());
        assert_eq!(backend.programs_registered(), 1);
        assert_eq!(backend.queue_count(), MULTI_QUEUE_COUNT);
    }

    #[test]
    fn test_single_queue_context() {
        let backend = Arc::new(EmulatedAccelerator::single_queue());
        let mut context = DeviceContext::new(0, 0, backend.clone());
        context.init();
        assert_eq!(context.num_queues(), 1);
        assert_eq!(backend.queue_count(), 1);

        context.switch_queue(5);
        assert_eq!(context.current_queue_id(), 0);
        assert!(context.check_capability("cl_never_advertised"));
    }

    #[test]
    fn test_init_failure() {
        let backend = Arc::new(EmulatedAccelerator::new(
            EmulatedConfig::multi_queue().with_failing_query(),
        ));
        let mut context = DeviceContext::new(0, 0, backend);
        let err = context.try_init().unwrap_err();
        assert!(matches!(err, MemError::InitializationFailed(_)));
        assert!(!context.is_initialized());
    }

    #[test]
    #[should_panic(expected = "forgemem fatal error")]
    fn test_init_failure_is_fatal() {
        let backend = Arc::new(EmulatedAccelerator::new(
            EmulatedConfig::single_queue().with_failing_query(),
        ));
        DeviceContext::new(0, 0, backend).init();
    }

    #[test]
    fn test_finish_queues_drains_every_queue() {
        let (mut context, backend) = multi_queue_context();
        let device = backend.allocate_device(16).unwrap();
        let src = [3u8; 16];
        unsafe {
            backend.enqueue_copy_to_device(3, device, src.as_ptr(), 8).unwrap();
            backend.enqueue_copy_to_device(6, device, src.as_ptr(), 16).unwrap();
        }
        context.switch_queue(5);

        context.finish_queues();
        assert_eq!(context.current_queue_id(), 0);
        assert_eq!(backend.active_queue(), 0);
        assert_eq!(backend.pending_writes(3), 0);
        assert_eq!(backend.pending_writes(6), 0);
        assert_eq!(backend.completed_writes(6), 1);
        unsafe { backend.free_device(device, 16).unwrap() };
    }

    #[test]
    fn test_check_capability_substring() {
        let (context, _backend) = multi_queue_context();
        assert!(context.check_capability("cl_khr_fp64"));
        assert!(context.check_capability("int64_base"));
        assert!(!context.check_capability("cl_khr_fp16"));
    }

    #[test]
    fn test_check_capability_clamps_reported_length() {
        let backend = Arc::new(EmulatedAccelerator::new(
            EmulatedConfig::multi_queue()
                .with_extensions("cl_khr_fp16")
                .with_reported_extensions_len(usize::MAX),
        ));
        let mut context = DeviceContext::new(0, 0, backend);
        context.init();
        assert!(context.check_capability("cl_khr_fp16"));
    }

    #[test]
    fn test_check_capability_false_when_query_fails() {
        let backend = Arc::new(EmulatedAccelerator::new(
            EmulatedConfig::multi_queue()
                .with_extensions("cl_khr_fp64")
                .with_failing_extensions(),
        ));
        let mut context = DeviceContext::new(0, 0, backend);
        context.init();
        assert!(!context.check_capability("cl_khr_fp64"));
        assert!(!context.check_capability(""));
    }

    #[test]
    fn test_memory_counters() {
        let context = DeviceContext::cpu();
        context.increase_memory_usage(100);
        context.increase_memory_usage(50);
        context.decrease_memory_usage(120);
        assert_eq!(context.memory_usage(), 30);
        assert_eq!(context.peak_memory_usage(), 150);

        context.reset_peak_memory_usage();
        assert_eq!(context.peak_memory_usage(), 30);
    }

    #[test]
    fn test_buffer_pool_through_context() {
        let mut context = DeviceContext::cpu();
        let a = context.buffer::<f32>(2);
        assert_eq!(context.pool_len::<f32>(), 3);
        assert!(Arc::ptr_eq(&a, &context.buffer::<f32>(2)));
        assert_eq!(context.pool_len::<u8>(), 0);

        let mut buffer = a.lock().unwrap();
        buffer.reshape(4);
        buffer.mutable_cpu_data().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        drop(buffer);
        assert_eq!(context.buffer::<f32>(2).lock().unwrap().cpu_data(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_buffers_outlive_context() {
        let backend = Arc::new(EmulatedAccelerator::single_queue());
        let mut mem = {
            let context = DeviceContext::new(0, 0, backend.clone());
            SyncedMemory::new(32, &context)
        };
        mem.mutable_gpu_data();
        assert_eq!(mem.cpu_data(), &[0u8; 32]);
        drop(mem);
        assert_eq!(backend.stats().live_device_allocations(), 0);
        assert_eq!(backend.stats().live_host_allocations(), 0);
    }

    #[test]
    fn test_from_config_selects_backend() {
        let cpu = DeviceContext::from_config(&DeviceConfig::default()).unwrap();
        assert_eq!(cpu.backend(), Backend::Cpu);

        let multi = DeviceContext::from_config(
            &DeviceConfig::new()
                .with_backend(Backend::MultiQueue)
                .with_device_id(2)
                .with_list_id(1)
                .with_queue_count(4),
        )
        .unwrap();
        assert_eq!(multi.backend(), Backend::MultiQueue);
        assert_eq!(multi.id(), 2);
        assert_eq!(multi.list_id(), 1);
        assert_eq!(multi.num_queues(), 4);

        let single = DeviceContext::from_config(
            &DeviceConfig::new()
                .with_backend(Backend::SingleQueue)
                .with_emulation(true),
        )
        .unwrap();
        assert_eq!(single.backend(), Backend::SingleQueue);
        assert_eq!(single.num_queues(), 1);
    }

    #[test]
    fn test_from_config_multi_queue_init() {
        let mut context = DeviceContext::from_config(
            &DeviceConfig::new()
                .with_backend(Backend::MultiQueue)
                .with_queue_count(3)
                .with_work_item_sizes([128, 64, 8]),
        )
        .unwrap();
        context.init();
        assert_eq!(context.workgroup_size(1), 64);
        context.switch_queue(7);
        assert_eq!(context.current_queue_id(), 1);
    }

    #[test]
    fn test_external_host_buffer_not_freed() {
        let backend = Arc::new(EmulatedAccelerator::single_queue());
        let context = DeviceContext::new(0, 0, backend.clone());
        let mut external = vec![5u8; 8];
        {
            let mut mem = SyncedMemory::new(8, &context);
            unsafe { mem.set_cpu_data(HostPtr::new(external.as_mut_ptr()).unwrap()) };
            mem.gpu_data();
        }
        let stats = backend.stats();
        assert_eq!(stats.host_allocations, 0);
        assert_eq!(stats.invalid_frees, 0);
        assert_eq!(external, vec![5u8; 8]);
    }
}
