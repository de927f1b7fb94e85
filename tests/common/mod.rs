//! Shared fixtures for the integration tests
//!
//! Every fixture pairs a context with the emulated accelerator behind it, so
//! tests can assert on allocation bookkeeping (live allocations, invalid
//! frees, staged writes) after the buffers under test are gone.

#![allow(dead_code)]

use std::sync::Arc;

use forgemem::backend::AllocationStats;
use forgemem::{DeviceBackend, DeviceContext, EmulatedAccelerator, EmulatedConfig};

pub use serial_test::serial;

/// Initialized single-queue context over an emulated accelerator
pub fn single_queue_context() -> (DeviceContext, Arc<EmulatedAccelerator>) {
    context_for(EmulatedConfig::single_queue())
}

/// Initialized multi-queue context with `queues` queues
pub fn multi_queue_context(queues: usize) -> (DeviceContext, Arc<EmulatedAccelerator>) {
    context_for(EmulatedConfig::multi_queue().with_max_queues(queues))
}

fn context_for(config: EmulatedConfig) -> (DeviceContext, Arc<EmulatedAccelerator>) {
    let queues = config.max_queues;
    let backend = Arc::new(EmulatedAccelerator::new(config));
    let mut context = DeviceContext::new(0, 0, backend.clone()).with_queue_count(queues);
    context.init();
    (context, backend)
}

/// Assert every allocation was released exactly once
pub fn assert_no_leaks(stats: &AllocationStats) {
    assert_eq!(stats.live_device_allocations(), 0, "device leak: {:?}", stats);
    assert_eq!(stats.live_host_allocations(), 0, "host leak: {:?}", stats);
    assert_eq!(stats.invalid_frees, 0, "double or foreign free: {:?}", stats);
}

/// Overwrite a device allocation as a kernel would
pub fn device_write(backend: &EmulatedAccelerator, ptr: forgemem::DevicePtr, bytes: &[u8]) {
    // SAFETY: tests only pass pointers the emulated backend handed out for
    // buffers of at least `bytes.len()` bytes
    unsafe {
        backend
            .copy_to_device(ptr, bytes.as_ptr(), bytes.len())
            .expect("emulated device write");
    }
}

/// Read a device allocation back without going through a SyncedMemory
pub fn device_read(backend: &EmulatedAccelerator, ptr: forgemem::DevicePtr, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    // SAFETY: as in `device_write`
    unsafe {
        backend
            .copy_to_host(out.as_mut_ptr(), ptr, len)
            .expect("emulated device read");
    }
    out
}
