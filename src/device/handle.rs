//! Shared part of a device context

use std::sync::Arc;

use crate::backend::{Backend, DeviceBackend};
use crate::memory::MemoryUsage;

/// What a buffer needs from its context: the backend to allocate and copy
/// through, and the counters to account against.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    id: usize,
    backend: Arc<dyn DeviceBackend>,
    usage: Arc<MemoryUsage>,
}

impl DeviceHandle {
    pub(crate) fn new(id: usize, backend: Arc<dyn DeviceBackend>) -> Self {
        DeviceHandle {
            id,
            backend,
            usage: Arc::new(MemoryUsage::new()),
        }
    }

    /// Physical device id
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn kind(&self) -> Backend {
        self.backend.kind()
    }

    pub fn backend(&self) -> &dyn DeviceBackend {
        self.backend.as_ref()
    }

    pub fn backend_arc(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    pub fn usage(&self) -> &MemoryUsage {
        &self.usage
    }

    /// Whether both handles account against the same context
    pub fn same_device(&self, other: &DeviceHandle) -> bool {
        Arc::ptr_eq(&self.usage, &other.usage)
    }
}
