//! Memory and transfer accounting shared by a context and its buffers

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Snapshot of the copies performed on behalf of one context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Blocking host→device copies
    pub to_device_copies: u64,
    /// Blocking device→host copies
    pub to_host_copies: u64,
    /// Asynchronous host→device pushes
    pub async_pushes: u64,
    pub bytes_to_device: u64,
    pub bytes_to_host: u64,
}

impl TransferStats {
    /// Copies in either direction, pushes included
    pub fn total_copies(&self) -> u64 {
        self.to_device_copies + self.to_host_copies + self.async_pushes
    }
}

/// Live/peak device memory counters plus transfer counters
#[derive(Debug, Default)]
pub struct MemoryUsage {
    usage: AtomicUsize,
    peak: AtomicUsize,
    to_device_copies: AtomicU64,
    to_host_copies: AtomicU64,
    async_pushes: AtomicU64,
    bytes_to_device: AtomicU64,
    bytes_to_host: AtomicU64,
}

impl MemoryUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently accounted as live
    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::SeqCst)
    }

    /// Highest usage since creation or the last [`reset_peak`](Self::reset_peak)
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn increase(&self, bytes: usize) {
        let new_usage = self.usage.fetch_add(bytes, Ordering::SeqCst).saturating_add(bytes);
        self.peak.fetch_max(new_usage, Ordering::SeqCst);
    }

    /// Saturates at zero
    pub fn decrease(&self, bytes: usize) {
        let previous = self
            .usage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |u| Some(u.saturating_sub(bytes)))
            .unwrap_or_else(|u| u);
        if bytes > previous {
            tracing::warn!(
                "memory usage underflow: releasing {} bytes with only {} accounted",
                bytes,
                previous
            );
        }
    }

    pub fn reset_peak(&self) {
        self.peak.store(self.usage(), Ordering::SeqCst);
    }

    pub fn record_to_device(&self, bytes: usize) {
        self.to_device_copies.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_device.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_to_host(&self, bytes: usize) {
        self.to_host_copies.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_host.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_async_push(&self, bytes: usize) {
        self.async_pushes.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_device.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn transfer_stats(&self) -> TransferStats {
        TransferStats {
            to_device_copies: self.to_device_copies.load(Ordering::Relaxed),
            to_host_copies: self.to_host_copies.load(Ordering::Relaxed),
            async_pushes: self.async_pushes.load(Ordering::Relaxed),
            bytes_to_device: self.bytes_to_device.load(Ordering::Relaxed),
            bytes_to_host: self.bytes_to_host.load(Ordering::Relaxed),
        }
    }
}
