//! Typed scratch-buffer pool
//!
//! One pool per context, keyed by element type. Each slot is created on
//! first request and handed out as a shared reference; asking for the same
//! index again returns the same buffer. Slots are never removed, and the
//! pool does not arbitrate between holders of the same slot.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::{Arc, Mutex};

use crate::backend::DevicePtr;
use crate::device::DeviceHandle;
use crate::memory::{SyncedHead, SyncedMemory};

/// Scalar types a scratch buffer can hold.
///
/// # Safety
/// Implementors must be plain old data: every bit pattern is a valid value,
/// there is no padding, and the alignment is at most
/// [`HOST_PAGE_ALIGN`](crate::memory::HOST_PAGE_ALIGN).
pub unsafe trait Element: Copy + Default + fmt::Debug + Send + Sync + 'static {
    const NAME: &'static str;
}

unsafe impl Element for u8 {
    const NAME: &'static str = "u8";
}
unsafe impl Element for i32 {
    const NAME: &'static str = "i32";
}
unsafe impl Element for u32 {
    const NAME: &'static str = "u32";
}
unsafe impl Element for f32 {
    const NAME: &'static str = "f32";
}
unsafe impl Element for f64 {
    const NAME: &'static str = "f64";
}
unsafe impl Element for half::f16 {
    const NAME: &'static str = "f16";
}

/// Shared handle to one pool slot
pub type SharedBuffer<T> = Arc<Mutex<ScratchBuffer<T>>>;

/// Reshapeable typed view over a [`SyncedMemory`].
///
/// Shrinking keeps the allocation; growing beyond the current capacity
/// replaces it with a fresh, unsynchronized one.
pub struct ScratchBuffer<T: Element> {
    data: SyncedMemory,
    count: usize,
    capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> ScratchBuffer<T> {
    pub fn new(device: DeviceHandle) -> Self {
        ScratchBuffer {
            data: SyncedMemory::with_handle(0, device),
            count: 0,
            capacity: 0,
            _marker: PhantomData,
        }
    }

    /// Number of elements in the current shape
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Elements the current allocation can hold
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Byte size of the current shape
    pub fn byte_len(&self) -> usize {
        self.count * mem::size_of::<T>()
    }

    pub fn reshape(&mut self, count: usize) {
        self.count = count;
        if count > self.capacity {
            let device = self.data.device().clone();
            tracing::debug!(
                "ScratchBuffer<{}>: growing from {} to {} elements",
                T::NAME,
                self.capacity,
                count
            );
            self.capacity = count;
            self.data = SyncedMemory::with_handle(count * mem::size_of::<T>(), device);
        }
    }

    pub fn head(&self) -> SyncedHead {
        self.data.head()
    }

    pub fn memory(&self) -> &SyncedMemory {
        &self.data
    }

    pub fn memory_mut(&mut self) -> &mut SyncedMemory {
        &mut self.data
    }

    pub fn cpu_data(&mut self) -> &[T] {
        let count = self.count;
        let bytes = self.data.cpu_data();
        // SAFETY: T is plain old data, the host buffer is page-aligned and
        // holds at least `capacity >= count` elements
        unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<T>(), count) }
    }

    pub fn mutable_cpu_data(&mut self) -> &mut [T] {
        let count = self.count;
        let bytes = self.data.mutable_cpu_data();
        // SAFETY: as in `cpu_data`, and the view is unique through `&mut self`
        unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr().cast::<T>(), count) }
    }

    pub fn gpu_data(&mut self) -> DevicePtr {
        self.data.gpu_data()
    }

    pub fn mutable_gpu_data(&mut self) -> DevicePtr {
        self.data.mutable_gpu_data()
    }
}

impl<T: Element> fmt::Debug for ScratchBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchBuffer")
            .field("element", &T::NAME)
            .field("count", &self.count)
            .field("capacity", &self.capacity)
            .field("head", &self.data.head())
            .finish()
    }
}

/// Grow-only pool of shared scratch buffers, one sequence per element type
#[derive(Default)]
pub struct BufferPool {
    slots: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot `index` for element type `T`, growing the sequence as needed
    pub fn get<T: Element>(&mut self, index: usize, device: &DeviceHandle) -> SharedBuffer<T> {
        let slots = self.slots_mut::<T>();
        if slots.len() <= index {
            tracing::trace!(
                "BufferPool: growing {} pool from {} to {} slots",
                T::NAME,
                slots.len(),
                index + 1
            );
        }
        while slots.len() <= index {
            slots.push(Arc::new(Mutex::new(ScratchBuffer::new(device.clone()))));
        }
        Arc::clone(&slots[index])
    }

    /// Number of slots created for element type `T`
    pub fn len<T: Element>(&self) -> usize {
        self.slots
            .get(&TypeId::of::<T>())
            .and_then(|s| s.downcast_ref::<Vec<SharedBuffer<T>>>())
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slots_mut<T: Element>(&mut self) -> &mut Vec<SharedBuffer<T>> {
        self.slots
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(Vec::<SharedBuffer<T>>::new()))
            .downcast_mut::<Vec<SharedBuffer<T>>>()
            .unwrap_or_else(|| unreachable!("pool slot keyed by TypeId holds another type"))
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("element_types", &self.slots.len())
            .finish()
    }
}
