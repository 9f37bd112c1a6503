//! Host staging, device buffers and shared-output writers.

use std::marker::PhantomData;
use std::sync::Arc;

use kiln_core::Device;

use super::queue::Queue;

/// Hands out a fresh staging buffer per request.
///
/// Buffers are never recycled: a buffer handed to [`DeviceBuffer::upload`]
/// belongs to that transfer, and the next batch gets new memory.
#[derive(Debug, Default)]
pub struct StagingArena {
    allocations: usize,
    bytes: usize,
}

impl StagingArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an empty staging buffer with room for `capacity` records.
    pub fn alloc<T: Copy>(&mut self, capacity: usize) -> StagingBuffer<T> {
        self.allocations += 1;
        self.bytes += capacity * std::mem::size_of::<T>();
        StagingBuffer {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Buffers handed out so far.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Total bytes reserved so far.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes
    }
}

/// Host-side records waiting to be uploaded.
#[derive(Debug)]
pub struct StagingBuffer<T> {
    data: Vec<T>,
}

impl<T: Copy> StagingBuffer<T> {
    pub fn push(&mut self, record: T) {
        self.data.push(record);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

/// Read-only device copy of uploaded records.
#[derive(Debug, Clone)]
pub struct DeviceBuffer<T> {
    data: Arc<[T]>,
    device: Device,
}

impl<T: Copy + Send + Sync> DeviceBuffer<T> {
    /// Transfer `staging` to the queue's device, consuming it.
    pub fn upload(queue: &Queue, staging: StagingBuffer<T>) -> Self {
        tracing::trace!(
            device = %queue.device(),
            records = staging.len(),
            bytes = staging.len() * std::mem::size_of::<T>(),
            "upload"
        );
        Self {
            data: staging.data.into(),
            device: queue.device(),
        }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

/// Mutable slice shared by many work-items that write disjoint indices.
pub struct UnsafeSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

// SAFETY: callers of `write`/`read` guarantee no index is accessed by two
// work-items concurrently.
unsafe impl<T: Send> Send for UnsafeSlice<'_, T> {}
unsafe impl<T: Send> Sync for UnsafeSlice<'_, T> {}

impl<'a, T: Copy> UnsafeSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// No other work-item may access `index` during this dispatch.
    #[inline]
    pub unsafe fn write(&self, index: usize, value: T) {
        assert!(index < self.len, "index {index} out of bounds for {}", self.len);
        self.ptr.add(index).write(value);
    }

    /// # Safety
    /// No other work-item may write `index` during this dispatch.
    #[inline]
    pub unsafe fn read(&self, index: usize) -> T {
        assert!(index < self.len, "index {index} out of bounds for {}", self.len);
        self.ptr.add(index).read()
    }
}
