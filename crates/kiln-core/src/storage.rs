use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{DType, Device, Element, KilnError, Result};

/// Raw bytes behind a [`Storage`].
///
/// The buffer is backed by `u64` words so every element type is naturally
/// aligned when the bytes are reinterpreted.
pub struct StorageData {
    words: Vec<u64>,
    nbytes: usize,
    dtype: DType,
}

impl StorageData {
    fn zeroed(dtype: DType, numel: usize) -> Self {
        let nbytes = dtype.storage_bytes(numel);
        Self {
            words: vec![0u64; nbytes.div_ceil(8)],
            nbytes,
            dtype,
        }
    }

    /// Read-only view of the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.nbytes]
    }

    /// Mutable view of the raw bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let nbytes = self.nbytes;
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..nbytes]
    }

    /// Interpret the buffer as elements of `T`.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        check_element::<T>(self.dtype)?;
        Ok(bytemuck::cast_slice(self.as_bytes()))
    }

    /// Interpret the buffer as mutable elements of `T`.
    pub fn as_slice_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        check_element::<T>(self.dtype)?;
        Ok(bytemuck::cast_slice_mut(self.as_bytes_mut()))
    }
}

/// `Bool` storage is accessed as `u8`.
fn check_element<T: Element>(dtype: DType) -> Result<()> {
    let stored = if dtype == DType::Bool { DType::U8 } else { dtype };
    if T::DTYPE == stored {
        Ok(())
    } else {
        Err(KilnError::DTypeMismatch {
            expected: dtype,
            got: T::DTYPE,
        })
    }
}

/// Shared, reference-counted tensor storage.
///
/// Unlike a copy-on-write buffer, every clone observes writes made through
/// any other clone: views returned by `narrow` or `transpose` alias their
/// parent, which is what the overlap checks in the kernels guard against.
#[derive(Clone)]
pub struct Storage {
    data: Arc<RwLock<StorageData>>,
    dtype: DType,
    device: Device,
    /// Number of logical elements (not bytes).
    numel: usize,
}

impl Storage {
    /// Allocate zeroed host storage for `numel` elements.
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        Self::zeros_on(dtype, numel, Device::Cpu)
    }

    /// Allocate zeroed storage for `numel` elements on `device`.
    pub fn zeros_on(dtype: DType, numel: usize, device: Device) -> Self {
        Self {
            data: Arc::new(RwLock::new(StorageData::zeroed(dtype, numel))),
            dtype,
            device,
            numel,
        }
    }

    /// Create host storage holding a copy of `data`.
    pub fn from_slice<T: Element>(data: &[T]) -> Self {
        let storage = Self::zeros(T::DTYPE, data.len());
        storage
            .data
            .write()
            .as_bytes_mut()
            .copy_from_slice(bytemuck::cast_slice(data));
        storage
    }

    /// Create storage from raw bytes.
    pub fn from_bytes(dtype: DType, numel: usize, bytes: &[u8]) -> Result<Self> {
        let expected = dtype.storage_bytes(numel);
        if bytes.len() != expected {
            return Err(KilnError::Storage(format!(
                "expected {expected} bytes for {numel} elements of {dtype}, got {}",
                bytes.len()
            )));
        }
        let storage = Self::zeros(dtype, numel);
        storage.data.write().as_bytes_mut().copy_from_slice(bytes);
        Ok(storage)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of logical elements.
    pub fn numel(&self) -> usize {
        self.numel
    }

    /// Size in bytes.
    pub fn nbytes(&self) -> usize {
        self.dtype.storage_bytes(self.numel)
    }

    /// Shared read access. Recursive so one thread may hold several guards
    /// on the same storage.
    pub fn read(&self) -> RwLockReadGuard<'_, StorageData> {
        self.data.read_recursive()
    }

    /// Exclusive write access.
    pub fn write(&self) -> RwLockWriteGuard<'_, StorageData> {
        self.data.write()
    }

    /// Whether both handles refer to the same allocation.
    pub fn same_storage(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Number of handles sharing this allocation.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Storage(dtype={}, device={}, numel={})",
            self.dtype, self.device, self.numel
        )
    }
}
