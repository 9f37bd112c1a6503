use std::fmt;

use smallvec::SmallVec;

use crate::element::cast_element;
use crate::{dispatch_dtype, DType, Device, Element, KilnError, Result, Shape, Storage};

/// A strided view over shared [`Storage`].
///
/// Views produced by `narrow`, `transpose`, `permute` and `broadcast_to` share
/// their parent's storage, so writes through one are visible in the other.
///
/// # Examples
///
/// ```
/// use kiln_core::Tensor;
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
/// let col = t.narrow(1, 1, 1).unwrap();
/// assert_eq!(col.shape().dims(), &[2, 1]);
/// assert_eq!(col.to_vec::<f32>().unwrap(), vec![2.0, 5.0]);
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    strides: SmallVec<[usize; 4]>,
    offset: usize,
}

/// Number of storage elements a view with `dims` and `strides` spans.
fn storage_extent(dims: &[usize], strides: &[usize]) -> usize {
    if dims.iter().any(|&d| d == 0) {
        return 0;
    }
    1 + dims
        .iter()
        .zip(strides)
        .map(|(&d, &s)| (d - 1) * s)
        .sum::<usize>()
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    fn with_contiguous_layout(storage: Storage, shape: Shape) -> Self {
        let strides = shape.contiguous_strides();
        Self {
            storage,
            shape,
            strides,
            offset: 0,
        }
    }

    /// Create a host tensor holding a copy of `data`.
    pub fn from_slice<T: Element>(data: &[T], shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != data.len() {
            return Err(KilnError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Self::with_contiguous_layout(Storage::from_slice(data), s))
    }

    /// Create a tensor from f32 data with the given shape.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the shape.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "Shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        Self::with_contiguous_layout(Storage::from_slice(data), s)
    }

    /// Create a `Bool` tensor.
    pub fn from_bool(data: &[bool], shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != data.len() {
            return Err(KilnError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![data.len()],
            });
        }
        let bytes: Vec<u8> = data.iter().map(|&b| b as u8).collect();
        let storage = Storage::from_bytes(DType::Bool, data.len(), &bytes)?;
        Ok(Self::with_contiguous_layout(storage, s))
    }

    /// Create a host tensor of zeros.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        Self::zeros_on(shape, dtype, Device::Cpu)
    }

    /// Create a tensor of zeros on `device`.
    pub fn zeros_on(shape: &[usize], dtype: DType, device: Device) -> Self {
        let s = Shape::new(shape);
        Self::with_contiguous_layout(Storage::zeros_on(dtype, s.numel(), device), s)
    }

    /// Create a host tensor filled with `value`, cast to `dtype`.
    pub fn full(shape: &[usize], value: f64, dtype: DType) -> Result<Self> {
        let t = Self::zeros(shape, dtype);
        t.fill_(value)?;
        Ok(t)
    }

    /// Allocate a zeroed host tensor with an explicit stride layout.
    pub fn empty_strided(shape: &[usize], strides: &[usize], dtype: DType) -> Result<Self> {
        Self::empty_strided_on(shape, strides, dtype, Device::Cpu)
    }

    /// Allocate a zeroed tensor on `device` with an explicit stride layout.
    pub fn empty_strided_on(
        shape: &[usize],
        strides: &[usize],
        dtype: DType,
        device: Device,
    ) -> Result<Self> {
        if shape.len() != strides.len() {
            return Err(KilnError::ShapeMismatch {
                expected: shape.to_vec(),
                got: strides.to_vec(),
            });
        }
        let storage = Storage::zeros_on(dtype, storage_extent(shape, strides), device);
        Ok(Self {
            storage,
            shape: Shape::new(shape),
            strides: SmallVec::from_slice(strides),
            offset: 0,
        })
    }

    /// New view over this tensor's storage with arbitrary geometry.
    ///
    /// Fails if the view would reach past the end of the storage.
    pub fn as_strided(&self, shape: &[usize], strides: &[usize], offset: usize) -> Result<Tensor> {
        if shape.len() != strides.len() {
            return Err(KilnError::ShapeMismatch {
                expected: shape.to_vec(),
                got: strides.to_vec(),
            });
        }
        let extent = storage_extent(shape, strides);
        if extent > 0 && offset + extent > self.storage.numel() {
            return Err(KilnError::Storage(format!(
                "view of {extent} elements at offset {offset} exceeds storage of {}",
                self.storage.numel()
            )));
        }
        Ok(Tensor {
            storage: self.storage.clone(),
            shape: Shape::new(shape),
            strides: SmallVec::from_slice(strides),
            offset,
        })
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn device(&self) -> Device {
        self.storage.device()
    }

    /// Strides (in elements, not bytes).
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Offset of the first element within the storage, in elements.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Half-open range of storage elements this view can touch.
    pub fn storage_span(&self) -> (usize, usize) {
        let extent = storage_extent(self.dims(), &self.strides);
        (self.offset, self.offset + extent)
    }

    /// Whether elements are laid out row-major without gaps.
    ///
    /// Size-1 dimensions may carry any stride. The storage offset does not
    /// matter.
    pub fn is_contiguous(&self) -> bool {
        if self.numel() == 0 {
            return true;
        }
        let mut expected = 1;
        for (&d, &s) in self.dims().iter().zip(&self.strides).rev() {
            if d == 1 {
                continue;
            }
            if s != expected {
                return false;
            }
            expected *= d;
        }
        true
    }

    /// A rank-1, zero-element placeholder that concatenation ignores.
    pub fn is_skipped(&self) -> bool {
        self.ndim() == 1 && self.numel() == 0
    }

    /// Whether every element offset fits a signed 32-bit index.
    pub fn fits_32bit_indexing(&self) -> bool {
        let limit = i32::MAX as usize;
        self.numel() <= limit && self.storage_span().1 <= limit
    }

    /// Storage index of the element at row-major position `flat`.
    #[inline]
    pub fn physical_index(&self, flat: usize) -> usize {
        let mut remaining = flat;
        let mut physical = self.offset;
        for (&d, &s) in self.dims().iter().zip(&self.strides).rev() {
            physical += (remaining % d) * s;
            remaining /= d;
        }
        physical
    }

    // =========================================================================
    // Views
    // =========================================================================

    fn check_axis(&self, axis: usize) -> Result<()> {
        if axis >= self.ndim() {
            return Err(KilnError::InvalidAxis {
                axis: axis as isize,
                ndim: self.ndim(),
            });
        }
        Ok(())
    }

    /// Slice `len` entries of dimension `dim` starting at `start`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Tensor> {
        self.check_axis(dim)?;
        let size = self.dims()[dim];
        if start + len > size {
            return Err(KilnError::ShapeMismatch {
                expected: vec![size],
                got: vec![start + len],
            });
        }
        Ok(Tensor {
            storage: self.storage.clone(),
            shape: self.shape.with_dim(dim, len),
            strides: self.strides.clone(),
            offset: self.offset + start * self.strides[dim],
        })
    }

    /// Swap two dimensions.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Tensor> {
        self.check_axis(dim0)?;
        self.check_axis(dim1)?;
        let mut dims: SmallVec<[usize; 4]> = SmallVec::from_slice(self.dims());
        let mut strides = self.strides.clone();
        dims.swap(dim0, dim1);
        strides.swap(dim0, dim1);
        Ok(Tensor {
            storage: self.storage.clone(),
            shape: Shape::new(&dims),
            strides,
            offset: self.offset,
        })
    }

    /// Reorder dimensions so output dimension `i` is input dimension `perm[i]`.
    pub fn permute(&self, perm: &[usize]) -> Result<Tensor> {
        if perm.len() != self.ndim() {
            return Err(KilnError::ShapeMismatch {
                expected: self.dims().to_vec(),
                got: perm.to_vec(),
            });
        }
        let mut seen = vec![false; perm.len()];
        for &p in perm {
            self.check_axis(p)?;
            if std::mem::replace(&mut seen[p], true) {
                return Err(KilnError::InvalidAxis {
                    axis: p as isize,
                    ndim: self.ndim(),
                });
            }
        }
        let dims: SmallVec<[usize; 4]> = perm.iter().map(|&p| self.dims()[p]).collect();
        let strides = perm.iter().map(|&p| self.strides[p]).collect();
        Ok(Tensor {
            storage: self.storage.clone(),
            shape: Shape::new(&dims),
            strides,
            offset: self.offset,
        })
    }

    /// Reshape, sharing storage when contiguous and copying otherwise.
    pub fn reshape(&self, new_shape: &[isize]) -> Result<Tensor> {
        let resolved =
            self.shape
                .resolve_reshape(new_shape)
                .ok_or_else(|| KilnError::InvalidReshape {
                    numel: self.numel(),
                    shape: new_shape.to_vec(),
                })?;
        let base = self.contiguous()?;
        let strides = resolved.contiguous_strides();
        Ok(Tensor {
            storage: base.storage,
            shape: resolved,
            strides,
            offset: base.offset,
        })
    }

    /// Broadcast to `target` with zero strides on expanded dimensions.
    pub fn broadcast_to(&self, target: &Shape) -> Result<Tensor> {
        let compatible = self
            .shape
            .broadcast_with(target)
            .is_some_and(|b| &b == target);
        if !compatible {
            return Err(KilnError::ShapeMismatch {
                expected: target.dims().to_vec(),
                got: self.dims().to_vec(),
            });
        }
        let lead = target.ndim() - self.ndim();
        let strides = target
            .dims()
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                if i < lead {
                    return 0;
                }
                let j = i - lead;
                if self.dims()[j] == 1 && size != 1 {
                    0
                } else {
                    self.strides[j]
                }
            })
            .collect();
        Ok(Tensor {
            storage: self.storage.clone(),
            shape: target.clone(),
            strides,
            offset: self.offset,
        })
    }

    // =========================================================================
    // Data access
    // =========================================================================

    /// Gather elements in row-major order.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        let guard = self.storage.read();
        let data = guard.as_slice::<T>()?;
        Ok((0..self.numel())
            .map(|i| data[self.physical_index(i)])
            .collect())
    }

    /// Gather elements in row-major order, widened to `f64`.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        dispatch_dtype!(self.dtype(), T => {
            Ok(self.to_vec::<T>()?.into_iter().map(Element::to_f64).collect())
        })
    }

    /// Return `self` if contiguous, otherwise a contiguous copy.
    pub fn contiguous(&self) -> Result<Tensor> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        self.clone_contiguous()
    }

    /// Contiguous copy in fresh storage.
    pub fn clone_contiguous(&self) -> Result<Tensor> {
        let out = Tensor::zeros_on(self.dims(), self.dtype(), self.device());
        out.copy_from(self)?;
        Ok(out)
    }

    /// Strided copy of `src` into `self` with implicit dtype cast.
    ///
    /// `src` is broadcast to `self`'s shape. When both share storage the
    /// source is snapshotted first, so overlapping ranges copy as if through
    /// a temporary.
    pub fn copy_from(&self, src: &Tensor) -> Result<()> {
        let src = if src.shape == self.shape {
            src.clone()
        } else {
            src.broadcast_to(&self.shape)?
        };
        let src = if src.storage.same_storage(&self.storage) {
            src.clone_contiguous()?
        } else {
            src
        };

        let (src_dtype, dst_dtype) = (src.dtype(), self.dtype());
        let src_guard = src.storage.read();
        let mut dst_guard = self.storage.write();
        dispatch_dtype!(src_dtype, S => {
            let input = src_guard.as_slice::<S>()?;
            dispatch_dtype!(dst_dtype, D => {
                let output = dst_guard.as_slice_mut::<D>()?;
                for i in 0..self.numel() {
                    output[self.physical_index(i)] = cast_element::<S, D>(
                        input[src.physical_index(i)],
                        src_dtype,
                        dst_dtype,
                    );
                }
            })
        });
        Ok(())
    }

    /// Set every element of the view to `value`, cast to this dtype.
    pub fn fill_(&self, value: f64) -> Result<()> {
        let dtype = self.dtype();
        let mut guard = self.storage.write();
        dispatch_dtype!(dtype, T => {
            let v = cast_element::<f64, T>(value, DType::F64, dtype);
            let output = guard.as_slice_mut::<T>()?;
            for i in 0..self.numel() {
                output[self.physical_index(i)] = v;
            }
        });
        Ok(())
    }

    /// Make this handle a zeroed row-major tensor of `shape`.
    ///
    /// A no-op when the shape already matches. Otherwise the handle is
    /// rebound to fresh storage of the same dtype and device; other views of
    /// the old storage are unaffected.
    pub fn resize_(&mut self, shape: &[usize]) {
        if self.dims() == shape {
            return;
        }
        tracing::trace!(from = %self.shape, to = ?shape, "resize_: reallocating storage");
        *self = Tensor::zeros_on(shape, self.dtype(), self.device());
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, strides={:?}, offset={}, dtype={}, device={})",
            self.shape,
            self.strides.as_slice(),
            self.offset,
            self.dtype(),
            self.device(),
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_f64_vec() {
            Ok(data) if data.len() <= 20 => {
                write!(f, "tensor({:?}, shape={}, dtype={})", data, self.shape, self.dtype())
            }
            Ok(data) => write!(
                f,
                "tensor([{:.4}, {:.4}, ..., {:.4}], shape={}, dtype={})",
                data[0],
                data[1],
                data[data.len() - 1],
                self.shape,
                self.dtype()
            ),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}
