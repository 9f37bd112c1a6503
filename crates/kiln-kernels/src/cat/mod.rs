//! Tensor concatenation.
//!
//! Contiguous, same-dtype inputs of rank ≤ 3 are copied by one batched
//! dispatch per group of up to `cat.batch_size` inputs. Everything else goes
//! through a narrow-and-copy loop.

pub mod batched_copy;
pub mod offset;
pub mod planner;

use kiln_core::overlap::has_internal_overlap;
use kiln_core::{DType, KilnError, Result, Tensor};

use crate::Context;

pub use batched_copy::InputDescriptor;
pub use offset::{output_offset, OutputGeometry};
pub use planner::concatenate;

/// Concatenate `tensors` along `dim` into `out`, resizing it if needed.
///
/// Negative `dim` counts from the end.
pub fn cat_out(ctx: &Context, out: &mut Tensor, tensors: &[Tensor], dim: isize) -> Result<()> {
    let first = tensors
        .first()
        .ok_or_else(|| KilnError::Unsupported("cat expects a non-empty list of tensors".into()))?;
    if has_internal_overlap(out) {
        return Err(KilnError::InternalOverlap);
    }
    let dtype = first.dtype();
    let all_same_type = out.dtype() == dtype && tensors.iter().all(|t| t.dtype() == dtype);
    concatenate(ctx, out, tensors, dim, all_same_type)
}

/// Concatenate `tensors` along `dim` into a new tensor of the promoted dtype.
///
/// ```
/// use kiln_core::Tensor;
/// use kiln_kernels::{cat, Context};
///
/// let a = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
/// let b = Tensor::from_f32(&[7.0, 8.0, 9.0], &[1, 3]);
/// let out = cat::cat(Context::global(), &[a, b], 0).unwrap();
/// assert_eq!(out.dims(), &[3, 3]);
/// ```
pub fn cat(ctx: &Context, tensors: &[Tensor], dim: isize) -> Result<Tensor> {
    let dtypes: Vec<DType> = tensors.iter().map(|t| t.dtype()).collect();
    let (dtype, first) = DType::result_type(&dtypes)
        .zip(tensors.first())
        .ok_or_else(|| KilnError::Unsupported("cat expects a non-empty list of tensors".into()))?;
    let mut out = Tensor::zeros_on(&[0], dtype, first.device());
    cat_out(ctx, &mut out, tensors, dim)?;
    Ok(out)
}
