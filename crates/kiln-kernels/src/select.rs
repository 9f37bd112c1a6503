//! Elementwise selection: `where_` and `isnan`.

use kiln_core::{dispatch_dtype, DType, Element, KilnError, Result, Shape, Tensor};

use crate::runtime::{NdRange, UnsafeSlice};
use crate::Context;

/// `condition ? self_ : other`, elementwise, after broadcasting all three.
///
/// The result takes `self_`'s dtype; `other` is cast to it.
pub fn where_(ctx: &Context, condition: &Tensor, self_: &Tensor, other: &Tensor) -> Result<Tensor> {
    if !matches!(condition.dtype(), DType::Bool | DType::U8) {
        return Err(KilnError::UnsupportedDType(condition.dtype()));
    }
    let dtype = self_.dtype();
    if !DType::can_cast(other.dtype(), dtype) {
        return Err(KilnError::Cast {
            from: other.dtype(),
            to: dtype,
        });
    }
    let device = self_.device();
    if condition.device() != device || other.device() != device {
        return Err(KilnError::Unsupported(format!(
            "where: expected all tensors on {device}"
        )));
    }
    let shape = broadcast_shape(&[condition, self_, other])?;

    // Materialise each operand densely in the output shape.
    let dense = |t: &Tensor, dtype: DType| -> Result<Tensor> {
        let out = Tensor::zeros_on(shape.dims(), dtype, device);
        out.copy_from(t)?;
        Ok(out)
    };
    let cond = dense(condition, DType::U8)?;
    let lhs = dense(self_, dtype)?;
    let rhs = dense(other, dtype)?;
    let out = Tensor::zeros_on(shape.dims(), dtype, device);
    let numel = shape.numel();
    if numel == 0 {
        return Ok(out);
    }

    let queue = ctx.queue(device);
    let range = NdRange::linear(numel, queue.max_work_group_size());
    let cond_guard = cond.storage().read();
    let mask = cond_guard.as_slice::<u8>()?;
    dispatch_dtype!(dtype, T => {
        let lhs_guard = lhs.storage().read();
        let rhs_guard = rhs.storage().read();
        let (a, b) = (lhs_guard.as_slice::<T>()?, rhs_guard.as_slice::<T>()?);
        let mut out_guard = out.storage().write();
        let writer = UnsafeSlice::new(out_guard.as_slice_mut::<T>()?);
        queue.submit_parallel_for("where", range, |item| {
            let step = item.global_range(1);
            let mut i = item.global_id(1);
            while i < numel {
                let v = if mask[i] != 0 { a[i] } else { b[i] };
                // SAFETY: one write per index.
                unsafe { writer.write(i, v) };
                i += step;
            }
        });
    });
    Ok(out)
}

/// `Bool` tensor marking NaN elements. Integral inputs are never NaN.
pub fn isnan(ctx: &Context, t: &Tensor) -> Result<Tensor> {
    let out = Tensor::zeros_on(t.dims(), DType::Bool, t.device());
    if !t.dtype().is_float() || t.numel() == 0 {
        return Ok(out);
    }
    let src = t.contiguous()?;
    let numel = src.numel();
    let base = src.offset();
    let queue = ctx.queue(t.device());
    let range = NdRange::linear(numel, queue.max_work_group_size());
    dispatch_dtype!(src.dtype(), T => {
        let guard = src.storage().read();
        let input = guard.as_slice::<T>()?;
        let mut out_guard = out.storage().write();
        let writer = UnsafeSlice::new(out_guard.as_slice_mut::<u8>()?);
        queue.submit_parallel_for("isnan", range, |item| {
            let step = item.global_range(1);
            let mut i = item.global_id(1);
            while i < numel {
                let nan = Element::to_f64(input[base + i]).is_nan();
                // SAFETY: one write per index.
                unsafe { writer.write(i, nan as u8) };
                i += step;
            }
        });
    });
    Ok(out)
}

fn broadcast_shape(tensors: &[&Tensor]) -> Result<Shape> {
    let mut shape = tensors[0].shape().clone();
    for t in &tensors[1..] {
        shape = shape
            .broadcast_with(t.shape())
            .ok_or_else(|| KilnError::ShapeMismatch {
                expected: shape.dims().to_vec(),
                got: t.dims().to_vec(),
            })?;
    }
    Ok(shape)
}
