//! Validation, output sizing and path selection for concatenation.

use kiln_core::overlap::{overlap_status, MemOverlap};
use kiln_core::{dispatch_dtype, DType, Element, KilnError, Result, Tensor};
use tracing::{debug, trace};

use super::batched_copy::{launch_batched_copy, BatchedCopyArgs, InputDescriptor};
use super::offset::OutputGeometry;
use crate::runtime::{DeviceBuffer, StagingArena, UnsafeSlice};
use crate::Context;

/// Highest output rank the batched copy handles.
pub const MAX_BATCHED_DIMS: usize = 3;

/// Concatenate `inputs` along `dim` into `out`.
///
/// Every check runs before `out` is touched. `out` is resized when its shape
/// differs from the concatenated shape. When every input is skipped the call
/// is a no-op.
pub fn concatenate(
    ctx: &Context,
    out: &mut Tensor,
    inputs: &[Tensor],
    dim: isize,
    all_same_type: bool,
) -> Result<()> {
    for (index, t) in inputs.iter().enumerate() {
        if t.ndim() == 0 {
            return Err(KilnError::Unsupported(format!(
                "zero-dimensional tensor (at position {index}) cannot be concatenated"
            )));
        }
        if matches!(overlap_status(t, out), MemOverlap::Partial | MemOverlap::Full) {
            return Err(KilnError::Aliasing { index });
        }
    }

    let Some(reference) = inputs.iter().find(|t| !t.is_skipped()) else {
        debug!(inputs = inputs.len(), "cat: every input is skipped");
        return Ok(());
    };
    let dim = reference
        .shape()
        .wrap_axis(dim)
        .ok_or(KilnError::InvalidAxis {
            axis: dim,
            ndim: reference.ndim(),
        })?;

    let mut cat_dim_size = 0;
    let mut has_skipped = false;
    for t in inputs {
        if t.is_skipped() {
            has_skipped = true;
            continue;
        }
        check_shape_except_dim(reference, t, dim)?;
        if !DType::can_cast(t.dtype(), out.dtype()) {
            return Err(KilnError::Cast {
                from: t.dtype(),
                to: out.dtype(),
            });
        }
        if t.device() != out.device() {
            return Err(KilnError::Unsupported(format!(
                "expected all tensors on {}, found one on {}",
                out.device(),
                t.device()
            )));
        }
        cat_dim_size += t.dims()[dim];
    }

    let result_shape = reference.shape().with_dim(dim, cat_dim_size);
    out.resize_(result_shape.dims());
    if out.numel() == 0 {
        return Ok(());
    }

    let batched = ctx.config().cat.enable_batched_copy
        && inputs.len() > 1
        && !has_skipped
        && out.ndim() <= MAX_BATCHED_DIMS
        && out.fits_32bit_indexing()
        && inputs
            .iter()
            .all(|t| t.is_contiguous() && t.fits_32bit_indexing())
        && all_same_type;
    debug!(
        inputs = inputs.len(),
        dim,
        out_shape = %out.shape(),
        batched,
        "cat"
    );

    if batched {
        batched_cat(ctx, out, inputs, dim)
    } else {
        narrow_copy_cat(out, inputs, dim)
    }
}

fn check_shape_except_dim(reference: &Tensor, t: &Tensor, dim: usize) -> Result<()> {
    let mismatch = || KilnError::ShapeMismatch {
        expected: reference.dims().to_vec(),
        got: t.dims().to_vec(),
    };
    if t.ndim() != reference.ndim() {
        return Err(mismatch());
    }
    for (d, (&a, &b)) in reference.dims().iter().zip(t.dims()).enumerate() {
        if d != dim && a != b {
            return Err(mismatch());
        }
    }
    Ok(())
}

/// Copy each input into its slice of `out`. Handles any rank, layout or
/// dtype mix.
fn narrow_copy_cat(out: &Tensor, inputs: &[Tensor], dim: usize) -> Result<()> {
    let mut offset = 0;
    for t in inputs.iter().filter(|t| !t.is_skipped()) {
        let len = t.dims()[dim];
        out.narrow(dim, offset, len)?.copy_from(t)?;
        offset += len;
    }
    Ok(())
}

fn batched_cat(ctx: &Context, out: &Tensor, inputs: &[Tensor], dim: usize) -> Result<()> {
    // Inputs sharing storage with `out` (but not overlapping it) are read
    // through a private copy so the output can be locked for writing.
    let inputs = inputs
        .iter()
        .map(|t| {
            if t.storage().same_storage(out.storage()) {
                t.clone_contiguous()
            } else {
                Ok(t.clone())
            }
        })
        .collect::<Result<Vec<_>>>()?;

    dispatch_dtype!(out.dtype(), T => match out.ndim() {
        1 => batched_cat_typed::<T, 1>(ctx, out, &inputs, dim),
        2 => batched_cat_typed::<T, 2>(ctx, out, &inputs, dim),
        3 => batched_cat_typed::<T, 3>(ctx, out, &inputs, dim),
        n => Err(KilnError::Unsupported(format!(
            "batched concat handles at most {MAX_BATCHED_DIMS} dimensions, got {n}"
        ))),
    })
}

fn batched_cat_typed<T: Element, const DIMS: usize>(
    ctx: &Context,
    out: &Tensor,
    inputs: &[Tensor],
    dim: usize,
) -> Result<()> {
    let geometry = OutputGeometry::<DIMS>::of(out).ok_or(KilnError::ShapeMismatch {
        expected: vec![0; DIMS],
        got: out.dims().to_vec(),
    })?;
    let queue = ctx.queue(out.device());
    let batch_size = ctx.config().cat.batch_size;

    let guards: Vec<_> = inputs.iter().map(|t| t.storage().read()).collect();
    let sources = guards
        .iter()
        .map(|g| g.as_slice::<T>())
        .collect::<Result<Vec<_>>>()?;
    let mut out_guard = out.storage().write();
    let writer = UnsafeSlice::new(out_guard.as_slice_mut::<T>()?);
    let args = BatchedCopyArgs {
        output: &writer,
        output_base: out.offset(),
        sources: &sources,
        geometry,
        concat_dim: dim,
        dim_stride: out.strides()[dim],
    };

    let mut arena = StagingArena::new();
    let mut offset = 0;
    for (batch, chunk) in inputs.chunks(batch_size).enumerate() {
        let mut staging = arena.alloc::<InputDescriptor>(chunk.len());
        for (slot, t) in chunk.iter().enumerate() {
            let dim_size = t.dims()[dim];
            staging.push(InputDescriptor {
                source: batch * batch_size + slot,
                source_offset: t.offset(),
                offset,
                dim_size,
                nelements: t.numel(),
            });
            offset += dim_size;
        }
        let meta = DeviceBuffer::upload(&queue, staging);
        trace!(batch, inputs = meta.len(), "cat: dispatch batch");
        launch_batched_copy(&queue, &args, &meta);
    }
    debug!(batches = arena.allocations(), "cat: batched copy complete");
    Ok(())
}
