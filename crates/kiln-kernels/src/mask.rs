//! Triangular masks (`triu`, `tril`) over the trailing two dimensions.

use kiln_core::{dispatch_dtype, Element, KilnError, Result, Tensor};

use crate::runtime::{NdRange, Queue, UnsafeSlice};
use crate::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Triangle {
    Upper,
    Lower,
}

impl Triangle {
    fn name(self) -> &'static str {
        match self {
            Triangle::Upper => "triu",
            Triangle::Lower => "tril",
        }
    }

    #[inline]
    fn keeps(self, row: usize, col: usize, diagonal: i64) -> bool {
        let d = col as i64 - row as i64;
        match self {
            Triangle::Upper => d >= diagonal,
            Triangle::Lower => d <= diagonal,
        }
    }
}

/// Upper triangle of `a`; elements below diagonal `k` become zero.
pub fn triu(ctx: &Context, a: &Tensor, k: i64) -> Result<Tensor> {
    let mut out = alloc_like(a)?;
    apply_triangle(ctx, &mut out, a, k, Triangle::Upper)?;
    Ok(out)
}

/// Lower triangle of `a`; elements above diagonal `k` become zero.
pub fn tril(ctx: &Context, a: &Tensor, k: i64) -> Result<Tensor> {
    let mut out = alloc_like(a)?;
    apply_triangle(ctx, &mut out, a, k, Triangle::Lower)?;
    Ok(out)
}

pub fn triu_out(ctx: &Context, out: &mut Tensor, a: &Tensor, k: i64) -> Result<()> {
    apply_triangle(ctx, out, a, k, Triangle::Upper)
}

pub fn tril_out(ctx: &Context, out: &mut Tensor, a: &Tensor, k: i64) -> Result<()> {
    apply_triangle(ctx, out, a, k, Triangle::Lower)
}

/// In-place `triu`.
pub fn triu_(ctx: &Context, a: &Tensor, k: i64) -> Result<()> {
    let mut out = a.clone();
    apply_triangle(ctx, &mut out, a, k, Triangle::Upper)
}

/// In-place `tril`.
pub fn tril_(ctx: &Context, a: &Tensor, k: i64) -> Result<()> {
    let mut out = a.clone();
    apply_triangle(ctx, &mut out, a, k, Triangle::Lower)
}

/// Result buffer with `a`'s layout when the mask can run on it directly.
fn alloc_like(a: &Tensor) -> Result<Tensor> {
    if dense_matrix_strides(a).is_some() && !a.is_contiguous() {
        Tensor::empty_strided_on(a.dims(), a.strides(), a.dtype(), a.device())
    } else {
        Ok(Tensor::zeros_on(a.dims(), a.dtype(), a.device()))
    }
}

/// Row and column strides used to recover (row, col) from a position
/// within one matrix, or `None` if `t` is not a dense batch of matrices.
///
/// A size-1 dimension gets the matrix element count as its stride so the
/// larger-stride test still picks the right decomposition.
fn dense_matrix_strides(t: &Tensor) -> Option<(usize, usize)> {
    let n = t.ndim();
    if n < 2 {
        return None;
    }
    let rows = t.dims()[n - 2];
    let cols = t.dims()[n - 1];
    let (mut row_stride, mut col_stride) = if t.is_contiguous() {
        (cols, 1)
    } else if n == 2 && t.transpose(0, 1).ok()?.is_contiguous() {
        (1, rows)
    } else {
        return None;
    };
    let matrix = rows * cols;
    if rows == 1 {
        row_stride = matrix;
    }
    if cols == 1 {
        col_stride = matrix;
    }
    Some((row_stride, col_stride))
}

fn apply_triangle(
    ctx: &Context,
    out: &mut Tensor,
    src: &Tensor,
    diagonal: i64,
    triangle: Triangle,
) -> Result<()> {
    if src.ndim() < 2 {
        return Err(KilnError::Unsupported(format!(
            "{}: input tensor must have at least 2 dimensions",
            triangle.name()
        )));
    }
    if out.dtype() != src.dtype() {
        return Err(KilnError::DTypeMismatch {
            expected: src.dtype(),
            got: out.dtype(),
        });
    }
    if out.dims() != src.dims() {
        out.resize_(src.dims());
    }
    if src.numel() == 0 {
        return Ok(());
    }

    let shares = out.storage().same_storage(src.storage());
    let same_view = shares && out.offset() == src.offset() && out.strides() == src.strides();
    let direct = dense_matrix_strides(src)
        .filter(|_| out.strides() == src.strides() && (same_view || !shares));
    tracing::debug!(
        op = triangle.name(),
        shape = %src.shape(),
        diagonal,
        direct = direct.is_some(),
        "triangle mask"
    );

    match direct {
        Some(strides) => mask_dense(ctx, out, src, strides, diagonal, triangle),
        None => {
            let dense = src.clone_contiguous()?;
            let tmp = Tensor::zeros_on(src.dims(), src.dtype(), src.device());
            let strides = dense_matrix_strides(&dense).ok_or_else(|| {
                KilnError::Storage("contiguous copy is not a dense matrix batch".into())
            })?;
            mask_dense(ctx, &tmp, &dense, strides, diagonal, triangle)?;
            out.copy_from(&tmp)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MaskArgs {
    out_base: usize,
    src_base: usize,
    row_stride: usize,
    col_stride: usize,
    matrix: usize,
    numel: usize,
    diagonal: i64,
    triangle: Triangle,
}

fn mask_dense(
    ctx: &Context,
    out: &Tensor,
    src: &Tensor,
    (row_stride, col_stride): (usize, usize),
    diagonal: i64,
    triangle: Triangle,
) -> Result<()> {
    let n = src.ndim();
    let args = MaskArgs {
        out_base: out.offset(),
        src_base: src.offset(),
        row_stride,
        col_stride,
        matrix: src.dims()[n - 2] * src.dims()[n - 1],
        numel: src.numel(),
        diagonal,
        triangle,
    };
    let queue = ctx.queue(src.device());
    dispatch_dtype!(src.dtype(), T => {
        if out.storage().same_storage(src.storage()) {
            let mut guard = out.storage().write();
            let writer = UnsafeSlice::new(guard.as_slice_mut::<T>()?);
            launch_mask::<T>(&queue, &writer, None, &args);
        } else {
            let src_guard = src.storage().read();
            let input = src_guard.as_slice::<T>()?;
            let mut guard = out.storage().write();
            let writer = UnsafeSlice::new(guard.as_slice_mut::<T>()?);
            launch_mask::<T>(&queue, &writer, Some(input), &args);
        }
    });
    Ok(())
}

/// Grid-stride kernel over every position of the batch. `src == None`
/// masks the output in place.
fn launch_mask<T: Element>(
    queue: &Queue,
    out: &UnsafeSlice<'_, T>,
    src: Option<&[T]>,
    args: &MaskArgs,
) {
    let range = NdRange::linear(args.numel, queue.max_work_group_size());
    queue.submit_parallel_for(args.triangle.name(), range, |item| {
        let step = item.global_range(1);
        let mut i = item.global_id(1);
        while i < args.numel {
            let p = i % args.matrix;
            let (row, col) = if args.row_stride > args.col_stride {
                (p / args.row_stride, p % args.row_stride / args.col_stride)
            } else {
                (p % args.col_stride / args.row_stride, p / args.col_stride)
            };
            // SAFETY: each work-item touches only position `i`.
            unsafe {
                let value = if args.triangle.keeps(row, col, args.diagonal) {
                    match src {
                        Some(s) => s[args.src_base + i],
                        None => out.read(args.out_base + i),
                    }
                } else {
                    T::zero()
                };
                out.write(args.out_base + i, value);
            }
            i += step;
        }
    });
}
