use kiln_core::{DType, KilnError, Result, Tensor};
use tracing::debug;

use super::{check_infos, matrix_dims, tensor_from_slice, to_column_major};
use crate::Context;

/// LU factorization with partial pivoting of a batch of square matrices.
///
/// Returns `(lu, pivots, infos)`:
/// - `lu` has the input's shape and holds `L` (unit diagonal, implicit) and
///   `U` packed together, stored column-major within each matrix.
/// - `pivots` (`I64`, shape `[..., n]`) lists the 1-based row swapped with
///   each row.
/// - `infos` (`I64`, shape `[...]`) is 0 for a regular matrix and `i` when
///   `U(i, i)` is exactly zero.
///
/// With `check_errors`, a non-zero status becomes an error naming the first
/// failing batch element (or the status alone for an unbatched input).
pub fn lu_with_info(
    ctx: &Context,
    a: &Tensor,
    pivot: bool,
    check_errors: bool,
) -> Result<(Tensor, Tensor, Tensor)> {
    if !pivot {
        return Err(KilnError::Unsupported(
            "lu without pivoting is not implemented".into(),
        ));
    }
    let (batch, m, n) = matrix_dims(a.dims())?;
    if m != n {
        let mut expected = a.dims().to_vec();
        let last = expected.len() - 1;
        expected[last] = m;
        return Err(KilnError::ShapeMismatch {
            expected,
            got: a.dims().to_vec(),
        });
    }
    if !a.dtype().is_float() {
        return Err(KilnError::UnsupportedDType(a.dtype()));
    }

    let ndim = a.ndim();
    let device = a.device();
    let pivot_dims = &a.dims()[..ndim - 1];
    let info_dims = &a.dims()[..ndim - 2];

    let mut strides = vec![0; ndim];
    strides[ndim - 2] = 1;
    strides[ndim - 1] = m;
    let mut step = m * n;
    for d in (0..ndim - 2).rev() {
        strides[d] = step;
        step *= a.dims()[d];
    }
    let lu = Tensor::empty_strided_on(a.dims(), &strides, a.dtype(), device)?;

    if a.numel() == 0 {
        debug!(shape = %a.shape(), "lu: empty input");
        return Ok((
            lu,
            Tensor::zeros_on(pivot_dims, DType::I64, device),
            Tensor::zeros_on(info_dims, DType::I64, device),
        ));
    }

    let service = ctx.factorization()?;
    let mut packed = to_column_major(a, batch, m, n)?;
    let mut pivots = vec![0i64; batch * n];
    let mut infos = vec![0i64; batch];
    service.getrf_batch(m, n, &mut packed, &mut pivots, &mut infos)?;
    debug!(
        batch,
        n,
        failed = infos.iter().filter(|&&i| i != 0).count(),
        "lu: factorized"
    );

    // `lu` is dense in exactly the column-major order of `packed`.
    lu.as_strided(&[a.numel()], &[1], 0)?
        .copy_from(&Tensor::from_slice(&packed, &[a.numel()])?)?;
    let pivots = tensor_from_slice(&pivots, pivot_dims, DType::I64, device)?;
    let infos_tensor = tensor_from_slice(&infos, info_dims, DType::I64, device)?;

    if check_errors {
        check_infos("lu", &infos, ndim > 2)?;
    }
    Ok((lu, pivots, infos_tensor))
}
