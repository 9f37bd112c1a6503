//! Batched singular value decomposition.

use kiln_core::{DType, KilnError, Result, Tensor};
use rayon::prelude::*;
use tracing::debug;

use super::service::SvdJob;
use super::{check_infos, matrix_dims, tensor_from_slice, to_column_major};
use crate::Context;

/// `A = U diag(S) Vᵀ` for every matrix in the trailing two dimensions.
///
/// For an input of shape `[..., m, n]` with `k = min(m, n)`, `S` is
/// `[..., k]` in descending order. With `some`, `U` is `[..., m, k]` and `V`
/// is `[..., n, k]`; otherwise `[..., m, m]` and `[..., n, n]`. When
/// `compute_uv` is false, `U` and `V` keep those shapes but are zero-filled.
///
/// ```
/// use kiln_core::Tensor;
/// use kiln_kernels::{linalg, Context};
///
/// let a = Tensor::from_slice(&[3.0f64, 0.0, 0.0, 4.0], &[2, 2]).unwrap();
/// let (_, s, _) = linalg::svd(Context::global(), &a, true, false).unwrap();
/// assert_eq!(s.to_vec::<f64>().unwrap(), vec![4.0, 3.0]);
/// ```
pub fn svd(ctx: &Context, a: &Tensor, some: bool, compute_uv: bool) -> Result<(Tensor, Tensor, Tensor)> {
    let (batch, m, n) = matrix_dims(a.dims())?;
    if !a.dtype().is_float() {
        return Err(KilnError::UnsupportedDType(a.dtype()));
    }
    let k = m.min(n);
    let shape_job = if some { SvdJob::Reduced } else { SvdJob::Full };
    let job = if compute_uv { shape_job } else { SvdJob::None };
    let (u_cols, v_cols) = (shape_job.u_cols(m, n), shape_job.vt_rows(m, n));

    let lead = &a.dims()[..a.ndim() - 2];
    let with = |tail: &[usize]| -> Vec<usize> { lead.iter().chain(tail).copied().collect() };
    let (u_dims, s_dims, v_dims) = (with(&[m, u_cols]), with(&[k]), with(&[n, v_cols]));
    let (dtype, device) = (a.dtype(), a.device());

    if a.numel() == 0 {
        debug!(shape = %a.shape(), "svd: empty input");
        return Ok((
            Tensor::zeros_on(&u_dims, dtype, device),
            Tensor::zeros_on(&s_dims, dtype, device),
            Tensor::zeros_on(&v_dims, dtype, device),
        ));
    }

    let service = ctx.factorization()?;
    let packed = to_column_major(a, batch, m, n)?;
    let (uc, vr) = (job.u_cols(m, n), job.vt_rows(m, n));
    let results = packed
        .par_chunks(m * n)
        .map(|matrix| {
            let mut s = vec![0.0; k];
            let mut u = vec![0.0; m * uc];
            let mut vt = vec![0.0; vr * n];
            let info = service.gesvd(job, m, n, matrix, &mut s, &mut u, &mut vt)?;
            Ok((s, u, vt, info))
        })
        .collect::<Result<Vec<_>>>()?;

    let infos: Vec<i64> = results.iter().map(|r| r.3).collect();
    debug!(batch, m, n, ?job, "svd: factorized");
    check_infos("svd", &infos, a.ndim() > 2)?;

    let mut s_out = Vec::with_capacity(batch * k);
    let mut u_out = vec![0.0; batch * m * u_cols];
    let mut v_out = vec![0.0; batch * n * v_cols];
    for (b, (s, u, vt, _)) in results.iter().enumerate() {
        s_out.extend_from_slice(s);
        if job == SvdJob::None {
            continue;
        }
        // column-major U -> row-major; V[i, j] = Vᵀ[j, i]
        let u_base = b * m * u_cols;
        for i in 0..m {
            for j in 0..u_cols {
                u_out[u_base + i * u_cols + j] = u[i + j * m];
            }
        }
        let v_base = b * n * v_cols;
        for i in 0..n {
            for j in 0..v_cols {
                v_out[v_base + i * v_cols + j] = vt[j + i * v_cols];
            }
        }
    }

    Ok((
        tensor_from_slice(&u_out, &u_dims, dtype, device)?,
        tensor_from_slice(&s_out, &s_dims, dtype, device)?,
        tensor_from_slice(&v_out, &v_dims, dtype, device)?,
    ))
}

/// [`svd`] writing into `u`, `s` and `v`, each resized to its result shape.
///
/// Nothing is written unless the decomposition succeeds and every result
/// can be cast to its output's dtype.
pub fn svd_out(
    ctx: &Context,
    u: &mut Tensor,
    s: &mut Tensor,
    v: &mut Tensor,
    a: &Tensor,
    some: bool,
    compute_uv: bool,
) -> Result<()> {
    let (u_tmp, s_tmp, v_tmp) = svd(ctx, a, some, compute_uv)?;
    for (out, tmp) in [(&*u, &u_tmp), (&*s, &s_tmp), (&*v, &v_tmp)] {
        if !DType::can_cast(tmp.dtype(), out.dtype()) {
            return Err(KilnError::Cast {
                from: tmp.dtype(),
                to: out.dtype(),
            });
        }
    }
    for (out, tmp) in [(u, u_tmp), (s, s_tmp), (v, v_tmp)] {
        out.resize_(tmp.dims());
        out.copy_from(&tmp)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelConfig;

    fn ctx() -> Context {
        Context::new(KernelConfig::default()).unwrap()
    }

    #[test]
    fn test_shapes() {
        let a = Tensor::zeros(&[2, 4, 3], DType::F32);
        let (u, s, v) = svd(&ctx(), &a, true, true).unwrap();
        assert_eq!(u.dims(), &[2, 4, 3]);
        assert_eq!(s.dims(), &[2, 3]);
        assert_eq!(v.dims(), &[2, 3, 3]);

        let (u, s, v) = svd(&ctx(), &a, false, true).unwrap();
        assert_eq!(u.dims(), &[2, 4, 4]);
        assert_eq!(s.dims(), &[2, 3]);
        assert_eq!(v.dims(), &[2, 3, 3]);
    }

    #[test]
    fn test_no_uv_is_zero_filled() {
        let a = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]);
        let (u, s, v) = svd(&ctx(), &a, true, false).unwrap();
        assert_eq!(u.dims(), &[3, 2]);
        assert!(u.to_vec::<f32>().unwrap().iter().all(|&x| x == 0.0));
        assert!(v.to_vec::<f32>().unwrap().iter().all(|&x| x == 0.0));
        assert!(s.to_vec::<f32>().unwrap()[0] > 9.0);
    }

    #[test]
    fn test_rejects_rank1_and_ints() {
        let ctx = ctx();
        assert!(svd(&ctx, &Tensor::zeros(&[3], DType::F32), true, true).is_err());
        assert!(matches!(
            svd(&ctx, &Tensor::zeros(&[2, 2], DType::I64), true, true),
            Err(KilnError::UnsupportedDType(DType::I64))
        ));
    }

    #[test]
    fn test_svd_out_resizes() {
        let a = Tensor::from_slice(&[2.0f64, 0.0, 0.0, 1.0], &[2, 2]).unwrap();
        let mut u = Tensor::zeros(&[0], DType::F64);
        let mut s = Tensor::zeros(&[0], DType::F32);
        let mut v = Tensor::zeros(&[0], DType::F64);
        svd_out(&ctx(), &mut u, &mut s, &mut v, &a, true, true).unwrap();
        assert_eq!(u.dims(), &[2, 2]);
        assert_eq!(s.dtype(), DType::F32);
        assert_eq!(s.to_vec::<f32>().unwrap(), vec![2.0, 1.0]);
    }

    #[test]
    fn test_svd_out_rejects_int_output() {
        let a = Tensor::from_slice(&[2.0f64, 0.0, 0.0, 1.0], &[2, 2]).unwrap();
        let mut u = Tensor::zeros(&[0], DType::F64);
        let mut s = Tensor::zeros(&[0], DType::I32);
        let mut v = Tensor::zeros(&[0], DType::F64);
        let err = svd_out(&ctx(), &mut u, &mut s, &mut v, &a, true, true).unwrap_err();
        assert!(matches!(err, KilnError::Cast { .. }));
        assert_eq!(u.dims(), &[0]);
    }
}
