//! Batched LU and SVD on top of a pluggable [`FactorizationService`].

pub mod lu;
pub mod service;
pub mod svd;

use kiln_core::{DType, Device, Element, KilnError, Result, Tensor};
use tracing::warn;

pub use lu::lu_with_info;
pub use service::{FactorizationService, HostFactorization, SvdJob};
pub use svd::{svd, svd_out};

/// Split `dims` into batch count and the trailing `(rows, cols)`.
fn matrix_dims(dims: &[usize]) -> Result<(usize, usize, usize)> {
    if dims.len() < 2 {
        let last = dims.last().copied().unwrap_or(1);
        return Err(KilnError::ShapeMismatch {
            expected: vec![last, last],
            got: dims.to_vec(),
        });
    }
    let (batch, matrix) = dims.split_at(dims.len() - 2);
    Ok((batch.iter().product(), matrix[0], matrix[1]))
}

/// Batches of `rows x cols` matrices in column-major order, widened to `f64`.
fn to_column_major(t: &Tensor, batch: usize, rows: usize, cols: usize) -> Result<Vec<f64>> {
    let data = t.to_f64_vec()?;
    let size = rows * cols;
    let mut out = vec![0.0; data.len()];
    for b in 0..batch {
        for i in 0..rows {
            for j in 0..cols {
                out[b * size + i + j * rows] = data[b * size + i * cols + j];
            }
        }
    }
    Ok(out)
}

/// A row-major tensor of `dims` holding `data` cast to `dtype`.
fn tensor_from_slice<T: Element>(
    data: &[T],
    dims: &[usize],
    dtype: DType,
    device: Device,
) -> Result<Tensor> {
    let out = Tensor::zeros_on(dims, dtype, device);
    out.copy_from(&Tensor::from_slice(data, dims)?)?;
    Ok(out)
}

/// Turn non-zero status codes into a `Factorization` error.
///
/// Batched inputs report the first failing batch index; a single matrix
/// reports its status directly.
fn check_infos(op: &str, infos: &[i64], batched: bool) -> Result<()> {
    let Some((index, &info)) = infos.iter().enumerate().find(|(_, &info)| info != 0) else {
        return Ok(());
    };
    let batch = batched.then_some(index);
    warn!(op, ?batch, info, "factorization reported a non-zero status");
    Err(KilnError::Factorization {
        op: op.to_string(),
        batch,
        info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_dims() {
        assert_eq!(matrix_dims(&[4, 2, 3, 5]).unwrap(), (8, 3, 5));
        assert_eq!(matrix_dims(&[3, 3]).unwrap(), (1, 3, 3));
        assert!(matrix_dims(&[3]).is_err());
    }

    #[test]
    fn test_check_infos() {
        assert!(check_infos("lu", &[0, 0], true).is_ok());
        match check_infos("lu", &[0, 2, 1], true) {
            Err(KilnError::Factorization { batch, info, .. }) => {
                assert_eq!(batch, Some(1));
                assert_eq!(info, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        match check_infos("lu", &[3], false) {
            Err(KilnError::Factorization { batch, info, .. }) => {
                assert_eq!(batch, None);
                assert_eq!(info, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_column_major_layout() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        assert_eq!(
            to_column_major(&t, 1, 2, 3).unwrap(),
            vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]
        );
    }
}
