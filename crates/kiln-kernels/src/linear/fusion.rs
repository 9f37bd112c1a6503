//! Matmul with an optional fused post-op epilogue.
//!
//! Optimizations:
//! - Rayon parallelism across output rows
//! - Post-op chain evaluated in the store epilogue (no second pass)

use kiln_core::{dispatch_dtype, DType, Element, KilnError, Result, Shape, Tensor};
use rayon::prelude::*;

use super::attr::PostOpAttr;
use super::post_ops::PostOpChain;
use crate::config::LinearConfig;

/// Minimum rows before we use rayon parallelism.
const PAR_ROW_THRESHOLD: usize = 16;

/// Result of a fusion attempt.
///
/// When `fused` is false, `result` is the plain `input @ weight + bias` and
/// the caller must apply every post-op itself.
#[derive(Debug, Clone)]
pub struct FusionOutcome {
    pub result: Tensor,
    pub fused: bool,
}

/// A matmul service that may fold post-ops into the product.
pub trait MatmulFusion: Send + Sync {
    /// `input [m, k] @ weight [k, n] + bias [n]`, followed by `attr` when the
    /// service decides to fuse it.
    fn matmul(
        &self,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        attr: &PostOpAttr,
    ) -> Result<FusionOutcome>;
}

/// Host matmul fusing post-ops for `F32`/`F64` results.
#[derive(Debug, Clone, Default)]
pub struct CpuMatmulFusion {
    config: LinearConfig,
}

impl CpuMatmulFusion {
    pub fn new(config: LinearConfig) -> Self {
        Self { config }
    }

    /// Whether this service fuses `attr` for a result of `dtype`.
    pub fn can_fuse(&self, dtype: DType, attr: &PostOpAttr) -> bool {
        self.config.enable_fusion
            && matches!(dtype, DType::F32 | DType::F64)
            && (self.config.fuse_binary || !attr.has_binary())
    }
}

impl MatmulFusion for CpuMatmulFusion {
    fn matmul(
        &self,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        attr: &PostOpAttr,
    ) -> Result<FusionOutcome> {
        let dtype = input.dtype();
        if !dtype.is_float() {
            return Err(KilnError::UnsupportedDType(dtype));
        }
        for other in std::iter::once(weight).chain(bias) {
            if other.dtype() != dtype {
                return Err(KilnError::DTypeMismatch {
                    expected: dtype,
                    got: other.dtype(),
                });
            }
        }
        if input.ndim() != 2 || weight.ndim() != 2 {
            return Err(KilnError::Unsupported(format!(
                "matmul expects 2-D operands, got {}-D and {}-D",
                input.ndim(),
                weight.ndim()
            )));
        }
        let (m, k) = (input.dims()[0], input.dims()[1]);
        let (k2, n) = (weight.dims()[0], weight.dims()[1]);
        if k != k2 {
            return Err(KilnError::MatmulDimMismatch { m, k1: k, k2, n });
        }
        if let Some(b) = bias {
            if b.dims() != [n] {
                return Err(KilnError::ShapeMismatch {
                    expected: vec![n],
                    got: b.dims().to_vec(),
                });
            }
        }

        let fused = self.can_fuse(dtype, attr);
        let epilogue = if fused { Some(attr) } else { None };
        let result = dispatch_dtype!(dtype, T => matmul_typed::<T>(input, weight, bias, epilogue))?;
        Ok(FusionOutcome { result, fused })
    }
}

fn matmul_typed<T: Element>(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    epilogue: Option<&PostOpAttr>,
) -> Result<Tensor> {
    let (m, k) = (input.dims()[0], input.dims()[1]);
    let n = weight.dims()[1];
    let dtype = input.dtype();
    let out = Tensor::zeros_on(&[m, n], dtype, input.device());
    if m == 0 || n == 0 {
        return Ok(out);
    }

    let a = input.to_vec::<T>()?;
    let b = weight.to_vec::<T>()?;
    let bias = bias.map(|t| t.to_vec::<T>()).transpose()?;
    let chain = epilogue
        .map(|attr| PostOpChain::<T>::prepare(attr, &Shape::new(&[m, n]), dtype))
        .transpose()?;

    let compute_row = |(row, c_row): (usize, &mut [T])| {
        let a_row = &a[row * k..(row + 1) * k];
        for (col, c) in c_row.iter_mut().enumerate() {
            let mut acc = 0.0f64;
            for (p, &x) in a_row.iter().enumerate() {
                acc += x.to_f64() * b[p * n + col].to_f64();
            }
            if let Some(bias) = &bias {
                acc += bias[col].to_f64();
            }
            let v = T::from_f64(acc);
            *c = match &chain {
                Some(chain) => chain.apply(row * n + col, v),
                None => v,
            };
        }
    };

    let mut c_data = vec![T::zero(); m * n];
    if m >= PAR_ROW_THRESHOLD {
        c_data.par_chunks_mut(n).enumerate().for_each(&compute_row);
    } else {
        c_data.chunks_mut(n).enumerate().for_each(&compute_row);
    }

    out.storage()
        .write()
        .as_slice_mut::<T>()?
        .copy_from_slice(&c_data);
    Ok(out)
}
