//! Scalar evaluation of post-ops, shared by the fused epilogue and the
//! unfused fallback.

use std::f64::consts::{FRAC_2_SQRT_PI, SQRT_2};

use kiln_core::{dispatch_dtype, DType, Element, KilnError, Result, Shape, Tensor};
use rayon::prelude::*;

use super::attr::{BinaryAlgorithm, EltwiseAlgorithm, PostOp, PostOpAttr};

/// `ln(1 + e^x)` without overflow for large `x`.
#[inline]
fn softplus(x: f64) -> f64 {
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

/// Unscaled elementwise function.
pub fn eltwise(algorithm: EltwiseAlgorithm, alpha: f64, beta: f64, x: f64) -> f64 {
    use EltwiseAlgorithm::*;
    match algorithm {
        Sqrt => x.sqrt(),
        Abs => x.abs(),
        Tanh => x.tanh(),
        Square => x * x,
        Exp => x.exp(),
        Log => x.ln(),
        Round => x.round_ties_even(),
        Logistic => 1.0 / (1.0 + (-x).exp()),
        Relu => {
            if x > 0.0 {
                x
            } else {
                alpha * x
            }
        }
        HardSwish => x * (x / 6.0 + 0.5).clamp(0.0, 1.0),
        Mish => x * softplus(x).tanh(),
        LogSigmoid => -softplus(-x),
        Swish => x / (1.0 + (-alpha * x).exp()),
        HardSigmoid => (alpha * x + beta).clamp(0.0, 1.0),
        Clip => x.max(alpha).min(beta),
        Elu => {
            if x > 0.0 {
                x
            } else {
                alpha * x.exp_m1()
            }
        }
        GeluErf => 0.5 * x * (1.0 + libm::erf(x / SQRT_2)),
        GeluTanh => {
            // sqrt(2 / pi)
            let c = FRAC_2_SQRT_PI / SQRT_2;
            0.5 * x * (1.0 + (c * (x + 0.044715 * x * x * x)).tanh())
        }
        Pow => alpha * x.powf(beta),
        Linear => alpha * x + beta,
    }
}

/// `x op y`. Comparisons yield 1 or 0.
pub fn binary(algorithm: BinaryAlgorithm, x: f64, y: f64) -> f64 {
    use BinaryAlgorithm::*;
    let flag = |b: bool| if b { 1.0 } else { 0.0 };
    match algorithm {
        Add => x + y,
        Mul => x * y,
        Div => x / y,
        Min => x.min(y),
        Max => x.max(y),
        Eq => flag(x == y),
        Ne => flag(x != y),
        Ge => flag(x >= y),
        Gt => flag(x > y),
        Le => flag(x <= y),
        Lt => flag(x < y),
    }
}

enum Step<T> {
    Eltwise {
        algorithm: EltwiseAlgorithm,
        scale: f64,
        alpha: f64,
        beta: f64,
    },
    Binary {
        algorithm: BinaryAlgorithm,
        operand: Vec<T>,
        scale: f64,
    },
}

/// A post-op list resolved against one result shape: binary operands are
/// broadcast and cast to the result dtype in row-major order.
pub(crate) struct PostOpChain<T> {
    steps: Vec<Step<T>>,
}

impl<T: Element> PostOpChain<T> {
    pub(crate) fn prepare(attr: &PostOpAttr, shape: &Shape, dtype: DType) -> Result<Self> {
        let steps = attr
            .ops()
            .iter()
            .map(|op| match op {
                PostOp::Eltwise {
                    algorithm,
                    scale,
                    alpha,
                    beta,
                } => Ok(Step::Eltwise {
                    algorithm: *algorithm,
                    scale: f64::from(*scale),
                    alpha: f64::from(*alpha),
                    beta: f64::from(*beta),
                }),
                PostOp::Binary {
                    algorithm,
                    operand,
                    scale,
                } => {
                    if !DType::can_cast(operand.dtype(), dtype) {
                        return Err(KilnError::Cast {
                            from: operand.dtype(),
                            to: dtype,
                        });
                    }
                    let dense = Tensor::zeros_on(shape.dims(), dtype, operand.device());
                    dense.copy_from(operand)?;
                    Ok(Step::Binary {
                        algorithm: *algorithm,
                        operand: dense.to_vec::<T>()?,
                        scale: f64::from(*scale),
                    })
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { steps })
    }

    /// Run every step on the element at row-major position `index`,
    /// rounding to `T` after each one.
    #[inline]
    pub(crate) fn apply(&self, index: usize, x: T) -> T {
        self.steps.iter().fold(x, |v, step| {
            let y = match step {
                Step::Eltwise {
                    algorithm,
                    scale,
                    alpha,
                    beta,
                } => scale * eltwise(*algorithm, *alpha, *beta, v.to_f64()),
                Step::Binary {
                    algorithm,
                    operand,
                    scale,
                } => binary(*algorithm, v.to_f64(), scale * operand[index].to_f64()),
            };
            T::from_f64(y)
        })
    }
}

/// Apply every op of `attr`, in order, to `t` in place.
///
/// This is what a caller runs after the matmul service reports that it did
/// not fuse the post-ops.
pub fn apply_post_ops(t: &Tensor, attr: &PostOpAttr) -> Result<()> {
    if attr.is_empty() || t.numel() == 0 {
        return Ok(());
    }
    let dtype = t.dtype();
    if !dtype.is_float() {
        return Err(KilnError::UnsupportedDType(dtype));
    }
    let dense = t.contiguous()?;
    dispatch_dtype!(dtype, T => apply_dense::<T>(&dense, attr))?;
    if !dense.storage().same_storage(t.storage()) {
        t.copy_from(&dense)?;
    }
    Ok(())
}

fn apply_dense<T: Element>(t: &Tensor, attr: &PostOpAttr) -> Result<()> {
    let chain = PostOpChain::<T>::prepare(attr, t.shape(), t.dtype())?;
    let (base, numel) = (t.offset(), t.numel());
    let mut guard = t.storage().write();
    let data = &mut guard.as_slice_mut::<T>()?[base..base + numel];
    data.par_iter_mut()
        .enumerate()
        .for_each(|(i, v)| *v = chain.apply(i, *v));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!((a - b).abs() < tol, "{a} vs {b}");
    }

    #[test]
    fn test_eltwise_values() {
        use EltwiseAlgorithm::*;
        assert_close(eltwise(Logistic, 0.0, 0.0, 0.0), 0.5, 1e-12);
        assert_close(eltwise(Relu, 0.1, 0.0, -2.0), -0.2, 1e-12);
        assert_close(eltwise(Clip, -1.0, 1.0, 3.0), 1.0, 1e-12);
        assert_close(eltwise(HardSigmoid, 1.0 / 6.0, 0.5, 0.0), 0.5, 1e-12);
        assert_close(eltwise(HardSwish, 0.0, 0.0, 3.0), 3.0, 1e-12);
        assert_close(eltwise(Swish, 1.0, 0.0, 0.0), 0.0, 1e-12);
        assert_close(eltwise(Elu, 1.0, 1.0, -1.0), (-1.0f64).exp() - 1.0, 1e-12);
        assert_close(eltwise(GeluErf, 0.0, 0.0, 1.0), 0.841_344_746, 1e-6);
        assert_close(eltwise(GeluTanh, 0.0, 0.0, 1.0), 0.841_191_990, 1e-6);
        assert_close(eltwise(Pow, 1.0, 2.0, 3.0), 9.0, 1e-12);
        assert_close(eltwise(LogSigmoid, 0.0, 0.0, 0.0), -(2.0f64).ln(), 1e-12);
        assert_close(eltwise(Mish, 0.0, 0.0, 100.0), 100.0, 1e-9);
        assert_eq!(eltwise(Round, 0.0, 0.0, 2.5), 2.0);
    }

    #[test]
    fn test_binary_values() {
        use BinaryAlgorithm::*;
        assert_eq!(binary(Add, 1.0, -3.0), -2.0);
        assert_eq!(binary(Min, 1.0, -3.0), -3.0);
        assert_eq!(binary(Ge, 1.0, 1.0), 1.0);
        assert_eq!(binary(Lt, 1.0, 1.0), 0.0);
    }

    #[test]
    fn test_apply_post_ops_in_order() {
        let t = Tensor::from_f32(&[-4.0, 1.0, 4.0, 9.0], &[2, 2]);
        let mut attr = PostOpAttr::new();
        attr.relu().sqrt().linear(2.0, 1.0);
        apply_post_ops(&t, &attr).unwrap();
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, 3.0, 5.0, 7.0]);
    }

    #[test]
    fn test_apply_binary_broadcast() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let row = Tensor::from_f32(&[10.0, 20.0], &[2]);
        let mut attr = PostOpAttr::new();
        attr.add(row, 0.5);
        apply_post_ops(&t, &attr).unwrap();
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![6.0, 12.0, 8.0, 14.0]);
    }

    #[test]
    fn test_apply_on_strided_view() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let view = t.transpose(0, 1).unwrap();
        let mut attr = PostOpAttr::new();
        attr.square();
        apply_post_ops(&view, &attr).unwrap();
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, 4.0, 9.0, 16.0]);
    }

    #[test]
    fn test_integer_rejected() {
        let t = Tensor::from_slice(&[1i32, 2], &[2]).unwrap();
        let mut attr = PostOpAttr::new();
        attr.relu();
        assert!(matches!(
            apply_post_ops(&t, &attr),
            Err(KilnError::UnsupportedDType(DType::I32))
        ));
    }
}
