//! The `linear` operator family and its name registry.

use kiln_core::{KilnError, Result, Shape, Tensor};
use tracing::debug;

use super::attr::{BinaryAlgorithm, PostOp, PostOpAttr};
use super::post_ops::apply_post_ops;
use crate::Context;

/// What runs after `input @ weight + bias`.
#[derive(Debug, Clone)]
pub enum LinearOp {
    Plain,
    Sqrt,
    Abs,
    Tanh,
    Square,
    Exp,
    Log,
    Round,
    Sigmoid,
    Relu,
    HardSwish,
    Mish,
    LogSigmoid,
    Silu,
    HardSigmoid,
    LeakyRelu {
        negative_slope: f64,
    },
    HardTanh {
        min: f64,
        max: f64,
    },
    /// Computes `scale * elu(x, alpha)`: `scale` is applied to the output.
    /// `input_scale` must be 1; any other value returns `Unsupported`.
    Elu {
        alpha: f64,
        scale: f64,
        input_scale: f64,
    },
    /// `approximate` is `"none"` (erf) or `"tanh"`.
    Gelu {
        approximate: String,
    },
    Pow {
        exponent: f64,
    },
    ScalarMul(f64),
    ScalarDiv(f64),
    /// `x + scalar * scale`
    ScalarAdd {
        scalar: f64,
        scale: f64,
    },
    /// `x - scalar * scale`
    ScalarSub {
        scalar: f64,
        scale: f64,
    },
    /// `x + alpha * accumul`
    Sum {
        accumul: Tensor,
        alpha: f64,
    },
    /// `x - alpha * other`
    BinarySub {
        other: Tensor,
        alpha: f64,
    },
    /// `x op other` for add, mul, div, min, max and comparisons.
    ///
    /// Comparisons yield 1 or 0 in the result's float dtype, not a `Bool`
    /// tensor.
    Binary {
        algorithm: BinaryAlgorithm,
        other: Tensor,
    },
}

impl LinearOp {
    pub fn name(&self) -> &'static str {
        match self {
            LinearOp::Plain => "linear",
            LinearOp::Sqrt => "linear_sqrt",
            LinearOp::Abs => "linear_abs",
            LinearOp::Tanh => "linear_tanh",
            LinearOp::Square => "linear_square",
            LinearOp::Exp => "linear_exp",
            LinearOp::Log => "linear_log",
            LinearOp::Round => "linear_round",
            LinearOp::Sigmoid => "linear_sigmoid",
            LinearOp::Relu => "linear_relu",
            LinearOp::HardSwish => "linear_hardswish",
            LinearOp::Mish => "linear_mish",
            LinearOp::LogSigmoid => "linear_log_sigmoid",
            LinearOp::Silu => "linear_silu",
            LinearOp::HardSigmoid => "linear_hardsigmoid",
            LinearOp::LeakyRelu { .. } => "linear_leaky_relu",
            LinearOp::HardTanh { .. } => "linear_hardtanh",
            LinearOp::Elu { .. } => "linear_elu",
            LinearOp::Gelu { .. } => "linear_gelu",
            LinearOp::Pow { .. } => "linear_pow",
            LinearOp::ScalarMul(_) => "linear_binary_mul.Scalar",
            LinearOp::ScalarDiv(_) => "linear_binary_div.Scalar",
            LinearOp::ScalarAdd { .. } => "linear_sum.Scalar",
            LinearOp::ScalarSub { .. } => "linear_binary_sub.Scalar",
            LinearOp::Sum { .. } => "linear_sum",
            LinearOp::BinarySub { .. } => "linear_binary_sub",
            LinearOp::Binary { algorithm, .. } => match algorithm {
                BinaryAlgorithm::Add => "linear_binary_add",
                BinaryAlgorithm::Mul => "linear_binary_mul",
                BinaryAlgorithm::Div => "linear_binary_div",
                BinaryAlgorithm::Min => "linear_binary_min",
                BinaryAlgorithm::Max => "linear_binary_max",
                BinaryAlgorithm::Eq => "linear_binary_eq",
                BinaryAlgorithm::Ne => "linear_binary_ne",
                BinaryAlgorithm::Ge => "linear_binary_ge",
                BinaryAlgorithm::Gt => "linear_binary_gt",
                BinaryAlgorithm::Le => "linear_binary_le",
                BinaryAlgorithm::Lt => "linear_binary_lt",
            },
        }
    }

    /// The post-op list this op attaches to the matmul.
    pub fn post_ops(&self) -> Result<PostOpAttr> {
        let mut attr = PostOpAttr::new();
        match self {
            LinearOp::Plain => {}
            LinearOp::Sqrt => {
                attr.sqrt();
            }
            LinearOp::Abs => {
                attr.abs();
            }
            LinearOp::Tanh => {
                attr.tanh();
            }
            LinearOp::Square => {
                attr.square();
            }
            LinearOp::Exp => {
                attr.exp();
            }
            LinearOp::Log => {
                attr.log();
            }
            LinearOp::Round => {
                attr.round();
            }
            LinearOp::Sigmoid => {
                attr.sigmoid();
            }
            LinearOp::Relu => {
                attr.relu();
            }
            LinearOp::HardSwish => {
                attr.hardswish();
            }
            LinearOp::Mish => {
                attr.mish();
            }
            LinearOp::LogSigmoid => {
                attr.log_sigmoid();
            }
            LinearOp::Silu => {
                attr.silu();
            }
            LinearOp::HardSigmoid => {
                attr.hardsigmoid();
            }
            LinearOp::LeakyRelu { negative_slope } => {
                attr.leaky_relu(*negative_slope as f32);
            }
            LinearOp::HardTanh { min, max } => {
                attr.hardtanh(*min as f32, *max as f32);
            }
            LinearOp::Elu {
                alpha,
                scale,
                input_scale,
            } => {
                if *input_scale != 1.0 {
                    return Err(KilnError::Unsupported(format!(
                        "linear_elu: input_scale {input_scale} is not supported"
                    )));
                }
                attr.elu(*alpha as f32, *scale as f32);
            }
            LinearOp::Gelu { approximate } => match approximate.as_str() {
                "none" => {
                    attr.gelu(false);
                }
                "tanh" => {
                    attr.gelu(true);
                }
                other => {
                    return Err(KilnError::Unsupported(format!(
                        "linear_gelu: unsupported approximation '{other}'"
                    )))
                }
            },
            LinearOp::Pow { exponent } => {
                attr.pow(*exponent as f32);
            }
            LinearOp::ScalarMul(s) => {
                attr.linear(*s as f32, 0.0);
            }
            LinearOp::ScalarDiv(s) => {
                if *s == 0.0 {
                    return Err(KilnError::DivisionByZero("linear_binary_div.Scalar"));
                }
                attr.linear((1.0 / *s) as f32, 0.0);
            }
            LinearOp::ScalarAdd { scalar, scale } => {
                attr.linear(1.0, (scalar * scale) as f32);
            }
            LinearOp::ScalarSub { scalar, scale } => {
                attr.linear(1.0, (scalar * -scale) as f32);
            }
            LinearOp::Sum { accumul, alpha } => {
                attr.add(accumul.clone(), *alpha as f32);
            }
            LinearOp::BinarySub { other, alpha } => {
                attr.sub(other.clone(), *alpha as f32);
            }
            LinearOp::Binary { algorithm, other } => {
                attr.binary(*algorithm, other.clone());
            }
        }
        Ok(attr)
    }
}

/// `input @ weight + bias` followed by `op`.
///
/// `weight` is `[in_features, out_features]` and `bias`, if given,
/// `[out_features]`. Leading input dimensions are flattened for the matmul
/// and restored on the result. Binary operands broadcast to the result.
pub fn linear(
    ctx: &Context,
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    op: &LinearOp,
) -> Result<Tensor> {
    let attr = op.post_ops()?;
    if input.ndim() == 0 || weight.ndim() != 2 {
        return Err(KilnError::Unsupported(format!(
            "{}: expected an input of rank >= 1 and a 2-D weight, got {}-D and {}-D",
            op.name(),
            input.ndim(),
            weight.ndim()
        )));
    }
    let (lead, last) = input.dims().split_at(input.ndim() - 1);
    let k = last[0];
    let (k2, n) = (weight.dims()[0], weight.dims()[1]);
    let m: usize = lead.iter().product();
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

    let out_dims: Vec<usize> = lead.iter().copied().chain([n]).collect();
    let attr = flatten_operands(&attr, &Shape::new(&out_dims), m, n)?;
    let input_2d = input.contiguous()?.reshape(&[m as isize, k as isize])?;

    let outcome = ctx.matmul_fusion().matmul(&input_2d, weight, bias, &attr)?;
    debug!(
        op = op.name(),
        m,
        k,
        n,
        post_ops = attr.len(),
        fused = outcome.fused,
        "linear"
    );
    if !outcome.fused {
        apply_post_ops(&outcome.result, &attr)?;
    }
    let out_dims: Vec<isize> = out_dims.iter().map(|&d| d as isize).collect();
    outcome.result.reshape(&out_dims)
}

/// Broadcast binary operands to the output shape and view them as `[m, n]`.
fn flatten_operands(attr: &PostOpAttr, out_shape: &Shape, m: usize, n: usize) -> Result<PostOpAttr> {
    let mut flat = PostOpAttr::new();
    for op in attr.ops() {
        match op {
            PostOp::Eltwise {
                algorithm,
                scale,
                alpha,
                beta,
            } => {
                flat.append_post_eltwise(*scale, *alpha, *beta, *algorithm);
            }
            PostOp::Binary {
                algorithm,
                operand,
                scale,
            } => {
                let operand = operand
                    .broadcast_to(out_shape)?
                    .reshape(&[m as isize, n as isize])?;
                flat.append_scale_binary(*algorithm, operand, *scale);
            }
        }
    }
    Ok(flat)
}

/// A positional argument to a registered linear operator.
#[derive(Debug, Clone)]
pub enum LinearArg {
    Tensor(Tensor),
    Scalar(f64),
    Str(String),
}

type Builder = fn(&[LinearArg]) -> Result<LinearOp>;

fn tensor_arg(args: &[LinearArg], index: usize) -> Result<Tensor> {
    match args.get(index) {
        Some(LinearArg::Tensor(t)) => Ok(t.clone()),
        other => Err(bad_arg("tensor", index, other)),
    }
}

fn scalar_arg(args: &[LinearArg], index: usize) -> Result<f64> {
    match args.get(index) {
        Some(LinearArg::Scalar(v)) => Ok(*v),
        other => Err(bad_arg("scalar", index, other)),
    }
}

fn str_arg(args: &[LinearArg], index: usize) -> Result<String> {
    match args.get(index) {
        Some(LinearArg::Str(s)) => Ok(s.clone()),
        other => Err(bad_arg("string", index, other)),
    }
}

fn bad_arg(expected: &str, index: usize, got: Option<&LinearArg>) -> KilnError {
    let got = match got {
        Some(LinearArg::Tensor(_)) => "tensor",
        Some(LinearArg::Scalar(_)) => "scalar",
        Some(LinearArg::Str(_)) => "string",
        None => "nothing",
    };
    KilnError::Unsupported(format!("expected a {expected} at argument {index}, got {got}"))
}

fn binary(algorithm: BinaryAlgorithm, args: &[LinearArg]) -> Result<LinearOp> {
    Ok(LinearOp::Binary {
        algorithm,
        other: tensor_arg(args, 0)?,
    })
}

/// Public operator names and how to build their [`LinearOp`] from
/// positional arguments.
const REGISTRY: &[(&str, Builder)] = &[
    ("linear", |_| Ok(LinearOp::Plain)),
    ("linear_sigmoid", |_| Ok(LinearOp::Sigmoid)),
    ("linear_relu", |_| Ok(LinearOp::Relu)),
    ("linear_sqrt", |_| Ok(LinearOp::Sqrt)),
    ("linear_abs", |_| Ok(LinearOp::Abs)),
    ("linear_tanh", |_| Ok(LinearOp::Tanh)),
    ("linear_square", |_| Ok(LinearOp::Square)),
    ("linear_exp", |_| Ok(LinearOp::Exp)),
    ("linear_log", |_| Ok(LinearOp::Log)),
    ("linear_round", |_| Ok(LinearOp::Round)),
    ("linear_log_sigmoid", |_| Ok(LinearOp::LogSigmoid)),
    ("linear_hardswish", |_| Ok(LinearOp::HardSwish)),
    ("linear_mish", |_| Ok(LinearOp::Mish)),
    ("linear_silu", |_| Ok(LinearOp::Silu)),
    ("linear_hardsigmoid", |_| Ok(LinearOp::HardSigmoid)),
    ("linear_leaky_relu", |a| {
        Ok(LinearOp::LeakyRelu {
            negative_slope: scalar_arg(a, 0)?,
        })
    }),
    ("linear_pow", |a| {
        Ok(LinearOp::Pow {
            exponent: scalar_arg(a, 0)?,
        })
    }),
    ("linear_hardtanh", |a| {
        Ok(LinearOp::HardTanh {
            min: scalar_arg(a, 0)?,
            max: scalar_arg(a, 1)?,
        })
    }),
    ("linear_elu", |a| {
        Ok(LinearOp::Elu {
            alpha: scalar_arg(a, 0)?,
            scale: scalar_arg(a, 1)?,
            input_scale: scalar_arg(a, 2)?,
        })
    }),
    ("linear_sum", |a| {
        Ok(LinearOp::Sum {
            accumul: tensor_arg(a, 0)?,
            alpha: scalar_arg(a, 1)?,
        })
    }),
    ("linear_gelu", |a| {
        Ok(LinearOp::Gelu {
            approximate: str_arg(a, 0)?,
        })
    }),
    ("linear_binary_sub", |a| {
        Ok(LinearOp::BinarySub {
            other: tensor_arg(a, 0)?,
            alpha: scalar_arg(a, 1)?,
        })
    }),
    ("linear_binary_add", |a| binary(BinaryAlgorithm::Add, a)),
    ("linear_binary_mul", |a| binary(BinaryAlgorithm::Mul, a)),
    ("linear_binary_div", |a| binary(BinaryAlgorithm::Div, a)),
    ("linear_binary_min", |a| binary(BinaryAlgorithm::Min, a)),
    ("linear_binary_max", |a| binary(BinaryAlgorithm::Max, a)),
    ("linear_binary_eq", |a| binary(BinaryAlgorithm::Eq, a)),
    ("linear_binary_ne", |a| binary(BinaryAlgorithm::Ne, a)),
    ("linear_binary_ge", |a| binary(BinaryAlgorithm::Ge, a)),
    ("linear_binary_gt", |a| binary(BinaryAlgorithm::Gt, a)),
    ("linear_binary_le", |a| binary(BinaryAlgorithm::Le, a)),
    ("linear_binary_lt", |a| binary(BinaryAlgorithm::Lt, a)),
    ("linear_binary_mul.Scalar", |a| Ok(LinearOp::ScalarMul(scalar_arg(a, 0)?))),
    ("linear_binary_div.Scalar", |a| Ok(LinearOp::ScalarDiv(scalar_arg(a, 0)?))),
    ("linear_sum.Scalar", |a| {
        Ok(LinearOp::ScalarAdd {
            scalar: scalar_arg(a, 0)?,
            scale: scalar_arg(a, 1)?,
        })
    }),
    ("linear_binary_sub.Scalar", |a| {
        Ok(LinearOp::ScalarSub {
            scalar: scalar_arg(a, 0)?,
            scale: scalar_arg(a, 1)?,
        })
    }),
];

/// Build the [`LinearOp`] registered under `name`.
pub fn lookup(name: &str, args: &[LinearArg]) -> Result<LinearOp> {
    let (_, build) = REGISTRY
        .iter()
        .find(|(registered, _)| *registered == name)
        .ok_or_else(|| KilnError::Unsupported(format!("unknown linear operator '{name}'")))?;
    build(args)
}

/// Every registered operator name.
pub fn registered_names() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(name, _)| *name)
}

/// Run the linear operator registered under `name`.
///
/// ```
/// use kiln_core::Tensor;
/// use kiln_kernels::linear::{call_linear, LinearArg};
/// use kiln_kernels::Context;
///
/// let x = Tensor::from_f32(&[1.0, -1.0], &[1, 2]);
/// let w = Tensor::from_f32(&[1.0, 0.0, 0.0, 1.0], &[2, 2]);
/// let args = [LinearArg::Scalar(0.5)];
/// let y = call_linear(Context::global(), "linear_leaky_relu", &x, &w, None, &args).unwrap();
/// assert_eq!(y.to_vec::<f32>().unwrap(), vec![1.0, -0.5]);
/// ```
pub fn call_linear(
    ctx: &Context,
    name: &str,
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    args: &[LinearArg],
) -> Result<Tensor> {
    let op = lookup(name, args)?;
    linear(ctx, input, weight, bias, &op)
}
