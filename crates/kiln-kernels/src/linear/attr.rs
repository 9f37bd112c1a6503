//! Post-operation descriptors attached to a matmul.

use kiln_core::Tensor;

/// Elementwise post-op algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EltwiseAlgorithm {
    Sqrt,
    Abs,
    Tanh,
    Square,
    Exp,
    Log,
    Round,
    Logistic,
    /// `x > 0 ? x : alpha * x`
    Relu,
    HardSwish,
    Mish,
    LogSigmoid,
    /// `x * sigmoid(alpha * x)`
    Swish,
    /// `clamp(alpha * x + beta, 0, 1)`
    HardSigmoid,
    /// `clamp(x, alpha, beta)`
    Clip,
    /// `x > 0 ? x : alpha * (exp(x) - 1)`
    Elu,
    GeluErf,
    GeluTanh,
    /// `alpha * x^beta`
    Pow,
    /// `alpha * x + beta`
    Linear,
}

/// Binary post-op algorithms combining the result with a second tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryAlgorithm {
    Add,
    Mul,
    Div,
    Min,
    Max,
    Eq,
    Ne,
    Ge,
    Gt,
    Le,
    Lt,
}

impl BinaryAlgorithm {
    /// Whether the algorithm is a predicate. Predicates evaluate to 1 or 0
    /// in the result dtype.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryAlgorithm::Eq
                | BinaryAlgorithm::Ne
                | BinaryAlgorithm::Ge
                | BinaryAlgorithm::Gt
                | BinaryAlgorithm::Le
                | BinaryAlgorithm::Lt
        )
    }
}

/// One post-operation record.
#[derive(Debug, Clone)]
pub enum PostOp {
    /// `scale * f(x; alpha, beta)`
    Eltwise {
        algorithm: EltwiseAlgorithm,
        scale: f32,
        alpha: f32,
        beta: f32,
    },
    /// `x op (scale * operand)`; `operand` broadcasts to the result.
    Binary {
        algorithm: BinaryAlgorithm,
        operand: Tensor,
        scale: f32,
    },
}

/// Ordered, append-only list of post-ops.
///
/// Each call appends exactly one record; the ops apply in call order.
///
/// ```
/// use kiln_kernels::linear::PostOpAttr;
///
/// let mut attr = PostOpAttr::new();
/// attr.leaky_relu(0.1).linear(2.0, 0.5);
/// assert_eq!(attr.len(), 2);
/// assert!(!attr.has_binary());
/// ```
#[derive(Debug, Clone, Default)]
pub struct PostOpAttr {
    ops: Vec<PostOp>,
}

impl PostOpAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_post_eltwise(
        &mut self,
        scale: f32,
        alpha: f32,
        beta: f32,
        algorithm: EltwiseAlgorithm,
    ) -> &mut Self {
        self.ops.push(PostOp::Eltwise {
            algorithm,
            scale,
            alpha,
            beta,
        });
        self
    }

    pub fn append_scale_binary(
        &mut self,
        algorithm: BinaryAlgorithm,
        operand: Tensor,
        scale: f32,
    ) -> &mut Self {
        self.ops.push(PostOp::Binary {
            algorithm,
            operand,
            scale,
        });
        self
    }

    fn eltwise(&mut self, algorithm: EltwiseAlgorithm, alpha: f32, beta: f32) -> &mut Self {
        self.append_post_eltwise(1.0, alpha, beta, algorithm)
    }

    pub fn sqrt(&mut self) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::Sqrt, 0.0, 0.0)
    }

    pub fn abs(&mut self) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::Abs, 0.0, 0.0)
    }

    pub fn tanh(&mut self) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::Tanh, 0.0, 0.0)
    }

    pub fn square(&mut self) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::Square, 0.0, 0.0)
    }

    pub fn exp(&mut self) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::Exp, 0.0, 0.0)
    }

    pub fn log(&mut self) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::Log, 0.0, 0.0)
    }

    pub fn round(&mut self) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::Round, 0.0, 0.0)
    }

    pub fn sigmoid(&mut self) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::Logistic, 0.0, 0.0)
    }

    pub fn relu(&mut self) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::Relu, 0.0, 0.0)
    }

    pub fn hardswish(&mut self) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::HardSwish, 0.0, 0.0)
    }

    pub fn mish(&mut self) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::Mish, 0.0, 0.0)
    }

    pub fn log_sigmoid(&mut self) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::LogSigmoid, 0.0, 0.0)
    }

    pub fn silu(&mut self) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::Swish, 1.0, 0.0)
    }

    pub fn hardsigmoid(&mut self) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::HardSigmoid, 1.0 / 6.0, 0.5)
    }

    pub fn leaky_relu(&mut self, negative_slope: f32) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::Relu, negative_slope, 0.0)
    }

    pub fn hardtanh(&mut self, min: f32, max: f32) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::Clip, min, max)
    }

    /// ELU scaled on the output: `scale * elu(x, alpha)`. There is no
    /// input scale.
    pub fn elu(&mut self, alpha: f32, scale: f32) -> &mut Self {
        self.append_post_eltwise(scale, alpha, 1.0, EltwiseAlgorithm::Elu)
    }

    /// GELU; `tanh_approximation` selects the tanh form over erf.
    pub fn gelu(&mut self, tanh_approximation: bool) -> &mut Self {
        let algorithm = if tanh_approximation {
            EltwiseAlgorithm::GeluTanh
        } else {
            EltwiseAlgorithm::GeluErf
        };
        self.eltwise(algorithm, 0.0, 0.0)
    }

    pub fn pow(&mut self, exponent: f32) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::Pow, 1.0, exponent)
    }

    pub fn linear(&mut self, alpha: f32, beta: f32) -> &mut Self {
        self.eltwise(EltwiseAlgorithm::Linear, alpha, beta)
    }

    /// `x op operand` with unit scale.
    ///
    /// Comparison algorithms (`Eq`, `Ne`, `Ge`, `Gt`, `Le`, `Lt`) write 1 or 0
    /// in the result's own dtype, fused or not; they never produce a `Bool`
    /// tensor.
    pub fn binary(&mut self, algorithm: BinaryAlgorithm, operand: Tensor) -> &mut Self {
        self.append_scale_binary(algorithm, operand, 1.0)
    }

    /// `x + scale * operand`
    pub fn add(&mut self, operand: Tensor, scale: f32) -> &mut Self {
        self.append_scale_binary(BinaryAlgorithm::Add, operand, scale)
    }

    /// `x - scale * operand`, recorded as an add with negated scale.
    pub fn sub(&mut self, operand: Tensor, scale: f32) -> &mut Self {
        self.append_scale_binary(BinaryAlgorithm::Add, operand, -scale)
    }

    pub fn ops(&self) -> &[PostOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn has_binary(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, PostOp::Binary { .. }))
    }
}
